//! Dispatch state machine of a scheduled actor.

use std::collections::VecDeque;

use super::actor_ref::ActorRef;
use super::behavior::{BehaviorCommand, BehaviorStack};
use super::context::{Context, PendingRequest, is_lifecycle_signal};
use super::exit::{ExitMsg, ExitReason};
use super::{Actor, DefaultAction};
use crate::error::RequestError;
use crate::mailbox::Mailbox;
use crate::message::{
    MailboxElement, Message, MessageId, Payload, ReplyTarget, Sender, SystemMessage,
};

/// Actor state plus everything needed to dispatch its mailbox.
pub(crate) struct ScheduledActor<A: Actor> {
    pub(crate) actor: A,
    pub(crate) ctx: Context<A>,
    stack: BehaviorStack<A>,
    /// Elements no handler accepted yet, oldest first.
    skipped: VecDeque<MailboxElement>,
    /// Skipped elements queued for another attempt before the mailbox.
    rescan: VecDeque<MailboxElement>,
}

impl<A: Actor> ScheduledActor<A> {
    pub(crate) fn new(actor: A, ctx: Context<A>) -> Self {
        Self {
            actor,
            ctx,
            stack: BehaviorStack::new(),
            skipped: VecDeque::new(),
            rescan: VecDeque::new(),
        }
    }

    /// Install the initial behavior.
    pub(crate) fn initialize(&mut self) {
        let behavior = self.actor.behavior(&mut self.ctx);
        self.stack.push(behavior);
        self.apply_commands();
        self.ctx.arm_timeout(self.stack.active_timeout());
    }

    /// Next element to dispatch: retried skipped ones first.
    pub(crate) fn next_element(&mut self, mailbox: &Mailbox<MailboxElement>) -> Option<MailboxElement> {
        self.rescan.pop_front().or_else(|| mailbox.pop())
    }

    pub(crate) fn has_rescan(&self) -> bool {
        !self.rescan.is_empty()
    }

    /// Elements still held by the actor, for bouncing at termination.
    pub(crate) fn take_parked(&mut self) -> impl Iterator<Item = MailboxElement> + use<A> {
        let rescan = std::mem::take(&mut self.rescan);
        std::mem::take(&mut self.skipped).into_iter().chain(rescan)
    }

    pub(crate) fn quit_requested(&self) -> bool {
        self.ctx.quit.is_some()
    }

    /// Dispatch one element.
    pub(crate) fn handle(&mut self, element: MailboxElement) {
        if let Payload::System(SystemMessage::Kill(reason)) = &element.payload {
            self.ctx.quit(reason.clone());
            return;
        }
        if let Payload::User(message) = &element.payload
            && let Some(exit) = message.downcast_ref::<ExitMsg>()
            && !self.ctx.traps_exit()
        {
            if exit.reason.is_abnormal() {
                tracing::debug!(actor = %self.ctx.id(), source = %exit.source, reason = %exit.reason, "exit signal");
                self.ctx.quit(exit.reason.clone());
            }
            return;
        }

        if let Some(front) = self.ctx.awaited.front() {
            let front_id = front.id;
            let answers_front = match &element.payload {
                Payload::Response(_) => element.message_id == front_id.response_id(),
                Payload::System(SystemMessage::RequestTimeout(id)) => *id == front_id,
                _ => false,
            };
            if !answers_front {
                self.skipped.push_back(element);
                return;
            }
            let result = match element.payload {
                Payload::Response(result) => result,
                _ => Err(RequestError::Timeout),
            };
            if let Some(pending) = self.ctx.awaited.pop_front() {
                self.complete(pending, result);
            }
            return;
        }

        let message_id = element.message_id;
        match element.payload {
            Payload::Response(result) => match self.ctx.multiplexed.remove(&message_id.request_id()) {
                Some(pending) => self.complete(pending, result),
                None => {
                    tracing::debug!(actor = %self.ctx.id(), id = %message_id, "dropping unexpected response");
                }
            },
            Payload::System(SystemMessage::RequestTimeout(id)) => match self.ctx.multiplexed.remove(&id) {
                Some(pending) => self.complete(pending, Err(RequestError::Timeout)),
                None => {
                    tracing::debug!(actor = %self.ctx.id(), %id, "dropping stale request timeout");
                }
            },
            Payload::System(SystemMessage::BehaviorTimeout(seq)) => {
                if self.ctx.armed_timeout.map(|(armed, _)| armed) != Some(seq) {
                    tracing::debug!(actor = %self.ctx.id(), seq, "dropping stale behavior timeout");
                    return;
                }
                self.ctx.armed_timeout = None;
                if let Some(handler) = self.stack.timeout_handler_mut() {
                    handler(&mut self.actor, &mut self.ctx);
                }
                self.after_handler();
            }
            Payload::System(SystemMessage::Kill(reason)) => self.ctx.quit(reason),
            Payload::User(message) => {
                self.handle_user(element.sender, message_id, element.stages, message);
            }
        }
    }

    fn handle_user(
        &mut self,
        sender: Option<Sender>,
        id: MessageId,
        stages: Vec<ActorRef>,
        message: Message,
    ) {
        let reply_target = |sender: Option<Sender>, stages| {
            sender
                .filter(|_| id.is_request())
                .map(|sender| ReplyTarget { sender, id, stages })
        };

        if let Some(handler) = self.stack.handler_mut(message.type_id()) {
            if id.is_request() {
                self.ctx.begin(reply_target(sender, stages), None);
            } else {
                self.ctx.begin(None, sender);
            }
            let response = handler(&mut self.actor, &mut self.ctx, message);
            self.ctx.finish(response);
            self.after_handler();
            return;
        }

        if is_lifecycle_signal(&message) {
            return;
        }

        match self.actor.default_handler(&mut self.ctx, &message) {
            DefaultAction::Skip => self.skipped.push_back(MailboxElement {
                sender,
                message_id: id,
                stages,
                payload: Payload::User(message),
            }),
            DefaultAction::Drop => {
                tracing::debug!(actor = %self.ctx.id(), message = message.type_name(), "dropping unhandled message");
                if let Some(target) = reply_target(sender, stages) {
                    target.deliver(Err(RequestError::Unhandled {
                        type_name: message.type_name().to_string(),
                    }));
                }
            }
        }
        self.apply_commands();
    }

    fn complete(&mut self, pending: PendingRequest<A>, result: Result<Message, RequestError>) {
        self.ctx.cancel_timer(pending.timer);
        (pending.continuation)(&mut self.actor, &mut self.ctx, result);
        self.request_rescan();
        self.apply_commands();
        self.terminate_if_idle();
    }

    /// Bookkeeping after a behavior handler or timeout handler ran.
    fn after_handler(&mut self) {
        let changed = self.apply_commands();
        if !changed {
            self.ctx.arm_timeout(self.stack.active_timeout());
        }
        self.terminate_if_idle();
    }

    /// Apply queued behavior changes. Erased behaviors are dropped here,
    /// after the handler that replaced them has returned.
    fn apply_commands(&mut self) -> bool {
        if self.ctx.commands.is_empty() {
            return false;
        }
        let mut erased = Vec::new();
        for command in std::mem::take(&mut self.ctx.commands) {
            match command {
                BehaviorCommand::Replace(behavior) => erased.extend(self.stack.replace(behavior)),
                BehaviorCommand::Push(behavior) => self.stack.push(behavior),
                BehaviorCommand::Pop => erased.extend(self.stack.pop()),
            }
        }
        drop(erased);
        self.ctx.arm_timeout(self.stack.active_timeout());
        self.request_rescan();
        true
    }

    fn request_rescan(&mut self) {
        if self.skipped.is_empty() {
            return;
        }
        let mut retry = std::mem::take(&mut self.skipped);
        retry.append(&mut self.rescan);
        self.rescan = retry;
    }

    /// An actor without behavior and without outstanding requests is done.
    fn terminate_if_idle(&mut self) {
        if self.stack.is_empty() && self.ctx.pending_requests() == 0 {
            self.ctx.quit(ExitReason::Normal);
        }
    }

    #[cfg(test)]
    pub(crate) fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    #[cfg(test)]
    pub(crate) fn skipped_len(&self) -> usize {
        self.skipped.len()
    }
}
