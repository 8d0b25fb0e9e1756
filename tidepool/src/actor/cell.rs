//! The runtime object behind a local [`ActorRef`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tidepool_core::ActorId;

use super::actor_ref::{AbstractActor, ActorRef, Attachable, WeakActorRef};
use super::context::Context;
use super::exit::{ExitReason, panic_message};
use super::scheduled::ScheduledActor;
use super::Actor;
use crate::error::{RequestError, SendError};
use crate::mailbox::{Mailbox, PushResult};
use crate::message::{MailboxElement, bounce};
use crate::scheduler::{ExecutionUnit, Resumable, ResumableKind, ResumeResult};
use crate::system::ActorSystem;

/// Mailbox, state and observers of one local actor.
///
/// The cell is scheduled whenever a push wakes its blocked mailbox; the
/// block protocol guarantees that at most one worker resumes it at a time.
pub(crate) struct ActorCell<A: Actor> {
    id: ActorId,
    mailbox: Mailbox<MailboxElement>,
    state: Mutex<Option<ScheduledActor<A>>>,
    /// `None` once terminated.
    attachables: Mutex<Option<Vec<Attachable>>>,
    exit_reason: OnceLock<ExitReason>,
    system: ActorSystem,
    weak_self: Weak<ActorCell<A>>,
    affinity: Option<usize>,
    max_throughput: usize,
}

impl<A: Actor> ActorCell<A> {
    /// Create the cell, run `behavior()` and hand out the first reference.
    pub(crate) fn spawn(system: &ActorSystem, actor: A, shard: Option<usize>) -> ActorRef {
        let id = system.next_actor_id();
        let cell = Arc::new_cyclic(|weak: &Weak<ActorCell<A>>| {
            let erased: Weak<dyn AbstractActor> = weak.clone();
            let ctx = Context::new(id, WeakActorRef::new(id, erased), system.clone(), shard);
            ActorCell {
                id,
                mailbox: Mailbox::new_blocked(),
                state: Mutex::new(Some(ScheduledActor::new(actor, ctx))),
                attachables: Mutex::new(Some(Vec::new())),
                exit_reason: OnceLock::new(),
                system: system.clone(),
                weak_self: weak.clone(),
                affinity: shard,
                max_throughput: system.scheduler().max_throughput(),
            }
        });
        let weak: Weak<ActorCell<A>> = Arc::downgrade(&cell);
        system.actor_spawned(WeakActorRef::new(id, weak));
        tracing::debug!(actor = %id, kind = std::any::type_name::<A>(), "spawned");

        // Holding the state lock keeps a worker woken by an early message
        // from running before the initial behavior is installed.
        {
            let mut guard = cell.state.lock();
            if let Some(state) = guard.as_mut() {
                let initialized = catch_unwind(AssertUnwindSafe(|| state.initialize()));
                let reason = match initialized {
                    Err(payload) => Some(ExitReason::Panicked(panic_message(payload.as_ref()))),
                    Ok(()) => state.ctx.quit.take(),
                };
                if let Some(reason) = reason {
                    cell.terminate(state, reason);
                    *guard = None;
                }
            }
        }
        ActorRef::from_arc(cell)
    }

    /// Run the termination sequence. Only the first call has an effect.
    fn terminate(&self, state: &mut ScheduledActor<A>, reason: ExitReason) {
        if self.exit_reason.set(reason.clone()).is_err() {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| state.actor.on_exit(&mut state.ctx, &reason))).is_err() {
            tracing::warn!(actor = %self.id, "on_exit panicked");
        }
        state.ctx.reset();

        self.mailbox
            .close(|element| bounce(element, RequestError::ReceiverDown));
        for element in state.take_parked() {
            bounce(element, RequestError::ReceiverDown);
        }

        let attachables = self.attachables.lock().take().unwrap_or_default();
        for attachable in attachables {
            attachable.notify(self.id, &reason);
        }
        self.system.actor_terminated(self.id);
        tracing::debug!(actor = %self.id, %reason, "terminated");
    }
}

impl<A: Actor> AbstractActor for ActorCell<A> {
    fn id(&self) -> ActorId {
        self.id
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<A>()
    }

    fn enqueue(&self, element: MailboxElement) -> Result<(), SendError> {
        match self.mailbox.push(element) {
            PushResult::Success => Ok(()),
            PushResult::UnblockedReader => {
                if let Some(me) = self.weak_self.upgrade() {
                    self.system.scheduler().enqueue(me);
                }
                Ok(())
            }
            PushResult::QueueClosed(element) => {
                bounce(element, RequestError::ReceiverDown);
                Err(SendError::QueueClosed)
            }
        }
    }

    fn attach(&self, attachable: Attachable) -> Result<(), Attachable> {
        match self.attachables.lock().as_mut() {
            Some(attachables) => {
                attachables.push(attachable);
                Ok(())
            }
            None => Err(attachable),
        }
    }

    fn detach(&self, observer: ActorId) {
        if let Some(attachables) = self.attachables.lock().as_mut() {
            attachables.retain(|attachable| attachable.observer() != observer);
        }
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason.get().cloned()
    }
}

impl<A: Actor> Resumable for ActorCell<A> {
    fn resume(&self, _unit: ExecutionUnit, max_throughput: usize) -> ResumeResult {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return ResumeResult::Done;
        };

        let max = max_throughput.max(1);
        let mut handled = 0;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            while handled < max {
                let Some(element) = state.next_element(&self.mailbox) else {
                    break;
                };
                handled += 1;
                state.handle(element);
                if state.quit_requested() {
                    break;
                }
            }
        }));

        let reason = match outcome {
            Err(payload) => Some(ExitReason::Panicked(panic_message(payload.as_ref()))),
            Ok(()) => state.ctx.quit.take(),
        };
        if let Some(reason) = reason {
            self.terminate(state, reason);
            *guard = None;
            return ResumeResult::Done;
        }

        if handled >= max || state.has_rescan() {
            return ResumeResult::ResumeLater;
        }
        if self.mailbox.try_block() {
            ResumeResult::AwaitingMessage
        } else {
            ResumeResult::ResumeLater
        }
    }

    fn kind(&self) -> ResumableKind {
        ResumableKind::ActorTask
    }

    fn cost(&self) -> u64 {
        self.mailbox.len().clamp(1, self.max_throughput.max(1)) as u64
    }

    fn affinity(&self) -> Option<usize> {
        self.affinity
    }
}

impl<A: Actor> Drop for ActorCell<A> {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.get_mut().take() {
            self.terminate(&mut state, ExitReason::Unreachable);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::actor::{Actor, Behavior, Context, DefaultAction, DownMsg, ExitReason};
    use crate::error::RequestError;
    use crate::message::Message;
    use crate::scheduler::SchedulerConfig;
    use crate::system::ActorSystem;

    fn system() -> ActorSystem {
        let config = SchedulerConfig::builder()
            .worker_count(2)
            .build()
            .expect("valid config");
        ActorSystem::new(config).expect("system starts")
    }

    struct Counter {
        value: u64,
        exits: Arc<AtomicUsize>,
    }

    struct Increment;
    struct Get;
    struct Stop;
    struct Boom;

    impl Actor for Counter {
        fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
            Behavior::new()
                .on(|this: &mut Counter, _ctx, _: Increment| this.value += 1)
                .on(|this: &mut Counter, _ctx, _: Get| this.value)
                .on(|_: &mut Counter, ctx: &mut Context<Counter>, _: Stop| {
                    ctx.quit(ExitReason::Normal)
                })
                .on(|_: &mut Counter, _ctx, _: Boom| -> () { panic!("boom") })
        }

        fn on_exit(&mut self, _ctx: &mut Context<Self>, _reason: &ExitReason) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }

        fn default_handler(&mut self, _ctx: &mut Context<Self>, _message: &Message) -> DefaultAction {
            DefaultAction::Drop
        }
    }

    fn counter(exits: &Arc<AtomicUsize>) -> Counter {
        Counter {
            value: 0,
            exits: exits.clone(),
        }
    }

    struct Watcher {
        target: crate::actor::ActorRef,
        downs: Arc<parking_lot::Mutex<Vec<ExitReason>>>,
    }

    impl Actor for Watcher {
        fn behavior(&mut self, ctx: &mut Context<Self>) -> Behavior<Self> {
            ctx.monitor(&self.target);
            Behavior::new().on(|this: &mut Watcher, _ctx, down: DownMsg| {
                this.downs.lock().push(down.reason);
            })
        }
    }

    #[test]
    fn test_tell_then_ask_sees_all_messages() {
        let system = system();
        let exits = Arc::new(AtomicUsize::new(0));
        let actor = system.spawn(counter(&exits));
        for _ in 0..100 {
            actor.tell(Increment).expect("delivered");
        }
        let value: u64 = actor.ask(Get).blocking().expect("answered");
        assert_eq!(value, 100);
        system.shutdown();
    }

    #[test]
    fn test_unhandled_request_is_answered() {
        let system = system();
        let exits = Arc::new(AtomicUsize::new(0));
        let actor = system.spawn(counter(&exits));
        let result = actor.ask::<u64, _>("nobody handles this").blocking();
        assert!(matches!(result, Err(RequestError::Unhandled { .. })));
        system.shutdown();
    }

    #[test]
    fn test_termination_runs_once_and_closes_mailbox() {
        let system = system();
        let exits = Arc::new(AtomicUsize::new(0));
        let actor = system.spawn(counter(&exits));
        let downs = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let _watcher = system.spawn(Watcher {
            target: actor.clone(),
            downs: downs.clone(),
        });

        actor.tell(Stop).expect("delivered");
        actor.tell(Stop).ok();
        assert!(system.await_running_count(1, Duration::from_secs(5)));

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(actor.exit_reason(), Some(ExitReason::Normal));
        assert!(actor.tell(Increment).is_err());
        let late = actor.ask::<u64, _>(Get).blocking();
        assert_eq!(late, Err(RequestError::ReceiverDown));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while downs.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(downs.lock().as_slice(), &[ExitReason::Normal]);
        system.shutdown();
    }

    #[test]
    fn test_panic_terminates_actor() {
        let system = system();
        let exits = Arc::new(AtomicUsize::new(0));
        let actor = system.spawn(counter(&exits));
        let pending = actor.ask::<u64, _>(Get);
        actor.tell(Boom).expect("delivered");
        assert_eq!(pending.blocking(), Ok(0));
        assert!(system.await_running_count(0, Duration::from_secs(5)));
        assert_eq!(actor.exit_reason(), Some(ExitReason::Panicked("boom".to_string())));
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        system.shutdown();
    }

    #[test]
    fn test_dropping_last_reference_terminates_unreachable() {
        let system = system();
        let exits = Arc::new(AtomicUsize::new(0));
        let actor = system.spawn(counter(&exits));
        let weak = actor.downgrade();
        let _: u64 = actor.ask(Get).blocking().expect("answered");
        drop(actor);
        assert!(system.await_running_count(0, Duration::from_secs(5)));
        assert!(weak.upgrade().is_none());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        system.shutdown();
    }
}
