//! Exit reasons and the down/exit signals carrying them.

use tidepool_core::ActorId;

/// Why an actor terminated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Regular shutdown, for example after `quit` without an error.
    Normal,
    /// Killed unconditionally.
    Kill,
    /// The last strong reference was dropped while the actor was idle.
    Unreachable,
    /// The actor system shut down.
    UserShutdown,
    /// The node hosting a remote actor became unreachable.
    RemoteLinkUnreachable,
    /// A handler panicked; carries the panic message.
    Panicked(String),
    /// Application-defined failure.
    Error(String),
}

impl ExitReason {
    /// Whether linked actors should terminate as well.
    pub fn is_abnormal(&self) -> bool {
        *self != ExitReason::Normal
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Kill => f.write_str("kill"),
            ExitReason::Unreachable => f.write_str("unreachable"),
            ExitReason::UserShutdown => f.write_str("user shutdown"),
            ExitReason::RemoteLinkUnreachable => f.write_str("remote link unreachable"),
            ExitReason::Panicked(message) => write!(f, "panicked: {message}"),
            ExitReason::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Sent to every monitor when the observed actor terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownMsg {
    /// Terminated actor.
    pub source: ActorId,
    /// Its exit reason.
    pub reason: ExitReason,
}

/// Sent to every linked actor when a peer terminates.
///
/// Unless the receiver traps exits, an abnormal reason terminates it too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitMsg {
    /// Terminated actor.
    pub source: ActorId,
    /// Its exit reason.
    pub reason: ExitReason,
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
