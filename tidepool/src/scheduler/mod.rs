//! Cooperative scheduling of resumables on a fixed pool of worker threads.
//!
//! The [`Coordinator`] owns `worker_count` OS threads. Each worker repeatedly
//! takes a [`Job`] from its policy, calls [`Resumable::resume`] and acts on the
//! [`ResumeResult`]:
//!
//! | result              | worker action                                   |
//! |---------------------|-------------------------------------------------|
//! | `ResumeLater`       | reschedule at the back of a run queue           |
//! | `AwaitingMessage`   | drop the queue's reference                      |
//! | `Done`              | drop the queue's reference                      |
//! | `ShutdownExecutionUnit` | leave the loop                              |
//!
//! Run queues are deficit round robin queues ([`DrrQueue`]) so that expensive
//! jobs cannot starve cheap ones.

mod clock;
mod config;
mod coordinator;
mod drr_queue;
mod policy;
mod resumable;
mod work_sharing;
mod work_stealing;
mod worker;

pub use clock::{ActorClock, TimerId};
pub use config::{
    DEFAULT_MAX_THROUGHPUT, SchedulerConfig, SchedulerConfigBuilder, SchedulerConfigError,
    SchedulingPolicy, StealConfig,
};
pub use coordinator::{Coordinator, SchedulerStats};
pub use drr_queue::{Costed, DrrQueue, NewRoundResult, TaskResult};
pub use resumable::{ExecutionUnit, FunctionJob, Job, Resumable, ResumableKind, ResumeResult};
