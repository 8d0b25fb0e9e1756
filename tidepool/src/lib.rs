//! # tidepool
//!
//! Sharded actors on a cooperative scheduler, with gossip membership and
//! consistent-hash routing across nodes.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  tidepool (this crate)                      │
//! │  • scheduler: resumables, DRR queues, sharing / stealing    │
//! │  • actor: mailboxes, behaviors, monitors and links          │
//! │  • directory: virtual actors, placement, shard directories  │
//! │  • cluster: membership, ring, routing, remote dispatch      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  tidepool-transport                         │
//! │  Frames with CRC32C, RPC channels and server                │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  tidepool-core                              │
//! │  NetworkProvider (Tokio / in-memory), ids, codec, hashing   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tidepool::ActorSystem;
//! use tidepool::actor::{Actor, Behavior, Context};
//! use tidepool::scheduler::SchedulerConfig;
//!
//! struct Echo;
//!
//! impl Actor for Echo {
//!     fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
//!         Behavior::new().on(|_: &mut Echo, _ctx: &mut Context<Echo>, text: String| text)
//!     }
//! }
//!
//! let config = SchedulerConfig::builder().worker_count(2).build().expect("valid config");
//! let system = ActorSystem::new(config).expect("workers start");
//! let echo = system.spawn(Echo);
//! echo.tell("hello".to_string()).expect("delivered");
//! system.shutdown();
//! ```
//!
//! ## Modules
//!
//! - [`scheduler`] - Worker pool, run queues and the actor clock
//! - [`mailbox`] - Lock-free inbox and per-category queues
//! - [`actor`] - The [`Actor`](actor::Actor) trait and references
//! - [`directory`] - Key-addressed virtual actors
//! - [`registry`] - Live actors and remote proxies by id
//! - [`cluster`] - Running an [`ActorSystem`] as a cluster member

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod actor;
pub mod cluster;
pub mod directory;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod system;

pub use error::{RequestError, SendError};
pub use message::{MailboxElement, Message, MessageId, Sender};
pub use system::ActorSystem;
pub use tidepool_core::{ActorId, NetworkAddress, NodeId};
