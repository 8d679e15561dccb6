//! Queue backend abstraction for dubbing-pipeline job orchestration.
//!
//! [`QueueBackend`] is the single interface the HTTP layer and
//! [`JobExecutor`]-equivalent worker loops speak. Two implementations exist:
//! [`DistributedQueue`] (coordinator-backed, safe across multiple processes)
//! and [`LocalQueue`] (in-process, no coordinator required). [`AutoQueue`]
//! composes both and switches between them based on observed coordinator
//! health, mirroring the original `AutoQueueBackend`'s `auto`/`distributed`/
//! `local` modes.
//!
//! This crate owns queue/lock state only. Job metadata remains exclusively
//! owned by `core-jobstate`'s `StateStore`; `QueueBackend` implementations
//! read it through the `StateStore` handle they are constructed with rather
//! than caching their own copy.

pub mod auto;
pub mod backend;
pub mod coordinator;
pub mod distributed;
pub mod error;
pub mod local;
pub mod policy;

pub use auto::{AutoQueue, AutoQueueConfig, ForcedMode};
pub use backend::{
    AdminJobSummary, AdminSnapshot, Counts, QueueBackend, QueueMode, QueueStatus, UserQuotaCounts,
};
pub use coordinator::{InMemoryCoordinator, KeyedCoordinator};
pub use distributed::{DistributedQueue, DistributedQueueConfig};
pub use error::{QueueError, QueueResult};
pub use local::LocalQueue;
pub use policy::{GlobalLimits, Operation, PolicyDecision, PolicyEngine, PolicyRequest};
