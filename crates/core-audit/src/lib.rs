//! Append-only audit log for the job orchestration service.
//!
//! # Key Concepts
//!
//! - **AuditEvent**: one operational/security-relevant occurrence
//!   (`quota.denied`, `retention.job.delete`, `admin.priority_changed`, ...)
//! - **AuditLog**: an append-only JSON Lines sink, one line per event,
//!   shared across handlers and background loops via `Arc`/`Clone`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   HTTP handlers / executor / sweeper│
//! └──────────────┬──────────────────────┘
//!                │
//!                │ AuditLog::record(event)
//!                ▼
//! ┌─────────────────────────────────────┐
//! │              AuditLog               │
//! │  best-effort, never blocks caller   │
//! └──────────────┬──────────────────────┘
//!                │ append JSON line
//!                ▼
//! ┌─────────────────────────────────────┐
//! │      audit.jsonl                    │
//! │ {"ts":"...","event":"quota.denied"} │
//! │ {"ts":"...","event":"job.submitted"}│
//! └─────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use orbit_core_audit::{AuditLog, AuditEvent};
//!
//! let log = AuditLog::open("audit.jsonl").unwrap();
//! log.record(AuditEvent::new("job.submitted").with_user("u1").with_job("j1"));
//! ```

pub mod audit;
pub mod error;

// Re-export main types
pub use audit::{AuditEvent, AuditLog};
pub use error::{Error, Result};

