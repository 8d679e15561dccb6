//! HTTP handlers, grouped by resource.

pub mod admin;
pub mod auth;
pub mod health;
pub mod jobs;
pub mod uploads;

pub use admin::{admin_queue, set_priority, set_quotas};
pub use auth::{login_handler, logout_handler, me_handler, LoginResponse};
pub use health::{health, metrics, readyz};
pub use jobs::{cancel_job, create_job, get_job, list_jobs, CreateJobRequest};
pub use uploads::{complete_upload, init_upload, put_chunk, upload_status};
