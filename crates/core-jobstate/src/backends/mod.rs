//! Backend implementations for [`crate::StateStore`].
//!
//! SQLite is the only backend; it is a required dependency, not a feature.

pub mod sqlite;
