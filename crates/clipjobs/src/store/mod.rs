//! Durable job store.
//!
//! [`JobStore`] turns database rows into [`Job`](crate::job::Job) values and
//! enforces the job state machine with conditional updates.

pub mod error;
pub mod job_store;

pub use error::StoreError;
pub use job_store::{JobFilter, JobPage, JobStore, ValueSet};
