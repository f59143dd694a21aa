//! Shared utilities for clipjobs integration tests.
//!
//! - `TestHarness` wires an orchestrator to an in-memory store and a
//!   scripted `sh -c` worker inside a temporary directory
//! - event helpers wait for a job to settle with a timeout

pub mod harness;

// Not every test binary uses every helper.
#[allow(unused_imports)]
pub use harness::{events_until_settled, statuses, TestHarness, WAIT_TIMEOUT};
