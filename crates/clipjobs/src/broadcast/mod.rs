//! Broadcasting of job events to observers.
//!
//! Delivery is best-effort: publishers never block, and subscribers that fall
//! behind lose the oldest events.

pub mod job_events;

pub use job_events::{JobEvent, JobEventBroadcaster, JobEventStream};
