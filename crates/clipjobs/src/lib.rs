pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use broadcast::{JobEvent, JobEventBroadcaster, JobEventStream};
pub use config::{
    load_config, load_config_from_str, LogFormat, LoggingConfig, OrchestratorConfig, WorkerSettings,
};
pub use error::{ClipjobsError, ConfigError, Result, SupervisorError, WorkerError};
pub use job::{
    ClipRef, ErrorKind, Job, JobFailure, JobLogLine, JobProgress, JobResult, JobStatistics,
    JobStatus, LogLevel,
};
pub use orchestrator::{JobOrchestrator, NewJob};
pub use store::{JobFilter, JobPage, JobStore, StoreError, ValueSet};
pub use telemetry::init_logging;
pub use worker::{OutputEvent, OutputParser, ProcessSupervisor, StreamKind, WorkerInvocation};
