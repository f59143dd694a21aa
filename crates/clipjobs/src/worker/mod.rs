//! Worker processes: invocation, supervision, output parsing.

pub mod invocation;
pub mod parser;
pub mod result;
pub mod supervisor;
pub mod transcript;

pub use invocation::{WorkerInvocation, WorkerOptions};
pub use parser::{OutputEvent, OutputParser, ParsedOutput, StreamKind};
pub use result::{extract_result, ResultError};
pub use supervisor::{ExitKind, ProcessSupervisor, SpawnedWorker, WorkerExit};
pub use transcript::Transcript;
