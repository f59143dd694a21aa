//! Per-job run task: pumps worker output into the store and the event
//! channel, then finalizes the job once the worker has exited.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use super::JobOrchestrator;
use crate::job::{ErrorKind, Job, JobFailure, JobStatus};
use crate::store::StoreError;
use crate::worker::{
    extract_result, ExitKind, OutputEvent, OutputParser, SpawnedWorker, StreamKind, Transcript,
    WorkerExit,
};

/// How long buffered output is drained after the worker exits.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);
const LINE_CHANNEL_CAPACITY: usize = 256;

pub(super) async fn drive(
    orch: JobOrchestrator,
    job: Job,
    spawned: SpawnedWorker,
    transcript: Transcript,
) {
    let span = tracing::info_span!("job", job_id = %job.id, pid = spawned.pid);
    run(orch, job, spawned, transcript).instrument(span).await
}

async fn run(orch: JobOrchestrator, job: Job, spawned: SpawnedWorker, mut transcript: Transcript) {
    let SpawnedWorker {
        stdout,
        stderr,
        exit: mut exit_rx,
        ..
    } = spawned;

    let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let readers = [
        tokio::spawn(read_lines(stdout, StreamKind::Stdout, tx.clone())),
        tokio::spawn(read_lines(stderr, StreamKind::Stderr, tx)),
    ];

    let mut parser = OutputParser::new();
    let mut exit: Option<WorkerExit> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some((stream, line)) => {
                    handle_line(&orch, &job.id, &mut parser, &mut transcript, stream, &line).await;
                }
                None => break,
            },
            received = &mut exit_rx, if exit.is_none() => {
                exit = Some(received.unwrap_or_else(|_| lost_exit()));
                deadline = Some(Instant::now() + DRAIN_WINDOW);
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                tracing::warn!("Output pipes still open after worker exit, finalizing");
                for reader in &readers {
                    reader.abort();
                }
                break;
            }
        }
    }

    let exit = match exit {
        Some(exit) => exit,
        None => exit_rx.await.unwrap_or_else(|_| lost_exit()),
    };

    transcript.finish(&exit.status.to_string(), Utc::now()).await;
    finalize(&orch, &job, parser, exit);
}

fn lost_exit() -> WorkerExit {
    WorkerExit {
        status: ExitKind::WaitFailed("reaper dropped without reporting".to_string()),
        cancel_requested: false,
    }
}

async fn read_lines<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(stream = stream.as_str(), error = %e, "Failed to read worker output");
                break;
            }
        }
    }
}

async fn handle_line(
    orch: &JobOrchestrator,
    job_id: &str,
    parser: &mut OutputParser,
    transcript: &mut Transcript,
    stream: StreamKind,
    line: &str,
) {
    transcript.write_line(stream, line).await;

    let Some(event) = parser.feed(stream, line) else {
        return;
    };

    let progress = match event {
        OutputEvent::Step(step) => orch.store.append_step(job_id, &step),
        OutputEvent::Progress(patch) => orch.store.merge_progress(job_id, &patch),
        OutputEvent::FrameProgress { current, total } => orch
            .store
            .update_progress(job_id, |p| p.set_frame(current, total)),
        OutputEvent::Percent(percent) => orch
            .store
            .update_progress(job_id, |p| p.set_percent(percent)),
        OutputEvent::InvalidProgress { raw, error } => {
            tracing::warn!(%raw, %error, "Ignoring malformed progress payload");
            return;
        }
        OutputEvent::Log { level, message } => {
            match orch.store.append_log(job_id, level, &message) {
                Ok(line) => orch.events.publish_log(&line),
                Err(e) => report_store_error(&e, "append log line"),
            }
            return;
        }
    };

    match progress {
        Ok(progress) => orch.events.publish_progress(job_id, &progress),
        Err(e) => report_store_error(&e, "update progress"),
    }
}

fn report_store_error(e: &StoreError, action: &str) {
    match e {
        // Deleted while running.
        StoreError::NotFound(_) => tracing::debug!(error = %e, "Could not {}", action),
        _ => tracing::warn!(error = %e, "Could not {}", action),
    }
}

fn finalize(orch: &JobOrchestrator, job: &Job, parser: OutputParser, exit: WorkerExit) {
    let log_file = job.log_file.as_deref();

    if exit.cancel_requested {
        let failure = JobFailure::cancelled().with_log_file(log_file);
        match orch.store.set_cancelled(&job.id, &failure) {
            Ok(cancelled) => {
                tracing::info!("Job cancelled");
                orch.events.publish_status(
                    &job.id,
                    cancelled.status,
                    cancelled.completed_at.unwrap_or(cancelled.updated_at),
                );
            }
            Err(e) => report_late_transition(&e, JobStatus::Cancelled),
        }
        return;
    }

    let last_stderr = parser.last_stderr().map(|s| s.to_string());
    let failure = match &exit.status {
        ExitKind::Exited(0) => {
            let parsed = parser.finish();
            match extract_result(&parsed, Some(job.input_path.as_str())) {
                Ok(result) => {
                    match orch.store.set_result(&job.id, &result) {
                        Ok(completed) => {
                            tracing::info!(clips = result.clips.len(), "Job completed");
                            orch.events.publish_status(
                                &job.id,
                                completed.status,
                                completed.completed_at.unwrap_or(completed.updated_at),
                            );
                            orch.events.publish_complete(&job.id, &result);
                        }
                        Err(e) => report_late_transition(&e, JobStatus::Completed),
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Worker exited cleanly without a usable result");
                    e.into_failure()
                }
            }
        }
        ExitKind::Exited(code) => {
            let mut message = format!("Worker exited with code {}", code);
            if let Some(stderr) = &last_stderr {
                message.push_str(": ");
                message.push_str(stderr);
            }
            JobFailure::exit_code(*code, message)
        }
        ExitKind::Signaled(signal) => {
            let message = match signal {
                Some(sig) => format!("Worker was killed by signal {}", sig),
                None => "Worker was killed by a signal".to_string(),
            };
            JobFailure::new(ErrorKind::ProcessExitError, message).with_code("SIGNAL")
        }
        ExitKind::WaitFailed(reason) => JobFailure::new(
            ErrorKind::ProcessExitError,
            format!("Lost track of worker process: {}", reason),
        ),
    };

    let failure = failure.with_log_file(log_file);
    match orch.store.set_error(&job.id, &failure) {
        Ok(failed) => {
            tracing::warn!(code = %failure.code, message = %failure.message, "Job failed");
            orch.publish_failed(&failed, &failure);
        }
        Err(e) => report_late_transition(&e, JobStatus::Failed),
    }
}

/// A cancel or delete that won the race already settled the job.
fn report_late_transition(e: &StoreError, to: JobStatus) {
    match e {
        StoreError::InvalidTransition { .. } | StoreError::NotFound(_) => {
            tracing::debug!(error = %e, to = to.as_str(), "Job already settled");
        }
        _ => tracing::error!(error = %e, to = to.as_str(), "Failed to finalize job"),
    }
}
