//! Process supervisor: the job id → live worker registry.
//!
//! Registration happens in the same critical section as the OS spawn, and
//! only the reaper task that owns the child removes the entry, so a job can
//! never have two live workers and a cancel after exit is a silent no-op.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;

use super::invocation::WorkerInvocation;
use crate::error::SupervisorError;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    /// Killed by a signal; carries the signal number where the OS reports one.
    Signaled(Option<i32>),
    /// Waiting on the child failed.
    WaitFailed(String),
}

impl ExitKind {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitKind::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            ExitKind::Signaled(status.signal())
        }
        #[cfg(not(unix))]
        {
            ExitKind::Signaled(None)
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {}", code),
            ExitKind::Signaled(Some(sig)) => write!(f, "signal {}", sig),
            ExitKind::Signaled(None) => write!(f, "signal"),
            ExitKind::WaitFailed(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

/// Delivered once per spawned worker, after the registry entry is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub status: ExitKind,
    /// Whether `signal_terminate` was called while the worker was live.
    pub cancel_requested: bool,
}

/// Handles for a freshly spawned worker.
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub exit: oneshot::Receiver<WorkerExit>,
}

struct LiveWorker {
    pid: Option<u32>,
    generation: u64,
    cancel_requested: bool,
    /// Fires the forced kill; taken by the first terminate request.
    kill_tx: Option<oneshot::Sender<()>>,
}

type Registry = Arc<Mutex<HashMap<String, LiveWorker>>>;

fn lock_registry(
    registry: &Mutex<HashMap<String, LiveWorker>>,
) -> MutexGuard<'_, HashMap<String, LiveWorker>> {
    match registry.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("Process registry lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Owns every live worker process.
pub struct ProcessSupervisor {
    registry: Registry,
    next_generation: AtomicU64,
    grace: Duration,
}

impl ProcessSupervisor {
    /// `grace` is the delay between SIGTERM and a forced kill.
    pub fn new(grace: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            grace,
        }
    }

    /// Spawns the worker for `job_id` and starts its reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        &self,
        job_id: &str,
        invocation: &WorkerInvocation,
    ) -> Result<SpawnedWorker, SupervisorError> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| SupervisorError::LockPoisoned)?;
        if registry.contains_key(job_id) {
            return Err(SupervisorError::AlreadyRunning(job_id.to_string()));
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            executable: invocation.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingStream)?;
        let stderr = child.stderr.take().ok_or(SupervisorError::MissingStream)?;
        let pid = child.id();

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        registry.insert(
            job_id.to_string(),
            LiveWorker {
                pid,
                generation,
                cancel_requested: false,
                kill_tx: Some(kill_tx),
            },
        );
        drop(registry);

        tracing::info!(job_id, pid, program = %invocation.program, "Worker spawned");

        tokio::spawn(reap(
            Arc::clone(&self.registry),
            job_id.to_string(),
            generation,
            child,
            kill_rx,
            exit_tx,
        ));

        Ok(SpawnedWorker {
            pid,
            stdout,
            stderr,
            exit: exit_rx,
        })
    }

    /// Asks the worker to stop: SIGTERM now, forced kill after the grace
    /// period. Returns false when no worker is live for `job_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn signal_terminate(&self, job_id: &str) -> bool {
        let mut registry = lock_registry(&self.registry);
        let Some(worker) = registry.get_mut(job_id) else {
            return false;
        };
        worker.cancel_requested = true;

        #[cfg(unix)]
        if let Some(pid) = worker.pid {
            send_sigterm(pid);
        }

        if let Some(kill_tx) = worker.kill_tx.take() {
            #[cfg(unix)]
            {
                let grace = self.grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = kill_tx.send(());
                });
            }
            #[cfg(not(unix))]
            {
                let _ = kill_tx.send(());
            }
        }

        tracing::info!(job_id, "Worker termination requested");
        true
    }

    pub fn is_live(&self, job_id: &str) -> bool {
        lock_registry(&self.registry).contains_key(job_id)
    }

    pub fn live_jobs(&self) -> Vec<String> {
        lock_registry(&self.registry).keys().cloned().collect()
    }

    /// Signals every live worker; returns how many were signaled.
    pub fn terminate_all(&self) -> usize {
        self.live_jobs()
            .iter()
            .filter(|job_id| self.signal_terminate(job_id))
            .count()
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // Safety: kill(2) takes plain integers and has no memory preconditions.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        tracing::warn!(
            pid,
            error = %std::io::Error::last_os_error(),
            "Failed to send SIGTERM"
        );
    }
}

async fn reap(
    registry: Registry,
    job_id: String,
    generation: u64,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<WorkerExit>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = &mut kill_rx => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            tracing::warn!(job_id = %job_id, "Worker did not exit after SIGTERM, killing");
            if let Err(e) = child.start_kill() {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to kill worker");
            }
            child.wait().await
        }
    };

    let cancel_requested = {
        let mut registry = lock_registry(&registry);
        match registry.get(&job_id) {
            Some(worker) if worker.generation == generation => registry
                .remove(&job_id)
                .map(|w| w.cancel_requested)
                .unwrap_or(false),
            _ => false,
        }
    };

    let status = match status {
        Ok(status) => ExitKind::from_status(status),
        Err(e) => ExitKind::WaitFailed(e.to_string()),
    };
    tracing::info!(job_id = %job_id, %status, cancel_requested, "Worker exited");

    // The receiver may already be gone if the job was deleted.
    let _ = exit_tx.send(WorkerExit {
        status,
        cancel_requested,
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> WorkerInvocation {
        WorkerInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_spawn_and_reap() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(5));
        let mut worker = supervisor.spawn("j1", &sh("echo hello; exit 3")).unwrap();
        assert!(worker.pid.is_some());

        let mut out = String::new();
        worker.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");

        let exit = worker.exit.await.unwrap();
        assert_eq!(exit.status, ExitKind::Exited(3));
        assert!(!exit.cancel_requested);
        assert!(!supervisor.is_live("j1"));
        assert!(!supervisor.signal_terminate("j1"));
    }

    #[tokio::test]
    async fn test_second_spawn_for_live_job_fails() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(5));
        let worker = supervisor.spawn("j1", &sh("exec sleep 30")).unwrap();

        let err = supervisor.spawn("j1", &sh("true")).err().unwrap();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        assert_eq!(supervisor.live_jobs(), vec!["j1".to_string()]);

        assert!(supervisor.signal_terminate("j1"));
        let exit = worker.exit.await.unwrap();
        assert!(exit.cancel_requested);
        assert_eq!(exit.status, ExitKind::Signaled(Some(libc::SIGTERM)));
    }

    #[tokio::test]
    async fn test_forced_kill_after_grace() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(200));
        let worker = supervisor
            .spawn("j1", &sh("trap '' TERM; while true; do sleep 0.05; done"))
            .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(supervisor.signal_terminate("j1"));
        let exit = tokio::time::timeout(Duration::from_secs(10), worker.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.status, ExitKind::Signaled(Some(libc::SIGKILL)));
        assert!(exit.cancel_requested);
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(1));
        let invocation = WorkerInvocation {
            program: "/nonexistent/clipper-worker".to_string(),
            args: vec![],
            working_dir: None,
            env: Default::default(),
        };
        let err = supervisor.spawn("j1", &invocation).err().unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(!supervisor.is_live("j1"));
    }

    #[tokio::test]
    async fn test_terminate_all() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(5));
        let a = supervisor.spawn("a", &sh("exec sleep 30")).unwrap();
        let b = supervisor.spawn("b", &sh("exec sleep 30")).unwrap();

        assert_eq!(supervisor.terminate_all(), 2);
        assert!(a.exit.await.unwrap().cancel_requested);
        assert!(b.exit.await.unwrap().cancel_requested);
        assert!(supervisor.live_jobs().is_empty());
    }
}
