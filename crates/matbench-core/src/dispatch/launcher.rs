//! Spawning the isolated worker process.
//!
//! A worker is this same binary re-invoked with the `worker` subcommand. It
//! gets a plan file, a trial count, a request id and a memory budget, and
//! writes its outcome file before exiting. The controller waits for either
//! the outcome file or process exit, bounded by a wall-clock timeout after
//! which the worker is killed. Panics, aborts and signals in the worker
//! never reach the controller.

use crate::protocol::{BlockPlan, WorkerOutcome};
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Env var that overrides which binary is launched as the worker.
pub const WORKER_BIN_ENV: &str = "MATBENCH_WORKER_BIN";

const PLAN_FILE: &str = "block_plan.json";
const OUTCOME_FILE: &str = "worker_outcome.json";
const STDERR_TAIL_BYTES: usize = 8 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long a worker may linger after its outcome file appeared.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub plan: BlockPlan,
    pub trials: u32,
    pub request_id: u64,
    pub memory_mb: u64,
    pub timeout: Duration,
}

/// What came back from one worker invocation, before interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchResult {
    /// An outcome file was read. Its request id has not been checked yet.
    Outcome(WorkerOutcome),
    /// The worker exited without leaving a readable outcome.
    Exited { status: String, stderr: String },
    /// No outcome within the wall-clock budget; the worker was killed.
    TimedOut { stderr: String },
}

/// Failure-injection boundary between the dispatcher and the OS.
pub trait WorkerLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<LaunchResult>;

    /// Binary or description recorded in the session log.
    fn describe(&self) -> String;
}

/// Shared view of the worker currently in flight, for killing it from
/// outside the launching thread (e.g. on a forced exit).
#[derive(Debug, Clone, Default)]
pub struct WorkerHandle(Arc<AtomicU32>);

impl WorkerHandle {
    /// Pid of the running worker, if any.
    pub fn pid(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Kills the running worker and its process group. Returns whether a
    /// worker was running.
    pub fn kill(&self) -> bool {
        let Some(pid) = self.pid() else {
            return false;
        };
        kill_group(pid);
        true
    }

    fn set(&self, pid: u32) {
        self.0.store(pid, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

pub struct ProcessLauncher {
    program: PathBuf,
    leading_args: Vec<OsString>,
    work_dir: PathBuf,
    active: WorkerHandle,
}

impl ProcessLauncher {
    /// `work_dir` holds the plan and outcome files; it must exist.
    pub fn new(
        program: impl Into<PathBuf>,
        leading_args: Vec<OsString>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args,
            work_dir: work_dir.into(),
            active: WorkerHandle::default(),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.active.clone()
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn plan_path(&self) -> PathBuf {
        self.work_dir.join(PLAN_FILE)
    }

    fn outcome_path(&self) -> PathBuf {
        self.work_dir.join(OUTCOME_FILE)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, req: &LaunchRequest) -> Result<LaunchResult> {
        let plan_path = self.plan_path();
        let outcome_path = self.outcome_path();

        // A leftover outcome from an earlier block must never be picked up.
        if outcome_path.exists() {
            std::fs::remove_file(&outcome_path)
                .with_context(|| format!("removing stale outcome {}", outcome_path.display()))?;
        }
        req.plan.write(&plan_path).context("writing block plan")?;

        let mut cmd = Command::new(&self.program);
        // Own process group: a terminal Ctrl-C stops the sweep between
        // blocks instead of killing the block in flight.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        let mut child = cmd
            .args(&self.leading_args)
            .arg("--plan")
            .arg(&plan_path)
            .arg("--trials")
            .arg(req.trials.to_string())
            .arg("--request-id")
            .arg(req.request_id.to_string())
            .arg("--memory-mb")
            .arg(req.memory_mb.to_string())
            .arg("--outcome")
            .arg(&outcome_path)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning worker binary: {}", self.program.display()))?;

        self.active.set(child.id());
        let stderr = child.stderr.take().map(spawn_stderr_tail);
        let waited = child.wait_for_outcome(&outcome_path, req.timeout);

        let result = match waited {
            Ok(Waited::OutcomeReady) => {
                if child.wait_timeout(EXIT_GRACE)?.is_none() {
                    debug!(pid = child.id(), "worker lingered after writing outcome; killing");
                    reap(&mut child);
                }
                read_outcome(
                    &outcome_path,
                    "exited after writing outcome".into(),
                    stderr,
                )
            }
            Ok(Waited::Exited(status)) => read_outcome(&outcome_path, status.to_string(), stderr),
            Ok(Waited::TimedOut) => {
                warn!(pid = child.id(), timeout = ?req.timeout, "worker frozen; killing");
                reap(&mut child);
                LaunchResult::TimedOut {
                    stderr: join_tail(stderr),
                }
            }
            Err(e) => {
                reap(&mut child);
                self.active.clear();
                return Err(e).context("waiting for worker");
            }
        };
        self.active.clear();
        Ok(result)
    }

    fn describe(&self) -> String {
        self.program.display().to_string()
    }
}

fn read_outcome(path: &Path, status: String, stderr: Option<JoinHandle<String>>) -> LaunchResult {
    let tail = join_tail(stderr);
    if !path.exists() {
        return LaunchResult::Exited { status, stderr: tail };
    }
    match WorkerOutcome::read(path) {
        Ok(outcome) => {
            if !tail.is_empty() {
                debug!(stderr = %tail, "worker stderr");
            }
            LaunchResult::Outcome(outcome)
        }
        Err(e) => LaunchResult::Exited {
            status: format!("{status}; {e}"),
            stderr: tail,
        },
    }
}

/// Kills the worker's whole process group so nothing it started keeps the
/// stderr pipe open.
fn reap(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

/// Workers lead their own process group, so the group id is the pid.
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(pid) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Drains stderr on a thread so a chatty worker cannot block on a full
/// pipe; keeps only the last few KiB.
fn spawn_stderr_tail(mut stderr: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

fn join_tail(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}

enum Waited {
    Exited(ExitStatus),
    OutcomeReady,
    TimedOut,
}

trait ChildExt {
    fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>>;

    fn wait_for_outcome(&mut self, outcome: &Path, timeout: Duration) -> std::io::Result<Waited>;
}

impl ChildExt for Child {
    fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            match self.try_wait()? {
                Some(status) => return Ok(Some(status)),
                None if start.elapsed() >= timeout => return Ok(None),
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn wait_for_outcome(&mut self, outcome: &Path, timeout: Duration) -> std::io::Result<Waited> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Waited::Exited(status));
            }
            // The worker renames a finished file into place, so existence means complete.
            if outcome.exists() {
                return Ok(Waited::OutcomeReady);
            }
            if start.elapsed() >= timeout {
                return Ok(Waited::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Finds the binary to launch as the worker: `MATBENCH_WORKER_BIN`, then the
/// current executable, then `matbench` on `PATH`.
pub fn resolve_worker_binary() -> PathBuf {
    if let Ok(bin) = std::env::var(WORKER_BIN_ENV) {
        let path = PathBuf::from(bin);
        if path.exists() {
            return path;
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        return exe;
    }
    PathBuf::from("matbench")
}
