//! Per-run, append-only session log (`log<N>.txt` in the output directory).
//!
//! Diagnostic only: nothing reads it back. A failed write is reported via
//! `tracing` and otherwise ignored so logging never stops a sweep.

use crate::model::Operation;
use crate::protocol::FailureReason;
use anyhow::{bail, Context, Result};
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MAX_LOG_INDEX: u32 = 1000;

pub struct SessionLog {
    path: Option<PathBuf>,
    out: Box<dyn Write + Send>,
}

impl SessionLog {
    /// Opens `log<N>.txt` in `dir` for the first N not already taken.
    pub fn create_in(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        for i in 0..MAX_LOG_INDEX {
            let path = dir.join(format!("log{i}.txt"));
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(Self {
                        path: Some(path),
                        out: Box::new(file),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("creating session log {}", path.display()))
                }
            }
        }
        bail!(
            "no free session log name in {} (log0.txt..log{}.txt all exist)",
            dir.display(),
            MAX_LOG_INDEX - 1
        )
    }

    pub fn to_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            path: None,
            out: Box::new(out),
        }
    }

    pub fn disabled() -> Self {
        Self::to_writer(io::sink())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(&mut self, message: impl Display) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let written = writeln!(self.out, "[{stamp}] {message}")
            .and_then(|()| self.out.flush());
        if let Err(e) = written {
            warn!(error = %e, "session log write failed");
        }
    }

    pub fn startup(&mut self, working_dir: &Path, worker: &str) {
        self.line(format_args!("start: working directory {}", working_dir.display()));
        self.line(format_args!("start: worker binary {worker}"));
    }

    pub fn resumed(&mut self, case: &str, size: usize, samples: usize) {
        self.line(format_args!("resume {case} at size {size} with {samples} existing samples"));
    }

    pub fn skipped(&mut self, case: &str, why: &str) {
        self.line(format_args!("skip {case}: {why}"));
    }

    pub fn retry(&mut self, op: Operation, size: usize, attempt: u32, memory_mb: u64) {
        self.line(format_args!(
            "retry: attempt {attempt} of {op} at size {size} ran out of memory with {memory_mb} MB"
        ));
    }

    pub fn failure(
        &mut self,
        reason: FailureReason,
        op: Operation,
        size: usize,
        memory_mb: u64,
        detail: Option<&str>,
    ) {
        self.line(format_args!(
            "failure: {reason} in {op} at size {size} with {memory_mb} MB: {}",
            detail.unwrap_or("(no detail)")
        ));
    }

    pub fn finished(&mut self, case: &str, outcome: &str) {
        self.line(format_args!("finish {case}: {outcome}"));
    }
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// In-memory sink shared with the test that inspects it.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl Captured {
    pub(crate) fn log() -> (SessionLog, Self) {
        let cap = Self::default();
        (SessionLog::to_writer(cap.clone()), cap)
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
