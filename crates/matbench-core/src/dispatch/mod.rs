//! Block dispatch: memory budgeting, worker invocation and out-of-memory
//! escalation.
//!
//! One call to [`BlockRunner::run_block`] is one block. The dispatcher
//! computes a budget, launches a worker, interprets what came back and, on
//! out-of-memory, retries with a larger budget. Out-of-memory never reaches
//! the case sequencer unless every attempt failed.

pub mod launcher;

pub use launcher::{LaunchRequest, LaunchResult, ProcessLauncher, WorkerHandle, WorkerLauncher};

use crate::config::{MemoryConfig, SweepConfig};
use crate::model::BenchmarkCase;
use crate::protocol::{BlockOutcome, BlockPlan, FailureReason, PLAN_SCHEMA};
use crate::session_log::SessionLog;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;

/// Printed by the Rust allocator right before it aborts the process.
const ALLOC_ABORT_MARKER: &str = "memory allocation of";

/// Turns an input footprint into a worker memory budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPolicy {
    base_mb: u64,
    max_attempts: u32,
    growth_step: u64,
    fixed_mb: Option<u64>,
}

impl From<&MemoryConfig> for MemoryPolicy {
    fn from(cfg: &MemoryConfig) -> Self {
        Self {
            base_mb: cfg.base_mb,
            max_attempts: cfg.max_attempts.max(1),
            growth_step: cfg.growth_step,
            fixed_mb: cfg.fixed_mb,
        }
    }
}

impl MemoryPolicy {
    /// Input footprint rounded up to whole MiB plus the fixed overhead.
    pub fn estimate_mb(&self, footprint_bytes: u64) -> u64 {
        footprint_bytes.div_ceil(MIB).saturating_add(self.base_mb)
    }

    /// Budget for 0-based `attempt`: the larger of estimate and floor,
    /// scaled by `1 + growth_step * attempt`.
    pub fn budget_mb(&self, estimate_mb: u64, floor_mb: u64, attempt: u32) -> u64 {
        if let Some(fixed) = self.fixed_mb {
            return fixed;
        }
        let factor = 1 + self.growth_step.saturating_mul(u64::from(attempt));
        estimate_mb.max(floor_mb).saturating_mul(factor)
    }

    /// A fixed budget leaves nothing to escalate.
    pub fn attempts(&self) -> u32 {
        if self.fixed_mb.is_some() {
            1
        } else {
            self.max_attempts
        }
    }
}

/// Everything the sequencer and orchestrator learn from one block.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub request_id: u64,
    pub outcome: BlockOutcome,
    /// Budget of the attempt that produced `outcome`.
    pub memory_mb: u64,
    /// Every budget issued for this block, in order.
    pub budgets_mb: Vec<u64>,
    /// All attempts ran out of memory; the case cannot continue.
    pub memory_exhausted: bool,
}

impl DispatchReport {
    pub fn attempts(&self) -> usize {
        self.budgets_mb.len()
    }
}

/// Runs one block for a case. The orchestrator only sees this trait, so
/// tests can drive it without spawning processes.
pub trait BlockRunner {
    fn run_block(
        &mut self,
        case: &BenchmarkCase,
        size_index: usize,
        collected: usize,
        log: &mut SessionLog,
    ) -> Result<DispatchReport>;
}

pub struct BlockDispatcher<L> {
    launcher: L,
    memory: MemoryPolicy,
    block_trials: u32,
    seed: u64,
    trial_time_ms: u64,
    max_trial_time_ms: u64,
    max_block_time_ms: u64,
    timeout: Duration,
    validate: bool,
    tolerance: f64,
    ids: StdRng,
    /// Largest budget that let a block finish; never decreases.
    memory_floor_mb: u64,
}

impl<L: WorkerLauncher> BlockDispatcher<L> {
    pub fn new(launcher: L, cfg: &SweepConfig) -> Self {
        Self {
            launcher,
            memory: MemoryPolicy::from(&cfg.memory),
            block_trials: cfg.block_trials.max(1),
            seed: cfg.seed,
            trial_time_ms: cfg.trial_time_ms,
            max_trial_time_ms: cfg.max_trial_time_ms,
            max_block_time_ms: cfg.max_block_time_ms,
            timeout: cfg.block_timeout(),
            validate: cfg.validate,
            tolerance: cfg.tolerance,
            ids: StdRng::seed_from_u64(cfg.seed.rotate_left(32)),
            memory_floor_mb: 0,
        }
    }

    pub fn memory_floor_mb(&self) -> u64 {
        self.memory_floor_mb
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn plan(&self, case: &BenchmarkCase, size_index: usize) -> BlockPlan {
        BlockPlan {
            schema_version: PLAN_SCHEMA.to_string(),
            library: case.library().to_string(),
            operation: case.operation(),
            size: case.sizes()[size_index],
            size_index,
            seed: self.seed,
            trial_time_ms: self.trial_time_ms,
            max_trial_time_ms: self.max_trial_time_ms,
            max_block_time_ms: self.max_block_time_ms,
            validate: self.validate,
            tolerance: self.tolerance,
        }
    }

    /// Never asks for more trials than the ceiling has room for.
    fn trials_to_request(&self, case: &BenchmarkCase, collected: usize) -> u32 {
        let remaining = (case.max_trials() as usize).saturating_sub(collected);
        (remaining.min(self.block_trials as usize) as u32).max(1)
    }
}

impl<L: WorkerLauncher> BlockRunner for BlockDispatcher<L> {
    fn run_block(
        &mut self,
        case: &BenchmarkCase,
        size_index: usize,
        collected: usize,
        log: &mut SessionLog,
    ) -> Result<DispatchReport> {
        let plan = self.plan(case, size_index);
        let op = plan.operation;
        let size = plan.size;
        let trials = self.trials_to_request(case, collected);
        let estimate = self.memory.estimate_mb(op.input_footprint_bytes(size));
        let attempts = self.memory.attempts();
        let mut budgets = Vec::with_capacity(attempts as usize);
        let mut request_id = 0;

        info!(case = %case.label(), size, trials, collected, "dispatching block");

        for attempt in 0..attempts {
            let memory_mb = self
                .memory
                .budget_mb(estimate, self.memory_floor_mb, attempt);
            budgets.push(memory_mb);
            request_id = self.ids.gen::<u64>();
            debug!(attempt, memory_mb, request_id, "launching worker");

            let request = LaunchRequest {
                plan: plan.clone(),
                trials,
                request_id,
                memory_mb,
                timeout: self.timeout,
            };
            let result = self
                .launcher
                .launch(&request)
                .with_context(|| format!("launching worker for {} at size {size}", case.label()))?;
            let outcome = interpret(request_id, result);

            if outcome.is_out_of_memory() {
                warn!(case = %case.label(), size, attempt, memory_mb, "worker ran out of memory");
                if attempt + 1 < attempts {
                    log.retry(op, size, attempt + 1, memory_mb);
                }
                continue;
            }

            match &outcome {
                BlockOutcome::Failed { reason, detail } => {
                    warn!(case = %case.label(), size, %reason, "block failed");
                    log.failure(*reason, op, size, memory_mb, detail.as_deref());
                }
                _ => self.memory_floor_mb = self.memory_floor_mb.max(memory_mb),
            }

            return Ok(DispatchReport {
                request_id,
                outcome,
                memory_mb,
                budgets_mb: budgets,
                memory_exhausted: false,
            });
        }

        let memory_mb = budgets.last().copied().unwrap_or(estimate);
        let detail =
            format!("out of memory after {attempts} attempts (last budget {memory_mb} MB)");
        warn!(case = %case.label(), size, memory_mb, "memory retries exhausted");
        log.failure(FailureReason::OutOfMemory, op, size, memory_mb, Some(&detail));
        Ok(DispatchReport {
            request_id,
            outcome: BlockOutcome::failed(FailureReason::OutOfMemory, detail),
            memory_mb,
            budgets_mb: budgets,
            memory_exhausted: true,
        })
    }
}

/// Maps a raw launch result to a block outcome for `request_id`.
fn interpret(request_id: u64, result: LaunchResult) -> BlockOutcome {
    match result {
        LaunchResult::Outcome(outcome) if outcome.request_id == request_id => {
            outcome.into_block_outcome()
        }
        LaunchResult::Outcome(outcome) => {
            warn!(
                expected = request_id,
                found = outcome.request_id,
                "discarding stale worker outcome"
            );
            BlockOutcome::failed(
                FailureReason::MiscException,
                format!(
                    "worker left no outcome for request {request_id} (stale outcome for {})",
                    outcome.request_id
                ),
            )
        }
        LaunchResult::Exited { status, stderr } => {
            let reason = if stderr.contains(ALLOC_ABORT_MARKER) {
                FailureReason::OutOfMemory
            } else {
                FailureReason::MiscException
            };
            BlockOutcome::failed(
                reason,
                with_stderr(format!("worker exited without outcome: {status}"), &stderr),
            )
        }
        LaunchResult::TimedOut { stderr } => BlockOutcome::failed(
            FailureReason::Frozen,
            with_stderr("worker killed after timeout".into(), &stderr),
        ),
    }
}

fn with_stderr(head: String, stderr: &str) -> String {
    if stderr.is_empty() {
        head
    } else {
        format!("{head}\n{stderr}")
    }
}
