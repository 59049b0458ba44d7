//! Sweep orchestrator: owns every pending case and drives one block at a
//! time until none are left.

use crate::config::{SweepConfig, TooSlowPolicy};
use crate::dispatch::BlockRunner;
use crate::model::BenchmarkCase;
use crate::sequencer::{CaseFailure, CaseSequencer, Fold};
use crate::session_log::SessionLog;
use crate::store::{LoadedCase, ResultStore};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepSummary {
    /// Cases that finished every size (or ended by policy) in this run.
    pub completed: usize,
    pub failed: usize,
    /// Already complete on disk; not touched.
    pub skipped: usize,
    pub resumed: usize,
    pub blocks: usize,
    pub interrupted: bool,
    pub failures: Vec<(String, CaseFailure)>,
}

impl SweepSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

pub struct Sweep<R> {
    runner: R,
    store: ResultStore,
    policy: TooSlowPolicy,
    randomize: bool,
    rng: StdRng,
    max_trial_time: Duration,
    stop: Arc<AtomicBool>,
}

impl<R: BlockRunner> Sweep<R> {
    pub fn new(runner: R, store: ResultStore, cfg: &SweepConfig) -> Self {
        Self {
            runner,
            store,
            policy: cfg.too_slow_policy,
            randomize: cfg.randomize_order,
            rng: StdRng::seed_from_u64(cfg.seed),
            max_trial_time: cfg.max_trial_time(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the sweep before the next block starts.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn run(&mut self, cases: Vec<BenchmarkCase>, log: &mut SessionLog) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        let mut pending = self.restore(cases, &mut summary, log)?;
        info!(pending = pending.len(), skipped = summary.skipped, "sweep starting");

        while !pending.is_empty() {
            if self.stop.load(Ordering::SeqCst) {
                warn!(remaining = pending.len(), "sweep interrupted");
                log.line(format_args!("interrupted with {} cases pending", pending.len()));
                summary.interrupted = true;
                break;
            }

            let pick = if self.randomize {
                self.rng.gen_range(0..pending.len())
            } else {
                0
            };
            let seq = &mut pending[pick];
            let state = seq.state();
            let (size_index, collected) = (state.size_index(), state.pending().len());

            let report = self
                .runner
                .run_block(seq.case(), size_index, collected, log)?;
            summary.blocks += 1;
            let fold = seq.fold(&report);
            self.store
                .save(&seq.to_record())
                .with_context(|| format!("saving record for {}", seq.case().label()))?;

            let label = seq.case().label();
            match fold {
                Fold::Continue { .. } | Fold::Advanced { .. } => continue,
                Fold::Finished => {
                    info!(case = %label, "case complete");
                    log.finished(&label, "complete");
                    summary.completed += 1;
                }
                Fold::Failed { reason, permanent } => {
                    let kind = if permanent {
                        "permanently failed"
                    } else {
                        "failed, resumable"
                    };
                    warn!(case = %label, %reason, kind, "case stopped");
                    log.finished(&label, &format!("{kind} ({reason})"));
                    summary.failed += 1;
                    if let Some(f) = seq.state().failure() {
                        summary.failures.push((label, f.clone()));
                    }
                }
            }
            pending.remove(pick);
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            blocks = summary.blocks,
            "sweep finished"
        );
        Ok(summary)
    }

    /// Builds a sequencer per case from what the store holds.
    fn restore(
        &self,
        cases: Vec<BenchmarkCase>,
        summary: &mut SweepSummary,
        log: &mut SessionLog,
    ) -> Result<Vec<CaseSequencer>> {
        let mut pending = Vec::with_capacity(cases.len());
        for case in cases {
            let label = case.label();
            let loaded = self
                .store
                .load(&case, self.max_trial_time)
                .with_context(|| format!("loading record for {label}"))?;
            match loaded {
                LoadedCase::Fresh => pending.push(CaseSequencer::new(case, self.policy)),
                LoadedCase::Stale(record) => {
                    log.line(format_args!(
                        "discarding record for {label}: sizes {:?} differ from {:?}",
                        record.sizes,
                        case.sizes()
                    ));
                    pending.push(CaseSequencer::new(case, self.policy));
                }
                LoadedCase::Complete(_) => {
                    info!(case = %label, "already complete");
                    log.skipped(&label, "already complete");
                    summary.skipped += 1;
                }
                LoadedCase::Resume(state) => {
                    let size = case.sizes()[state.size_index()];
                    info!(case = %label, size, samples = state.pending().len(), "resuming");
                    log.resumed(&label, size, state.pending().len());
                    summary.resumed += 1;
                    pending.push(CaseSequencer::with_state(case, self.policy, state));
                }
            }
        }
        Ok(pending)
    }
}
