//! Case sequencer: folds block outcomes into per-case progress and decides
//! when a size is done and when the case is.

use crate::config::TooSlowPolicy;
use crate::dispatch::DispatchReport;
use crate::model::{BenchmarkCase, Measurement, SizeMetrics};
use crate::protocol::{BlockOutcome, FailureReason};
use crate::store::{PersistedCaseRecord, RECORD_SCHEMA};
use serde::{Deserialize, Serialize};

/// Why a case stopped before finishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseFailure {
    pub reason: FailureReason,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Memory retries ran out; later runs skip the case too.
    pub permanent: bool,
}

/// Mutable progress of one case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseState {
    size_index: usize,
    /// Samples collected so far for `size_index`.
    pending: Vec<Measurement>,
    /// One slot per size; `Some` once the size is finalized.
    finalized: Vec<Option<SizeMetrics>>,
    failure: Option<CaseFailure>,
    complete: bool,
    max_memory_mb: u64,
}

impl CaseState {
    pub fn fresh(size_count: usize) -> Self {
        Self {
            size_index: 0,
            pending: Vec::new(),
            finalized: vec![None; size_count],
            failure: None,
            complete: false,
            max_memory_mb: 0,
        }
    }

    /// State positioned at `size_index` with slots before it finalized.
    pub(crate) fn resumed(
        size_index: usize,
        pending: Vec<Measurement>,
        finalized: Vec<Option<SizeMetrics>>,
        max_memory_mb: u64,
    ) -> Self {
        Self {
            size_index,
            pending,
            finalized,
            failure: None,
            complete: false,
            max_memory_mb,
        }
    }

    pub fn size_index(&self) -> usize {
        self.size_index
    }

    pub fn pending(&self) -> &[Measurement] {
        &self.pending
    }

    pub fn finalized(&self) -> &[Option<SizeMetrics>] {
        &self.finalized
    }

    pub fn failure(&self) -> Option<&CaseFailure> {
        self.failure.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }

    /// Nothing more will be run for this case in this run.
    pub fn is_finished(&self) -> bool {
        self.complete || self.failure.is_some()
    }
}

/// What one fold did to the case.
#[derive(Debug, Clone, PartialEq)]
pub enum Fold {
    /// The current size needs more trials.
    Continue { collected: usize },
    /// The current size was finalized; the next one is up.
    Advanced { finalized_size: usize },
    /// No more sizes to run.
    Finished,
    /// The case stops for this run.
    Failed { reason: FailureReason, permanent: bool },
}

pub struct CaseSequencer {
    case: BenchmarkCase,
    policy: TooSlowPolicy,
    state: CaseState,
}

impl CaseSequencer {
    pub fn new(case: BenchmarkCase, policy: TooSlowPolicy) -> Self {
        let state = CaseState::fresh(case.sizes().len());
        Self { case, policy, state }
    }

    pub fn with_state(case: BenchmarkCase, policy: TooSlowPolicy, state: CaseState) -> Self {
        Self { case, policy, state }
    }

    pub fn case(&self) -> &BenchmarkCase {
        &self.case
    }

    pub fn state(&self) -> &CaseState {
        &self.state
    }

    pub fn current_size(&self) -> Option<usize> {
        if self.state.is_finished() {
            return None;
        }
        self.case.sizes().get(self.state.size_index).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Folds one block's result into the case. Calls after the case
    /// finished change nothing.
    pub fn fold(&mut self, report: &DispatchReport) -> Fold {
        let Some(size) = self.current_size() else {
            return self.settled();
        };

        match &report.outcome {
            BlockOutcome::Completed { measurements } if measurements.is_empty() => self.fail(
                FailureReason::MiscException,
                size,
                Some("block finished without measurements".into()),
                false,
            ),
            BlockOutcome::Completed { measurements } => {
                self.state.max_memory_mb = self.state.max_memory_mb.max(report.memory_mb);
                self.append(measurements);
                if self.state.pending.len() >= self.case.max_trials() as usize {
                    self.finalize_and_advance()
                } else {
                    Fold::Continue {
                        collected: self.state.pending.len(),
                    }
                }
            }
            BlockOutcome::TooSlow { measurements } => {
                self.state.max_memory_mb = self.state.max_memory_mb.max(report.memory_mb);
                self.append(measurements);
                match self.policy {
                    TooSlowPolicy::AdvanceSize => self.finalize_and_advance(),
                    TooSlowPolicy::AbortCase => {
                        self.finalize_current();
                        self.state.complete = true;
                        Fold::Finished
                    }
                }
            }
            BlockOutcome::Failed { reason, detail } => {
                self.fail(*reason, size, detail.clone(), report.memory_exhausted)
            }
        }
    }

    /// Appends up to the trial ceiling; a batch may fill it mid-list.
    fn append(&mut self, measurements: &[Measurement]) {
        let room = (self.case.max_trials() as usize)
            .saturating_sub(self.state.pending.len());
        self.state
            .pending
            .extend(measurements.iter().take(room).copied());
    }

    fn finalize_current(&mut self) {
        let slot = &mut self.state.finalized[self.state.size_index];
        if slot.is_none() {
            *slot = Some(SizeMetrics::from_samples(&self.state.pending));
        }
        self.state.pending.clear();
    }

    fn finalize_and_advance(&mut self) -> Fold {
        let finalized_size = self.case.sizes()[self.state.size_index];
        self.finalize_current();
        self.state.size_index += 1;
        if self.state.size_index >= self.case.sizes().len() {
            self.state.complete = true;
            Fold::Finished
        } else {
            Fold::Advanced { finalized_size }
        }
    }

    fn fail(
        &mut self,
        reason: FailureReason,
        size: usize,
        detail: Option<String>,
        permanent: bool,
    ) -> Fold {
        self.state.failure = Some(CaseFailure {
            reason,
            size,
            detail,
            permanent,
        });
        if permanent {
            self.state.complete = true;
        }
        Fold::Failed { reason, permanent }
    }

    fn settled(&self) -> Fold {
        match &self.state.failure {
            Some(f) => Fold::Failed {
                reason: f.reason,
                permanent: f.permanent,
            },
            None => Fold::Finished,
        }
    }

    /// On-disk form of the current state. The in-progress size is written
    /// with the samples collected so far so a restart can reuse them.
    pub fn to_record(&self) -> PersistedCaseRecord {
        let mut metrics = self.state.finalized.clone();
        let idx = self.state.size_index;
        if idx < metrics.len() && metrics[idx].is_none() && !self.state.pending.is_empty() {
            metrics[idx] = Some(SizeMetrics::from_samples(&self.state.pending));
        }
        PersistedCaseRecord {
            schema_version: RECORD_SCHEMA.to_string(),
            library: self.case.library().to_string(),
            display_name: self.case.display_name().to_string(),
            operation: self.case.operation(),
            sizes: self.case.sizes().to_vec(),
            metrics,
            complete: self.state.complete,
            failure: self.state.failure.clone(),
            max_memory_mb: self.state.max_memory_mb,
            updated_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;
    use proptest::prelude::*;

    fn m(elapsed: f64) -> Measurement {
        Measurement {
            ops_per_sec: 100.0,
            elapsed_secs: elapsed,
            cycles: 100,
        }
    }

    fn report(outcome: BlockOutcome) -> DispatchReport {
        DispatchReport {
            request_id: 1,
            outcome,
            memory_mb: 300,
            budgets_mb: vec![300],
            memory_exhausted: false,
        }
    }

    fn completed(n: usize) -> DispatchReport {
        report(BlockOutcome::Completed {
            measurements: vec![m(0.1); n],
        })
    }

    fn too_slow(n: usize) -> DispatchReport {
        report(BlockOutcome::TooSlow {
            measurements: vec![m(9.0); n],
        })
    }

    fn seq(policy: TooSlowPolicy) -> CaseSequencer {
        let case = BenchmarkCase::new("naive", Operation::Mult, vec![10, 50, 100], 5).unwrap();
        CaseSequencer::new(case, policy)
    }

    fn counts(s: &CaseSequencer) -> Vec<Option<usize>> {
        s.state()
            .finalized()
            .iter()
            .map(|slot| slot.as_ref().map(|m| m.sample_count))
            .collect()
    }

    #[test]
    fn three_size_sweep_ends_complete() {
        let mut s = seq(TooSlowPolicy::AdvanceSize);
        assert_eq!(s.fold(&completed(5)), Fold::Advanced { finalized_size: 10 });
        assert_eq!(s.fold(&completed(3)), Fold::Continue { collected: 3 });
        assert_eq!(s.fold(&completed(2)), Fold::Advanced { finalized_size: 50 });
        assert_eq!(s.fold(&too_slow(1)), Fold::Finished);

        assert_eq!(counts(&s), vec![Some(5), Some(5), Some(1)]);
        let record = s.to_record();
        assert!(record.complete);
        assert_eq!(record.max_memory_mb, 300);
        assert!(record.failure.is_none());
    }

    #[test]
    fn oversized_batch_is_cut_at_the_ceiling() {
        let mut s = seq(TooSlowPolicy::AdvanceSize);
        s.fold(&completed(4));
        assert_eq!(s.fold(&completed(5)), Fold::Advanced { finalized_size: 10 });
        assert_eq!(counts(&s)[0], Some(5));
        assert!(s.state().pending().is_empty());
    }

    #[test]
    fn zero_sample_too_slow_still_advances() {
        let mut s = seq(TooSlowPolicy::AdvanceSize);
        assert_eq!(s.fold(&too_slow(0)), Fold::Advanced { finalized_size: 10 });
        assert_eq!(s.state().size_index(), 1);
        assert_eq!(counts(&s)[0], Some(0));
    }

    #[test]
    fn abort_policy_skips_larger_sizes() {
        let mut s = seq(TooSlowPolicy::AbortCase);
        s.fold(&completed(5));
        assert_eq!(s.fold(&too_slow(1)), Fold::Finished);
        assert_eq!(counts(&s), vec![Some(5), Some(1), None]);
        assert!(s.state().is_complete());
        assert_eq!(s.current_size(), None);
    }

    #[test]
    fn misc_failure_is_resumable_and_keeps_samples() {
        let mut s = seq(TooSlowPolicy::AdvanceSize);
        s.fold(&completed(5));
        s.fold(&completed(2));
        let fold = s.fold(&report(BlockOutcome::failed(FailureReason::Frozen, "killed")));
        assert_eq!(
            fold,
            Fold::Failed {
                reason: FailureReason::Frozen,
                permanent: false
            }
        );
        let record = s.to_record();
        assert!(!record.complete);
        assert_eq!(record.metrics[1].as_ref().unwrap().sample_count, 2);
        assert_eq!(record.failure.unwrap().size, 50);
    }

    #[test]
    fn exhausted_memory_is_permanent() {
        let mut s = seq(TooSlowPolicy::AdvanceSize);
        let mut r = report(BlockOutcome::failed(FailureReason::OutOfMemory, "oom"));
        r.memory_exhausted = true;
        r.memory_mb = 4000;
        assert_eq!(
            s.fold(&r),
            Fold::Failed {
                reason: FailureReason::OutOfMemory,
                permanent: true
            }
        );
        assert!(s.to_record().complete);
        assert_eq!(
            s.state().max_memory_mb(),
            0,
            "failed blocks do not count as memory used"
        );
    }

    #[test]
    fn folds_after_finish_change_nothing() {
        let mut s = seq(TooSlowPolicy::AbortCase);
        s.fold(&too_slow(1));
        let before = s.state().clone();
        assert_eq!(s.fold(&completed(5)), Fold::Finished);
        assert_eq!(s.state(), &before);
    }

    #[test]
    fn empty_success_is_not_progress() {
        let mut s = seq(TooSlowPolicy::AdvanceSize);
        assert!(matches!(s.fold(&completed(0)), Fold::Failed { permanent: false, .. }));
    }

    fn outcome_strategy() -> impl Strategy<Value = DispatchReport> {
        prop_oneof![
            (0usize..7).prop_map(completed),
            (0usize..3).prop_map(too_slow),
            Just(report(BlockOutcome::failed(FailureReason::MiscException, "x"))),
        ]
    }

    proptest! {
        #[test]
        fn size_index_never_decreases(
            reports in proptest::collection::vec(outcome_strategy(), 0..40),
        ) {
            for policy in [TooSlowPolicy::AdvanceSize, TooSlowPolicy::AbortCase] {
                let mut s = seq(policy);
                let mut last = 0;
                let mut frozen: Vec<Option<SizeMetrics>> = vec![None; 3];
                for r in &reports {
                    s.fold(r);
                    let idx = s.state().size_index();
                    prop_assert!(idx >= last);
                    prop_assert!(idx <= 3);
                    last = idx;
                    for (i, slot) in s.state().finalized().iter().enumerate() {
                        if let Some(done) = &frozen[i] {
                            prop_assert_eq!(Some(done), slot.as_ref());
                        } else if slot.is_some() {
                            frozen[i] = slot.clone();
                        }
                    }
                }
            }
        }
    }
}
