use matbench_core::config::{SweepConfig, TooSlowPolicy};
use matbench_core::dispatch::{
    BlockDispatcher, BlockRunner, DispatchReport, LaunchRequest, LaunchResult, WorkerLauncher,
};
use matbench_core::model::{BenchmarkCase, Measurement, Operation};
use matbench_core::protocol::{BlockOutcome, FailureReason, WorkerOutcome};
use matbench_core::session_log::SessionLog;
use matbench_core::store::ResultStore;
use matbench_core::Sweep;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn m(elapsed: f64) -> Measurement {
    Measurement {
        ops_per_sec: 1.0 / elapsed,
        elapsed_secs: elapsed,
        cycles: 1,
    }
}

fn ok(n: usize) -> BlockOutcome {
    BlockOutcome::Completed {
        measurements: vec![m(0.01); n],
    }
}

fn too_slow(n: usize) -> BlockOutcome {
    BlockOutcome::TooSlow {
        measurements: vec![m(60.0); n],
    }
}

/// Replays outcomes in order and records every block it was asked for.
#[derive(Default)]
struct ScriptedRunner {
    script: VecDeque<BlockOutcome>,
    calls: Vec<(String, usize, usize)>,
}

impl ScriptedRunner {
    fn new(script: impl IntoIterator<Item = BlockOutcome>) -> Self {
        Self {
            script: script.into_iter().collect(),
            calls: Vec::new(),
        }
    }
}

impl BlockRunner for ScriptedRunner {
    fn run_block(
        &mut self,
        case: &BenchmarkCase,
        size_index: usize,
        collected: usize,
        _log: &mut SessionLog,
    ) -> anyhow::Result<DispatchReport> {
        self.calls.push((case.label(), size_index, collected));
        let outcome = self
            .script
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted outcome left for {}", case.label()))?;
        Ok(DispatchReport {
            request_id: self.calls.len() as u64,
            outcome,
            memory_mb: 256,
            budgets_mb: vec![256],
            memory_exhausted: false,
        })
    }
}

fn cfg(dir: &std::path::Path) -> SweepConfig {
    SweepConfig {
        output_dir: dir.to_path_buf(),
        randomize_order: false,
        sizes: vec![10, 50, 100],
        max_trials: 5,
        max_trial_time_ms: 30_000,
        ..SweepConfig::default()
    }
}

fn mult_case() -> BenchmarkCase {
    BenchmarkCase::new("naive", Operation::Mult, vec![10, 50, 100], 5).unwrap()
}

#[test]
fn three_size_case_finishes_with_expected_record() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(dir.path());
    let runner = ScriptedRunner::new([ok(5), ok(3), ok(2), too_slow(1)]);
    let mut sweep = Sweep::new(runner, ResultStore::new(dir.path()), &cfg);

    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.blocks, 4);
    assert!(summary.is_clean());
    assert_eq!(
        sweep.runner().calls,
        vec![
            ("naive/mult".to_string(), 0, 0),
            ("naive/mult".to_string(), 1, 0),
            ("naive/mult".to_string(), 1, 3),
            ("naive/mult".to_string(), 2, 0),
        ]
    );

    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    let counts: Vec<usize> = record
        .metrics
        .iter()
        .map(|s| s.as_ref().unwrap().sample_count)
        .collect();
    assert_eq!(counts, vec![5, 5, 1]);
    assert!(record.complete);
    assert_eq!(record.sizes, vec![10, 50, 100]);
}

#[test]
fn interrupted_case_resumes_with_existing_samples() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(dir.path());

    // First run dies at size 50 after three samples.
    let first = ScriptedRunner::new([
        ok(5),
        ok(3),
        BlockOutcome::failed(FailureReason::MiscException, "segfault in adapter"),
    ]);
    let mut sweep = Sweep::new(first, ResultStore::new(dir.path()), &cfg);
    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert!(!summary.is_clean());
    assert_eq!(summary.failures[0].1.size, 50);
    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    assert!(!record.complete);

    let second = ScriptedRunner::new([ok(2), too_slow(1)]);
    let mut sweep = Sweep::new(second, ResultStore::new(dir.path()), &cfg);
    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(sweep.runner().calls[0], ("naive/mult".to_string(), 1, 3));

    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    assert_eq!(record.metrics[1].as_ref().unwrap().sample_count, 5);
    assert!(record.complete);
}

#[test]
fn frozen_last_size_resumes_instead_of_counting_as_complete() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(dir.path());

    let first = ScriptedRunner::new([
        ok(5),
        ok(5),
        ok(3),
        BlockOutcome::failed(FailureReason::Frozen, "no outcome before timeout"),
    ]);
    let mut sweep = Sweep::new(first, ResultStore::new(dir.path()), &cfg);
    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].1.size, 100);
    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    assert!(!record.complete);
    assert_eq!(record.populated(), 3);

    let second = ScriptedRunner::new([ok(2)]);
    let mut sweep = Sweep::new(second, ResultStore::new(dir.path()), &cfg);
    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(sweep.runner().calls, vec![("naive/mult".to_string(), 2, 3)]);

    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    assert_eq!(record.metrics[2].as_ref().unwrap().sample_count, 5);
    assert!(record.complete);
    assert!(record.failure.is_none());
}

#[test]
fn complete_cases_are_skipped_on_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(dir.path());
    let mut sweep = Sweep::new(
        ScriptedRunner::new([ok(5), ok(5), ok(5)]),
        ResultStore::new(dir.path()),
        &cfg,
    );
    sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();

    let mut again = Sweep::new(
        ScriptedRunner::default(),
        ResultStore::new(dir.path()),
        &cfg,
    );
    let summary = again
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.blocks, 0);
    assert!(again.runner().calls.is_empty());
}

#[test]
fn fixed_order_finishes_one_case_before_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = cfg(dir.path());
    cfg.sizes = vec![10];
    let a = BenchmarkCase::new("naive", Operation::Add, vec![10], 5).unwrap();
    let b = BenchmarkCase::new("naive", Operation::Det, vec![10], 5).unwrap();
    let mut sweep = Sweep::new(
        ScriptedRunner::new([ok(2), ok(3), ok(5)]),
        ResultStore::new(dir.path()),
        &cfg,
    );
    let summary = sweep.run(vec![a, b], &mut SessionLog::disabled()).unwrap();
    assert_eq!(summary.completed, 2);
    let labels: Vec<&str> = sweep.runner().calls.iter().map(|c| c.0.as_str()).collect();
    assert_eq!(labels, vec!["naive/add", "naive/add", "naive/det"]);
}

#[test]
fn random_order_drains_every_case() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = cfg(dir.path());
    cfg.randomize_order = true;
    let cases: Vec<BenchmarkCase> = [Operation::Add, Operation::Det, Operation::Invert]
        .into_iter()
        .map(|op| BenchmarkCase::new("naive", op, vec![10, 50], 5).unwrap())
        .collect();
    let mut sweep = Sweep::new(
        ScriptedRunner::new(std::iter::repeat_n(ok(5), 6)),
        ResultStore::new(dir.path()),
        &cfg,
    );
    let summary = sweep.run(cases, &mut SessionLog::disabled()).unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.blocks, 6);
}

#[test]
fn stop_flag_halts_before_next_block() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(dir.path());
    let mut sweep = Sweep::new(
        ScriptedRunner::new([ok(5)]),
        ResultStore::new(dir.path()),
        &cfg,
    );
    sweep.stop_flag().store(true, Ordering::SeqCst);
    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.blocks, 0);
    let stored = sweep.store().read("naive", Operation::Mult).unwrap();
    assert!(stored.is_none());
}

#[test]
fn abort_policy_leaves_larger_sizes_untried() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = cfg(dir.path());
    cfg.too_slow_policy = TooSlowPolicy::AbortCase;
    let mut sweep = Sweep::new(
        ScriptedRunner::new([ok(5), too_slow(1)]),
        ResultStore::new(dir.path()),
        &cfg,
    );
    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.completed, 1);
    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    assert!(record.complete);
    assert!(record.metrics[2].is_none());
}

/// Fails with out-of-memory until the budget reaches `needed_mb`.
struct MemoryHungry {
    needed_mb: u64,
    budgets: Vec<u64>,
}

impl WorkerLauncher for MemoryHungry {
    fn launch(&mut self, req: &LaunchRequest) -> anyhow::Result<LaunchResult> {
        self.budgets.push(req.memory_mb);
        let outcome = if req.memory_mb >= self.needed_mb {
            WorkerOutcome::success(req.request_id, vec![m(0.01); req.trials as usize])
        } else {
            WorkerOutcome::failure(
                req.request_id,
                FailureReason::OutOfMemory,
                Some("alloc".into()),
            )
        };
        Ok(LaunchResult::Outcome(outcome))
    }

    fn describe(&self) -> String {
        "memory-hungry".into()
    }
}

#[test]
fn memory_escalation_is_recorded_as_max_memory() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = cfg(dir.path());
    cfg.sizes = vec![10];
    let case = BenchmarkCase::new("naive", Operation::Mult, vec![10], 5).unwrap();
    // 10x10 inputs round up to one MiB on top of the base.
    let b = cfg.memory.base_mb + 1;

    let launcher = MemoryHungry {
        needed_mb: 5 * b,
        budgets: Vec::new(),
    };
    let dispatcher = BlockDispatcher::new(launcher, &cfg);
    let mut sweep = Sweep::new(dispatcher, ResultStore::new(dir.path()), &cfg);
    let summary = sweep.run(vec![case], &mut SessionLog::disabled()).unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(
        sweep.runner().launcher().budgets,
        vec![b, 2 * b, 3 * b, 4 * b, 5 * b]
    );
    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    assert_eq!(record.max_memory_mb, 5 * b);
}

#[test]
fn exhausted_memory_fails_case_for_good() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(dir.path());
    let launcher = MemoryHungry {
        needed_mb: u64::MAX,
        budgets: Vec::new(),
    };
    let mut sweep = Sweep::new(
        BlockDispatcher::new(launcher, &cfg),
        ResultStore::new(dir.path()),
        &cfg,
    );
    let summary = sweep
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert!(summary.failures[0].1.permanent);
    assert_eq!(sweep.runner().launcher().budgets.len(), 5);

    let record = sweep
        .store()
        .read("naive", Operation::Mult)
        .unwrap()
        .unwrap();
    assert!(record.complete);
    assert!(record.metrics.iter().all(Option::is_none));

    let mut again = Sweep::new(
        ScriptedRunner::default(),
        ResultStore::new(dir.path()),
        &cfg,
    );
    let summary = again
        .run(vec![mult_case()], &mut SessionLog::disabled())
        .unwrap();
    assert_eq!(summary.skipped, 1);
}
