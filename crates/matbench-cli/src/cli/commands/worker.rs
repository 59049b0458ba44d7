//! The isolated side of a block: read the plan, run the trials, write one
//! outcome, exit. `main` calls `process::exit` right after, whatever state
//! the library under test left behind.

use super::super::args::WorkerArgs;
use crate::exit_codes;
use matbench_core::protocol::{BlockPlan, FailureReason, WorkerOutcome};
use matbench_core::runner::{install_panic_capture, TrialRunner};
use tracing::{debug, warn};

pub fn run(args: &WorkerArgs) -> i32 {
    install_panic_capture();
    if let Err(e) = limit_memory(args.memory_mb) {
        warn!(error = %e, memory_mb = args.memory_mb, "could not apply memory limit");
    }

    let outcome = execute(args);
    debug!(
        request_id = outcome.request_id,
        failure = ?outcome.failure,
        trials = outcome.measurements.len(),
        "block done"
    );
    match outcome.write(&args.outcome) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("worker: {e}");
            exit_codes::CONFIG_ERROR
        }
    }
}

fn execute(args: &WorkerArgs) -> WorkerOutcome {
    let plan = match BlockPlan::read(&args.plan) {
        Ok(plan) => plan,
        Err(e) => {
            return WorkerOutcome::failure(
                args.request_id,
                FailureReason::BadConfig,
                Some(e.to_string()),
            )
        }
    };
    let registry = matbench_native::registry();
    let Some(library) = registry.get(&plan.library) else {
        return WorkerOutcome::failure(
            args.request_id,
            FailureReason::BadConfig,
            Some(format!("unknown library {:?}", plan.library)),
        );
    };
    TrialRunner::new(library.as_ref(), &plan).run(args.trials, args.request_id)
}

#[cfg(target_os = "linux")]
fn limit_memory(memory_mb: u64) -> anyhow::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};
    if memory_mb == 0 {
        return Ok(());
    }
    let bytes = memory_mb.saturating_mul(1024 * 1024);
    setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn limit_memory(memory_mb: u64) -> anyhow::Result<()> {
    if memory_mb > 0 {
        debug!(memory_mb, "address-space limit not supported on this platform");
    }
    Ok(())
}
