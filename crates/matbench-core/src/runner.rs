//! Trial runner: the worker half of a block.
//!
//! Runs up to `trials` trials of one operation at one size against freshly
//! generated inputs. Stops early when a trial exceeds the per-trial ceiling
//! (too slow) or when the block's aggregate time budget is used up (returns
//! what it has as a normal result). Any fault becomes a typed outcome; the
//! caller is expected to terminate the process right after writing it.

use crate::adapter::{AdapterError, MatrixLibrary};
use crate::matrix::DenseMatrix;
use crate::model::{Measurement, Operation};
use crate::protocol::{BlockPlan, FailureReason, WorkerOutcome};
use crate::validate::{self, ValidationOutcome};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

/// Installs a panic hook that records the message and a backtrace so a
/// caught panic can be reported with a stack summary.
pub fn install_panic_capture() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let trace = std::backtrace::Backtrace::force_capture();
        if let Ok(mut slot) = LAST_PANIC.lock() {
            *slot = Some(format!("{info}\n{trace}"));
        }
        previous(info);
    }));
}

fn take_panic_report(payload: &(dyn std::any::Any + Send)) -> String {
    let captured = LAST_PANIC.lock().ok().and_then(|mut slot| slot.take());
    captured.unwrap_or_else(|| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panic: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panic: {s}")
        } else {
            "panic with non-string payload".to_string()
        }
    })
}

/// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Mixed into the block seed for validation vectors, so checking outputs
/// never shifts the input stream.
const VALIDATION_STREAM: u64 = 0x7A11_DA7E_0C4E_C5ED;

/// Seed of the input stream for one block.
pub fn derive_seed(seed: u64, request_id: u64, size: usize) -> u64 {
    mix(mix(mix(seed) ^ request_id) ^ size as u64)
}

/// Fresh random inputs for `op` at size `n`.
pub fn generate_inputs<R: Rng + ?Sized>(
    op: Operation,
    n: usize,
    rng: &mut R,
) -> Result<Vec<DenseMatrix>, AdapterError> {
    if op == Operation::Chol {
        return Ok(vec![DenseMatrix::try_random_spd(n, rng)?]);
    }
    op.input_shapes(n)
        .into_iter()
        .map(|(r, c)| DenseMatrix::try_random(r, c, &mut *rng).map_err(AdapterError::from))
        .collect()
}

#[derive(Debug)]
enum TrialError {
    Adapter(AdapterError),
    Invalid(ValidationOutcome),
}

impl From<AdapterError> for TrialError {
    fn from(e: AdapterError) -> Self {
        TrialError::Adapter(e)
    }
}

enum LoopEnd {
    Finished(Vec<Measurement>),
    TooSlow(Vec<Measurement>),
}

pub struct TrialRunner<'a> {
    library: &'a dyn MatrixLibrary,
    plan: &'a BlockPlan,
}

impl<'a> TrialRunner<'a> {
    pub fn new(library: &'a dyn MatrixLibrary, plan: &'a BlockPlan) -> Self {
        Self { library, plan }
    }

    /// Runs the block and converts every way it can end into an outcome.
    pub fn run(&self, trials: u32, request_id: u64) -> WorkerOutcome {
        if !self.library.supports(self.plan.operation) {
            return WorkerOutcome::failure(
                request_id,
                FailureReason::BadConfig,
                Some(format!(
                    "{} does not implement {}",
                    self.library.name(),
                    self.plan.operation
                )),
            );
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.evaluation_loop(trials, request_id))) {
            Ok(Ok(LoopEnd::Finished(ms))) => WorkerOutcome::success(request_id, ms),
            Ok(Ok(LoopEnd::TooSlow(ms))) => WorkerOutcome::too_slow(request_id, ms),
            Ok(Err(TrialError::Adapter(AdapterError::OutOfMemory(e)))) => {
                WorkerOutcome::failure(request_id, FailureReason::OutOfMemory, Some(e.to_string()))
            }
            Ok(Err(TrialError::Adapter(e @ AdapterError::Unsupported { .. }))) => {
                WorkerOutcome::failure(request_id, FailureReason::BadConfig, Some(e.to_string()))
            }
            Ok(Err(TrialError::Adapter(e))) => WorkerOutcome::failure(
                request_id,
                FailureReason::MiscException,
                Some(e.to_string()),
            ),
            Ok(Err(TrialError::Invalid(v))) => WorkerOutcome::failure(
                request_id,
                FailureReason::MiscException,
                Some(format!("output validation failed: {v}")),
            ),
            Err(payload) => WorkerOutcome::failure(
                request_id,
                FailureReason::MiscException,
                Some(take_panic_report(payload.as_ref())),
            ),
        }
    }

    fn evaluation_loop(&self, trials: u32, request_id: u64) -> Result<LoopEnd, TrialError> {
        let plan = self.plan;
        let seed = derive_seed(plan.seed, request_id, plan.size);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut check_rng = StdRng::seed_from_u64(mix(seed ^ VALIDATION_STREAM));
        let block_start = Instant::now();
        let mut measurements = Vec::with_capacity(trials as usize);

        for i in 0..trials {
            if i > 0 && block_start.elapsed() > plan.max_block_time() {
                debug!(trial = i, "block time budget used up");
                break;
            }

            let inputs = generate_inputs(plan.operation, plan.size, &mut rng)?;
            let (measurement, outputs) = self.time_trial(&inputs)?;

            if plan.validate {
                let verdict = validate::check(
                    plan.operation,
                    &inputs,
                    &outputs,
                    plan.tolerance,
                    &mut check_rng,
                );
                if !verdict.is_ok() {
                    warn!(trial = i, %verdict, "validation failed");
                    return Err(TrialError::Invalid(verdict));
                }
            }

            debug!(
                trial = i,
                ops_per_sec = measurement.ops_per_sec,
                elapsed = measurement.elapsed_secs,
                cycles = measurement.cycles,
                "trial done"
            );
            measurements.push(measurement);

            if Duration::from_secs_f64(measurement.elapsed_secs) > plan.max_trial_time() {
                debug!(trial = i, "single trial exceeded ceiling");
                return Ok(LoopEnd::TooSlow(measurements));
            }
        }

        Ok(LoopEnd::Finished(measurements))
    }

    /// Grows the cycle count until the timed run reaches the target trial
    /// time or the trial as a whole passes the per-trial ceiling.
    fn time_trial(
        &self,
        inputs: &[DenseMatrix],
    ) -> Result<(Measurement, Vec<DenseMatrix>), AdapterError> {
        let target = self.plan.trial_time().as_secs_f64();
        let ceiling = self.plan.max_trial_time();
        let start = Instant::now();
        let mut cycles: u64 = 1;

        loop {
            let run = self.library.run(self.plan.operation, inputs, cycles)?;
            let secs = run.elapsed.as_secs_f64().max(1e-9);
            let total = start.elapsed();

            if secs >= target || total > ceiling {
                let m = Measurement {
                    ops_per_sec: cycles as f64 / secs,
                    elapsed_secs: total.as_secs_f64(),
                    cycles,
                };
                return Ok((m, run.outputs));
            }

            let factor = (target / secs * 1.1).clamp(2.0, 10.0);
            cycles = ((cycles as f64) * factor).ceil() as u64;
        }
    }
}
