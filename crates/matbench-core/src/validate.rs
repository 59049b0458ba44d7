//! Correctness checks for adapter outputs.
//!
//! Each check is independent of the adapter's own algorithm: products are
//! checked with random-vector residuals, factorizations by reconstruction,
//! and solves by their backward residual.

use crate::matrix::DenseMatrix;
use crate::model::Operation;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    NoError,
    /// Residual above tolerance.
    LargeError { residual: f64 },
    /// Output contains NaN or infinity.
    Uncountable,
    /// Wrong number of outputs, wrong shape, or a broken structural property.
    Misc(String),
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationOutcome::NoError)
    }
}

impl fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationOutcome::NoError => f.write_str("no error"),
            ValidationOutcome::LargeError { residual } => {
                write!(f, "large error (residual {residual:e})")
            }
            ValidationOutcome::Uncountable => f.write_str("uncountable (non-finite output)"),
            ValidationOutcome::Misc(msg) => write!(f, "structural error: {msg}"),
        }
    }
}

pub fn check<R: Rng + ?Sized>(
    op: Operation,
    inputs: &[DenseMatrix],
    outputs: &[DenseMatrix],
    tolerance: f64,
    rng: &mut R,
) -> ValidationOutcome {
    let expected = expected_output_shape(op, inputs);
    let Some(out) = outputs.first() else {
        return ValidationOutcome::Misc(format!("{op} produced no output"));
    };
    if outputs.len() != 1 {
        return ValidationOutcome::Misc(format!(
            "{op} produced {} outputs, expected 1",
            outputs.len()
        ));
    }
    if out.shape() != expected {
        return ValidationOutcome::Misc(format!(
            "{op} output is {}x{}, expected {}x{}",
            out.rows(),
            out.cols(),
            expected.0,
            expected.1
        ));
    }

    match op {
        Operation::Det => return check_det(&inputs[0], out.get(0, 0), tolerance),
        _ if !out.all_finite() => return ValidationOutcome::Uncountable,
        _ => {}
    }

    let residual = match op {
        Operation::Add => {
            elementwise_residual(out, |r, c| inputs[0].get(r, c) + inputs[1].get(r, c))
        }
        Operation::Scale => {
            elementwise_residual(out, |r, c| Operation::SCALE_FACTOR * inputs[0].get(r, c))
        }
        Operation::Transpose => elementwise_residual(out, |r, c| inputs[0].get(c, r)),
        Operation::Mult => product_residual(&inputs[0], &inputs[1], false, out, rng),
        Operation::MultTransB => product_residual(&inputs[0], &inputs[1], true, out, rng),
        Operation::Invert => inverse_residual(&inputs[0], out),
        Operation::Solve => solve_residual(&inputs[0], &inputs[1], out),
        Operation::Chol => match cholesky_residual(&inputs[0], out) {
            Ok(r) => r,
            Err(outcome) => return outcome,
        },
        Operation::Det => unreachable!("handled above"),
    };

    classify(residual, tolerance)
}

fn classify(residual: f64, tolerance: f64) -> ValidationOutcome {
    if !residual.is_finite() {
        ValidationOutcome::Uncountable
    } else if residual > tolerance {
        ValidationOutcome::LargeError { residual }
    } else {
        ValidationOutcome::NoError
    }
}

fn expected_output_shape(op: Operation, inputs: &[DenseMatrix]) -> (usize, usize) {
    let n = inputs.first().map_or(0, DenseMatrix::rows);
    match op {
        Operation::Det => (1, 1),
        Operation::Solve => (n, inputs.get(1).map_or(1, DenseMatrix::cols)),
        _ => (n, n),
    }
}

fn elementwise_residual(out: &DenseMatrix, expected: impl Fn(usize, usize) -> f64) -> f64 {
    let mut worst = 0.0f64;
    let mut scale = 1.0f64;
    for r in 0..out.rows() {
        for c in 0..out.cols() {
            let e = expected(r, c);
            worst = worst.max((out.get(r, c) - e).abs());
            scale = scale.max(e.abs());
        }
    }
    worst / scale
}

fn mat_vec(m: &DenseMatrix, x: &[f64], transposed: bool, abs: bool) -> Vec<f64> {
    let f = |v: f64| if abs { v.abs() } else { v };
    if transposed {
        let mut y = vec![0.0; m.cols()];
        for (r, &xr) in x.iter().enumerate().take(m.rows()) {
            for (c, yc) in y.iter_mut().enumerate() {
                *yc += f(m.get(r, c)) * f(xr);
            }
        }
        y
    } else {
        (0..m.rows())
            .map(|r| m.row(r).iter().zip(x).map(|(&a, &b)| f(a) * f(b)).sum())
            .collect()
    }
}

fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0f64, |acc, x| acc.max(x.abs()))
}

/// `‖A(Bx) − Cx‖ / ‖|A|(|B||x|)‖`, with `B` optionally transposed.
fn product_residual<R: Rng + ?Sized>(
    a: &DenseMatrix,
    b: &DenseMatrix,
    b_transposed: bool,
    c: &DenseMatrix,
    rng: &mut R,
) -> f64 {
    let dist = Uniform::new_inclusive(-1.0, 1.0);
    let x: Vec<f64> = (0..c.cols()).map(|_| dist.sample(rng)).collect();

    let expected = mat_vec(a, &mat_vec(b, &x, b_transposed, false), false, false);
    let actual = mat_vec(c, &x, false, false);
    let bound = mat_vec(a, &mat_vec(b, &x, b_transposed, true), false, true);

    let diff: Vec<f64> = expected.iter().zip(&actual).map(|(e, a)| e - a).collect();
    max_abs(&diff) / max_abs(&bound).max(f64::MIN_POSITIVE)
}

fn inf_norm(m: &DenseMatrix) -> f64 {
    (0..m.rows())
        .map(|r| m.row(r).iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// `‖AX − I‖ / (‖A‖‖X‖)`.
fn inverse_residual(a: &DenseMatrix, x: &DenseMatrix) -> f64 {
    let n = a.rows();
    let mut worst = 0.0f64;
    for r in 0..n {
        let mut row_sum = 0.0;
        for c in 0..n {
            let mut acc = 0.0;
            for k in 0..n {
                acc += a.get(r, k) * x.get(k, c);
            }
            let target = if r == c { 1.0 } else { 0.0 };
            row_sum += (acc - target).abs();
        }
        worst = worst.max(row_sum);
    }
    worst / (inf_norm(a) * inf_norm(x)).max(f64::MIN_POSITIVE)
}

/// `‖Ax − b‖ / (‖A‖‖x‖ + ‖b‖)`.
fn solve_residual(a: &DenseMatrix, b: &DenseMatrix, x: &DenseMatrix) -> f64 {
    let mut worst = 0.0f64;
    for col in 0..b.cols() {
        let xc: Vec<f64> = (0..x.rows()).map(|r| x.get(r, col)).collect();
        let ax = mat_vec(a, &xc, false, false);
        let bc: Vec<f64> = (0..b.rows()).map(|r| b.get(r, col)).collect();
        let diff: Vec<f64> = ax.iter().zip(&bc).map(|(p, q)| p - q).collect();
        let denom = inf_norm(a) * max_abs(&xc) + max_abs(&bc);
        worst = worst.max(max_abs(&diff) / denom.max(f64::MIN_POSITIVE));
    }
    worst
}

fn cholesky_residual(a: &DenseMatrix, l: &DenseMatrix) -> Result<f64, ValidationOutcome> {
    let n = a.rows();
    for r in 0..n {
        for c in (r + 1)..n {
            if l.get(r, c) != 0.0 {
                return Err(ValidationOutcome::Misc(format!(
                    "cholesky factor has non-zero entry above the diagonal at ({r}, {c})"
                )));
            }
        }
    }
    let mut worst = 0.0f64;
    for r in 0..n {
        for c in 0..=r {
            let acc: f64 = (0..=c).map(|k| l.get(r, k) * l.get(c, k)).sum();
            worst = worst.max((acc - a.get(r, c)).abs());
        }
    }
    Ok(worst / a.max_abs().max(f64::MIN_POSITIVE))
}

/// Determinant by Gaussian elimination with partial pivoting.
pub fn reference_det(a: &DenseMatrix) -> f64 {
    let n = a.rows();
    let mut m: Vec<f64> = a.as_slice().to_vec();
    let mut det = 1.0;
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| m[i * n + col].abs().total_cmp(&m[j * n + col].abs()))
            .unwrap_or(col);
        let p = m[pivot * n + col];
        if p == 0.0 {
            return 0.0;
        }
        if pivot != col {
            for k in 0..n {
                m.swap(pivot * n + k, col * n + k);
            }
            det = -det;
        }
        det *= p;
        for r in (col + 1)..n {
            let factor = m[r * n + col] / p;
            for k in col..n {
                m[r * n + k] -= factor * m[col * n + k];
            }
        }
    }
    det
}

fn check_det(a: &DenseMatrix, got: f64, tolerance: f64) -> ValidationOutcome {
    let reference = reference_det(a);
    if !got.is_finite() {
        // Large random matrices overflow; agreeing infinities are not an error.
        return if got == reference {
            ValidationOutcome::NoError
        } else {
            ValidationOutcome::Uncountable
        };
    }
    let scale = reference.abs().max(f64::MIN_POSITIVE);
    classify(
        (got - reference).abs() / scale,
        tolerance * a.rows().max(1) as f64,
    )
}
