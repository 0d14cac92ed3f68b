//! # Regularisation-strength line search
//!
//! Each Gauss-Newton iteration targets a data misfit of
//! `max(0.7 * phid, MinimumPhiD)` rather than descending as fast as the
//! damped step allows. Candidate lambdas are first explored on a fixed
//! log-spaced grid around the current value; when the target is bracketed
//! the search bisects in log-lambda until the misfit lands just above the
//! target. Selection rules:
//!
//! * the candidate whose PhiD is closest to the target *from above* wins;
//! * when every candidate undershoots the target, the minimum-PhiD
//!   candidate wins instead (this is the path that lets a bunch drop
//!   straight to the least-squares solution when damping is negligible).

/// One evaluated candidate of the lambda search.
#[derive(Debug, Clone, Copy)]
pub struct Trial {
    pub lambda: f64,
    pub stepfactor: f64,
    pub phid: f64,
}

/// Multiplicative factors applied to the current lambda, explored in
/// order. The grid reaches two decades up and three and a half down.
const LAMBDA_FACTORS: [f64; 12] = [
    100.0,
    10.0,
    3.1622776601683795,
    1.0,
    0.31622776601683794,
    0.1,
    0.031622776601683794,
    0.01,
    0.0031622776601683794,
    0.001,
    0.00031622776601683794,
    0.0001,
];

/// Relative overshoot tolerated above the target before the bisection
/// stops.
const TARGET_TOLERANCE: f64 = 0.005;

/// Maximum bisection refinements after the grid pass.
const MAX_REFINEMENTS: usize = 16;

/// Search candidate lambdas for the misfit best matching `target_phid`.
///
/// Arguments
/// -----------------
/// * `current_lambda`: Lambda of the accepted previous iteration; the
///   grid is relative to it.
/// * `target_phid`: Data misfit the iteration aims for.
/// * `eval`: Evaluates one candidate lambda to the PhiD of the stepped
///   (and bound-projected) model, or `None` when the candidate
///   mis-evaluates (singular system, non-finite prediction).
///
/// Return
/// ----------
/// * `Some(Trial)` with the selected lambda (step factor 1.0).
/// * `None` when every candidate mis-evaluated; the caller terminates
///   the bunch with reason "No improvement".
pub fn search_target(
    current_lambda: f64,
    target_phid: f64,
    mut eval: impl FnMut(f64) -> Option<f64>,
) -> Option<Trial> {
    let mut best_above: Option<Trial> = None;
    // Candidate just under the target, for bracketing.
    let mut best_below: Option<Trial> = None;
    let mut best_any: Option<Trial> = None;

    let mut consider = |trial: Trial,
                        best_above: &mut Option<Trial>,
                        best_below: &mut Option<Trial>,
                        best_any: &mut Option<Trial>| {
        if trial.phid >= target_phid {
            if best_above.map(|b| trial.phid < b.phid).unwrap_or(true) {
                *best_above = Some(trial);
            }
        } else if best_below.map(|b| trial.phid > b.phid).unwrap_or(true) {
            *best_below = Some(trial);
        }
        if best_any.map(|b| trial.phid < b.phid).unwrap_or(true) {
            *best_any = Some(trial);
        }
    };

    for factor in LAMBDA_FACTORS {
        let lambda = current_lambda * factor;
        let Some(phid) = eval(lambda) else {
            continue;
        };
        if !phid.is_finite() {
            continue;
        }
        let trial = Trial {
            lambda,
            stepfactor: 1.0,
            phid,
        };
        consider(trial, &mut best_above, &mut best_below, &mut best_any);
    }

    // Bracketed: bisect in log-lambda until the above-side candidate sits
    // just over the target.
    if let (Some(mut above), Some(mut below)) = (best_above, best_below) {
        for _ in 0..MAX_REFINEMENTS {
            if above.phid <= target_phid * (1.0 + TARGET_TOLERANCE) {
                break;
            }
            let mid = (above.lambda.ln() + below.lambda.ln()) * 0.5;
            let lambda = mid.exp();
            let Some(phid) = eval(lambda) else {
                break;
            };
            if !phid.is_finite() {
                break;
            }
            let trial = Trial {
                lambda,
                stepfactor: 1.0,
                phid,
            };
            if phid >= target_phid {
                above = trial;
            } else {
                below = trial;
            }
        }
        return Some(above);
    }

    best_above.or(best_any)
}
