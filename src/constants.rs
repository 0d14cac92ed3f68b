use nalgebra::{DMatrix, DVector};

/// Dense column vector used throughout the inversion core.
pub type Vector = DVector<f64>;
/// Dense matrix used throughout the inversion core.
pub type Matrix = DMatrix<f64>;

/// Natural log of 10, used to scale Jacobian columns of log10 parameters.
pub const LN10: f64 = std::f64::consts::LN_10;

/// Initial damping factor of the Gauss-Newton iteration.
pub const INITIAL_LAMBDA: f64 = 1.0e8;

/// Fraction of the current data misfit targeted by each iteration.
pub const TARGET_PHID_FRACTION: f64 = 0.7;

/// Std deviation (in decades) of log10 value-change proposals.
pub const DEFAULT_LOG_STD_DECADES: f64 = 1.0;

/// Interface-move proposal std as a fraction of the current position.
pub const DEFAULT_MOVE_STD_FRACTION: f64 = 0.25;

/// Number of bins in the nuisance and noise posterior histograms.
pub const NUM_NUISANCE_HISTOGRAM_BINS: usize = 17;
pub const NUM_NOISE_HISTOGRAM_BINS: usize = 17;

/// Finite thickness assigned to the half-space when writing layer tables.
pub const DEFAULT_BOTTOM_LAYER_THICKNESS: f64 = 100.0;

/// A datum or noise estimate is null when it is not a finite number.
///
/// Null entries are excluded from the active data set before inversion;
/// see [`crate::data::ActiveData`].
#[inline]
pub fn is_null(v: f64) -> bool {
    !v.is_finite()
}

/// `10^x`, the inverse of the log10 working parameterisation.
#[inline]
pub fn pow10(x: f64) -> f64 {
    10.0_f64.powf(x)
}
