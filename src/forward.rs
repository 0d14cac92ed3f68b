//! # Forward-model seam
//!
//! The EM physics lives behind the [`ForwardSystem`] trait: given a layered
//! earth and a transmitter/receiver geometry it produces primary fields,
//! per-window secondary fields, and per-window partial derivatives with
//! respect to a conductivity layer, a thickness layer, or a geometry
//! element. The inverter owns its forward systems and hands them immutable
//! parameter views; predictions are written into inverter-owned buffers.
//!
//! Receiver pitch and roll derivatives are *not* requested from the
//! physics: they are closed-form rotations of fields already computed, so
//! they are provided here as free functions over the field vectors.

use crate::aem1d_errors::Aem1dError;
use crate::earth::LayeredEarth;
use crate::geometry::Geometry;

/// Per-window X/Y/Z secondary fields (or their derivatives).
#[derive(Debug, Clone, Default)]
pub struct FieldResponse {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl FieldResponse {
    pub fn zeros(nwindows: usize) -> Self {
        FieldResponse {
            x: vec![0.0; nwindows],
            y: vec![0.0; nwindows],
            z: vec![0.0; nwindows],
        }
    }
}

/// Single-valued X/Y/Z primary field at the receiver.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimaryField {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// The partial derivative a forward system can be asked for.
///
/// Receiver pitch and roll are deliberately absent: those derivatives are
/// closed-form rotations handled by [`rx_pitch_derivative`] and
/// [`rx_roll_derivative`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDerivative {
    /// d/d(conductivity of layer `li`), linear space.
    Conductivity(usize),
    /// d/d(thickness of layer `li`), linear space.
    Thickness(usize),
    TxHeight,
    TxRxDx,
    TxRxDy,
    TxRxDz,
}

/// Computes predicted fields and their derivatives for one EM system.
///
/// Implementations may cache whatever they like between calls; the
/// inverter always passes the earth and geometry the result must
/// correspond to. The FFT workspace shared by concrete TDEM
/// implementations is guarded process-wide at initialisation only; the
/// trait itself is single-threaded within a bunch.
pub trait ForwardSystem {
    /// Number of time windows of this system.
    fn nwindows(&self) -> usize;

    /// Primary (free-space) field for `geometry`.
    fn primary_fields(&mut self, geometry: &Geometry) -> PrimaryField;

    /// Secondary field response per window.
    fn secondary_fields(
        &mut self,
        earth: &LayeredEarth,
        geometry: &Geometry,
    ) -> Result<FieldResponse, Aem1dError>;

    /// Partial derivative of the secondary (plus primary, where the
    /// derivative is taken with respect to a geometry offset) field.
    fn derivative_fields(
        &mut self,
        request: FieldDerivative,
        earth: &LayeredEarth,
        geometry: &Geometry,
    ) -> Result<FieldResponse, Aem1dError>;
}

/// Static description of one EM system in the inversion.
///
/// Fields
/// -----------------
/// * `nwindows`: Time windows recorded by the system.
/// * `use_x`, `use_y`, `use_z`: Components entering the data vector.
/// * `invert_x_plus_z`: Replace X and Z rows by the synthetic amplitude
///   `XZ = hypot(X, Z)` (Y kept separately when used).
/// * `invert_primary_plus_secondary`: Observations and predictions are
///   total fields rather than secondary-only.
/// * `reconstruct_primary`: Recompute the primary field from the
///   true-frame geometry when assembling bunch data.
#[derive(Debug, Clone, Copy)]
pub struct SystemSpec {
    pub nwindows: usize,
    pub use_x: bool,
    pub use_y: bool,
    pub use_z: bool,
    pub invert_x_plus_z: bool,
    pub invert_primary_plus_secondary: bool,
    pub reconstruct_primary: bool,
}

impl SystemSpec {
    /// A Z-component-only system, the most common airborne configuration.
    pub fn z_only(nwindows: usize) -> Self {
        SystemSpec {
            nwindows,
            use_x: false,
            use_y: false,
            use_z: true,
            invert_x_plus_z: false,
            invert_primary_plus_secondary: false,
            reconstruct_primary: false,
        }
    }

    #[inline]
    pub fn component_used(&self, comp: usize) -> bool {
        match comp {
            0 => self.use_x,
            1 => self.use_y,
            2 => self.use_z,
            _ => false,
        }
    }
}

/// One EM system of the inversion: its description plus its physics.
pub struct EmSystem {
    pub spec: SystemSpec,
    pub forward: Box<dyn ForwardSystem>,
}

impl EmSystem {
    pub fn new(spec: SystemSpec, forward: Box<dyn ForwardSystem>) -> Self {
        EmSystem { spec, forward }
    }
}

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// Closed-form derivative of pitch-rotated X/Z fields with respect to the
/// receiver pitch (degrees).
///
/// The receiver measures `x_m = x cos p - z sin p`,
/// `z_m = x sin p + z cos p`; differentiating the rotation gives the
/// derivative fields directly from the already-computed `x` and `z`.
///
/// Arguments
/// -----------------
/// * `x`, `z`: Total (primary plus secondary) field per window.
/// * `pitch_deg`: Current receiver pitch in degrees.
///
/// Return
/// ----------
/// * `(dx_dpitch, dz_dpitch)` per window, in field units per degree.
pub fn rx_pitch_derivative(x: &[f64], z: &[f64], pitch_deg: f64) -> (Vec<f64>, Vec<f64>) {
    let p = pitch_deg * DEG_TO_RAD;
    let (sinp, cosp) = p.sin_cos();
    let dx = x
        .iter()
        .zip(z)
        .map(|(&xi, &zi)| (-xi * sinp - zi * cosp) * DEG_TO_RAD)
        .collect();
    let dz = x
        .iter()
        .zip(z)
        .map(|(&xi, &zi)| (xi * cosp - zi * sinp) * DEG_TO_RAD)
        .collect();
    (dx, dz)
}

/// Closed-form derivative of roll-rotated Y/Z fields with respect to the
/// receiver roll (degrees). Same construction as [`rx_pitch_derivative`]
/// with the rotation acting in the Y/Z plane.
pub fn rx_roll_derivative(y: &[f64], z: &[f64], roll_deg: f64) -> (Vec<f64>, Vec<f64>) {
    let r = roll_deg * DEG_TO_RAD;
    let (sinr, cosr) = r.sin_cos();
    let dy = y
        .iter()
        .zip(z)
        .map(|(&yi, &zi)| (-yi * sinr + zi * cosr) * DEG_TO_RAD)
        .collect();
    let dz = y
        .iter()
        .zip(z)
        .map(|(&yi, &zi)| (-yi * cosr - zi * sinr) * DEG_TO_RAD)
        .collect();
    (dy, dz)
}
