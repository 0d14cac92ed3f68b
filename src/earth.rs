//! # 1-D layered earth model
//!
//! A [`LayeredEarth`] is an ordered stack of layer conductivities and the
//! thicknesses of all layers above the half-space: `L` conductivities and
//! `L-1` thicknesses, the half-space being the last layer.
//!
//! The deterministic inverter works on a *set* of sibling earths
//! ([`EarthModelSet`]): the reference model it is pulled towards, the
//! per-layer standard deviations, the optional linear-space bounds, and
//! the inverted model populated at the end of a bunch. The set is checked
//! once per record by [`EarthModelSet::sanity_check`]; a violated invariant
//! is a configuration error and aborts before any inversion.
//!
//! Log10 is the working parameterisation for both conductivity and
//! thickness; everything stored here is in linear space (S/m and metres).

use crate::aem1d_errors::Aem1dError;

/// Ordered layer conductivities and thicknesses of a 1-D earth.
///
/// Fields
/// -----------------
/// * `conductivity`: Layer conductivities `[S/m]`, length `L`, all `> 0`.
/// * `thickness`: Layer thicknesses `[m]`, length `L-1`, all `> 0`.
///   The half-space (last layer) carries no thickness.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayeredEarth {
    pub conductivity: Vec<f64>,
    pub thickness: Vec<f64>,
}

impl LayeredEarth {
    /// Build an earth from conductivity and thickness vectors.
    ///
    /// Return
    /// ----------
    /// * `Ok(LayeredEarth)` when `|c| = |t| + 1` and all entries are
    ///   strictly positive.
    /// * `Err(Aem1dError::EarthModelError)` otherwise.
    pub fn new(conductivity: Vec<f64>, thickness: Vec<f64>) -> Result<Self, Aem1dError> {
        if conductivity.len() != thickness.len() + 1 {
            return Err(Aem1dError::EarthModelError(format!(
                "expected {} thicknesses for {} layers, got {}",
                conductivity.len().saturating_sub(1),
                conductivity.len(),
                thickness.len()
            )));
        }
        if conductivity.iter().any(|&c| c <= 0.0) {
            return Err(Aem1dError::EarthModelError(
                "conductivity is <= 0 in at least one layer".to_string(),
            ));
        }
        if thickness.iter().any(|&t| t <= 0.0) {
            return Err(Aem1dError::EarthModelError(
                "thickness is <= 0 in at least one layer".to_string(),
            ));
        }
        Ok(LayeredEarth {
            conductivity,
            thickness,
        })
    }

    /// Number of layers, half-space included.
    #[inline]
    pub fn nlayers(&self) -> usize {
        self.conductivity.len()
    }

    /// Thickness vector extended by a pseudo thickness for the half-space.
    ///
    /// The half-space has no thickness of its own, but the regularisation
    /// weights need one weight per layer. The dummy extends the geometric
    /// progression of the two deepest finite layers:
    /// `t[L-2]^2 / t[L-3]`. For a two-layer earth the single thickness is
    /// duplicated; a one-layer earth gets unit weight.
    pub fn dummy_thickness(&self) -> Vec<f64> {
        let nl = self.nlayers();
        match nl {
            0 | 1 => vec![1.0],
            2 => vec![self.thickness[0], self.thickness[0]],
            _ => {
                let mut t = self.thickness.clone();
                let last = t[nl - 2] * t[nl - 2] / t[nl - 3];
                t.push(last);
                t
            }
        }
    }

    /// Depth to the top of each layer (first entry is 0).
    pub fn layer_top_depth(&self) -> Vec<f64> {
        let mut d = Vec::with_capacity(self.nlayers());
        let mut top = 0.0;
        d.push(top);
        for &t in &self.thickness {
            top += t;
            d.push(top);
        }
        d
    }

    /// Depth to the bottom of each layer; the half-space bottom repeats
    /// its top (it has no finite extent).
    pub fn layer_bottom_depth(&self) -> Vec<f64> {
        let mut d = Vec::with_capacity(self.nlayers());
        let mut bot = 0.0;
        for &t in &self.thickness {
            bot += t;
            d.push(bot);
        }
        d.push(bot);
        d
    }
}

/// The sibling earths of one sounding: reference, std, bounds and result.
///
/// `min`/`max` are optional: empty vectors mean the corresponding
/// parameters are unbounded. All populated siblings must agree in shape
/// with the reference earth.
#[derive(Debug, Clone, Default)]
pub struct EarthModelSet {
    pub reference: LayeredEarth,
    pub std: LayeredEarth,
    pub min: LayeredEarth,
    pub max: LayeredEarth,
    pub inverted: LayeredEarth,
}

impl EarthModelSet {
    /// Validate shapes and orderings across the sibling earths.
    ///
    /// The checks mirror the per-record validation of the original
    /// sample-by-sample inverter: positive reference and std entries,
    /// matching min/max shapes, `min < max` and `min < ref < max`
    /// component-wise whenever bounds are supplied.
    ///
    /// Return
    /// ----------
    /// * `Ok(())` when every invariant holds.
    /// * `Err(Aem1dError::EarthModelError)` with all violations joined
    ///   into one message otherwise.
    pub fn sanity_check(&self) -> Result<(), Aem1dError> {
        let nc = self.reference.conductivity.len();
        let nt = self.reference.thickness.len();
        let mut problems: Vec<String> = Vec::new();

        if nc != nt + 1 {
            problems.push(
                "the conductivity and/or thickness do not have the correct number of layers"
                    .to_string(),
            );
        }

        if self.reference.conductivity.iter().any(|&v| v <= 0.0) {
            problems.push("the conductivity ref is <= 0 in at least one layer".to_string());
        }
        if self.std.conductivity.iter().any(|&v| v <= 0.0) {
            problems.push("the conductivity std is <= 0".to_string());
        }
        if self.reference.thickness.iter().any(|&v| v <= 0.0) {
            problems.push("the thickness ref is <= 0 in at least one layer".to_string());
        }
        if self.std.thickness.iter().any(|&v| v <= 0.0) {
            problems.push("the thickness std is <= 0 in at least one layer".to_string());
        }

        if !self.min.conductivity.is_empty() {
            Self::check_bounds(
                "conductivity",
                &self.reference.conductivity,
                &self.min.conductivity,
                &self.max.conductivity,
                &mut problems,
            );
        }
        if !self.min.thickness.is_empty() {
            Self::check_bounds(
                "thickness",
                &self.reference.thickness,
                &self.min.thickness,
                &self.max.thickness,
                &mut problems,
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Aem1dError::EarthModelError(problems.join("; ")))
        }
    }

    fn check_bounds(
        what: &str,
        reference: &[f64],
        min: &[f64],
        max: &[f64],
        problems: &mut Vec<String>,
    ) {
        if min.len() != reference.len() || max.len() != reference.len() {
            problems.push(format!(
                "the {what} min/max do not have the correct number of layers"
            ));
            return;
        }
        for li in 0..reference.len() {
            if min[li] <= 0.0 || max[li] <= 0.0 {
                problems.push(format!("the {what} min or max is <= 0 in layer {li}"));
            }
            if max[li] <= min[li] {
                problems.push(format!("the {what} max <= min in layer {li}"));
            }
            if reference[li] <= min[li] || reference[li] >= max[li] {
                problems.push(format!("the {what} ref is outside [min, max] in layer {li}"));
            }
        }
    }
}
