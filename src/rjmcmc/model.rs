//! # Trans-dimensional 1-D model
//!
//! A [`Model1d`] is one state of the reversible-jump sampler: a set of
//! interfaces sorted by depth (the first always at position 0), an
//! ordered list of geometry nuisances, and an ordered list of
//! multiplicative noise magnitudes. The model caches its predicted data,
//! squared relative residuals, per-datum variance and misfit so that
//! noise-magnitude proposals can update the misfit incrementally without
//! re-running the forward model.

use std::str::FromStr;

use ordered_float::OrderedFloat;

use crate::aem1d_errors::Aem1dError;
use crate::geometry::GeometryElement;

/// Whether a sampled quantity lives in linear or log10 space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parameterization {
    #[default]
    Linear,
    Log10,
}

impl Parameterization {
    pub fn is_linear(&self) -> bool {
        matches!(self, Parameterization::Linear)
    }

    pub fn type_string(&self) -> &'static str {
        match self {
            Parameterization::Linear => "LINEAR",
            Parameterization::Log10 => "LOG10",
        }
    }
}

impl FromStr for Parameterization {
    type Err = Aem1dError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("LINEAR") {
            Ok(Parameterization::Linear)
        } else if s.eq_ignore_ascii_case("LOG10") {
            Ok(Parameterization::Log10)
        } else {
            Err(Aem1dError::UnknownEnumValue {
                kind: "Parameterization",
                value: s.to_string(),
            })
        }
    }
}

/// One layer of the partition: the position of its top interface and its
/// value (log10 or linear conductivity, per the value parameterisation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layer {
    pub ptop: f64,
    pub value: f64,
}

/// A geometry nuisance marginalised over during sampling.
///
/// The element tag indexes the geometry-element name table, so nuisances
/// stay a plain tagged struct rather than trait objects.
#[derive(Debug, Clone, Copy)]
pub struct Nuisance {
    pub element: GeometryElement,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub sd_change: f64,
}

/// One multiplicative noise process applying to the half-open datum
/// range `[data_bounds.0, data_bounds.1)`.
#[derive(Debug, Clone, Copy)]
pub struct NoiseProcess {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub sd_change: f64,
    pub data_bounds: (usize, usize),
}

/// One state of the reversible-jump chain.
#[derive(Debug, Clone, Default)]
pub struct Model1d {
    pmax: f64,
    vmin: f64,
    vmax: f64,
    misfit: f64,
    predicted: Vec<f64>,
    residuals_squared: Vec<f64>,
    /// Per-datum variance; updated in place on noise changes.
    pub nvar: Vec<f64>,
    pub layers: Vec<Layer>,
    pub nuisances: Vec<Nuisance>,
    pub noises: Vec<NoiseProcess>,
}

impl Model1d {
    pub fn new(pmax: f64, vmin: f64, vmax: f64) -> Self {
        Model1d {
            pmax,
            vmin,
            vmax,
            misfit: f64::MAX,
            ..Default::default()
        }
    }

    #[inline]
    pub fn nlayers(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn nnuisances(&self) -> usize {
        self.nuisances.len()
    }

    #[inline]
    pub fn nnoises(&self) -> usize {
        self.noises.len()
    }

    /// Dimensionality of the model: two per layer plus the nuisances.
    #[inline]
    pub fn nparams(&self) -> usize {
        2 * self.nlayers() + self.nnuisances()
    }

    #[inline]
    pub fn misfit(&self) -> f64 {
        self.misfit
    }

    pub fn set_misfit(&mut self, misfit: f64) {
        self.misfit = misfit;
    }

    /// Chi-squared of the cached residuals against the current variance.
    pub fn chi2(&self) -> f64 {
        self.residuals_squared
            .iter()
            .zip(&self.nvar)
            .map(|(&r2, &nv)| r2 / nv)
            .sum()
    }

    /// Log posterior-probability proxy used to rank sampled models.
    pub fn logppd(&self) -> f64 {
        -self.misfit / 2.0 - (self.nparams() as f64).ln()
    }

    pub fn set_predicted(&mut self, predicted: Vec<f64>) {
        self.predicted = predicted;
    }

    pub fn predicted(&self) -> &[f64] {
        &self.predicted
    }

    pub fn set_residuals_squared(&mut self, residuals_squared: Vec<f64>) {
        self.residuals_squared = residuals_squared;
    }

    pub fn residuals_squared(&self) -> &[f64] {
        &self.residuals_squared
    }

    pub fn sort_layers(&mut self) {
        self.layers.sort_by_key(|l| OrderedFloat(l.ptop));
    }

    /// Index of the layer enclosing `pos`.
    pub fn which_layer(&self, pos: f64) -> usize {
        for li in 0..self.nlayers() - 1 {
            if pos < self.layers[li + 1].ptop {
                return li;
            }
        }
        self.nlayers() - 1
    }

    /// Move interface `index` to `pnew`.
    ///
    /// Interface 0 is pinned at position 0; the new position must lie
    /// strictly inside `(0, pmax)`. Invalidates the cached misfit.
    pub fn move_interface(&mut self, index: usize, pnew: f64) -> bool {
        self.misfit = f64::MAX;
        if index == 0 || index >= self.nlayers() {
            return false;
        }
        if pnew <= 0.0 || pnew >= self.pmax {
            return false;
        }
        self.layers[index].ptop = pnew;
        self.sort_layers();
        true
    }

    /// Insert an interface at `pos` with value `vbelow` underneath.
    ///
    /// Rejects positions outside `[0, pmax]`, values outside
    /// `[vmin, vmax]`, and positions that collide with an existing
    /// interface. Invalidates the cached misfit.
    pub fn insert_interface(&mut self, pos: f64, vbelow: f64) -> bool {
        self.misfit = f64::MAX;
        if pos < 0.0 || pos > self.pmax {
            return false;
        }
        if vbelow < self.vmin || vbelow > self.vmax {
            return false;
        }
        // No degenerately thin layers.
        if self
            .layers
            .iter()
            .any(|l| (pos - l.ptop).abs() < f64::EPSILON)
        {
            return false;
        }

        if self.layers.is_empty() {
            self.layers.push(Layer {
                ptop: 0.0,
                value: vbelow,
            });
        } else {
            self.layers.push(Layer {
                ptop: pos,
                value: vbelow,
            });
            self.sort_layers();
        }
        true
    }

    /// Remove interface `index` (never the surface layer). Invalidates
    /// the cached misfit.
    pub fn delete_interface(&mut self, index: usize) -> bool {
        self.misfit = f64::MAX;
        if index == 0 || index >= self.nlayers() {
            return false;
        }
        self.layers.remove(index);
        true
    }

    /// Layer values, top down.
    pub fn values(&self) -> Vec<f64> {
        self.layers.iter().map(|l| l.value).collect()
    }

    /// Layer thicknesses (the half-space has none).
    pub fn thicknesses(&self) -> Vec<f64> {
        self.layers
            .windows(2)
            .map(|w| w[1].ptop - w[0].ptop)
            .collect()
    }
}

#[cfg(test)]
mod model_test {
    use super::*;

    fn three_layer() -> Model1d {
        let mut m = Model1d::new(100.0, -3.0, 0.0);
        assert!(m.insert_interface(0.0, -1.0));
        assert!(m.insert_interface(30.0, -2.0));
        assert!(m.insert_interface(60.0, -1.5));
        m
    }

    #[test]
    fn test_layers_stay_sorted() {
        let mut m = Model1d::new(100.0, -3.0, 0.0);
        assert!(m.insert_interface(0.0, -1.0));
        assert!(m.insert_interface(60.0, -1.5));
        assert!(m.insert_interface(30.0, -2.0));
        let tops: Vec<f64> = m.layers.iter().map(|l| l.ptop).collect();
        assert_eq!(tops, vec![0.0, 30.0, 60.0]);
        assert_eq!(m.thicknesses(), vec![30.0, 30.0]);
    }

    #[test]
    fn test_which_layer() {
        let m = three_layer();
        assert_eq!(m.which_layer(5.0), 0);
        assert_eq!(m.which_layer(30.0), 1);
        assert_eq!(m.which_layer(59.9), 1);
        assert_eq!(m.which_layer(99.0), 2);
    }

    #[test]
    fn test_move_interface_rules() {
        let mut m = three_layer();
        assert!(!m.move_interface(0, 10.0));
        assert!(!m.move_interface(1, 0.0));
        assert!(!m.move_interface(1, 100.0));
        assert!(m.move_interface(1, 70.0));
        // Sorting keeps the partition valid after a cross-over move.
        let tops: Vec<f64> = m.layers.iter().map(|l| l.ptop).collect();
        assert_eq!(tops, vec![0.0, 60.0, 70.0]);
    }

    #[test]
    fn test_insert_rejects_collisions_and_out_of_prior() {
        let mut m = three_layer();
        assert!(!m.insert_interface(30.0, -1.0));
        assert!(!m.insert_interface(110.0, -1.0));
        assert!(!m.insert_interface(45.0, 1.0));
        assert!(m.insert_interface(45.0, -2.5));
        assert_eq!(m.nlayers(), 4);
    }

    #[test]
    fn test_delete_interface() {
        let mut m = three_layer();
        assert!(!m.delete_interface(0));
        assert!(m.delete_interface(1));
        assert_eq!(m.nlayers(), 2);
        assert_eq!(m.layers[1].ptop, 60.0);
    }

    #[test]
    fn test_parameterization_parse() {
        assert_eq!(
            "log10".parse::<Parameterization>().unwrap(),
            Parameterization::Log10
        );
        assert!(Parameterization::from_str("decibel").is_err());
    }
}
