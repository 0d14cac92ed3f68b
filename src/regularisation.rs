//! # Model-norm regularisation
//!
//! Builds the weight matrices that define the model-norm penalty of the
//! damped Gauss-Newton objective:
//!
//! * `Wc`, `Wt`, `Wg` – diagonal reference weights for conductivity,
//!   thickness and geometry, each scaled by its alpha and by the layer
//!   thickness relative to the mean thickness (conductivity only);
//! * `Ws` – first- or second-derivative smoothness along the
//!   log-conductivity profile;
//! * `Wq` – per-sounding homogeneity, each row pulling one layer towards
//!   the mean of the others;
//! * `Wr = Wc + Wt + Wg` – the reference-bias part (the only part that
//!   pulls towards `m0`);
//! * `Wm = Wr + Ws + Wq` – the full model-norm weight.
//!
//! All matrices are `P x P`, symmetric positive semi-definite, and have
//! zero rows/columns for parameters that are not solved. They are rebuilt
//! for every bunch because the thickness scaling depends on the reference
//! thicknesses of the bunch.

use std::str::FromStr;

use crate::aem1d_errors::Aem1dError;
use crate::constants::{Matrix, Vector};
use crate::earth::EarthModelSet;
use crate::geometry::GeometryElement;
use crate::params::ParameterLayout;

/// Which discrete derivative the smoothness penalty minimises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmoothnessMethod {
    FirstDerivative,
    #[default]
    SecondDerivative,
}

impl FromStr for SmoothnessMethod {
    type Err = Aem1dError;

    /// Accepts both `Minimise…` and `Minimize…` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("Minimise1stDerivatives")
            || s.eq_ignore_ascii_case("Minimize1stDerivatives")
        {
            Ok(SmoothnessMethod::FirstDerivative)
        } else if s.eq_ignore_ascii_case("Minimise2ndDerivatives")
            || s.eq_ignore_ascii_case("Minimize2ndDerivatives")
        {
            Ok(SmoothnessMethod::SecondDerivative)
        } else {
            Err(Aem1dError::UnknownEnumValue {
                kind: "SmoothnessMethod",
                value: s.to_string(),
            })
        }
    }
}

/// The five alpha weights of the model norm.
#[derive(Debug, Clone, Copy, Default)]
pub struct Alphas {
    pub conductivity: f64,
    pub thickness: f64,
    pub geometry: f64,
    pub smoothness: f64,
    pub homogeneity: f64,
}

/// The assembled weight matrices of one bunch.
#[derive(Debug, Clone)]
pub struct Regularisation {
    pub wc: Matrix,
    pub wt: Matrix,
    pub wg: Matrix,
    pub ws: Matrix,
    pub wq: Matrix,
    pub wr: Matrix,
    pub wm: Matrix,
}

/// Assembles [`Regularisation`] from the bunch layout and reference earths.
pub struct RegularisationBuilder<'a> {
    layout: &'a ParameterLayout,
    earths: &'a [EarthModelSet],
    alphas: Alphas,
    smoothness: SmoothnessMethod,
    /// Per-parameter reference standard deviations, layout order.
    std: &'a Vector,
}

impl<'a> RegularisationBuilder<'a> {
    pub fn new(
        layout: &'a ParameterLayout,
        earths: &'a [EarthModelSet],
        alphas: Alphas,
        smoothness: SmoothnessMethod,
        std: &'a Vector,
    ) -> Self {
        debug_assert_eq!(earths.len(), layout.nsoundings());
        debug_assert_eq!(std.len(), layout.nparams());
        RegularisationBuilder {
            layout,
            earths,
            alphas,
            smoothness,
            std,
        }
    }

    /// Build every weight matrix for the bunch.
    pub fn build(&self) -> Regularisation {
        let wc = self.build_wc();
        let wt = self.build_wt();
        let wg = self.build_wg();
        let ws = match self.smoothness {
            SmoothnessMethod::FirstDerivative => self.build_ws_first_derivative(),
            SmoothnessMethod::SecondDerivative => self.build_ws_second_derivative(),
        };
        let wq = self.build_wq();
        let wr = &wc + &wt + &wg;
        let wm = &wr + &ws + &wq;
        Regularisation {
            wc,
            wt,
            wg,
            ws,
            wq,
            wr,
            wm,
        }
    }

    fn build_wc(&self) -> Matrix {
        let layout = self.layout;
        let nparam = layout.nparams();
        let mut wc = Matrix::zeros(nparam, nparam);
        if !layout.solve_conductivity() || self.alphas.conductivity == 0.0 {
            return wc;
        }

        let nl = layout.nlayers();
        let s = self.alphas.conductivity / (nl * layout.nsoundings()) as f64;
        for (si, earth) in self.earths.iter().enumerate() {
            let t = earth.reference.dummy_thickness();
            let tavg = mean(&t);
            for li in 0..nl {
                let p = layout.cindex(si, li);
                let sigma = self.std[p];
                wc[(p, p)] = s * (t[li] / tavg) / (sigma * sigma);
            }
        }
        wc
    }

    fn build_wt(&self) -> Matrix {
        let layout = self.layout;
        let nparam = layout.nparams();
        let mut wt = Matrix::zeros(nparam, nparam);
        if !layout.solve_thickness() || self.alphas.thickness == 0.0 {
            return wt;
        }

        let nl = layout.nlayers();
        let s = self.alphas.thickness / ((nl - 1) * layout.nsoundings()) as f64;
        for si in 0..layout.nsoundings() {
            for li in 0..nl - 1 {
                let p = layout.tindex(si, li);
                let sigma = self.std[p];
                wt[(p, p)] = s / (sigma * sigma);
            }
        }
        wt
    }

    fn build_wg(&self) -> Matrix {
        let layout = self.layout;
        let nparam = layout.nparams();
        let mut wg = Matrix::zeros(nparam, nparam);
        if !layout.solve_geometry() || self.alphas.geometry == 0.0 {
            return wg;
        }

        let ngeom = GeometryElement::ALL
            .iter()
            .filter(|&&e| layout.solve_geometry_element(e))
            .count();
        let s = self.alphas.geometry / (ngeom * layout.nsoundings()) as f64;
        for si in 0..layout.nsoundings() {
            for e in GeometryElement::ALL {
                if let Some(p) = layout.gindex(si, e) {
                    let sigma = self.std[p];
                    wg[(p, p)] = s / (sigma * sigma);
                }
            }
        }
        wg
    }

    fn build_ws_first_derivative(&self) -> Matrix {
        let layout = self.layout;
        let nparam = layout.nparams();
        let nl = layout.nlayers();
        if self.alphas.smoothness == 0.0 || nl < 3 || !layout.solve_conductivity() {
            return Matrix::zeros(nparam, nparam);
        }

        let nrows = layout.nsoundings() * (nl - 1);
        let mut l = Matrix::zeros(nrows, nparam);
        let mut row = 0usize;
        for (si, earth) in self.earths.iter().enumerate() {
            let t = earth.reference.dummy_thickness();
            let tavg = mean(&t);
            for li in 1..nl {
                let d12 = (t[li - 1] + t[li]) / 2.0;
                // sqrt: the weight gets squared in L'L
                let s = (t[li] / tavg).sqrt();
                l[(row, layout.cindex(si, li - 1))] = -s / d12;
                l[(row, layout.cindex(si, li))] = s / d12;
                row += 1;
            }
        }
        scaled_gram(&l, self.alphas.smoothness, row)
    }

    fn build_ws_second_derivative(&self) -> Matrix {
        let layout = self.layout;
        let nparam = layout.nparams();
        let nl = layout.nlayers();
        if self.alphas.smoothness == 0.0 || nl < 3 || !layout.solve_conductivity() {
            return Matrix::zeros(nparam, nparam);
        }

        let nrows = layout.nsoundings() * (nl - 2);
        let mut l = Matrix::zeros(nrows, nparam);
        let mut row = 0usize;
        for (si, earth) in self.earths.iter().enumerate() {
            let t = earth.reference.dummy_thickness();
            let tavg = mean(&t);
            for li in 1..nl - 1 {
                let d12 = (t[li - 1] + t[li]) / 2.0;
                let d23 = (t[li] + t[li + 1]) / 2.0;
                // sqrt: the weight gets squared in L'L
                let s = (t[li] / tavg).sqrt();
                l[(row, layout.cindex(si, li - 1))] = s / d12;
                l[(row, layout.cindex(si, li))] = -s / d12 - s / d23;
                l[(row, layout.cindex(si, li + 1))] = s / d23;
                row += 1;
            }
        }
        scaled_gram(&l, self.alphas.smoothness, row)
    }

    fn build_wq(&self) -> Matrix {
        let layout = self.layout;
        let nparam = layout.nparams();
        let nl = layout.nlayers();
        if self.alphas.homogeneity == 0.0 || !layout.solve_conductivity() {
            return Matrix::zeros(nparam, nparam);
        }

        let nrows = layout.nsoundings() * nl;
        let mut l = Matrix::zeros(nrows, nparam);
        let mut row = 0usize;
        for (si, earth) in self.earths.iter().enumerate() {
            let t = earth.reference.dummy_thickness();
            let tavg = mean(&t);
            // One constraint per layer: c_l minus the mean of the other
            // layers of the same sounding. Rows sum to zero (a one-layer
            // earth keeps its single diagonal entry).
            for li in 0..nl {
                let s = (t[li] / tavg).sqrt();
                for ki in 0..nl {
                    let p = layout.cindex(si, ki);
                    if ki == li {
                        l[(row, p)] = s;
                    } else {
                        l[(row, p)] = -s / (nl as f64 - 1.0);
                    }
                }
                row += 1;
            }
        }
        scaled_gram(&l, self.alphas.homogeneity, row)
    }
}

fn mean(v: &[f64]) -> f64 {
    v.iter().sum::<f64>() / v.len() as f64
}

/// `L'L * alpha / nrows`.
fn scaled_gram(l: &Matrix, alpha: f64, nrows: usize) -> Matrix {
    let mut w = l.transpose() * l;
    w *= alpha / nrows as f64;
    w
}
