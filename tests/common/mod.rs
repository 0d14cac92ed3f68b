use aem1d::aem1d_errors::Aem1dError;
use aem1d::constants::LN10;
use aem1d::earth::LayeredEarth;
use aem1d::forward::{FieldDerivative, FieldResponse, ForwardSystem, PrimaryField};
use aem1d::geometry::Geometry;

/// A forward model linear in the log10 conductivities:
/// `z_w = sum_l F[w][l] * log10(c_l)`. The Gauss-Newton normal equations
/// are exact for it, which makes the solver behaviour analytic.
pub struct LogLinearForward {
    pub f: Vec<Vec<f64>>,
}

impl LogLinearForward {
    pub fn predict(&self, earth: &LayeredEarth) -> Vec<f64> {
        self.f
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&earth.conductivity)
                    .map(|(&fi, &c)| fi * c.log10())
                    .sum()
            })
            .collect()
    }
}

impl ForwardSystem for LogLinearForward {
    fn nwindows(&self) -> usize {
        self.f.len()
    }

    fn primary_fields(&mut self, _geometry: &Geometry) -> PrimaryField {
        PrimaryField::default()
    }

    fn secondary_fields(
        &mut self,
        earth: &LayeredEarth,
        _geometry: &Geometry,
    ) -> Result<FieldResponse, Aem1dError> {
        let mut r = FieldResponse::zeros(self.nwindows());
        r.z = self.predict(earth);
        Ok(r)
    }

    fn derivative_fields(
        &mut self,
        request: FieldDerivative,
        earth: &LayeredEarth,
        _geometry: &Geometry,
    ) -> Result<FieldResponse, Aem1dError> {
        let mut r = FieldResponse::zeros(self.nwindows());
        if let FieldDerivative::Conductivity(li) = request {
            // The inverter applies the ln10 * c chain factor itself.
            for (wi, row) in self.f.iter().enumerate() {
                r.z[wi] = row[li] / (LN10 * earth.conductivity[li]);
            }
        }
        Ok(r)
    }
}

/// A well-conditioned design matrix for a two-layer earth.
pub fn two_layer_design() -> Vec<Vec<f64>> {
    vec![
        vec![1.0, 0.1],
        vec![0.8, 0.3],
        vec![0.6, 0.5],
        vec![0.4, 0.7],
        vec![0.2, 0.9],
        vec![0.1, 1.0],
    ]
}
