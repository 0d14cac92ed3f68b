//! # Sample-by-sample Gauss-Newton inversion
//!
//! [`SbsInverter`] inverts one *bunch* of adjacent soundings at a time
//! with a damped, bounded, regularised Gauss-Newton iteration and emits a
//! single best-fit layered earth (and optionally geometry) per bunch.
//!
//! ## Iteration outline
//!
//! 1. Start from the reference model with `lambda = 1e8`.
//! 2. Compute the prediction and Jacobian at the current model. Jacobian
//!    columns of log10 parameters are scaled by `ln 10 x linear value`;
//!    rows of a `hypot(X, Z)` amplitude datum combine the X and Z
//!    derivatives; receiver pitch/roll columns come from closed-form
//!    rotations of the already-computed fields.
//! 3. Target `max(0.7 * phid, MinimumPhiD)` and search the lambda grid:
//!    every candidate solves the damped normal equations
//!    `A = J'WdJ + lambda*Wm`, `b = J'Wd(d - g + Jm) + lambda*Wr*m0`
//!    (SVD pseudo-inverse), projects the new model into the parameter
//!    bounds, and evaluates the resulting PhiD.
//! 4. Accept the step iff PhiD does not increase; otherwise the bunch
//!    terminates with reason "No improvement".
//!
//! At termination the parameter sensitivity `diag(J'WdJ)` and uncertainty
//! `sqrt(diag((J'WdJ + lambda*Wm)^-1))` are computed and the inverted
//! earth and geometry are populated from the final parameter vector.
//!
//! The inverter owns all parameter and weight storage for the lifetime of
//! a bunch; weight matrices are rebuilt each bunch because their scaling
//! depends on the reference thicknesses.

pub mod lambda;

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::aem1d_errors::Aem1dError;
use crate::config::{ControlFile, FieldDefinition, NormType, Options};
use crate::constants::{
    is_null, pow10, Matrix, Vector, DEFAULT_BOTTOM_LAYER_THICKNESS, INITIAL_LAMBDA, LN10,
    TARGET_PHID_FRACTION,
};
use crate::data::{ActiveData, DataIndex, SoundingData, XCOMP, XZAMP, YCOMP, ZCOMP};
use crate::earth::{EarthModelSet, LayeredEarth};
use crate::forward::{
    rx_pitch_derivative, rx_roll_derivative, EmSystem, FieldDerivative, SystemSpec,
};
use crate::geometry::{Geometry, GeometryElement, GeometrySet};
use crate::input::{SampleId, TabularInput};
use crate::logger::{null_logger, Logger};
use crate::output::{ColumnFormat, OutputOptions, PointWriter};
use crate::params::{InvertibleField, ParameterLayout};
use crate::regularisation::RegularisationBuilder;

use lambda::search_target;

/// Why the iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    MaxIterations,
    ReachedMinimum,
    SmallImprovement,
    NoImprovement,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::MaxIterations => "Too many iterations",
            TerminationReason::ReachedMinimum => "Reached minimum",
            TerminationReason::SmallImprovement => "Small % improvement",
            TerminationReason::NoImprovement => "No improvement",
        };
        f.write_str(s)
    }
}

/// Rolling state of the Gauss-Newton iteration.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub iteration: usize,
    pub lambda: f64,
    pub param: Vector,
    pub pred: Vector,
    pub phid: f64,
    pub targetphid: f64,
    pub phim: f64,
    pub phic: f64,
    pub phit: f64,
    pub phig: f64,
    pub phis: f64,
    pub phiq: f64,
}

impl IterationState {
    fn starting_from(param: Vector) -> Self {
        IterationState {
            iteration: 0,
            lambda: INITIAL_LAMBDA,
            param,
            pred: Vector::zeros(0),
            phid: f64::MAX,
            targetphid: f64::MAX,
            phim: 0.0,
            phic: 0.0,
            phit: 0.0,
            phig: 0.0,
            phis: 0.0,
            phiq: 0.0,
        }
    }
}

/// Everything the inverter needs to know about one sounding of a bunch.
#[derive(Debug, Clone, Default)]
pub struct SoundingContext {
    pub id: SampleId,
    pub earth: EarthModelSet,
    pub geometry: GeometrySet,
    /// Observed data, one entry per EM system.
    pub data: Vec<SoundingData>,
}

/// One bunch of adjacent soundings handed to [`SbsInverter::invert_bunch`].
#[derive(Debug, Clone, Default)]
pub struct BunchContext {
    pub soundings: Vec<SoundingContext>,
    pub master_index: usize,
    pub master_record: usize,
}

/// Outcome of one inverted bunch.
#[derive(Debug, Clone)]
pub struct BunchResult {
    pub state: IterationState,
    pub termination: TerminationReason,
    pub ndata: usize,
    pub sensitivity: Vector,
    pub uncertainty: Vector,
    pub inverted_earths: Vec<LayeredEarth>,
    pub inverted_geometries: Vec<Geometry>,
    pub nforwards: usize,
    pub njacobians: usize,
    pub output_message: String,
}

/// The sample-by-sample Gauss-Newton inverter.
pub struct SbsInverter {
    options: Options,
    output_options: OutputOptions,
    nlayers: usize,
    conductivity: InvertibleField,
    thickness: InvertibleField,
    geometry_fields: [InvertibleField; GeometryElement::SIZE],
    systems: Vec<EmSystem>,
    logger: Arc<dyn Logger>,

    // Per-bunch state, owned for the lifetime of one bunch and rebuilt
    // at the start of the next.
    layout: ParameterLayout,
    dindex: DataIndex,
    earths: Vec<EarthModelSet>,
    geoms: Vec<GeometrySet>,
    ids: Vec<SampleId>,
    /// Observed data, `[system][sounding]`.
    sdata: Vec<Vec<SoundingData>>,
    obs: Vector,
    err: Vector,
    active: ActiveData,
    /// Diagonal data weights `1 / (nData * err^2)`.
    wd: Vector,
    ref_param: Vector,
    ref_std: Vector,
    reg: Option<crate::regularisation::Regularisation>,
    free_geometry: bool,
    nforwards: usize,
    njacobians: usize,
    output_message: String,
}

impl SbsInverter {
    /// Build an inverter from its options, solve controls and systems.
    ///
    /// Arguments
    /// -----------------
    /// * `options`: The parsed `Options` section.
    /// * `output_options`: The parsed `Output` section toggles.
    /// * `nlayers`: Layers of the earth parameterisation.
    /// * `conductivity`, `thickness`: Solve/bound controls of the earth
    ///   quantities.
    /// * `geometry_fields`: Solve/bound controls per geometry element.
    /// * `systems`: The EM systems, each pairing a [`SystemSpec`] with
    ///   its forward physics.
    pub fn new(
        options: Options,
        output_options: OutputOptions,
        nlayers: usize,
        conductivity: InvertibleField,
        thickness: InvertibleField,
        geometry_fields: [InvertibleField; GeometryElement::SIZE],
        systems: Vec<EmSystem>,
    ) -> Result<Self, Aem1dError> {
        if nlayers == 0 {
            return Err(Aem1dError::ConfigError(
                "NumberOfLayers must be at least 1".to_string(),
            ));
        }
        if systems.is_empty() {
            return Err(Aem1dError::ConfigError(
                "at least one EMSystem is required".to_string(),
            ));
        }
        if !conductivity.solve && !thickness.solve && !geometry_fields.iter().any(|g| g.solve) {
            return Err(Aem1dError::ConfigError(
                "nothing is being solved for".to_string(),
            ));
        }
        let layout = ParameterLayout::new(
            nlayers,
            options.soundings_per_bunch,
            conductivity,
            thickness,
            geometry_fields,
        );
        let specs: Vec<SystemSpec> = systems.iter().map(|s| s.spec).collect();
        let dindex = DataIndex::new(&specs, options.soundings_per_bunch);
        Ok(SbsInverter {
            options,
            output_options,
            nlayers,
            conductivity,
            thickness,
            geometry_fields,
            systems,
            logger: null_logger(),
            layout,
            dindex,
            earths: Vec::new(),
            geoms: Vec::new(),
            ids: Vec::new(),
            sdata: Vec::new(),
            obs: Vector::zeros(0),
            err: Vector::zeros(0),
            active: ActiveData::full(0),
            wd: Vector::zeros(0),
            ref_param: Vector::zeros(0),
            ref_std: Vector::zeros(0),
            reg: None,
            free_geometry: false,
            nforwards: 0,
            njacobians: 0,
            output_message: String::new(),
        })
    }

    /// Supply the diagnostic logger the inverter reports through. The
    /// default discards everything; the core holds no process-wide
    /// logging state.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    fn nsoundings(&self) -> usize {
        self.earths.len()
    }

    /// Invert one bunch.
    ///
    /// Return
    /// ----------
    /// * `Ok(BunchResult)` with the final iterate, termination reason,
    ///   sensitivity/uncertainty and the inverted models.
    /// * `Err(Aem1dError::RecordError)` when the bunch must be skipped
    ///   (zero noise, no active data).
    /// * Other errors are configuration or forward-model failures.
    pub fn invert_bunch(&mut self, bunch: BunchContext) -> Result<BunchResult, Aem1dError> {
        self.reset_bunch(bunch)?;
        self.initialise_bunch_data()?;
        self.initialise_bunch_parameters();
        self.initialise_regularisation();

        let (mut state, termination) = self.iterate()?;

        let inverted_earths = self.earth_models(&state.param);
        let inverted_geometries = self.geometry_models(&state.param);
        for (si, (e, g)) in inverted_earths.iter().zip(&inverted_geometries).enumerate() {
            self.earths[si].inverted = e.clone();
            self.geoms[si].inverted = *g;
        }

        let (sensitivity, uncertainty) = self.parameter_statistics(&mut state)?;
        Ok(BunchResult {
            ndata: self.active.ndata(),
            sensitivity,
            uncertainty,
            inverted_earths,
            inverted_geometries,
            nforwards: self.nforwards,
            njacobians: self.njacobians,
            output_message: self.output_message.clone(),
            state,
            termination,
        })
    }

    /// Reset all per-bunch state and take ownership of the new bunch.
    fn reset_bunch(&mut self, bunch: BunchContext) -> Result<(), Aem1dError> {
        let ns = bunch.soundings.len();
        if ns == 0 {
            return Err(Aem1dError::RecordError("empty bunch".to_string()));
        }
        for s in &bunch.soundings {
            s.earth.sanity_check()?;
            if s.data.len() != self.systems.len() {
                return Err(Aem1dError::RecordError(format!(
                    "sounding supplies data for {} systems, {} configured",
                    s.data.len(),
                    self.systems.len()
                )));
            }
        }

        self.layout = ParameterLayout::new(
            self.nlayers,
            ns,
            self.conductivity,
            self.thickness,
            self.geometry_fields,
        );
        let specs: Vec<SystemSpec> = self.systems.iter().map(|s| s.spec).collect();
        self.dindex = DataIndex::new(&specs, ns);

        self.earths.clear();
        self.geoms.clear();
        self.ids.clear();
        self.sdata = vec![Vec::with_capacity(ns); self.systems.len()];
        for s in bunch.soundings {
            self.earths.push(s.earth);
            self.geoms.push(s.geometry);
            self.ids.push(s.id);
            for (sysi, d) in s.data.into_iter().enumerate() {
                self.sdata[sysi].push(d);
            }
        }
        self.free_geometry = false;
        self.nforwards = 0;
        self.njacobians = 0;
        self.output_message.clear();
        self.reg = None;
        Ok(())
    }

    /// Assemble the observation and noise vectors, reconstruct primaries,
    /// cull null entries and build the data weights.
    fn initialise_bunch_data(&mut self) -> Result<(), Aem1dError> {
        let nall = self.dindex.nall();
        let mut obs = vec![f64::NAN; nall];
        let mut err = vec![f64::NAN; nall];

        for sysi in 0..self.systems.len() {
            let spec = self.systems[sysi].spec;
            for si in 0..self.nsoundings() {
                if spec.reconstruct_primary {
                    let p = self.systems[sysi]
                        .forward
                        .primary_fields(&self.geoms[si].tfr);
                    self.sdata[sysi][si].primary = [p.x, p.y, p.z];
                }
                let d = &self.sdata[sysi][si];
                if spec.invert_x_plus_z {
                    for wi in 0..spec.nwindows {
                        let mut x = d.secondary[XCOMP][wi];
                        let mut z = d.secondary[ZCOMP][wi];
                        if spec.invert_primary_plus_secondary {
                            x += d.primary[XCOMP];
                            z += d.primary[ZCOMP];
                        }
                        let amp = x.hypot(z);
                        let di = self.dindex.get(si, sysi, XZAMP, wi).expect("xz slot");
                        obs[di] = amp;
                        let xe = d.noise[XCOMP][wi];
                        let ze = d.noise[ZCOMP][wi];
                        err[di] = (x * xe).hypot(z * ze) / amp;

                        if spec.use_y {
                            let di = self.dindex.get(si, sysi, YCOMP, wi).expect("y slot");
                            obs[di] = d.secondary[YCOMP][wi]
                                + if spec.invert_primary_plus_secondary {
                                    d.primary[YCOMP]
                                } else {
                                    0.0
                                };
                            err[di] = d.noise[YCOMP][wi];
                        }
                    }
                } else {
                    for ci in 0..3 {
                        if !spec.component_used(ci) {
                            continue;
                        }
                        for wi in 0..spec.nwindows {
                            let di = self.dindex.get(si, sysi, ci, wi).expect("component slot");
                            obs[di] = d.secondary[ci][wi]
                                + if spec.invert_primary_plus_secondary {
                                    d.primary[ci]
                                } else {
                                    0.0
                                };
                            err[di] = d.noise[ci][wi];
                        }
                    }
                }
            }
        }

        self.active = ActiveData::from_obs_and_noise(&obs, &err);
        if self.active.ndata() == 0 {
            return Err(Aem1dError::RecordError(
                "no active data in bunch".to_string(),
            ));
        }
        if self.active.nculled() > 0 {
            self.output_message.push_str(&format!(
                ", {} null data/noise were culled",
                self.active.nculled()
            ));
        }
        self.obs = self.active.cull(&obs);
        self.err = self.active.cull(&err);

        let nzero = self.err.iter().filter(|&&e| e == 0.0).count();
        if nzero > 0 {
            return Err(Aem1dError::RecordError(format!(
                "skipped, {nzero} noise values were 0.0"
            )));
        }

        let nd = self.active.ndata() as f64;
        self.wd =
            Vector::from_iterator(self.err.len(), self.err.iter().map(|&e| 1.0 / (nd * e * e)));
        Ok(())
    }

    /// Fill the reference parameter vector `m0` and its std from the
    /// reference earths and geometries of the bunch.
    fn initialise_bunch_parameters(&mut self) {
        let np = self.layout.nparams();
        self.ref_param = Vector::zeros(np);
        self.ref_std = Vector::zeros(np);
        for si in 0..self.nsoundings() {
            let e = &self.earths[si];
            let g = &self.geoms[si];
            if self.layout.solve_conductivity() {
                for li in 0..self.nlayers {
                    let p = self.layout.cindex(si, li);
                    self.ref_param[p] = e.reference.conductivity[li].log10();
                    self.ref_std[p] = e.std.conductivity[li];
                }
            }
            if self.layout.solve_thickness() {
                for li in 0..self.nlayers - 1 {
                    let p = self.layout.tindex(si, li);
                    self.ref_param[p] = e.reference.thickness[li].log10();
                    self.ref_std[p] = e.std.thickness[li];
                }
            }
            for elem in GeometryElement::ALL {
                if let Some(p) = self.layout.gindex(si, elem) {
                    self.ref_param[p] = g.reference[elem];
                    self.ref_std[p] = g.std[elem];
                }
            }
        }
    }

    fn initialise_regularisation(&mut self) {
        let reg = RegularisationBuilder::new(
            &self.layout,
            &self.earths,
            self.options.alphas,
            self.options.smoothness,
            &self.ref_std,
        )
        .build();
        self.reg = Some(reg);
    }

    /// Linear-space earths at `parameters` (unsolved quantities keep
    /// their reference values).
    fn earth_models(&self, parameters: &Vector) -> Vec<LayeredEarth> {
        (0..self.nsoundings())
            .map(|si| {
                let mut e = self.earths[si].reference.clone();
                if self.layout.solve_conductivity() {
                    for li in 0..self.nlayers {
                        e.conductivity[li] = pow10(parameters[self.layout.cindex(si, li)]);
                    }
                }
                if self.layout.solve_thickness() {
                    for li in 0..self.nlayers - 1 {
                        e.thickness[li] = pow10(parameters[self.layout.tindex(si, li)]);
                    }
                }
                e
            })
            .collect()
    }

    /// Geometries at `parameters` (unsolved elements keep their input
    /// values).
    fn geometry_models(&self, parameters: &Vector) -> Vec<Geometry> {
        (0..self.nsoundings())
            .map(|si| {
                let mut g = self.geoms[si].input;
                for elem in GeometryElement::ALL {
                    if let Some(p) = self.layout.gindex(si, elem) {
                        g[elem] = parameters[p];
                    }
                }
                g
            })
            .collect()
    }

    /// One forward evaluation; with `compute_derivatives`, also the
    /// culled Jacobian.
    fn forward_impl(
        &mut self,
        parameters: &Vector,
        compute_derivatives: bool,
    ) -> Result<(Vector, Option<Matrix>), Aem1dError> {
        let earths = self.earth_models(parameters);
        let geoms = self.geometry_models(parameters);

        self.nforwards += 1;
        if compute_derivatives {
            self.njacobians += 1;
        }

        let Self {
            ref mut systems,
            ref dindex,
            ref layout,
            ref active,
            free_geometry,
            nlayers,
            ..
        } = *self;

        let nall = dindex.nall();
        let mut pred_all = vec![0.0; nall];
        let mut j_all = if compute_derivatives {
            Some(Matrix::zeros(nall, layout.nparams()))
        } else {
            None
        };

        for (sysi, system) in systems.iter_mut().enumerate() {
            let spec = system.spec;
            let nw = spec.nwindows;
            for (si, (earth, geom)) in earths.iter().zip(&geoms).enumerate() {
                let sec = system.forward.secondary_fields(earth, geom)?;
                let mut xfm = sec.x;
                let mut yfm = sec.y;
                let mut zfm = sec.z;
                if spec.invert_primary_plus_secondary {
                    let p = system.forward.primary_fields(geom);
                    xfm.iter_mut().for_each(|v| *v += p.x);
                    yfm.iter_mut().for_each(|v| *v += p.y);
                    zfm.iter_mut().for_each(|v| *v += p.z);
                }
                let xzfm: Vec<f64> = if spec.invert_x_plus_z {
                    (0..nw).map(|wi| xfm[wi].hypot(zfm[wi])).collect()
                } else {
                    Vec::new()
                };

                if spec.invert_x_plus_z {
                    for wi in 0..nw {
                        if let Some(di) = dindex.get(si, sysi, XZAMP, wi) {
                            pred_all[di] = xzfm[wi];
                        }
                        if let Some(di) = dindex.get(si, sysi, YCOMP, wi) {
                            pred_all[di] = yfm[wi];
                        }
                    }
                } else {
                    for wi in 0..nw {
                        for (ci, f) in [(XCOMP, &xfm), (YCOMP, &yfm), (ZCOMP, &zfm)] {
                            if let Some(di) = dindex.get(si, sysi, ci, wi) {
                                pred_all[di] = f[wi];
                            }
                        }
                    }
                }

                let Some(j) = j_all.as_mut() else {
                    continue;
                };

                if layout.solve_conductivity() {
                    for li in 0..nlayers {
                        let pindex = layout.cindex(si, li);
                        let mut d = system.forward.derivative_fields(
                            FieldDerivative::Conductivity(li),
                            earth,
                            geom,
                        )?;
                        // Chain rule of the log10 parameterisation.
                        let sf = LN10 * earth.conductivity[li];
                        scale(&mut d.x, sf);
                        scale(&mut d.y, sf);
                        scale(&mut d.z, sf);
                        fill_matrix_column(
                            j, dindex, &spec, si, sysi, pindex, &xfm, &zfm, &xzfm, &d.x, &d.y,
                            &d.z,
                        );
                    }
                }

                if layout.solve_thickness() {
                    for li in 0..nlayers - 1 {
                        let pindex = layout.tindex(si, li);
                        let mut d = system.forward.derivative_fields(
                            FieldDerivative::Thickness(li),
                            earth,
                            geom,
                        )?;
                        let sf = LN10 * earth.thickness[li];
                        scale(&mut d.x, sf);
                        scale(&mut d.y, sf);
                        scale(&mut d.z, sf);
                        fill_matrix_column(
                            j, dindex, &spec, si, sysi, pindex, &xfm, &zfm, &xzfm, &d.x, &d.y,
                            &d.z,
                        );
                    }
                }

                if free_geometry {
                    for (elem, request) in [
                        (GeometryElement::TxHeight, FieldDerivative::TxHeight),
                        (GeometryElement::TxRxDx, FieldDerivative::TxRxDx),
                        (GeometryElement::TxRxDy, FieldDerivative::TxRxDy),
                        (GeometryElement::TxRxDz, FieldDerivative::TxRxDz),
                    ] {
                        if let Some(pindex) = layout.gindex(si, elem) {
                            let d = system.forward.derivative_fields(request, earth, geom)?;
                            fill_matrix_column(
                                j, dindex, &spec, si, sysi, pindex, &xfm, &zfm, &xzfm, &d.x,
                                &d.y, &d.z,
                            );
                        }
                    }
                    // Receiver attitude columns are rotations of the
                    // already-computed fields, not forward calls.
                    if let Some(pindex) = layout.gindex(si, GeometryElement::RxPitch) {
                        let (dx, dz) =
                            rx_pitch_derivative(&xfm, &zfm, geom[GeometryElement::RxPitch]);
                        let dy = vec![0.0; nw];
                        fill_matrix_column(
                            j, dindex, &spec, si, sysi, pindex, &xfm, &zfm, &xzfm, &dx, &dy, &dz,
                        );
                    }
                    if let Some(pindex) = layout.gindex(si, GeometryElement::RxRoll) {
                        let (dy, dz) =
                            rx_roll_derivative(&yfm, &zfm, geom[GeometryElement::RxRoll]);
                        let dx = vec![0.0; nw];
                        fill_matrix_column(
                            j, dindex, &spec, si, sysi, pindex, &xfm, &zfm, &xzfm, &dx, &dy, &dz,
                        );
                    }
                }
            }
        }

        let pred = active.cull(&pred_all);
        if pred.iter().any(|&v| is_null(v)) {
            return Err(Aem1dError::NumericalFault(
                "non-finite value in predicted data".to_string(),
            ));
        }
        let jacobian = match j_all {
            Some(j) => {
                let jc = active.cull_rows(&j);
                if jc.iter().any(|&v| is_null(v)) {
                    return Err(Aem1dError::NumericalFault(
                        "non-finite value in Jacobian".to_string(),
                    ));
                }
                Some(jc)
            }
            None => None,
        };
        Ok((pred, jacobian))
    }

    /// Normalised data misfit of a prediction.
    fn phi_data(&self, pred: &Vector) -> f64 {
        let r = &self.obs - pred;
        r.iter()
            .zip(self.wd.iter())
            .map(|(&ri, &wi)| wi * ri * ri)
            .sum()
    }

    fn update_phi_model(&self, state: &mut IterationState) {
        let reg = self.reg.as_ref().expect("regularisation built");
        let alphas = self.options.alphas;
        let dm = &state.param - &self.ref_param;
        state.phic = if alphas.conductivity > 0.0 {
            quad(&dm, &reg.wc)
        } else {
            0.0
        };
        state.phit = if alphas.thickness > 0.0 && self.layout.solve_thickness() {
            quad(&dm, &reg.wt)
        } else {
            0.0
        };
        state.phig = if alphas.geometry > 0.0 {
            quad(&dm, &reg.wg)
        } else {
            0.0
        };
        state.phis = if alphas.smoothness > 0.0 {
            quad(&state.param, &reg.ws)
        } else {
            0.0
        };
        state.phiq = if alphas.homogeneity > 0.0 {
            quad(&state.param, &reg.wq)
        } else {
            0.0
        };
        state.phim = state.phic + state.phit + state.phig + state.phis + state.phiq;
    }

    /// Solve the damped normal equations at (`param`, `pred`, `jacobian`)
    /// for the new model.
    ///
    /// Under the L1 norm the data weights are reweighted on the fly by
    /// `1 / |r_i / e_i|`, keeping diagonal positivity for non-zero
    /// residuals while leaving the interface unchanged.
    fn solve_linear_system(
        &self,
        lambda: f64,
        param: &Vector,
        pred: &Vector,
        jacobian: &Matrix,
    ) -> Result<Vector, Aem1dError> {
        let reg = self.reg.as_ref().expect("regularisation built");
        let r = &self.obs - pred;

        let mut v = self.wd.clone();
        if self.options.norm_type == NormType::L1 {
            for i in 0..v.len() {
                let nr = (r[i] / self.err[i]).abs();
                if nr > 0.0 {
                    v[i] /= nr;
                }
            }
        }

        // J'V with V diagonal: scale Jacobian rows by v, then transpose.
        let mut vj = jacobian.clone();
        for (i, mut row) in vj.row_iter_mut().enumerate() {
            row *= v[i];
        }
        let jtvj = jacobian.transpose() * &vj;

        let mut weighted = &r + jacobian * param;
        for i in 0..weighted.len() {
            weighted[i] *= v[i];
        }
        let b = jacobian.transpose() * weighted + (&reg.wr * &self.ref_param) * lambda;
        let a = &jtvj + &reg.wm * lambda;

        let svd = a.svd(true, true);
        svd.solve(&b, 1.0e-13)
            .map_err(|e| Aem1dError::SolverStall(format!("linear solve failed: {e}")))
    }

    /// Solve for the new model at a candidate lambda and project it into
    /// the parameter bounds.
    ///
    /// The change is re-expressed as `dm_i = clip(m_i + dm_i) - m_i` for
    /// every bounded parameter; earth bounds are supplied in linear space
    /// and compared in log10. A clipped parameter lands exactly on its
    /// bound.
    fn projected_model(
        &self,
        lambda: f64,
        param: &Vector,
        pred: &Vector,
        jacobian: &Matrix,
    ) -> Result<Vector, Aem1dError> {
        let mut m_new = self.solve_linear_system(lambda, param, pred, jacobian)?;

        if self.layout.bound_conductivity() {
            for si in 0..self.nsoundings() {
                let e = &self.earths[si];
                if e.min.conductivity.is_empty() {
                    continue;
                }
                for li in 0..self.nlayers {
                    let p = self.layout.cindex(si, li);
                    let lmin = e.min.conductivity[li].log10();
                    let lmax = e.max.conductivity[li].log10();
                    m_new[p] = m_new[p].clamp(lmin, lmax);
                }
            }
        }
        if self.layout.bound_thickness() {
            for si in 0..self.nsoundings() {
                let e = &self.earths[si];
                if e.min.thickness.is_empty() {
                    continue;
                }
                for li in 0..self.nlayers - 1 {
                    let p = self.layout.tindex(si, li);
                    let lmin = e.min.thickness[li].log10();
                    let lmax = e.max.thickness[li].log10();
                    m_new[p] = m_new[p].clamp(lmin, lmax);
                }
            }
        }
        for si in 0..self.nsoundings() {
            let g = &self.geoms[si];
            for elem in GeometryElement::ALL {
                if !self.layout.bound_geometry_element(elem) {
                    continue;
                }
                if let Some(p) = self.layout.gindex(si, elem) {
                    m_new[p] = m_new[p].clamp(g.min[elem], g.max[elem]);
                }
            }
        }
        Ok(m_new)
    }

    /// The damped Gauss-Newton iteration over one bunch.
    fn iterate(&mut self) -> Result<(IterationState, TerminationReason), Aem1dError> {
        let mut state = IterationState::starting_from(self.ref_param.clone());
        let (pred, _) = self.forward_impl(&state.param, false)?;
        state.pred = pred;
        state.phid = self.phi_data(&state.pred);
        state.targetphid = state.phid;
        self.update_phi_model(&mut state);

        let mut percent_change = 100.0;
        loop {
            if state.iteration >= self.options.max_iterations {
                return Ok((state, TerminationReason::MaxIterations));
            }
            if state.phid <= self.options.min_phid {
                return Ok((state, TerminationReason::ReachedMinimum));
            }
            if state.iteration > 4 && percent_change < self.options.min_percent_improvement {
                return Ok((state, TerminationReason::SmallImprovement));
            }

            self.free_geometry = self.layout.solve_geometry()
                && state.iteration + 1 >= self.options.begin_geometry_solve_iteration;

            let (g, j) = match self.forward_impl(&state.param, true) {
                Ok((g, Some(j))) => (g, j),
                Ok((_, None)) => unreachable!("derivatives requested"),
                Err(Aem1dError::NumericalFault(msg)) => {
                    self.logger
                        .warn(&format!("numerical fault in Jacobian, terminating bunch: {msg}"));
                    return Ok((state, TerminationReason::NoImprovement));
                }
                Err(e) => return Err(e),
            };

            let target_phid = (state.phid * TARGET_PHID_FRACTION).max(self.options.min_phid);
            let trial = search_target(state.lambda, target_phid, |lam| {
                let m_try = self.projected_model(lam, &state.param, &g, &j).ok()?;
                let (g_try, _) = self.forward_impl(&m_try, false).ok()?;
                Some(self.phi_data(&g_try))
            });
            let Some(trial) = trial else {
                return Ok((state, TerminationReason::NoImprovement));
            };

            let m_proj = match self.projected_model(trial.lambda, &state.param, &g, &j) {
                Ok(m) => m,
                Err(_) => return Ok((state, TerminationReason::NoImprovement)),
            };
            // Step shortening re-expresses the projected model as a
            // scaled change; the full step keeps clipped parameters
            // exactly on their bounds.
            let m_new = if trial.stepfactor < 1.0 {
                &state.param + (&m_proj - &state.param) * trial.stepfactor
            } else {
                m_proj
            };
            let (g_new, _) = match self.forward_impl(&m_new, false) {
                Ok(v) => v,
                Err(_) => return Ok((state, TerminationReason::NoImprovement)),
            };
            let phid_new = self.phi_data(&g_new);
            percent_change = 100.0 * (state.phid - phid_new) / state.phid;

            if phid_new <= state.phid {
                state.iteration += 1;
                state.param = m_new;
                state.pred = g_new;
                state.targetphid = target_phid;
                state.phid = phid_new;
                state.lambda = trial.lambda;
                self.update_phi_model(&mut state);
                self.logger.debug(&format!(
                    "accepted iteration {} phid={:.6e} lambda={:.3e}",
                    state.iteration, state.phid, state.lambda
                ));
            } else {
                return Ok((state, TerminationReason::NoImprovement));
            }
        }
    }

    /// Parameter sensitivity and uncertainty at the final iterate.
    fn parameter_statistics(
        &mut self,
        state: &mut IterationState,
    ) -> Result<(Vector, Vector), Aem1dError> {
        let np = self.layout.nparams();
        let (pred, jacobian) = match self.forward_impl(&state.param, true) {
            Ok((p, Some(j))) => (p, j),
            _ => return Ok((Vector::zeros(np), Vector::zeros(np))),
        };
        state.pred = pred;

        let mut vj = jacobian.clone();
        for (i, mut row) in vj.row_iter_mut().enumerate() {
            row *= self.wd[i];
        }
        let jtvj = jacobian.transpose() * &vj;
        let sensitivity = Vector::from_iterator(np, jtvj.diagonal().iter().copied());

        let reg = self.reg.as_ref().expect("regularisation built");
        let a = &jtvj + &reg.wm * state.lambda;
        let uncertainty = match a.svd(true, true).pseudo_inverse(1.0e-13) {
            Ok(ainv) => {
                Vector::from_iterator(np, ainv.diagonal().iter().map(|&v| v.max(0.0).sqrt()))
            }
            Err(_) => Vector::zeros(np),
        };
        Ok((sensitivity, uncertainty))
    }

    /// Write the point record of an inverted bunch at its master sounding.
    pub fn write_point<W: Write>(
        &self,
        writer: &mut PointWriter<W>,
        master_index: usize,
        master_record: usize,
        result: &BunchResult,
    ) -> Result<(), Aem1dError> {
        let si = master_index;
        let oo = &self.output_options;
        let id = &self.ids[si];
        writer.begin_point_output()?;

        writer.write_field(
            "uniqueid",
            "Inversion sequence number",
            "",
            ColumnFormat::Integer(12),
            &[master_record as f64],
        )?;
        writer.write_field("line", "Line number", "", ColumnFormat::Integer(10), &[id.line])?;
        if let Some(fid) = id.fiducial {
            writer.write_field("fiducial", "Fiducial", "", ColumnFormat::Fixed(12, 2), &[fid])?;
        }
        if let (Some(x), Some(y)) = (id.x, id.y) {
            writer.write_field("easting", "Easting", "m", ColumnFormat::Fixed(12, 1), &[x])?;
            writer.write_field("northing", "Northing", "m", ColumnFormat::Fixed(12, 1), &[y])?;
        }
        writer.write_field(
            "elevation",
            "Ground elevation",
            "m",
            ColumnFormat::Fixed(9, 2),
            &[id.elevation],
        )?;

        let g = &self.geoms[si];
        for (elem, value) in g.input.iter() {
            writer.write_field(
                &format!("input_{elem}"),
                &format!("Input {}", elem.description()),
                elem.units(),
                ColumnFormat::Fixed(9, 2),
                &[value],
            )?;
        }
        for elem in GeometryElement::ALL {
            if oo.inverted_fields_only && !self.layout.solve_geometry_element(elem) {
                continue;
            }
            writer.write_field(
                &format!("inverted_{elem}"),
                &format!("Inverted {}", elem.description()),
                elem.units(),
                ColumnFormat::Fixed(9, 2),
                &[result.inverted_geometries[si][elem]],
            )?;
        }

        writer.write_field(
            "ndata",
            "Number of data in inversion",
            "",
            ColumnFormat::Integer(4),
            &[result.ndata as f64],
        )?;
        let earth = &result.inverted_earths[si];
        writer.write_field(
            "nlayers",
            "Number of layers",
            "",
            ColumnFormat::Integer(4),
            &[self.nlayers as f64],
        )?;
        writer.write_field(
            "conductivity",
            "Layer conductivity",
            "S/m",
            ColumnFormat::Scientific(15, 6),
            &earth.conductivity,
        )?;

        // Pad the half-space to a finite thickness for the layer table.
        let bottom = if !self.layout.solve_thickness() && self.nlayers > 1 {
            earth.thickness[self.nlayers - 2]
        } else {
            DEFAULT_BOTTOM_LAYER_THICKNESS
        };
        let mut thickness = earth.thickness.clone();
        thickness.push(bottom);
        writer.write_field(
            "thickness",
            "Layer thickness",
            "m",
            ColumnFormat::Fixed(9, 2),
            &thickness,
        )?;

        if oo.positive_layer_top_depths {
            writer.write_field(
                "depth_top",
                "Depth to top of layer",
                "m",
                ColumnFormat::Fixed(9, 2),
                &earth.layer_top_depth(),
            )?;
        }
        if oo.negative_layer_top_depths {
            let d: Vec<f64> = earth.layer_top_depth().iter().map(|v| -v).collect();
            writer.write_field(
                "depth_top_negative",
                "Negative of depth to top of layer",
                "m",
                ColumnFormat::Fixed(9, 2),
                &d,
            )?;
        }
        if oo.positive_layer_bottom_depths {
            writer.write_field(
                "depth_bottom",
                "Depth to bottom of layer",
                "m",
                ColumnFormat::Fixed(9, 2),
                &earth.layer_bottom_depth(),
            )?;
        }
        if oo.negative_layer_bottom_depths {
            let d: Vec<f64> = earth.layer_bottom_depth().iter().map(|v| -v).collect();
            writer.write_field(
                "depth_bottom_negative",
                "Negative of depth to bottom of layer",
                "m",
                ColumnFormat::Fixed(9, 2),
                &d,
            )?;
        }
        if oo.interface_elevations {
            let d: Vec<f64> = earth
                .layer_top_depth()
                .iter()
                .map(|v| id.elevation - v)
                .collect();
            writer.write_field(
                "elevation_interface",
                "Elevation of interface",
                "m",
                ColumnFormat::Fixed(9, 2),
                &d,
            )?;
        }

        if oo.parameter_sensitivity {
            self.write_parameter_block(writer, si, &result.sensitivity, "sensitivity")?;
        }
        if oo.parameter_uncertainty {
            self.write_parameter_block(writer, si, &result.uncertainty, "uncertainty")?;
        }

        if oo.observed_data {
            self.write_data_block(writer, si, "observed", DataBlock::Observed)?;
        }
        if oo.noise_estimates {
            self.write_data_block(writer, si, "noise", DataBlock::Noise)?;
        }
        if oo.predicted_data {
            let pred_all = self.active.scatter(&result.state.pred, f64::NAN);
            self.write_data_block(writer, si, "predicted", DataBlock::Predicted(&pred_all))?;
        }

        let a = self.options.alphas;
        writer.write_field("AlphaC", "AlphaConductivity inversion parameter", "", ColumnFormat::Scientific(15, 6), &[a.conductivity])?;
        writer.write_field("AlphaT", "AlphaThickness inversion parameter", "", ColumnFormat::Scientific(15, 6), &[a.thickness])?;
        writer.write_field("AlphaG", "AlphaGeometry inversion parameter", "", ColumnFormat::Scientific(15, 6), &[a.geometry])?;
        writer.write_field("AlphaS", "AlphaSmoothness inversion parameter", "", ColumnFormat::Scientific(15, 6), &[a.smoothness])?;
        writer.write_field("AlphaQ", "AlphaHomogeneous inversion parameter", "", ColumnFormat::Scientific(15, 6), &[a.homogeneity])?;
        let s = &result.state;
        writer.write_field("PhiD", "Normalised data misfit", "", ColumnFormat::Scientific(15, 6), &[s.phid])?;
        writer.write_field("PhiM", "Combined model norm", "", ColumnFormat::Scientific(15, 6), &[s.phim])?;
        writer.write_field("PhiC", "Conductivity reference model norm", "", ColumnFormat::Scientific(15, 6), &[s.phic])?;
        writer.write_field("PhiT", "Thickness reference model norm", "", ColumnFormat::Scientific(15, 6), &[s.phit])?;
        writer.write_field("PhiG", "Geometry reference model norm", "", ColumnFormat::Scientific(15, 6), &[s.phig])?;
        writer.write_field("PhiS", "Smoothness model norm", "", ColumnFormat::Scientific(15, 6), &[s.phis])?;
        writer.write_field("PhiQ", "Homogeneity model norm", "", ColumnFormat::Scientific(15, 6), &[s.phiq])?;
        writer.write_field("Lambda", "Lambda regularization parameter", "", ColumnFormat::Scientific(15, 6), &[s.lambda])?;
        writer.write_field("Iterations", "Number of iterations", "", ColumnFormat::Integer(4), &[s.iteration as f64])?;

        writer.end_point_output()?;
        Ok(())
    }

    fn write_parameter_block<W: Write>(
        &self,
        writer: &mut PointWriter<W>,
        si: usize,
        values: &Vector,
        what: &str,
    ) -> Result<(), Aem1dError> {
        if self.layout.solve_conductivity() {
            let v: Vec<f64> = (0..self.nlayers)
                .map(|li| values[self.layout.cindex(si, li)])
                .collect();
            writer.write_field(
                &format!("conductivity_{what}"),
                &format!("Conductivity parameter {what}"),
                "",
                ColumnFormat::Scientific(15, 6),
                &v,
            )?;
        }
        if self.layout.solve_thickness() {
            let mut v: Vec<f64> = (0..self.nlayers - 1)
                .map(|li| values[self.layout.tindex(si, li)])
                .collect();
            // The half-space is not a parameter.
            v.push(0.0);
            writer.write_field(
                &format!("thickness_{what}"),
                &format!("Thickness parameter {what}"),
                "",
                ColumnFormat::Scientific(15, 6),
                &v,
            )?;
        }
        for elem in GeometryElement::ALL {
            if let Some(p) = self.layout.gindex(si, elem) {
                writer.write_field(
                    &format!("inverted_{elem}_{what}"),
                    &format!("{} parameter {what}", elem.description()),
                    elem.units(),
                    ColumnFormat::Scientific(15, 6),
                    &[values[p]],
                )?;
            }
        }
        Ok(())
    }

    /// Per-system per-component data arrays of the master sounding.
    fn write_data_block<W: Write>(
        &self,
        writer: &mut PointWriter<W>,
        si: usize,
        prefix: &str,
        source: DataBlock<'_>,
    ) -> Result<(), Aem1dError> {
        for (sysi, system) in self.systems.iter().enumerate() {
            let spec = system.spec;
            let d = &self.sdata[sysi][si];
            let comps: &[(usize, &str)] = if spec.invert_x_plus_z {
                if spec.use_y {
                    &[(XZAMP, "XZ"), (YCOMP, "Y")]
                } else {
                    &[(XZAMP, "XZ")]
                }
            } else {
                &[(XCOMP, "X"), (YCOMP, "Y"), (ZCOMP, "Z")]
            };
            for &(ci, name) in comps {
                if ci != XZAMP && !spec.component_used(ci) {
                    continue;
                }
                let values: Vec<f64> = match source {
                    DataBlock::Observed if ci == XZAMP => (0..spec.nwindows)
                        .map(|wi| d.secondary[XCOMP][wi].hypot(d.secondary[ZCOMP][wi]))
                        .collect(),
                    DataBlock::Observed => d.secondary[ci].clone(),
                    DataBlock::Noise if ci == XZAMP => (0..spec.nwindows)
                        .map(|wi| d.noise[XCOMP][wi].hypot(d.noise[ZCOMP][wi]))
                        .collect(),
                    DataBlock::Noise => d.noise[ci].clone(),
                    DataBlock::Predicted(all) => (0..spec.nwindows)
                        .map(|wi| {
                            self.dindex
                                .get(si, sysi, ci, wi)
                                .map(|di| all[di])
                                .unwrap_or(f64::NAN)
                        })
                        .collect(),
                };
                writer.write_field(
                    &format!("{prefix}_EMSystem_{}_{name}S", sysi + 1),
                    &format!(
                        "{prefix} EMSystem {} {name}-component secondary field",
                        sysi + 1
                    ),
                    "",
                    ColumnFormat::Scientific(15, 6),
                    &values,
                )?;
            }
        }
        Ok(())
    }

    /// One-line summary of a finished bunch, for the run log.
    pub fn bunch_summary(
        &self,
        master_index: usize,
        master_record: usize,
        result: &BunchResult,
    ) -> String {
        let id = &self.ids[master_index];
        format!(
            "Rec {:>6} Ln {:>7} Its={:>3} Phid={:>6.2} {}{} nF={} nJ={}",
            master_record + 1,
            id.line,
            result.state.iteration,
            result.state.phid,
            result.termination,
            result.output_message,
            result.nforwards,
            result.njacobians,
        )
    }
}

enum DataBlock<'a> {
    Observed,
    Noise,
    Predicted(&'a [f64]),
}

fn quad(v: &Vector, w: &Matrix) -> f64 {
    (v.transpose() * w * v)[(0, 0)]
}

fn scale(v: &mut [f64], s: f64) {
    v.iter_mut().for_each(|x| *x *= s);
}

/// Fill one Jacobian column. XZ-amplitude rows combine the X and Z
/// derivatives as `(X dX + Z dZ) / XZ`.
#[allow(clippy::too_many_arguments)]
fn fill_matrix_column(
    j: &mut Matrix,
    dindex: &DataIndex,
    spec: &SystemSpec,
    si: usize,
    sysi: usize,
    pindex: usize,
    xfm: &[f64],
    zfm: &[f64],
    xzfm: &[f64],
    xdrv: &[f64],
    ydrv: &[f64],
    zdrv: &[f64],
) {
    let nw = spec.nwindows;
    if spec.invert_x_plus_z {
        for wi in 0..nw {
            if let Some(di) = dindex.get(si, sysi, XZAMP, wi) {
                j[(di, pindex)] = (xfm[wi] * xdrv[wi] + zfm[wi] * zdrv[wi]) / xzfm[wi];
            }
            if let Some(di) = dindex.get(si, sysi, YCOMP, wi) {
                j[(di, pindex)] = ydrv[wi];
            }
        }
    } else {
        for wi in 0..nw {
            for (ci, d) in [(XCOMP, xdrv), (YCOMP, ydrv), (ZCOMP, zdrv)] {
                if let Some(di) = dindex.get(si, sysi, ci, wi) {
                    j[(di, pindex)] = d[wi];
                }
            }
        }
    }
}

/// Parsed control-file sections needed to drive a whole inversion run.
pub struct InversionSetup {
    pub options: Options,
    pub output_options: OutputOptions,
    pub nlayers: usize,
    pub conductivity: crate::config::InvertibleFieldSpec,
    pub thickness: crate::config::InvertibleFieldSpec,
    pub geometry: Vec<crate::config::InvertibleFieldSpec>,
    pub ancillary: Vec<(String, FieldDefinition)>,
    pub em_systems: Vec<crate::config::EmSystemConfig>,
}

impl InversionSetup {
    pub fn from_control(control: &ControlFile) -> Result<Self, Aem1dError> {
        Ok(InversionSetup {
            options: control.options()?,
            output_options: OutputOptions::from_block(control.output_block()),
            nlayers: control.nlayers()?,
            conductivity: control.conductivity_spec()?,
            thickness: control.thickness_spec()?,
            geometry: control.geometry_specs()?,
            ancillary: control.ancillary_fields()?,
            em_systems: control.em_systems()?,
        })
    }

    fn invertible(spec: &crate::config::InvertibleFieldSpec) -> InvertibleField {
        if spec.solve {
            InvertibleField::solved(spec.bound)
        } else {
            InvertibleField::fixed()
        }
    }

    /// Field definition of the mandatory `line` ancillary.
    fn line_field(&self) -> &FieldDefinition {
        self.ancillary
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("line"))
            .map(|(_, fd)| fd)
            .expect("checked at parse time")
    }

    /// Assemble one sounding's context from its record.
    fn read_sounding(
        &self,
        input: &TabularInput,
        record: usize,
    ) -> Result<SoundingContext, Aem1dError> {
        let nlayers = self.nlayers;
        let anc = input.read_ancillary(record, &self.ancillary)?;
        let id = SampleId::from_ancillary(record, &anc);

        let read = |fd: &FieldDefinition, n: usize| input.read_field(record, fd, n);

        let mut earth = EarthModelSet::default();
        let c = &self.conductivity;
        // Ref takes precedence over Input when both are present.
        earth.reference.conductivity = read(&c.reference, nlayers)?
            .or(read(&c.input, nlayers)?)
            .ok_or_else(|| Aem1dError::RecordError("no conductivity input or ref".to_string()))?;
        if c.solve {
            earth.std.conductivity = read(&c.std, nlayers)?.ok_or_else(|| {
                Aem1dError::ConfigError("no Std defined for conductivity".to_string())
            })?;
            if let Some(v) = read(&c.min, nlayers)? {
                earth.min.conductivity = v;
            }
            if let Some(v) = read(&c.max, nlayers)? {
                earth.max.conductivity = v;
            }
        }

        let t = &self.thickness;
        if nlayers > 1 {
            earth.reference.thickness = read(&t.reference, nlayers - 1)?
                .or(read(&t.input, nlayers - 1)?)
                .ok_or_else(|| Aem1dError::RecordError("no thickness input or ref".to_string()))?;
            if t.solve {
                earth.std.thickness = read(&t.std, nlayers - 1)?.ok_or_else(|| {
                    Aem1dError::ConfigError("no Std defined for thickness".to_string())
                })?;
                if let Some(v) = read(&t.min, nlayers - 1)? {
                    earth.min.thickness = v;
                }
                if let Some(v) = read(&t.max, nlayers - 1)? {
                    earth.max.thickness = v;
                }
            }
        }

        let mut geometry = GeometrySet::default();
        for elem in GeometryElement::ALL {
            let spec = &self.geometry[elem.index()];
            let input_v = input.read_scalar(record, &spec.input)?;
            let ref_v = input.read_scalar(record, &spec.reference)?;
            // Input and Ref fall back to one another.
            let (input_v, ref_v) = match (input_v, ref_v) {
                (Some(i), Some(r)) => (i, r),
                (Some(i), None) => (i, i),
                (None, Some(r)) => (r, r),
                (None, None) => {
                    if spec.solve {
                        return Err(Aem1dError::ConfigError(format!(
                            "no Input or Ref defined for {elem}"
                        )));
                    }
                    (0.0, 0.0)
                }
            };
            geometry.input[elem] = input_v;
            geometry.reference[elem] = ref_v;
            geometry.tfr[elem] = input.read_scalar(record, &spec.tfr)?.unwrap_or(input_v);
            if spec.solve {
                geometry.std[elem] = input
                    .read_scalar(record, &spec.std)?
                    .ok_or_else(|| Aem1dError::ConfigError(format!("no Std defined for {elem}")))?;
                geometry.min[elem] = input
                    .read_scalar(record, &spec.min)?
                    .unwrap_or(f64::NEG_INFINITY);
                geometry.max[elem] = input
                    .read_scalar(record, &spec.max)?
                    .unwrap_or(f64::INFINITY);
            }
        }

        let mut data = Vec::with_capacity(self.em_systems.len());
        for sys in &self.em_systems {
            let nw = sys.spec.nwindows;
            let mut d = SoundingData::new(nw);
            for ci in 0..3 {
                if !sys.spec.component_used(ci) {
                    continue;
                }
                if let Some(v) = input.read_field(record, &sys.secondary[ci], nw)? {
                    d.secondary[ci] = v;
                }
                if let Some(v) = input.read_field(record, &sys.noise[ci], nw)? {
                    d.noise[ci] = v;
                }
                if let Some(v) = input.read_scalar(record, &sys.primary[ci])? {
                    d.primary[ci] = v;
                }
            }
            data.push(d);
        }

        Ok(SoundingContext {
            id,
            earth,
            geometry,
            data,
        })
    }
}

/// Drive a whole run: iterate bunches, invert each, write point records.
///
/// The worker processes the bunches whose global job index satisfies
/// `job % size == rank`; work distribution across workers is the caller's
/// concern. Record-level failures skip the bunch with a logged reason;
/// configuration and I/O failures abort the run.
///
/// Return
/// ----------
/// * Number of points written by this worker.
pub fn run_inversion<W: Write>(
    setup: &InversionSetup,
    input: &TabularInput,
    systems: Vec<EmSystem>,
    writer: &mut PointWriter<W>,
    size: usize,
    rank: usize,
    logger: Arc<dyn Logger>,
) -> Result<usize, Aem1dError> {
    let size = size.max(1);
    let rank = rank % size;
    let mut inverter = SbsInverter::new(
        setup.options.clone(),
        setup.output_options,
        setup.nlayers,
        InversionSetup::invertible(&setup.conductivity),
        InversionSetup::invertible(&setup.thickness),
        std::array::from_fn(|i| InversionSetup::invertible(&setup.geometry[i])),
        systems,
    )?
    .with_logger(logger.clone());
    let line_fd = setup.line_field().clone();

    for job in 0..input.nrecords() {
        if job % size != rank {
            continue;
        }
        let record = job;

        let bunch = match input.get_bunch(
            &line_fd,
            record,
            setup.options.soundings_per_bunch,
            setup.options.bunch_subsample,
        ) {
            Ok(Some(b)) => b,
            Ok(None) => break,
            Err(e) => {
                logger.warn(&format!("record {record}: skipping bunch, {e}"));
                continue;
            }
        };

        let mut soundings = Vec::with_capacity(bunch.len());
        let mut failed = None;
        for &r in bunch.records() {
            match setup.read_sounding(input, r) {
                Ok(s) => soundings.push(s),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            logger.warn(&format!(
                "record {record}: skipping bunch, could not read record: {e}"
            ));
            continue;
        }

        let context = BunchContext {
            soundings,
            master_index: bunch.master_index(),
            master_record: bunch.master_record(),
        };
        let master_index = context.master_index;
        let master_record = context.master_record;
        match inverter.invert_bunch(context) {
            Ok(result) => {
                inverter.write_point(writer, master_index, master_record, &result)?;
                logger.info(&inverter.bunch_summary(master_index, master_record, &result));
            }
            Err(Aem1dError::RecordError(msg)) => {
                logger.warn(&format!("record {record}: skipping bunch, {msg}"));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(writer.points_written())
}

#[cfg(test)]
mod gauss_newton_test {
    use super::*;
    use crate::config::NormType;
    use crate::forward::{FieldResponse, ForwardSystem, PrimaryField};
    use crate::regularisation::{Alphas, SmoothnessMethod};
    use approx::assert_relative_eq;

    /// A forward model linear in the *log10* conductivities:
    /// `z_w = sum_l F[w][l] * log10(c_l)`. The Gauss-Newton step on such
    /// a model is exact.
    struct LogLinearForward {
        f: Vec<Vec<f64>>,
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
            for (wi, row) in self.f.iter().enumerate() {
                r.z[wi] = row
                    .iter()
                    .zip(&earth.conductivity)
                    .map(|(&f, &c)| f * c.log10())
                    .sum();
            }
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
                // d z_w / d c_l in linear space; the inverter applies the
                // ln10 * c chain factor itself.
                for (wi, row) in self.f.iter().enumerate() {
                    r.z[wi] = row[li] / (LN10 * earth.conductivity[li]);
                }
            }
            Ok(r)
        }
    }

    fn options(alphas: Alphas, max_iterations: usize, min_phid: f64) -> Options {
        Options {
            soundings_per_bunch: 1,
            bunch_subsample: 1,
            alphas,
            norm_type: NormType::L2,
            smoothness: SmoothnessMethod::SecondDerivative,
            begin_geometry_solve_iteration: 0,
            max_iterations,
            min_phid,
            min_percent_improvement: 1.0,
        }
    }

    fn context(
        reference: LayeredEarth,
        std: LayeredEarth,
        min: LayeredEarth,
        max: LayeredEarth,
        obs: Vec<f64>,
        noise: Vec<f64>,
    ) -> BunchContext {
        let nw = obs.len();
        let mut d = SoundingData::new(nw);
        d.secondary[ZCOMP] = obs;
        d.noise[ZCOMP] = noise;
        BunchContext {
            soundings: vec![SoundingContext {
                id: SampleId::default(),
                earth: EarthModelSet {
                    reference,
                    std,
                    min,
                    max,
                    inverted: LayeredEarth::default(),
                },
                geometry: GeometrySet::default(),
                data: vec![d],
            }],
            master_index: 0,
            master_record: 0,
        }
    }

    fn two_layer_design() -> Vec<Vec<f64>> {
        vec![
            vec![1.0, 0.1],
            vec![0.8, 0.3],
            vec![0.6, 0.5],
            vec![0.4, 0.7],
            vec![0.2, 0.9],
            vec![0.1, 1.0],
        ]
    }

    fn synthetic_obs(f: &[Vec<f64>], earth: &LayeredEarth) -> Vec<f64> {
        f.iter()
            .map(|row| {
                row.iter()
                    .zip(&earth.conductivity)
                    .map(|(&fi, &c)| fi * c.log10())
                    .sum()
            })
            .collect()
    }

    fn inverter(forward: LogLinearForward, opts: Options, bound: bool) -> SbsInverter {
        let nw = forward.nwindows();
        SbsInverter::new(
            opts,
            OutputOptions::default(),
            2,
            InvertibleField::solved(bound),
            InvertibleField::fixed(),
            [InvertibleField::fixed(); GeometryElement::SIZE],
            vec![EmSystem::new(SystemSpec::z_only(nw), Box::new(forward))],
        )
        .unwrap()
    }

    #[test]
    fn test_gn_step_contracts_to_analytic_solution() {
        // Exact synthetic data and negligible noise: every candidate
        // lambda undershoots the target, so the search falls back to the
        // minimum-PhiD trial and the first accepted iteration lands on
        // the analytic solution.
        let f = two_layer_design();
        let truth = LayeredEarth::new(vec![0.05, 0.002], vec![20.0]).unwrap();
        let obs = synthetic_obs(&f, &truth);
        let noise = vec![1.0e-9; obs.len()];
        let forward = LogLinearForward { f };

        let alphas = Alphas {
            conductivity: 1.0,
            ..Default::default()
        };
        let mut inv = inverter(forward, options(alphas, 1, 0.0), false);
        let ctx = context(
            LayeredEarth::new(vec![0.1, 0.01], vec![20.0]).unwrap(),
            LayeredEarth {
                conductivity: vec![0.5, 0.5],
                thickness: vec![],
            },
            LayeredEarth::default(),
            LayeredEarth::default(),
            obs,
            noise,
        );
        let result = inv.invert_bunch(ctx).unwrap();
        assert_eq!(result.state.iteration, 1);
        assert_relative_eq!(
            result.state.param[0],
            truth.conductivity[0].log10(),
            epsilon = 1.0e-8
        );
        assert_relative_eq!(
            result.state.param[1],
            truth.conductivity[1].log10(),
            epsilon = 1.0e-8
        );
        assert!(result.sensitivity.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn test_bound_activation_clips_exactly() {
        // One layer, target conductivity 0.3 outside the [0.05, 0.2]
        // bound, negligible damping: every trial clips to the bound, the
        // fallback branch of the search selects it, and after one
        // iteration the parameter sits exactly on log10(0.2).
        let f = vec![vec![1.0], vec![2.0], vec![0.5]];
        let truth = LayeredEarth::new(vec![0.3], vec![]).unwrap();
        let obs = synthetic_obs(&f, &truth);
        let noise = vec![1.0e-6; obs.len()];
        let forward = LogLinearForward { f };

        let alphas = Alphas {
            conductivity: 1.0,
            ..Default::default()
        };
        let mut inv = SbsInverter::new(
            options(alphas, 1, 1.0),
            OutputOptions::default(),
            1,
            InvertibleField::solved(true),
            InvertibleField::fixed(),
            [InvertibleField::fixed(); GeometryElement::SIZE],
            vec![EmSystem::new(SystemSpec::z_only(3), Box::new(forward))],
        )
        .unwrap();
        let ctx = context(
            LayeredEarth::new(vec![0.1], vec![]).unwrap(),
            LayeredEarth {
                conductivity: vec![0.5],
                thickness: vec![],
            },
            LayeredEarth {
                conductivity: vec![0.05],
                thickness: vec![],
            },
            LayeredEarth {
                conductivity: vec![0.2],
                thickness: vec![],
            },
            obs,
            noise,
        );
        let result = inv.invert_bunch(ctx).unwrap();
        assert_eq!(result.state.iteration, 1);
        assert_eq!(result.state.param[0], 0.2_f64.log10());
        assert_relative_eq!(
            result.inverted_earths[0].conductivity[0],
            0.2,
            max_relative = 1e-12
        );
    }

    /// Forward model with a transmitter-height term on top of the
    /// log-linear conductivity response.
    struct HeightAwareForward {
        f: Vec<Vec<f64>>,
        height_gain: f64,
    }

    impl ForwardSystem for HeightAwareForward {
        fn nwindows(&self) -> usize {
            self.f.len()
        }

        fn primary_fields(&mut self, _geometry: &Geometry) -> PrimaryField {
            PrimaryField::default()
        }

        fn secondary_fields(
            &mut self,
            earth: &LayeredEarth,
            geometry: &Geometry,
        ) -> Result<FieldResponse, Aem1dError> {
            let h = geometry.get(GeometryElement::TxHeight);
            let mut r = FieldResponse::zeros(self.nwindows());
            for (wi, row) in self.f.iter().enumerate() {
                let c_part: f64 = row
                    .iter()
                    .zip(&earth.conductivity)
                    .map(|(&f, &c)| f * c.log10())
                    .sum();
                r.z[wi] = c_part + self.height_gain * h;
            }
            Ok(r)
        }

        fn derivative_fields(
            &mut self,
            request: FieldDerivative,
            earth: &LayeredEarth,
            _geometry: &Geometry,
        ) -> Result<FieldResponse, Aem1dError> {
            let mut r = FieldResponse::zeros(self.nwindows());
            match request {
                FieldDerivative::Conductivity(li) => {
                    for (wi, row) in self.f.iter().enumerate() {
                        r.z[wi] = row[li] / (LN10 * earth.conductivity[li]);
                    }
                }
                FieldDerivative::TxHeight => {
                    r.z.iter_mut().for_each(|v| *v = self.height_gain);
                }
                _ => {}
            }
            Ok(r)
        }
    }

    #[test]
    fn test_geometry_element_is_recovered() {
        // Conductivity plus transmitter height solved together; exact
        // data generated at a height 2 m above the reference. The column
        // sums of the design vary so the height column stays independent.
        let f = vec![
            vec![1.0, 0.1],
            vec![0.8, 0.25],
            vec![0.6, 0.5],
            vec![0.4, 0.75],
            vec![0.2, 0.85],
            vec![0.1, 1.05],
        ];
        let truth_earth = LayeredEarth::new(vec![0.05, 0.002], vec![20.0]).unwrap();
        let truth_height = 37.0;
        let gain = 0.05;

        let obs: Vec<f64> = f
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&truth_earth.conductivity)
                    .map(|(&fi, &c)| fi * c.log10())
                    .sum::<f64>()
                    + gain * truth_height
            })
            .collect();
        let noise = vec![1.0e-9; obs.len()];

        let alphas = Alphas {
            conductivity: 1.0,
            geometry: 0.1,
            ..Default::default()
        };
        let mut geometry_fields = [InvertibleField::fixed(); GeometryElement::SIZE];
        geometry_fields[GeometryElement::TxHeight.index()] = InvertibleField::solved(false);
        let mut inv = SbsInverter::new(
            options(alphas, 3, 0.0),
            OutputOptions::default(),
            2,
            InvertibleField::solved(false),
            InvertibleField::fixed(),
            geometry_fields,
            vec![EmSystem::new(
                SystemSpec::z_only(6),
                Box::new(HeightAwareForward { f, height_gain: gain }),
            )],
        )
        .unwrap();

        let mut geometry = GeometrySet::default();
        geometry.input.set(GeometryElement::TxHeight, 35.0);
        geometry.reference.set(GeometryElement::TxHeight, 35.0);
        geometry.std.set(GeometryElement::TxHeight, 2.0);

        let mut ctx = context(
            LayeredEarth::new(vec![0.1, 0.01], vec![20.0]).unwrap(),
            LayeredEarth {
                conductivity: vec![0.5, 0.5],
                thickness: vec![],
            },
            LayeredEarth::default(),
            LayeredEarth::default(),
            obs,
            noise,
        );
        ctx.soundings[0].geometry = geometry;

        let result = inv.invert_bunch(ctx).unwrap();
        let h = result.inverted_geometries[0].get(GeometryElement::TxHeight);
        assert_relative_eq!(h, truth_height, epsilon = 1.0e-6);
        assert_relative_eq!(
            result.inverted_earths[0].conductivity[0],
            truth_earth.conductivity[0],
            max_relative = 1.0e-6
        );
    }

    #[test]
    fn test_zero_noise_skips_bunch() {
        let f = two_layer_design();
        let truth = LayeredEarth::new(vec![0.05, 0.002], vec![20.0]).unwrap();
        let obs = synthetic_obs(&f, &truth);
        let mut noise = vec![1.0e-4; obs.len()];
        noise[2] = 0.0;
        let forward = LogLinearForward { f };
        let alphas = Alphas {
            conductivity: 1.0,
            ..Default::default()
        };
        let mut inv = inverter(forward, options(alphas, 6, 1.0), false);
        let ctx = context(
            LayeredEarth::new(vec![0.1, 0.01], vec![20.0]).unwrap(),
            LayeredEarth {
                conductivity: vec![0.5, 0.5],
                thickness: vec![],
            },
            LayeredEarth::default(),
            LayeredEarth::default(),
            obs,
            noise,
        );
        assert!(matches!(
            inv.invert_bunch(ctx),
            Err(Aem1dError::RecordError(_))
        ));
    }

    #[test]
    fn test_l1_norm_still_improves_misfit() {
        let f = two_layer_design();
        let truth = LayeredEarth::new(vec![0.05, 0.002], vec![20.0]).unwrap();
        let obs = synthetic_obs(&f, &truth);
        let noise = vec![1.0e-2; obs.len()];
        let forward = LogLinearForward { f };
        let alphas = Alphas {
            conductivity: 1.0,
            ..Default::default()
        };
        let mut opts = options(alphas, 4, 0.0);
        opts.norm_type = NormType::L1;
        let mut inv = inverter(forward, opts, false);
        let ctx = context(
            LayeredEarth::new(vec![0.1, 0.01], vec![20.0]).unwrap(),
            LayeredEarth {
                conductivity: vec![0.5, 0.5],
                thickness: vec![],
            },
            LayeredEarth::default(),
            LayeredEarth::default(),
            obs,
            noise,
        );
        let result = inv.invert_bunch(ctx).unwrap();
        assert!(result.state.iteration >= 1);
        assert!(result.state.phid.is_finite());
        assert!(result.state.phid < 1.0e3);
    }
}
