mod common;

use aem1d::aem1d_errors::Aem1dError;
use aem1d::config::{ControlFile, NormType, Options};
use aem1d::data::{SoundingData, ZCOMP};
use aem1d::earth::{EarthModelSet, LayeredEarth};
use aem1d::forward::{EmSystem, SystemSpec};
use aem1d::gauss_newton::{
    run_inversion, BunchContext, InversionSetup, SbsInverter, SoundingContext,
};
use aem1d::geometry::{GeometryElement, GeometrySet};
use aem1d::input::{SampleId, TabularInput};
use aem1d::logger::{LogLevel, Logger};
use aem1d::output::{OutputOptions, PointWriter};
use aem1d::params::InvertibleField;
use aem1d::regularisation::{Alphas, SmoothnessMethod};
use common::{two_layer_design, LogLinearForward};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::{Arc, Mutex};

/// Collects the run's diagnostics; the core never touches a global
/// subscriber.
#[derive(Default)]
struct CollectingLogger {
    messages: Mutex<Vec<(LogLevel, String)>>,
}

impl Logger for CollectingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.messages
            .lock()
            .expect("not poisoned")
            .push((level, message.to_string()));
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

fn one_sounding_context(
    earth: EarthModelSet,
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
            earth,
            geometry: GeometrySet::default(),
            data: vec![d],
        }],
        master_index: 0,
        master_record: 0,
    }
}

fn conductivity_only_inverter(
    forward: LogLinearForward,
    nlayers: usize,
    opts: Options,
) -> SbsInverter {
    let nw = forward.f.len();
    SbsInverter::new(
        opts,
        OutputOptions::default(),
        nlayers,
        InvertibleField::solved(false),
        InvertibleField::fixed(),
        [InvertibleField::fixed(); GeometryElement::SIZE],
        vec![EmSystem::new(SystemSpec::z_only(nw), Box::new(forward))],
    )
    .unwrap()
}

/// Two-layer fixture: conductivity only, reference model equal to the
/// true model, data perturbed by the quoted noise. The inverter must fit
/// to the noise level within six iterations without wandering away from
/// the truth.
#[test]
fn two_layer_fixture_converges() {
    let f = two_layer_design();
    let truth = LayeredEarth::new(vec![0.1, 0.01], vec![20.0]).unwrap();
    let forward = LogLinearForward { f };
    let noise_abs = 3.0e-4;
    let mut rng = StdRng::seed_from_u64(11);
    // The injected noise is half the quoted noise, so the fit always
    // reaches the target misfit.
    let obs: Vec<f64> = forward
        .predict(&truth)
        .into_iter()
        .map(|v| {
            let z: f64 = rng.sample(StandardNormal);
            v + 0.5 * noise_abs * z
        })
        .collect();
    let noise = vec![noise_abs; obs.len()];

    let alphas = Alphas {
        conductivity: 1.0,
        ..Default::default()
    };
    let mut inv = conductivity_only_inverter(forward, 2, options(alphas, 6, 1.0));
    let earth = EarthModelSet {
        reference: truth.clone(),
        std: LayeredEarth {
            conductivity: vec![0.5, 0.5],
            thickness: vec![],
        },
        ..Default::default()
    };
    let result = inv.invert_bunch(one_sounding_context(earth, obs, noise)).unwrap();

    assert!(
        result.state.phid <= 1.01,
        "phid = {} after {} iterations",
        result.state.phid,
        result.state.iteration
    );
    assert!(result.state.iteration <= 6);
    let m = &result.state.param;
    assert!((m[0] - truth.conductivity[0].log10()).abs() <= 1.0e-3);
    assert!((m[1] - truth.conductivity[1].log10()).abs() <= 1.0e-3);
}

/// Smoothness null test: three layers, a large smoothness alpha, no
/// reference pull, data from a homogeneous earth. The smoothness penalty
/// must flatten the profile.
#[test]
fn smoothness_regulariser_flattens_homogeneous_earth() {
    let f = vec![
        vec![1.0, 0.5, 0.2],
        vec![0.6, 0.8, 0.4],
        vec![0.3, 0.6, 0.9],
        vec![0.2, 0.4, 1.0],
    ];
    let truth = LayeredEarth::new(vec![0.05, 0.05, 0.05], vec![20.0, 40.0]).unwrap();
    let forward = LogLinearForward { f };
    let obs = forward.predict(&truth);
    let noise = vec![1.0e-6; obs.len()];

    let alphas = Alphas {
        conductivity: 0.0,
        smoothness: 1.0e8,
        ..Default::default()
    };
    let mut inv = conductivity_only_inverter(forward, 3, options(alphas, 2, 1.0));
    let earth = EarthModelSet {
        reference: LayeredEarth::new(vec![0.1, 0.02, 0.08], vec![20.0, 40.0]).unwrap(),
        std: LayeredEarth {
            conductivity: vec![0.5; 3],
            thickness: vec![0.5; 2],
        },
        ..Default::default()
    };
    let result = inv.invert_bunch(one_sounding_context(earth, obs, noise)).unwrap();

    assert!(result.state.iteration <= 2 && result.state.iteration >= 1);
    let m = &result.state.param;
    assert!(
        (m[0] - m[1]).abs() <= 1.0e-6 && (m[1] - m[2]).abs() <= 1.0e-6,
        "profile is not flat: {:?}",
        m.as_slice()
    );
}

/// Null-data culling: ten windows with three NaN observations leave
/// seven active data.
#[test]
fn null_data_is_culled() {
    let f: Vec<Vec<f64>> = (0..10)
        .map(|w| vec![1.0 - 0.08 * w as f64, 0.05 + 0.09 * w as f64])
        .collect();
    let truth = LayeredEarth::new(vec![0.05, 0.002], vec![20.0]).unwrap();
    let forward = LogLinearForward { f };
    let mut obs = forward.predict(&truth);
    obs[1] = f64::NAN;
    obs[4] = f64::NAN;
    obs[8] = f64::NAN;
    let noise = vec![1.0e-3; obs.len()];

    let alphas = Alphas {
        conductivity: 1.0,
        ..Default::default()
    };
    let mut inv = conductivity_only_inverter(forward, 2, options(alphas, 3, 1.0));
    let earth = EarthModelSet {
        reference: LayeredEarth::new(vec![0.1, 0.01], vec![20.0]).unwrap(),
        std: LayeredEarth {
            conductivity: vec![0.5, 0.5],
            thickness: vec![],
        },
        ..Default::default()
    };
    let result = inv.invert_bunch(one_sounding_context(earth, obs, noise)).unwrap();

    assert_eq!(result.ndata, 7);
    assert!(result.output_message.contains("3 null data/noise were culled"));
    assert_eq!(result.state.pred.len(), 7);
}

const CONTROL: &str = r#"
Control Begin
    Options Begin
        SoundingsPerBunch = 1
        AlphaConductivity = 1.0
        AlphaThickness = 0.0
        AlphaGeometry = 0.0
        AlphaSmoothness = 0.0
        AlphaHomogeneous = 0.0
        MaximumIterations = 5
        MinimumPhiD = 1.0
        MinimumPercentageImprovement = 1.0
    End
    Input Begin
        AncillaryFields Begin
            Line = Column 1
            Fiducial = Column 2
        End
        Earth Begin
            NumberOfLayers = 2
            Conductivity Begin
                Solve = yes
                Ref = 0.1 0.01
                Std = 0.5 0.5
            End
            Thickness Begin
                Solve = no
                Input = 20
            End
        End
    End
    Output Begin
        PredictedData = yes
    End
    EMSystem Begin
        NumberOfWindows = 6
        ZComponent Begin
            Use = yes
            Secondary = Column 3
            Noise = Column 9
        End
    End
End
"#;

/// End-to-end run over a small line: control file, tabular records, the
/// full bunch loop and the point writer.
#[test]
fn run_inversion_end_to_end() {
    let control = ControlFile::from_str(CONTROL).unwrap();
    let setup = InversionSetup::from_control(&control).unwrap();

    let design = two_layer_design();
    let truth = LayeredEarth::new(vec![0.05, 0.004], vec![20.0]).unwrap();
    let forward = LogLinearForward { f: design.clone() };
    let pred = forward.predict(&truth);

    // line, fiducial, 6 secondary windows, 6 noise columns
    let mut rows = Vec::new();
    for fid in 0..4 {
        let mut row = vec![100.0, fid as f64];
        row.extend(&pred);
        row.extend(std::iter::repeat(1.0e-3).take(6));
        rows.push(row);
    }
    let input = TabularInput::from_rows(rows);

    let systems = vec![EmSystem::new(
        SystemSpec::z_only(6),
        Box::new(LogLinearForward { f: design }),
    )];
    let mut writer = PointWriter::new(Vec::new());
    let logger = Arc::new(CollectingLogger::default());
    let npoints =
        run_inversion(&setup, &input, systems, &mut writer, 1, 0, logger.clone()).unwrap();

    assert_eq!(npoints, 4);
    let map = writer.column_map();
    assert!(map.contains("conductivity"));
    assert!(map.contains("PhiD"));
    assert!(map.contains("predicted_EMSystem_1_ZS"));

    // One summary line per inverted bunch, through the supplied object.
    let messages = logger.messages.lock().unwrap();
    let summaries = messages
        .iter()
        .filter(|(level, _)| *level == LogLevel::Info)
        .count();
    assert_eq!(summaries, 4);
}

/// Work partition: with two workers each processes half the records.
#[test]
fn rank_partition_splits_work() {
    let control = ControlFile::from_str(CONTROL).unwrap();
    let setup = InversionSetup::from_control(&control).unwrap();
    let design = two_layer_design();
    let truth = LayeredEarth::new(vec![0.05, 0.004], vec![20.0]).unwrap();
    let pred = LogLinearForward { f: design.clone() }.predict(&truth);
    let mut rows = Vec::new();
    for fid in 0..4 {
        let mut row = vec![100.0, fid as f64];
        row.extend(&pred);
        row.extend(std::iter::repeat(1.0e-3).take(6));
        rows.push(row);
    }
    let input = TabularInput::from_rows(rows);

    for rank in 0..2 {
        let systems = vec![EmSystem::new(
            SystemSpec::z_only(6),
            Box::new(LogLinearForward { f: design.clone() }),
        )];
        let mut writer = PointWriter::new(Vec::new());
        let npoints = run_inversion(
            &setup,
            &input,
            systems,
            &mut writer,
            2,
            rank,
            aem1d::logger::null_logger(),
        )
        .unwrap();
        assert_eq!(npoints, 2, "rank {rank} processed the wrong share");
    }
}

/// A configuration that solves nothing is rejected before any inversion.
#[test]
fn nothing_to_solve_is_a_configuration_error() {
    let forward = LogLinearForward {
        f: two_layer_design(),
    };
    let alphas = Alphas::default();
    let result = SbsInverter::new(
        options(alphas, 1, 1.0),
        OutputOptions::default(),
        2,
        InvertibleField::fixed(),
        InvertibleField::fixed(),
        [InvertibleField::fixed(); GeometryElement::SIZE],
        vec![EmSystem::new(SystemSpec::z_only(6), Box::new(forward))],
    );
    assert!(matches!(result, Err(Aem1dError::ConfigError(_))));
}
