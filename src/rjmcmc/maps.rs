//! # Posterior aggregation
//!
//! The sampler accumulates its included samples into a set of maps:
//!
//! * [`PpdMap`] – the position x value 2-D histogram (PPD), the
//!   interface-depth histogram and the layer-count histogram;
//! * [`NuisanceMap`] / [`NoiseMap`] – per-process value traces, later
//!   condensed into 17-bin histograms with summary statistics;
//! * [`ChainHistory`] – per-chain convergence records saved on the
//!   report schedule.
//!
//! [`PpdMap::summary_models`] reduces the PPD to the mean, mode and
//! 10/50/90-percentile model per position bin.

use crate::geometry::GeometryElement;
use crate::rjmcmc::model::Model1d;

/// Basic statistics of a sampled value trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl Stats {
    pub fn of(values: &[f64]) -> Stats {
        if values.is_empty() {
            return Stats::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Stats {
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean,
            std: var.sqrt(),
        }
    }
}

/// Fixed-bin histogram of a value trace.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub centres: Vec<f64>,
    pub counts: Vec<u32>,
}

impl Histogram {
    /// Histogram `values` over `nbins` equal bins spanning their range.
    pub fn of(values: &[f64], nbins: usize) -> Histogram {
        let stats = Stats::of(values);
        let span = (stats.max - stats.min).max(f64::MIN_POSITIVE);
        let dw = span / nbins as f64;
        let centres = (0..nbins)
            .map(|i| stats.min + dw * (i as f64 + 0.5))
            .collect();
        let mut counts = vec![0u32; nbins];
        for &v in values {
            let bi = (((v - stats.min) / dw) as usize).min(nbins - 1);
            counts[bi] += 1;
        }
        Histogram { centres, counts }
    }
}

/// Summary statistics of one marginal value histogram (one PPD row).
#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramStats {
    pub mean: f64,
    pub mode: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

impl HistogramStats {
    fn of(centres: &[f64], counts: &[u32]) -> HistogramStats {
        let total: u64 = counts.iter().map(|&c| c as u64).sum();
        if total == 0 {
            return HistogramStats::default();
        }
        let mean = centres
            .iter()
            .zip(counts)
            .map(|(&v, &c)| v * c as f64)
            .sum::<f64>()
            / total as f64;
        let mode_bin = counts
            .iter()
            .enumerate()
            .max_by_key(|(_, &c)| c)
            .map(|(i, _)| i)
            .unwrap_or(0);

        let percentile = |q: f64| -> f64 {
            let threshold = q * total as f64;
            let mut cum = 0.0;
            for (i, &c) in counts.iter().enumerate() {
                cum += c as f64;
                if cum >= threshold {
                    return centres[i];
                }
            }
            centres[centres.len() - 1]
        };

        HistogramStats {
            mean,
            mode: centres[mode_bin],
            p10: percentile(0.10),
            p50: percentile(0.50),
            p90: percentile(0.90),
        }
    }
}

/// Mean/mode/percentile models over the position grid.
#[derive(Debug, Clone)]
pub struct SummaryModels {
    pub mean: Vec<f64>,
    pub mode: Vec<f64>,
    pub p10: Vec<f64>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
}

/// Position x value posterior histogram with its companion interface and
/// layer-count histograms.
#[derive(Debug, Clone)]
pub struct PpdMap {
    nl_min: usize,
    pmax: f64,
    vmin: f64,
    vmax: f64,
    np: usize,
    nv: usize,
    dp: f64,
    dv: f64,
    nentries: usize,
    /// Position bin centres.
    pub pbin: Vec<f64>,
    /// Value bin centres.
    pub vbin: Vec<f64>,
    /// `np x nv` cell counts, row-major by position.
    pub counts: Vec<u32>,
    /// Interface-depth histogram over the position bins.
    pub cpcounts: Vec<u32>,
    /// Layer-count histogram over `[nl_min, nl_max]`.
    pub layercounts: Vec<u32>,
}

impl PpdMap {
    pub fn new(
        nl_min: usize,
        nl_max: usize,
        pmax: f64,
        np: usize,
        vmin: f64,
        vmax: f64,
        nv: usize,
    ) -> Self {
        let dp = pmax / np as f64;
        let dv = (vmax - vmin) / nv as f64;
        PpdMap {
            nl_min,
            pmax,
            vmin,
            vmax,
            np,
            nv,
            dp,
            dv,
            nentries: 0,
            pbin: (0..np).map(|i| dp * (i as f64 + 0.5)).collect(),
            vbin: (0..nv).map(|i| vmin + dv * (i as f64 + 0.5)).collect(),
            counts: vec![0; np * nv],
            cpcounts: vec![0; np],
            layercounts: vec![0; nl_max - nl_min + 1],
        }
    }

    #[inline]
    pub fn npbins(&self) -> usize {
        self.np
    }

    #[inline]
    pub fn nvbins(&self) -> usize {
        self.nv
    }

    pub fn nentries(&self) -> usize {
        self.nentries
    }

    /// Value bin of `val`, clamped to the grid.
    pub fn vbin_of(&self, val: f64) -> usize {
        if val < self.vmin {
            return 0;
        }
        if val >= self.vmax {
            return self.nv - 1;
        }
        ((val - self.vmin) / self.dv) as usize
    }

    /// Position bin of `pos`, clamped to the grid.
    pub fn pbin_of(&self, pos: f64) -> usize {
        if pos < 0.0 {
            return 0;
        }
        if pos >= self.pmax {
            return self.np - 1;
        }
        (pos / self.dp) as usize
    }

    /// Accumulate one included sample.
    pub fn add_model(&mut self, m: &Model1d) {
        self.nentries += 1;
        self.layercounts[m.nlayers() - self.nl_min] += 1;

        for pi in 0..self.np {
            let li = m.which_layer(self.pbin[pi]);
            let vi = self.vbin_of(m.layers[li].value);
            self.counts[pi * self.nv + vi] += 1;
        }
        for li in 1..m.nlayers() {
            let pi = self.pbin_of(m.layers[li].ptop);
            self.cpcounts[pi] += 1;
        }
    }

    /// Marginal value distribution statistics of position bin `pi`.
    pub fn histogram_stats(&self, pi: usize) -> HistogramStats {
        let row = &self.counts[pi * self.nv..(pi + 1) * self.nv];
        HistogramStats::of(&self.vbin, row)
    }

    /// The mean/mode/p10/p50/p90 models over all position bins.
    pub fn summary_models(&self) -> SummaryModels {
        let mut s = SummaryModels {
            mean: Vec::with_capacity(self.np),
            mode: Vec::with_capacity(self.np),
            p10: Vec::with_capacity(self.np),
            p50: Vec::with_capacity(self.np),
            p90: Vec::with_capacity(self.np),
        };
        for pi in 0..self.np {
            let hs = self.histogram_stats(pi);
            s.mean.push(hs.mean);
            s.mode.push(hs.mode);
            s.p10.push(hs.p10);
            s.p50.push(hs.p50);
            s.p90.push(hs.p90);
        }
        s
    }
}

/// Per-nuisance sampled value traces, type-tagged.
#[derive(Debug, Clone, Default)]
pub struct NuisanceMap {
    types: Vec<GeometryElement>,
    nentries: usize,
    pub values: Vec<Vec<f64>>,
}

impl NuisanceMap {
    pub fn add_model(&mut self, m: &Model1d) {
        if self.values.len() != m.nnuisances() {
            self.values = vec![Vec::new(); m.nnuisances()];
            self.types = m.nuisances.iter().map(|n| n.element).collect();
        }
        for (trace, n) in self.values.iter_mut().zip(&m.nuisances) {
            trace.push(n.value);
        }
        self.nentries += 1;
    }

    pub fn nentries(&self) -> usize {
        self.nentries
    }

    pub fn nnuisances(&self) -> usize {
        self.values.len()
    }

    pub fn types(&self) -> &[GeometryElement] {
        &self.types
    }
}

/// Per-noise-process sampled magnitude traces, tagged by data bounds.
#[derive(Debug, Clone, Default)]
pub struct NoiseMap {
    bounds: Vec<(usize, usize)>,
    nentries: usize,
    pub values: Vec<Vec<f64>>,
}

impl NoiseMap {
    pub fn add_model(&mut self, m: &Model1d) {
        if self.values.len() != m.nnoises() {
            self.values = vec![Vec::new(); m.nnoises()];
            self.bounds = m.noises.iter().map(|n| n.data_bounds).collect();
        }
        for (trace, n) in self.values.iter_mut().zip(&m.noises) {
            trace.push(n.value);
        }
        self.nentries += 1;
    }

    pub fn nentries(&self) -> usize {
        self.nentries
    }

    pub fn nnoises(&self) -> usize {
        self.values.len()
    }

    pub fn bounds(&self) -> &[(usize, usize)] {
        &self.bounds
    }
}

/// Convergence record of one chain, appended on the report schedule.
#[derive(Debug, Clone, Default)]
pub struct ChainHistory {
    pub sample: Vec<u32>,
    pub temperature: Vec<f32>,
    pub nlayers: Vec<u32>,
    pub misfit: Vec<f32>,
    pub logppd: Vec<f32>,
    pub ar_valuechange: Vec<f32>,
    pub ar_move: Vec<f32>,
    pub ar_birth: Vec<f32>,
    pub ar_death: Vec<f32>,
    pub ar_nuisancechange: Vec<f32>,
    pub ar_noisechange: Vec<f32>,
    /// Full sampled models; populated only when chain saving is enabled.
    pub models: Vec<Model1d>,
}

#[cfg(test)]
mod maps_test {
    use super::*;
    use approx::assert_relative_eq;

    fn model(layers: &[(f64, f64)]) -> Model1d {
        let mut m = Model1d::new(100.0, -3.0, 0.0);
        for &(p, v) in layers {
            assert!(m.insert_interface(p, v));
        }
        m
    }

    #[test]
    fn test_ppd_accumulation() {
        let mut map = PpdMap::new(1, 5, 100.0, 10, -3.0, 0.0, 6);
        let m = model(&[(0.0, -2.75), (50.0, -0.25)]);
        map.add_model(&m);

        assert_eq!(map.nentries(), 1);
        assert_eq!(map.layercounts, vec![0, 1, 0, 0, 0]);
        // Interface at 50 m lands in position bin 5.
        assert_eq!(map.cpcounts[5], 1);
        // Upper half of the profile is the first value, lower half the second.
        let vi_top = map.vbin_of(-2.75);
        let vi_bot = map.vbin_of(-0.25);
        for pi in 0..5 {
            assert_eq!(map.counts[pi * 6 + vi_top], 1);
        }
        for pi in 5..10 {
            assert_eq!(map.counts[pi * 6 + vi_bot], 1);
        }
    }

    #[test]
    fn test_bin_clamping() {
        let map = PpdMap::new(1, 3, 100.0, 10, -3.0, 0.0, 6);
        assert_eq!(map.pbin_of(-5.0), 0);
        assert_eq!(map.pbin_of(1.0e9), 9);
        assert_eq!(map.vbin_of(-99.0), 0);
        assert_eq!(map.vbin_of(99.0), 5);
    }

    #[test]
    fn test_histogram_stats_percentiles() {
        // Ramp histogram: counts 1..=4 over centres 0..=3.
        let hs = HistogramStats::of(&[0.0, 1.0, 2.0, 3.0], &[1, 2, 3, 4]);
        assert_relative_eq!(hs.mean, (0.0 + 2.0 + 6.0 + 12.0) / 10.0);
        assert_eq!(hs.mode, 3.0);
        assert_eq!(hs.p50, 2.0);
        assert_eq!(hs.p90, 3.0);
    }

    #[test]
    fn test_summary_models_shape() {
        let mut map = PpdMap::new(1, 4, 100.0, 8, -3.0, 0.0, 5);
        map.add_model(&model(&[(0.0, -1.5)]));
        map.add_model(&model(&[(0.0, -1.5), (40.0, -2.5)]));
        let s = map.summary_models();
        assert_eq!(s.mean.len(), 8);
        assert_eq!(s.p10.len(), 8);
        // Shallow bins saw only -1.5.
        assert_relative_eq!(s.mode[0], map.vbin[map.vbin_of(-1.5)]);
    }

    #[test]
    fn test_histogram_of_trace() {
        let values = vec![0.0, 0.1, 0.2, 0.9, 1.0];
        let h = Histogram::of(&values, 5);
        assert_eq!(h.counts.iter().sum::<u32>(), 5);
        assert_eq!(h.counts[0], 2);
        assert_eq!(h.counts[4], 2);
    }

    #[test]
    fn test_trace_maps_initialise_from_first_model() {
        let mut m = model(&[(0.0, -1.0)]);
        m.nuisances.push(crate::rjmcmc::model::Nuisance {
            element: GeometryElement::TxHeight,
            value: 35.0,
            min: 30.0,
            max: 40.0,
            sd_change: 0.5,
        });
        m.noises.push(crate::rjmcmc::model::NoiseProcess {
            value: 0.03,
            min: 0.0,
            max: 0.2,
            sd_change: 0.01,
            data_bounds: (0, 12),
        });

        let mut nmap = NuisanceMap::default();
        let mut mnmap = NoiseMap::default();
        nmap.add_model(&m);
        mnmap.add_model(&m);
        assert_eq!(nmap.types(), &[GeometryElement::TxHeight]);
        assert_eq!(mnmap.bounds(), &[(0, 12)]);
        assert_eq!(nmap.values[0], vec![35.0]);
        assert_eq!(mnmap.values[0], vec![0.03]);
    }
}
