//! # Data vector bookkeeping
//!
//! The logical data layout of a bunch runs over sounding x system x
//! component x window. [`DataIndex`] flattens that rank-4 table into one
//! vector with computed strides and assigns each present datum its row in
//! the *all-data* layout (length `D_all`). [`ActiveData`] then maps the
//! compact working vectors (length `D`) onto the logical layout, skipping
//! entries whose observation or noise estimate is null.
//!
//! Component slots are `X`, `Y`, `Z` plus the synthetic `XZ` amplitude
//! used when a system inverts `hypot(X, Z)` instead of the two separate
//! components.

use crate::constants::{is_null, Matrix, Vector};
use crate::forward::SystemSpec;

pub const XCOMP: usize = 0;
pub const YCOMP: usize = 1;
pub const ZCOMP: usize = 2;
pub const XZAMP: usize = 3;
/// Component slots per system: X, Y, Z and the synthetic XZ amplitude.
pub const NCOMPS: usize = 4;

/// Observed data of one sounding for one EM system.
///
/// `secondary` and `noise` are per component per window; `primary` is the
/// single primary-field value per component.
#[derive(Debug, Clone, Default)]
pub struct SoundingData {
    pub secondary: [Vec<f64>; 3],
    pub noise: [Vec<f64>; 3],
    pub primary: [f64; 3],
}

impl SoundingData {
    pub fn new(nwindows: usize) -> Self {
        SoundingData {
            secondary: std::array::from_fn(|_| vec![0.0; nwindows]),
            noise: std::array::from_fn(|_| vec![0.0; nwindows]),
            primary: [0.0; 3],
        }
    }
}

/// Flattened sounding x system x component x window index table.
///
/// Each present datum is assigned a sequential row in the all-data
/// layout; absent slots hold `-1`. The assignment order matches the
/// data-vector assembly: per sounding, per system, XZ windows first (then
/// Y when used) under XZ inversion, otherwise X, Y, Z in component order.
#[derive(Debug, Clone)]
pub struct DataIndex {
    nsoundings: usize,
    per_sounding: usize,
    sys_offset: Vec<usize>,
    nwindows: Vec<usize>,
    table: Vec<i32>,
    nall: usize,
}

impl DataIndex {
    /// Build the index table for `nsoundings` soundings over `specs`.
    pub fn new(specs: &[SystemSpec], nsoundings: usize) -> Self {
        let nwindows: Vec<usize> = specs.iter().map(|s| s.nwindows).collect();
        let mut sys_offset = Vec::with_capacity(specs.len());
        let mut per_sounding = 0usize;
        for nw in &nwindows {
            sys_offset.push(per_sounding);
            per_sounding += NCOMPS * nw;
        }

        let mut table = vec![-1i32; nsoundings * per_sounding];
        let mut di = 0i32;
        for si in 0..nsoundings {
            for (sysi, spec) in specs.iter().enumerate() {
                let nw = nwindows[sysi];
                let slot = |ci: usize, wi: usize| si * per_sounding + sys_offset[sysi] + ci * nw + wi;
                if spec.invert_x_plus_z {
                    for wi in 0..nw {
                        table[slot(XZAMP, wi)] = di;
                        di += 1;
                    }
                    if spec.use_y {
                        for wi in 0..nw {
                            table[slot(YCOMP, wi)] = di;
                            di += 1;
                        }
                    }
                } else {
                    for ci in 0..3 {
                        if !spec.component_used(ci) {
                            continue;
                        }
                        for wi in 0..nw {
                            table[slot(ci, wi)] = di;
                            di += 1;
                        }
                    }
                }
            }
        }

        DataIndex {
            nsoundings,
            per_sounding,
            sys_offset,
            nwindows,
            table,
            nall: di as usize,
        }
    }

    /// Total number of data rows in the all-data layout.
    #[inline]
    pub fn nall(&self) -> usize {
        self.nall
    }

    #[inline]
    pub fn nsoundings(&self) -> usize {
        self.nsoundings
    }

    /// All-data row of `(sounding, system, component, window)`, or `None`
    /// when that slot carries no datum.
    #[inline]
    pub fn get(&self, si: usize, sysi: usize, ci: usize, wi: usize) -> Option<usize> {
        debug_assert!(ci < NCOMPS && wi < self.nwindows[sysi]);
        let v = self.table
            [si * self.per_sounding + self.sys_offset[sysi] + ci * self.nwindows[sysi] + wi];
        if v < 0 {
            None
        } else {
            Some(v as usize)
        }
    }
}

/// Map from the compact working vectors onto the all-data layout.
///
/// Built once per bunch from the assembled observation and noise vectors;
/// an entry survives when both are non-null.
#[derive(Debug, Clone)]
pub struct ActiveData {
    indices: Vec<usize>,
    nall: usize,
}

impl ActiveData {
    /// Select the rows whose observation and noise are both non-null.
    pub fn from_obs_and_noise(obs: &[f64], noise: &[f64]) -> Self {
        debug_assert_eq!(obs.len(), noise.len());
        let indices = (0..obs.len())
            .filter(|&i| !is_null(obs[i]) && !is_null(noise[i]))
            .collect();
        ActiveData {
            indices,
            nall: obs.len(),
        }
    }

    /// Identity selection over `nall` rows (nothing culled).
    pub fn full(nall: usize) -> Self {
        ActiveData {
            indices: (0..nall).collect(),
            nall,
        }
    }

    /// Number of active data.
    #[inline]
    pub fn ndata(&self) -> usize {
        self.indices.len()
    }

    /// Length of the all-data layout this selection was built from.
    #[inline]
    pub fn nall(&self) -> usize {
        self.nall
    }

    /// Number of culled (null) entries.
    #[inline]
    pub fn nculled(&self) -> usize {
        self.nall - self.indices.len()
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Compact `v_all` down to the active rows.
    pub fn cull(&self, v_all: &[f64]) -> Vector {
        debug_assert_eq!(v_all.len(), self.nall);
        Vector::from_iterator(self.indices.len(), self.indices.iter().map(|&i| v_all[i]))
    }

    /// Compact the rows of `m_all` down to the active rows.
    pub fn cull_rows(&self, m_all: &Matrix) -> Matrix {
        debug_assert_eq!(m_all.nrows(), self.nall);
        let mut m = Matrix::zeros(self.indices.len(), m_all.ncols());
        for (r, &i) in self.indices.iter().enumerate() {
            m.row_mut(r).copy_from(&m_all.row(i));
        }
        m
    }

    /// Scatter a compact vector back onto the all-data layout, filling
    /// culled slots with `fill`. Inverse of [`ActiveData::cull`] on the
    /// active rows.
    pub fn scatter(&self, v: &Vector, fill: f64) -> Vec<f64> {
        debug_assert_eq!(v.len(), self.indices.len());
        let mut out = vec![fill; self.nall];
        for (r, &i) in self.indices.iter().enumerate() {
            out[i] = v[r];
        }
        out
    }
}
