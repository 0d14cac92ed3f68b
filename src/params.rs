//! # Parameter layout
//!
//! The deterministic inverter works on one flat parameter vector per
//! bunch, `P = n_per_sounding x n_soundings` entries long. Within each
//! sounding block the order is fixed: conductivity log10 values (when
//! solved), then thickness log10 values (when solved), then every solved
//! geometry element in declaration order.
//!
//! [`ParameterLayout`] computes the block offsets once, at bunch setup,
//! and they are never mutated afterwards. `cindex`/`tindex`/`gindex`
//! address the concatenated vector; for any valid layout they are pairwise
//! disjoint and cover `[0, P)` exactly, which is what the property tests
//! at the bottom of this file pin down.

use crate::geometry::GeometryElement;

/// Inversion controls of one invertible quantity.
///
/// Fields
/// -----------------
/// * `solve`: Whether the quantity enters the parameter vector.
/// * `bound`: Whether the bound projection applies to it.
/// * `offset`: Offset of its block within the per-sounding parameter
///   block; `-1` when not solved. Filled in by [`ParameterLayout::new`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InvertibleField {
    pub solve: bool,
    pub bound: bool,
    pub offset: i32,
}

impl InvertibleField {
    /// A field that is solved for, optionally with bound projection.
    pub fn solved(bound: bool) -> Self {
        InvertibleField {
            solve: true,
            bound,
            offset: -1,
        }
    }

    /// A field held fixed at its input value.
    pub fn fixed() -> Self {
        InvertibleField::default()
    }
}

/// Offsets of every solved quantity within the bunch parameter vector.
#[derive(Debug, Clone)]
pub struct ParameterLayout {
    nsoundings: usize,
    nlayers: usize,
    conductivity: InvertibleField,
    thickness: InvertibleField,
    geometry: [InvertibleField; GeometryElement::SIZE],
    n_param_per_sounding: usize,
    n_geometry_per_sounding: usize,
}

impl ParameterLayout {
    /// Compute the per-sounding block layout from the solve flags.
    ///
    /// Arguments
    /// -----------------
    /// * `nlayers`: Number of layers of the earth model (half-space included).
    /// * `nsoundings`: Number of soundings co-inverted in the bunch.
    /// * `conductivity`, `thickness`: Solve/bound controls for the earth
    ///   quantities.
    /// * `geometry`: Solve/bound controls per geometry element, in
    ///   declaration order.
    ///
    /// Return
    /// ----------
    /// * A [`ParameterLayout`] with all offsets assigned. Offsets are
    ///   computed once here and never change for the lifetime of a bunch.
    pub fn new(
        nlayers: usize,
        nsoundings: usize,
        mut conductivity: InvertibleField,
        mut thickness: InvertibleField,
        mut geometry: [InvertibleField; GeometryElement::SIZE],
    ) -> Self {
        let mut n_param_per_sounding = 0usize;

        if conductivity.solve {
            conductivity.offset = 0;
            n_param_per_sounding += nlayers;
        } else {
            conductivity.offset = -1;
        }

        if thickness.solve {
            thickness.offset = n_param_per_sounding as i32;
            n_param_per_sounding += nlayers - 1;
        } else {
            thickness.offset = -1;
        }

        let mut n_geometry_per_sounding = 0usize;
        for g in geometry.iter_mut() {
            if g.solve {
                g.offset = n_param_per_sounding as i32;
                n_param_per_sounding += 1;
                n_geometry_per_sounding += 1;
            } else {
                g.offset = -1;
            }
        }

        ParameterLayout {
            nsoundings,
            nlayers,
            conductivity,
            thickness,
            geometry,
            n_param_per_sounding,
            n_geometry_per_sounding,
        }
    }

    #[inline]
    pub fn nlayers(&self) -> usize {
        self.nlayers
    }

    #[inline]
    pub fn nsoundings(&self) -> usize {
        self.nsoundings
    }

    /// Total length of the bunch parameter vector.
    #[inline]
    pub fn nparams(&self) -> usize {
        self.n_param_per_sounding * self.nsoundings
    }

    #[inline]
    pub fn nparams_per_sounding(&self) -> usize {
        self.n_param_per_sounding
    }

    #[inline]
    pub fn solve_conductivity(&self) -> bool {
        self.conductivity.solve
    }

    #[inline]
    pub fn solve_thickness(&self) -> bool {
        self.thickness.solve
    }

    /// Whether any geometry element is solved for.
    #[inline]
    pub fn solve_geometry(&self) -> bool {
        self.n_geometry_per_sounding > 0
    }

    #[inline]
    pub fn solve_geometry_element(&self, element: GeometryElement) -> bool {
        self.geometry[element.index()].solve
    }

    #[inline]
    pub fn bound_conductivity(&self) -> bool {
        self.conductivity.solve && self.conductivity.bound
    }

    #[inline]
    pub fn bound_thickness(&self) -> bool {
        self.thickness.solve && self.thickness.bound
    }

    #[inline]
    pub fn bound_geometry_element(&self, element: GeometryElement) -> bool {
        let g = &self.geometry[element.index()];
        g.solve && g.bound
    }

    /// Parameter index of conductivity layer `li` of sounding `si`.
    ///
    /// Panics in debug builds when conductivity is not solved; callers
    /// guard with [`ParameterLayout::solve_conductivity`].
    #[inline]
    pub fn cindex(&self, si: usize, li: usize) -> usize {
        debug_assert!(self.conductivity.solve && li < self.nlayers);
        si * self.n_param_per_sounding + self.conductivity.offset as usize + li
    }

    /// Parameter index of thickness layer `li` of sounding `si`.
    #[inline]
    pub fn tindex(&self, si: usize, li: usize) -> usize {
        debug_assert!(self.thickness.solve && li < self.nlayers - 1);
        si * self.n_param_per_sounding + self.thickness.offset as usize + li
    }

    /// Parameter index of geometry `element` of sounding `si`, or `None`
    /// when the element is not solved.
    #[inline]
    pub fn gindex(&self, si: usize, element: GeometryElement) -> Option<usize> {
        let off = self.geometry[element.index()].offset;
        if off < 0 {
            None
        } else {
            Some(si * self.n_param_per_sounding + off as usize)
        }
    }
}

#[cfg(test)]
mod params_test {
    use super::*;

    fn geometry_with(solved: &[GeometryElement]) -> [InvertibleField; GeometryElement::SIZE] {
        let mut g = [InvertibleField::fixed(); GeometryElement::SIZE];
        for e in solved {
            g[e.index()] = InvertibleField::solved(true);
        }
        g
    }

    #[test]
    fn test_indices_disjoint_and_cover() {
        let layout = ParameterLayout::new(
            4,
            3,
            InvertibleField::solved(true),
            InvertibleField::solved(false),
            geometry_with(&[GeometryElement::TxHeight, GeometryElement::RxPitch]),
        );
        // 4 conductivities + 3 thicknesses + 2 geometry elements per sounding
        assert_eq!(layout.nparams_per_sounding(), 9);
        assert_eq!(layout.nparams(), 27);

        let mut seen = vec![false; layout.nparams()];
        for si in 0..3 {
            for li in 0..4 {
                let p = layout.cindex(si, li);
                assert!(!seen[p]);
                seen[p] = true;
            }
            for li in 0..3 {
                let p = layout.tindex(si, li);
                assert!(!seen[p]);
                seen[p] = true;
            }
            for e in GeometryElement::ALL {
                if let Some(p) = layout.gindex(si, e) {
                    assert!(!seen[p]);
                    seen[p] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s), "indices must cover [0, P) exactly");
    }

    #[test]
    fn test_geometry_declaration_order() {
        let layout = ParameterLayout::new(
            2,
            1,
            InvertibleField::solved(false),
            InvertibleField::fixed(),
            geometry_with(&[GeometryElement::TxRxDz, GeometryElement::TxHeight]),
        );
        // tx_height precedes txrx_dz in declaration order regardless of the
        // order the caller listed them in.
        let h = layout.gindex(0, GeometryElement::TxHeight).unwrap();
        let dz = layout.gindex(0, GeometryElement::TxRxDz).unwrap();
        assert_eq!(h, 2);
        assert_eq!(dz, 3);
        assert_eq!(layout.gindex(0, GeometryElement::RxYaw), None);
    }

    #[test]
    fn test_unsolved_quantities_have_no_offsets() {
        let layout = ParameterLayout::new(
            3,
            1,
            InvertibleField::solved(true),
            InvertibleField::fixed(),
            geometry_with(&[]),
        );
        assert!(!layout.solve_thickness());
        assert!(!layout.solve_geometry());
        assert_eq!(layout.nparams(), 3);
    }
}
