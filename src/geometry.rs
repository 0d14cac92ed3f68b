//! # Transmitter/receiver geometry
//!
//! The survey geometry of one sounding is a fixed bag of ten named
//! scalars: transmitter height and attitude, transmitter-to-receiver
//! offsets, and receiver attitude. [`GeometryElement`] tags each slot;
//! [`Geometry`] stores the values and is addressed either by element or by
//! case-insensitive name.
//!
//! The element tag doubles as the nuisance type tag of the stochastic
//! inverter, so nuisances stay a plain tagged struct rather than a list of
//! trait objects.

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::aem1d_errors::Aem1dError;

/// One of the ten named scalar elements of the survey geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryElement {
    TxHeight,
    TxRoll,
    TxPitch,
    TxYaw,
    TxRxDx,
    TxRxDy,
    TxRxDz,
    RxRoll,
    RxPitch,
    RxYaw,
}

impl GeometryElement {
    /// All elements in declaration order. The order fixes both the
    /// geometry storage layout and the parameter-block layout of solved
    /// geometry elements.
    pub const ALL: [GeometryElement; 10] = [
        GeometryElement::TxHeight,
        GeometryElement::TxRoll,
        GeometryElement::TxPitch,
        GeometryElement::TxYaw,
        GeometryElement::TxRxDx,
        GeometryElement::TxRxDy,
        GeometryElement::TxRxDz,
        GeometryElement::RxRoll,
        GeometryElement::RxPitch,
        GeometryElement::RxYaw,
    ];

    /// Number of geometry elements.
    pub const SIZE: usize = Self::ALL.len();

    /// Canonical lower-case name of the element.
    pub fn name(&self) -> &'static str {
        match self {
            GeometryElement::TxHeight => "tx_height",
            GeometryElement::TxRoll => "tx_roll",
            GeometryElement::TxPitch => "tx_pitch",
            GeometryElement::TxYaw => "tx_yaw",
            GeometryElement::TxRxDx => "txrx_dx",
            GeometryElement::TxRxDy => "txrx_dy",
            GeometryElement::TxRxDz => "txrx_dz",
            GeometryElement::RxRoll => "rx_roll",
            GeometryElement::RxPitch => "rx_pitch",
            GeometryElement::RxYaw => "rx_yaw",
        }
    }

    /// Human-readable description, used when labelling output fields.
    pub fn description(&self) -> &'static str {
        match self {
            GeometryElement::TxHeight => "transmitter height",
            GeometryElement::TxRoll => "transmitter roll",
            GeometryElement::TxPitch => "transmitter pitch",
            GeometryElement::TxYaw => "transmitter yaw",
            GeometryElement::TxRxDx => "transmitter-receiver inline offset",
            GeometryElement::TxRxDy => "transmitter-receiver transverse offset",
            GeometryElement::TxRxDz => "transmitter-receiver vertical offset",
            GeometryElement::RxRoll => "receiver roll",
            GeometryElement::RxPitch => "receiver pitch",
            GeometryElement::RxYaw => "receiver yaw",
        }
    }

    /// Measurement units of the element.
    pub fn units(&self) -> &'static str {
        match self {
            GeometryElement::TxHeight
            | GeometryElement::TxRxDx
            | GeometryElement::TxRxDy
            | GeometryElement::TxRxDz => "m",
            _ => "deg",
        }
    }

    /// Position of the element in [`GeometryElement::ALL`].
    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Case-insensitive lookup by name.
    ///
    /// Return
    /// ----------
    /// * `Ok(GeometryElement)` for a known element name.
    /// * `Err(Aem1dError::UnknownGeometryElement)` otherwise.
    pub fn from_name(name: &str) -> Result<GeometryElement, Aem1dError> {
        Self::ALL
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
            .copied()
            .ok_or_else(|| Aem1dError::UnknownGeometryElement(name.to_string()))
    }
}

impl fmt::Display for GeometryElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The ten geometry scalars of one sounding.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Geometry {
    values: [f64; GeometryElement::SIZE],
}

impl Geometry {
    /// Geometry with every element zero.
    pub fn zeros() -> Self {
        Self::default()
    }

    /// Value of `element`.
    #[inline]
    pub fn get(&self, element: GeometryElement) -> f64 {
        self.values[element.index()]
    }

    /// Set `element` to `value`.
    #[inline]
    pub fn set(&mut self, element: GeometryElement, value: f64) {
        self.values[element.index()] = value;
    }

    /// Value addressed by case-insensitive element name.
    pub fn get_by_name(&self, name: &str) -> Result<f64, Aem1dError> {
        Ok(self.get(GeometryElement::from_name(name)?))
    }

    /// Iterate `(element, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (GeometryElement, f64)> + '_ {
        GeometryElement::ALL.iter().map(|&e| (e, self.get(e)))
    }
}

impl Index<GeometryElement> for Geometry {
    type Output = f64;

    #[inline]
    fn index(&self, element: GeometryElement) -> &f64 {
        &self.values[element.index()]
    }
}

impl IndexMut<GeometryElement> for Geometry {
    #[inline]
    fn index_mut(&mut self, element: GeometryElement) -> &mut f64 {
        &mut self.values[element.index()]
    }
}

/// The sibling geometries of one sounding.
///
/// Fields
/// -----------------
/// * `input`: Geometry as read from the record.
/// * `reference`: Geometry the inversion is pulled towards.
/// * `std`: Per-element standard deviations of solved elements.
/// * `min`, `max`: Bounds of solved elements.
/// * `tfr`: True-frame geometry used when reconstructing primary fields.
/// * `inverted`: Result geometry populated at the end of a bunch.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometrySet {
    pub input: Geometry,
    pub reference: Geometry,
    pub std: Geometry,
    pub min: Geometry,
    pub max: Geometry,
    pub tfr: Geometry,
    pub inverted: Geometry,
}
