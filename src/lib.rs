//! # aem1d
//!
//! Inversion core of an airborne time-domain electromagnetic (TDEM)
//! toolkit: given observed EM responses recorded along flight lines, it
//! recovers one-dimensional layered-earth conductivity/thickness
//! profiles (and optionally survey geometry) beneath each sounding.
//!
//! Two complementary inverters share one data model and one
//! forward-model seam:
//!
//! * [`gauss_newton`] – the deterministic sample-by-sample inverter: a
//!   damped, bounded, regularised Gauss-Newton solver over bunches of
//!   adjacent soundings;
//! * [`rjmcmc`] – the stochastic inverter: a reversible-jump MCMC
//!   sampler with parallel tempering producing posterior ensembles.
//!
//! The EM physics itself is a collaborator behind the
//! [`forward::ForwardSystem`] trait.

pub mod aem1d_errors;
pub mod config;
pub mod constants;
pub mod data;
pub mod earth;
pub mod forward;
pub mod gauss_newton;
pub mod geometry;
pub mod input;
pub mod logger;
pub mod output;
pub mod params;
pub mod regularisation;
pub mod rjmcmc;

pub use aem1d_errors::Aem1dError;
pub use config::{ControlFile, NormType, Options};
pub use earth::{EarthModelSet, LayeredEarth};
pub use forward::{EmSystem, ForwardSystem, SystemSpec};
pub use gauss_newton::{run_inversion, BunchContext, BunchResult, InversionSetup, SbsInverter};
pub use geometry::{Geometry, GeometryElement, GeometrySet};
pub use logger::{LogLevel, Logger, NullLogger, TracingLogger};
pub use rjmcmc::{Model1d, RjConfig, RjSampler};
