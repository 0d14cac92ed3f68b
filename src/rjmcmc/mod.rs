//! # Reversible-jump MCMC inversion
//!
//! The stochastic counterpart of the Gauss-Newton inverter: instead of a
//! single best-fit model per bunch, [`sampler::RjSampler`] draws a
//! posterior ensemble over layer count, layer values, interface
//! positions, nuisance geometry parameters and multiplicative noise
//! magnitudes for one sounding, using reversible-jump Markov-chain Monte
//! Carlo with parallel tempering.
//!
//! * [`model`] – the trans-dimensional model state with its cached
//!   variance, residuals and misfit;
//! * [`sampler`] – proposal kernels, tempering, the sampling loop;
//! * [`maps`] – posterior aggregation (PPD, histograms, convergence
//!   records, summary models).

pub mod maps;
pub mod model;
pub mod sampler;

pub use maps::{ChainHistory, Histogram, HistogramStats, NoiseMap, NuisanceMap, PpdMap, Stats,
    SummaryModels};
pub use model::{Layer, Model1d, NoiseProcess, Nuisance, Parameterization};
pub use sampler::{Chain, KernelCounters, NoisePrior, ProposalCounter, RjConfig, RjConfigBuilder,
    RjSampler};
