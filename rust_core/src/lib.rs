pub mod autodiff;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod gp;
pub mod graph;
pub mod linalg;
pub mod model;
pub mod nn;
pub mod nuts;
pub mod predictive;
pub mod priors;
pub mod progress;
pub mod regressor;
pub mod rng;
pub mod sampler;
pub mod samples;
pub mod split;
pub mod tasks;
pub mod train;

pub use config::FitConfig;
pub use device::Device;
pub use error::{BnnError, Result};
pub use model::{BnnModel, HeteroskedasticModel, MultiTaskModel, PartialBnnModel, PartialDklModel, ProbabilisticModel};
pub use nn::{Activation, Network, Params};
pub use predictive::Prediction;
pub use regressor::{Bnn, HeteroskedasticBnn, MultiTaskBnn, PartialBnn, PartialDkl, Regressor};
pub use rng::RngKey;
pub use sampler::{ChainMethod, ExtraField};
pub use samples::PosteriorSamples;
pub use split::{Boundary, SplitterRegistry};

