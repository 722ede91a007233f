//! Estimator surface: `fit` a model with NUTS, then predict from its posterior.

use crate::config::FitConfig;
use crate::device::Device;
use crate::diagnostics::{self, DiagnosticsReport};
use crate::error::{BnnError, Result};
use crate::model::{BnnModel, HeteroskedasticModel, MultiTaskModel, PartialBnnModel, PartialDklModel, ProbabilisticModel};
use crate::predictive::{self, Prediction};
use crate::rng::RngKey;
use crate::sampler::{self, McmcRun};
use crate::samples::PosteriorSamples;
use log::info;
use ndarray::{Array2, Array3, ArrayD, ArrayView, Dimension, Ix2};
use std::collections::BTreeMap;

pub type Bnn = Regressor<BnnModel>;
pub type PartialBnn = Regressor<PartialBnnModel>;
pub type HeteroskedasticBnn = Regressor<HeteroskedasticModel>;
pub type MultiTaskBnn = Regressor<MultiTaskModel>;
pub type PartialDkl = Regressor<PartialDklModel>;

#[derive(Debug, Clone)]
struct Fitted {
    samples: PosteriorSamples,
    run: McmcRun,
}

/// A probabilistic model together with the posterior of its last fit.
#[derive(Debug, Clone)]
pub struct Regressor<M> {
    model: M,
    fitted: Option<Fitted>,
}

/// Accept `[n]` as a single column or `[n, k]` as is.
fn as_matrix<D: Dimension>(a: ArrayView<f64, D>, what: &str) -> Result<Array2<f64>> {
    let a = a.into_dyn();
    match a.ndim() {
        1 => {
            let n = a.len();
            Array2::from_shape_vec((n, 1), a.iter().copied().collect())
                .map_err(|e| BnnError::InvalidConfig(e.to_string()))
        }
        2 => Ok(a
            .into_dimensionality::<Ix2>()
            .map_err(|e| BnnError::InvalidConfig(e.to_string()))?
            .to_owned()),
        _ => Err(BnnError::shape(what, "a vector or a matrix", a.shape())),
    }
}

impl<M: ProbabilisticModel> Regressor<M> {
    pub fn new(model: M) -> Self {
        Self { model, fitted: None }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn fitted(&self) -> Result<&Fitted> {
        self.fitted.as_ref().ok_or(BnnError::NotFitted)
    }

    /// `as_matrix` plus a width check against the model input.
    fn input_matrix<D: Dimension>(&self, x: ArrayView<f64, D>, what: &str) -> Result<Array2<f64>> {
        let x = as_matrix(x, what)?;
        if x.ncols() != self.model.input_dim() {
            return Err(BnnError::DimensionMismatch {
                context: format!("{} {what}", self.model.name()),
                expected: self.model.input_dim(),
                got: x.ncols(),
            });
        }
        Ok(x)
    }

    /// Run NUTS on `(x, y)`. A previous posterior is replaced only when the
    /// new fit succeeds.
    pub fn fit<D1: Dimension, D2: Dimension>(
        &mut self,
        x: ArrayView<f64, D1>,
        y: ArrayView<f64, D2>,
        config: &FitConfig,
        key: RngKey,
    ) -> Result<()> {
        config.validate()?;
        let x = as_matrix(x, "X")?;
        let y = as_matrix(y, "y")?;
        if x.nrows() != y.nrows() {
            return Err(BnnError::RowMismatch {
                x_rows: x.nrows(),
                y_rows: y.nrows(),
            });
        }
        let x = self.input_matrix(x.view(), "X")?;
        info!(
            "fitting {} on {} rows × {} columns (device {})",
            self.model.name(),
            x.nrows(),
            x.ncols(),
            config.device
        );

        let (prepare_key, sample_key) = key.split2();
        self.model.prepare(x.view(), y.view(), prepare_key)?;
        let graph = self.model.build(x.view(), y.view())?;
        let sampler_config = config.sampler_config();
        let run = config
            .device
            .install(|| sampler::sample(&graph, &sampler_config, sample_key))??;
        let samples = PosteriorSamples::from_run(&graph, &run)?;
        info!(
            "collected {} posterior samples of {} sites",
            samples.num_samples(),
            graph.sites().len()
        );
        self.fitted = Some(Fitted { samples, run });
        Ok(())
    }

    /// Posterior samples, `[chains, draws, ...]` or flattened to `[S, ...]`.
    pub fn get_samples(&self, chain_dim: bool) -> Result<PosteriorSamples> {
        let samples = &self.fitted()?.samples;
        if chain_dim {
            Ok(samples.clone())
        } else {
            samples.flatten()
        }
    }

    /// Sampler statistics requested through `FitConfig::extra_fields`.
    pub fn get_extra_fields(&self, chain_dim: bool) -> Result<BTreeMap<String, ArrayD<f64>>> {
        self.fitted()?.run.extra_fields(chain_dim)
    }

    pub fn predict<D: Dimension>(
        &self,
        x_new: ArrayView<f64, D>,
        n_draws: usize,
        device: Device,
        key: RngKey,
    ) -> Result<Prediction> {
        self.predict_with_samples(&self.fitted()?.samples, x_new, n_draws, device, key)
    }

    /// Predict with a caller-supplied posterior, e.g. a thinned subset.
    pub fn predict_with_samples<D: Dimension>(
        &self,
        samples: &PosteriorSamples,
        x_new: ArrayView<f64, D>,
        n_draws: usize,
        device: Device,
        key: RngKey,
    ) -> Result<Prediction> {
        let x_new = self.input_matrix(x_new, "X_new")?;
        info!("predicting {} rows from {} samples", x_new.nrows(), samples.num_samples());
        predictive::predict(&self.model, samples, x_new.view(), n_draws, device, key)
    }

    pub fn predict_in_batches<D: Dimension>(
        &self,
        x_new: ArrayView<f64, D>,
        batch_size: usize,
        n_draws: usize,
        device: Device,
        key: RngKey,
    ) -> Result<Prediction> {
        let samples = &self.fitted()?.samples;
        let x_new = self.input_matrix(x_new, "X_new")?;
        info!(
            "predicting {} rows from {} samples in batches of {batch_size}",
            x_new.nrows(),
            samples.num_samples()
        );
        predictive::predict_in_batches(&self.model, samples, x_new.view(), batch_size, n_draws, device, key)
    }

    /// Predictive draws `[S, n, outputs]`.
    pub fn sample_from_posterior<D: Dimension>(
        &self,
        x_new: ArrayView<f64, D>,
        n_draws: usize,
        device: Device,
        key: RngKey,
    ) -> Result<Array3<f64>> {
        let samples = &self.fitted()?.samples;
        let x_new = self.input_matrix(x_new, "X_new")?;
        predictive::sample_from_posterior(&self.model, samples, x_new.view(), n_draws, device, key)
    }

    pub fn summary(&self) -> Result<DiagnosticsReport> {
        let fitted = self.fitted()?;
        diagnostics::compute_diagnostics(&fitted.samples, &fitted.run)
    }
}

impl<M: ProbabilisticModel> From<M> for Regressor<M> {
    fn from(model: M) -> Self {
        Self::new(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Activation;
    use crate::sampler::{ChainMethod, ExtraField};
    use ndarray::{Array1, Array2};

    fn small_config() -> FitConfig {
        FitConfig {
            num_warmup: 60,
            num_samples: 25,
            num_chains: 2,
            chain_method: ChainMethod::Sequential,
            progress_bar: false,
            extra_fields: vec![ExtraField::Diverging],
            max_tree_depth: 5,
            ..FitConfig::default()
        }
    }

    fn data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((12, 1), |(i, _)| i as f64 / 6.0 - 1.0);
        let y = x.column(0).mapv(|v| 0.5 * v);
        (x, y)
    }

    #[test]
    fn unfitted_regressor_refuses_queries() {
        let reg = Bnn::new(BnnModel::new(1, &[3], 1, Activation::Tanh).unwrap());
        let (x, _) = data();
        assert!(matches!(reg.get_samples(true), Err(BnnError::NotFitted)));
        assert!(matches!(
            reg.predict(x.view(), 1, Device::Default, RngKey::new(0)),
            Err(BnnError::NotFitted)
        ));
        assert!(matches!(reg.summary(), Err(BnnError::NotFitted)));
    }

    #[test]
    fn fit_shapes_and_queries() {
        let mut reg = Bnn::new(BnnModel::new(1, &[3], 1, Activation::Tanh).unwrap());
        let (x, y) = data();
        reg.fit(x.view(), y.view(), &small_config(), RngKey::new(1)).unwrap();

        let chained = reg.get_samples(true).unwrap();
        assert_eq!(chained.get("Dense0.kernel").unwrap().shape(), &[2, 25, 1, 3]);
        let flat = reg.get_samples(false).unwrap();
        assert_eq!(flat.get("sig").unwrap().shape(), &[50]);
        assert!(flat.get("sig").unwrap().iter().all(|&s| s > 0.0));

        let extra = reg.get_extra_fields(true).unwrap();
        assert_eq!(extra["diverging"].shape(), &[2, 25]);

        let pred = reg.predict(x.view(), 2, Device::Default, RngKey::new(2)).unwrap();
        assert_eq!(pred.mean.dim(), (12, 1));
        assert!(pred.variance.iter().all(|&v| v >= 0.0));

        let draws = reg.sample_from_posterior(x.view(), 1, Device::Default, RngKey::new(2)).unwrap();
        assert_eq!(draws.shape(), &[50, 12, 1]);

        let report = reg.summary().unwrap();
        assert_eq!(report.num_chains, 2);
        assert_eq!(report.num_draws, 25);
    }

    #[test]
    fn prediction_inputs_checked_before_sampling() {
        let mut reg = Bnn::new(BnnModel::new(1, &[3], 1, Activation::Tanh).unwrap());
        let (x, y) = data();
        reg.fit(x.view(), y.view(), &small_config(), RngKey::new(1)).unwrap();
        let wide = Array2::<f64>::zeros((4, 3));
        let key = RngKey::new(0);
        let is_width_error = |r: Result<()>| matches!(r, Err(BnnError::DimensionMismatch { expected: 1, got: 3, .. }));
        assert!(is_width_error(reg.predict(wide.view(), 1, Device::Default, key).map(drop)));
        assert!(is_width_error(reg.predict_in_batches(wide.view(), 2, 1, Device::Default, key).map(drop)));
        assert!(is_width_error(reg.sample_from_posterior(wide.view(), 1, Device::Default, key).map(drop)));
    }

    #[test]
    fn row_and_column_mismatches_rejected() {
        let mut reg = Bnn::new(BnnModel::new(1, &[3], 1, Activation::Tanh).unwrap());
        let (x, y) = data();
        let short = y.slice(ndarray::s![..5]).to_owned();
        assert!(matches!(
            reg.fit(x.view(), short.view(), &small_config(), RngKey::new(0)),
            Err(BnnError::RowMismatch { x_rows: 12, y_rows: 5 })
        ));
        let wide = Array2::<f64>::zeros((12, 2));
        assert!(matches!(
            reg.fit(wide.view(), y.view(), &small_config(), RngKey::new(0)),
            Err(BnnError::DimensionMismatch { .. })
        ));
        assert!(!reg.is_fitted());
    }
}
