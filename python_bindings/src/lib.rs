use ndarray::ArrayD;
use numpy::{IntoPyArray, PyArray2, PyArray3, PyReadonlyArrayDyn};
use partial_bnn_core::model::ProbabilisticModel;
use partial_bnn_core::train::TrainConfig;
use partial_bnn_core::{
    Activation, BnnError, BnnModel, Boundary, ChainMethod, Device, ExtraField, FitConfig, HeteroskedasticModel,
    MultiTaskModel, Network, PartialBnnModel, Regressor, RngKey,
};
use pyo3::exceptions::{PyKeyError, PyOSError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

fn to_py_err(err: BnnError) -> PyErr {
    let msg = err.to_string();
    match err {
        BnnError::UnknownSite(_) | BnnError::UnknownExtraField(_) => PyKeyError::new_err(msg),
        BnnError::Io(_) => PyOSError::new_err(msg),
        BnnError::RowMismatch { .. } | BnnError::InvalidShape { .. } | BnnError::UnseenTask { .. } => {
            PyValueError::new_err(msg)
        }
        err if err.is_configuration() => PyValueError::new_err(msg),
        _ => PyRuntimeError::new_err(msg),
    }
}

fn parse<T: std::str::FromStr<Err = BnnError>>(s: &str) -> PyResult<T> {
    s.parse().map_err(to_py_err)
}

fn device(name: Option<&str>) -> PyResult<Device> {
    name.map_or(Ok(Device::Default), parse)
}

#[allow(clippy::too_many_arguments)]
fn fit_config(
    num_warmup: usize,
    num_samples: usize,
    num_chains: usize,
    chain_method: &str,
    progress_bar: bool,
    device_name: Option<&str>,
    extra_fields: Vec<String>,
    max_tree_depth: usize,
    target_accept: f64,
) -> PyResult<FitConfig> {
    let config = FitConfig {
        num_warmup,
        num_samples,
        num_chains,
        chain_method: parse::<ChainMethod>(chain_method)?,
        progress_bar,
        device: device(device_name)?,
        extra_fields: extra_fields
            .iter()
            .map(|f| parse::<ExtraField>(f))
            .collect::<PyResult<_>>()?,
        max_tree_depth,
        target_accept,
        ..FitConfig::default()
    };
    config.validate().map_err(to_py_err)?;
    Ok(config)
}

fn train_config(sgd_epochs: usize, sgd_lr: f64, sgd_batch_size: Option<usize>, swa_epochs: usize) -> TrainConfig {
    TrainConfig {
        epochs: sgd_epochs,
        learning_rate: sgd_lr,
        batch_size: sgd_batch_size,
        swa_epochs,
        ..TrainConfig::default()
    }
}

fn arrays_to_dict<'py, 'a>(
    py: Python<'py>,
    items: impl Iterator<Item = (&'a str, &'a ArrayD<f64>)>,
) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    for (name, value) in items {
        dict.set_item(name, value.clone().into_pyarray(py))?;
    }
    Ok(dict)
}

fn fit_regressor<M: ProbabilisticModel>(
    py: Python<'_>,
    inner: &mut Regressor<M>,
    x: PyReadonlyArrayDyn<'_, f64>,
    y: PyReadonlyArrayDyn<'_, f64>,
    config: FitConfig,
    seed: u64,
) -> PyResult<()> {
    let x = x.as_array().to_owned();
    let y = y.as_array().to_owned();
    py.allow_threads(|| inner.fit(x.view(), y.view(), &config, RngKey::new(seed)))
        .map_err(to_py_err)
}

/// Shared estimator surface; `$ctor` supplies the class-specific `#[new]`.
macro_rules! estimator {
    ($class:ident, $py_name:literal, $model:ty, { $($ctor:tt)* }) => {
        #[pyclass(name = $py_name)]
        struct $class {
            inner: Regressor<$model>,
        }

        #[pymethods]
        impl $class {
            $($ctor)*

            #[pyo3(signature = (
                x, y, num_warmup=2000, num_samples=2000, num_chains=1, chain_method="sequential",
                progress_bar=true, device=None, rng_key=0, extra_fields=Vec::new(), max_tree_depth=10,
                target_accept=0.8
            ))]
            #[allow(clippy::too_many_arguments)]
            fn fit(
                &mut self,
                py: Python<'_>,
                x: PyReadonlyArrayDyn<'_, f64>,
                y: PyReadonlyArrayDyn<'_, f64>,
                num_warmup: usize,
                num_samples: usize,
                num_chains: usize,
                chain_method: &str,
                progress_bar: bool,
                device: Option<&str>,
                rng_key: u64,
                extra_fields: Vec<String>,
                max_tree_depth: usize,
                target_accept: f64,
            ) -> PyResult<()> {
                let config = fit_config(
                    num_warmup,
                    num_samples,
                    num_chains,
                    chain_method,
                    progress_bar,
                    device,
                    extra_fields,
                    max_tree_depth,
                    target_accept,
                )?;
                fit_regressor(py, &mut self.inner, x, y, config, rng_key)
            }

            #[pyo3(signature = (chain_dim=false))]
            fn get_samples<'py>(&self, py: Python<'py>, chain_dim: bool) -> PyResult<Bound<'py, PyDict>> {
                let samples = self.inner.get_samples(chain_dim).map_err(to_py_err)?;
                arrays_to_dict(py, samples.iter())
            }

            #[pyo3(signature = (chain_dim=false))]
            fn get_extra_fields<'py>(&self, py: Python<'py>, chain_dim: bool) -> PyResult<Bound<'py, PyDict>> {
                let fields = self.inner.get_extra_fields(chain_dim).map_err(to_py_err)?;
                arrays_to_dict(py, fields.iter().map(|(k, v)| (k.as_str(), v)))
            }

            /// Returns `(mean, variance)`.
            #[pyo3(signature = (x_new, n_draws=1, device=None, rng_key=0))]
            fn predict<'py>(
                &self,
                py: Python<'py>,
                x_new: PyReadonlyArrayDyn<'py, f64>,
                n_draws: usize,
                device: Option<&str>,
                rng_key: u64,
            ) -> PyResult<(Bound<'py, PyArray2<f64>>, Bound<'py, PyArray2<f64>>)> {
                let device = self::device(device)?;
                let x_new = x_new.as_array().to_owned();
                let inner = &self.inner;
                let pred = py
                    .allow_threads(|| inner.predict(x_new.view(), n_draws, device, RngKey::new(rng_key)))
                    .map_err(to_py_err)?;
                Ok((pred.mean.into_pyarray(py), pred.variance.into_pyarray(py)))
            }

            #[pyo3(signature = (x_new, batch_size=100, n_draws=1, device=None, rng_key=0))]
            fn predict_in_batches<'py>(
                &self,
                py: Python<'py>,
                x_new: PyReadonlyArrayDyn<'py, f64>,
                batch_size: usize,
                n_draws: usize,
                device: Option<&str>,
                rng_key: u64,
            ) -> PyResult<(Bound<'py, PyArray2<f64>>, Bound<'py, PyArray2<f64>>)> {
                let device = self::device(device)?;
                let x_new = x_new.as_array().to_owned();
                let inner = &self.inner;
                let pred = py
                    .allow_threads(|| {
                        inner.predict_in_batches(x_new.view(), batch_size, n_draws, device, RngKey::new(rng_key))
                    })
                    .map_err(to_py_err)?;
                Ok((pred.mean.into_pyarray(py), pred.variance.into_pyarray(py)))
            }

            #[pyo3(signature = (x_new, n_draws=1, device=None, rng_key=0))]
            fn sample_from_posterior<'py>(
                &self,
                py: Python<'py>,
                x_new: PyReadonlyArrayDyn<'py, f64>,
                n_draws: usize,
                device: Option<&str>,
                rng_key: u64,
            ) -> PyResult<Bound<'py, PyArray3<f64>>> {
                let device = self::device(device)?;
                let x_new = x_new.as_array().to_owned();
                let inner = &self.inner;
                let draws = py
                    .allow_threads(|| inner.sample_from_posterior(x_new.view(), n_draws, device, RngKey::new(rng_key)))
                    .map_err(to_py_err)?;
                Ok(draws.into_pyarray(py))
            }

            fn summary(&self) -> PyResult<String> {
                Ok(self.inner.summary().map_err(to_py_err)?.to_table())
            }

            fn __repr__(&self) -> String {
                let model = self.inner.model();
                format!(
                    "{}(input_dim={}, output_dim={}, fitted={})",
                    model.name(),
                    model.input_dim(),
                    model.output_dim(),
                    self.inner.is_fitted()
                )
            }
        }
    };
}

estimator!(PyBnn, "BNN", BnnModel, {
    #[new]
    #[pyo3(signature = (input_dim, output_dim, hidden_dim=vec![32, 16, 8], activation="tanh"))]
    fn new(input_dim: usize, output_dim: usize, hidden_dim: Vec<usize>, activation: &str) -> PyResult<Self> {
        let model = BnnModel::new(input_dim, &hidden_dim, output_dim, parse::<Activation>(activation)?)
            .map_err(to_py_err)?;
        Ok(Self { inner: Regressor::new(model) })
    }
});

estimator!(PyPartialBnn, "PartialBNN", PartialBnnModel, {
    /// The last `num_stochastic_layers` layers are sampled; the rest are
    /// pretrained by MAP fitting at `fit` time.
    #[new]
    #[pyo3(signature = (
        input_dim, output_dim, hidden_dim=vec![32, 16, 8], activation="tanh", num_stochastic_layers=1,
        pretrained_priors_sigma=None, sgd_epochs=500, sgd_lr=0.01, sgd_batch_size=None, swa_epochs=10
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        input_dim: usize,
        output_dim: usize,
        hidden_dim: Vec<usize>,
        activation: &str,
        num_stochastic_layers: usize,
        pretrained_priors_sigma: Option<f64>,
        sgd_epochs: usize,
        sgd_lr: f64,
        sgd_batch_size: Option<usize>,
        swa_epochs: usize,
    ) -> PyResult<Self> {
        let network = Network::mlp(input_dim, &hidden_dim, output_dim, parse::<Activation>(activation)?);
        let mut model = PartialBnnModel::new(network, None, Boundary::Count(num_stochastic_layers))
            .map_err(to_py_err)?
            .with_train_config(train_config(sgd_epochs, sgd_lr, sgd_batch_size, swa_epochs));
        if let Some(sigma) = pretrained_priors_sigma {
            model = model.with_pretrained_priors(sigma);
        }
        Ok(Self { inner: Regressor::new(model) })
    }
});

estimator!(PyHeteroskedasticBnn, "HeteroskedasticBNN", HeteroskedasticModel, {
    /// Fully stochastic unless `num_stochastic_layers` is given.
    #[new]
    #[pyo3(signature = (
        input_dim, output_dim, hidden_dim=vec![32, 16, 8], activation="tanh", num_stochastic_layers=None,
        sgd_epochs=500, sgd_lr=0.01, sgd_batch_size=None, swa_epochs=10
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        input_dim: usize,
        output_dim: usize,
        hidden_dim: Vec<usize>,
        activation: &str,
        num_stochastic_layers: Option<usize>,
        sgd_epochs: usize,
        sgd_lr: f64,
        sgd_batch_size: Option<usize>,
        swa_epochs: usize,
    ) -> PyResult<Self> {
        let activation = parse::<Activation>(activation)?;
        let model = match num_stochastic_layers {
            None => HeteroskedasticModel::new(input_dim, &hidden_dim, output_dim, activation),
            Some(k) => HeteroskedasticModel::partial(
                Network::mlp_2head(input_dim, &hidden_dim, output_dim, activation),
                None,
                Boundary::Count(k),
            ),
        }
        .map_err(to_py_err)?
        .with_train_config(train_config(sgd_epochs, sgd_lr, sgd_batch_size, swa_epochs));
        Ok(Self { inner: Regressor::new(model) })
    }
});

estimator!(PyMultitaskBnn, "MultitaskBNN", MultiTaskModel, {
    /// `input_dim` counts features only; `X` carries the task index as its last column.
    #[new]
    #[pyo3(signature = (input_dim, output_dim, num_tasks, embedding_dim, hidden_dim=vec![32, 16, 8], activation="tanh"))]
    fn new(
        input_dim: usize,
        output_dim: usize,
        num_tasks: usize,
        embedding_dim: usize,
        hidden_dim: Vec<usize>,
        activation: &str,
    ) -> PyResult<Self> {
        let model = MultiTaskModel::new(
            input_dim,
            output_dim,
            num_tasks,
            embedding_dim,
            &hidden_dim,
            parse::<Activation>(activation)?,
        )
        .map_err(to_py_err)?;
        Ok(Self { inner: Regressor::new(model) })
    }
});

#[pymodule]
fn partial_bnn(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let _ = env_logger::try_init();
    m.add_class::<PyBnn>()?;
    m.add_class::<PyPartialBnn>()?;
    m.add_class::<PyHeteroskedasticBnn>()?;
    m.add_class::<PyMultitaskBnn>()?;
    Ok(())
}
