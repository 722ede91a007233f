//! Posterior predictive engine.
//!
//! Each posterior sample is evaluated independently on the new inputs with its
//! own key `key.fold_in(global sample index)`, so any chunking of the sample
//! axis reproduces the unchunked result.

use crate::device::Device;
use crate::error::{BnnError, Result};
use crate::model::ProbabilisticModel;
use crate::rng::RngKey;
use crate::samples::PosteriorSamples;
use log::debug;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;
use std::ops::Range;

/// Predictive mean and total predictive variance, both `n × outputs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Array2<f64>,
    pub variance: Array2<f64>,
}

/// Per-sample locations and predictive draws, `[samples, n, outputs]`.
struct SampleMap {
    locs: Array3<f64>,
    draws: Array3<f64>,
}

fn map_samples<M: ProbabilisticModel + ?Sized>(
    model: &M,
    samples: &PosteriorSamples,
    range: Range<usize>,
    inputs: ArrayView2<f64>,
    n_draws: usize,
    key: RngKey,
) -> Result<SampleMap> {
    let per_sample = range
        .into_par_iter()
        .map(|s| {
            let params = samples.draw(s)?;
            let mut rng = key.fold_in(s as u64).to_rng();
            model.predict_draw(&params, inputs, n_draws, &mut rng)
        })
        .collect::<Result<Vec<_>>>()?;
    let locs: Vec<ArrayView2<f64>> = per_sample.iter().map(|(l, _)| l.view()).collect();
    let draws: Vec<ArrayView2<f64>> = per_sample.iter().map(|(_, d)| d.view()).collect();
    Ok(SampleMap {
        locs: ndarray::stack(Axis(0), &locs).map_err(|e| BnnError::InvalidConfig(e.to_string()))?,
        draws: ndarray::stack(Axis(0), &draws).map_err(|e| BnnError::InvalidConfig(e.to_string()))?,
    })
}

fn check_request(samples: &PosteriorSamples, n_draws: usize) -> Result<()> {
    if n_draws == 0 {
        return Err(BnnError::InvalidConfig("n_draws must be positive".into()));
    }
    if samples.is_empty() {
        return Err(BnnError::InvalidConfig("no posterior samples to predict with".into()));
    }
    Ok(())
}

fn mean_over_samples(a: &Array3<f64>) -> Result<Array2<f64>> {
    a.mean_axis(Axis(0))
        .ok_or_else(|| BnnError::InvalidConfig("empty sample axis".into()))
}

/// Predictive mean and variance over all samples.
pub fn predict<M: ProbabilisticModel + ?Sized>(
    model: &M,
    samples: &PosteriorSamples,
    x_new: ArrayView2<f64>,
    n_draws: usize,
    device: Device,
    key: RngKey,
) -> Result<Prediction> {
    check_request(samples, n_draws)?;
    let inputs = model.predictive_inputs(x_new)?;
    let total = samples.num_samples();
    device.install(|| {
        let map = map_samples(model, samples, 0..total, inputs.view(), n_draws, key)?;
        Ok(Prediction {
            mean: mean_over_samples(&map.locs)?,
            variance: map.draws.var_axis(Axis(0), 0.0),
        })
    })?
}

/// Memory-bounded [`predict`]: samples are mapped in contiguous chunks of
/// `batch_size`, each gathered before the next starts.
pub fn predict_in_batches<M: ProbabilisticModel + ?Sized>(
    model: &M,
    samples: &PosteriorSamples,
    x_new: ArrayView2<f64>,
    batch_size: usize,
    n_draws: usize,
    device: Device,
    key: RngKey,
) -> Result<Prediction> {
    check_request(samples, n_draws)?;
    if batch_size == 0 {
        return Err(BnnError::InvalidConfig("batch_size must be positive".into()));
    }
    let inputs = model.predictive_inputs(x_new)?;
    let total = samples.num_samples();
    device.install(|| {
        let mut weighted_mean: Option<Array2<f64>> = None;
        let mut draws = Vec::with_capacity(total.div_ceil(batch_size));
        for start in (0..total).step_by(batch_size) {
            let end = (start + batch_size).min(total);
            debug!("predictive chunk {start}..{end} of {total}");
            let map = map_samples(model, samples, start..end, inputs.view(), n_draws, key)?;
            let chunk_mean = mean_over_samples(&map.locs)? * (end - start) as f64;
            weighted_mean = Some(match weighted_mean {
                Some(acc) => acc + chunk_mean,
                None => chunk_mean,
            });
            draws.push(map.draws);
        }
        let views: Vec<_> = draws.iter().map(|d| d.view()).collect();
        let all_draws =
            ndarray::concatenate(Axis(0), &views).map_err(|e| BnnError::InvalidConfig(e.to_string()))?;
        let mean = weighted_mean.ok_or_else(|| BnnError::InvalidConfig("empty sample axis".into()))? / total as f64;
        Ok(Prediction {
            mean,
            variance: all_draws.var_axis(Axis(0), 0.0),
        })
    })?
}

/// Raw predictive draws `[samples, n, outputs]`, no aggregation.
pub fn sample_from_posterior<M: ProbabilisticModel + ?Sized>(
    model: &M,
    samples: &PosteriorSamples,
    x_new: ArrayView2<f64>,
    n_draws: usize,
    device: Device,
    key: RngKey,
) -> Result<Array3<f64>> {
    check_request(samples, n_draws)?;
    let inputs = model.predictive_inputs(x_new)?;
    let total = samples.num_samples();
    device.install(|| Ok(map_samples(model, samples, 0..total, inputs.view(), n_draws, key)?.draws))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BnnModel;
    use crate::nn::{Activation, Params};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, ArrayD, IxDyn};
    use rand::Rng;
    use std::collections::BTreeMap;

    fn fake_samples(model_inputs: usize, hidden: usize, count: usize) -> PosteriorSamples {
        let mut rng = RngKey::new(99).to_rng();
        let mut draw = |shape: &[usize]| -> ArrayD<f64> {
            Array::from_shape_fn(IxDyn(shape), |_| rng.gen::<f64>() - 0.5)
        };
        let mut sites: BTreeMap<String, ArrayD<f64>> = BTreeMap::new();
        sites.insert("Dense0.kernel".into(), draw(&[count, model_inputs, hidden]));
        sites.insert("Dense0.bias".into(), draw(&[count, hidden]));
        sites.insert("Dense1.kernel".into(), draw(&[count, hidden, 1]));
        sites.insert("Dense1.bias".into(), draw(&[count, 1]));
        sites.insert("sig".into(), draw(&[count]).mapv(|v| v.abs() + 0.1));
        PosteriorSamples::new(sites).unwrap()
    }

    fn inputs() -> Array2<f64> {
        Array2::from_shape_fn((5, 2), |(i, j)| (i as f64 - 2.0) * 0.3 + j as f64 * 0.1)
    }

    #[test]
    fn batches_match_full_prediction() {
        let model = BnnModel::new(2, &[4], 1, Activation::Tanh).unwrap();
        let samples = fake_samples(2, 4, 23);
        let x = inputs();
        let key = RngKey::new(5);
        let full = predict(&model, &samples, x.view(), 3, Device::Default, key).unwrap();
        for batch in [1, 4, 7, 23, 100] {
            let chunked = predict_in_batches(&model, &samples, x.view(), batch, 3, Device::Default, key).unwrap();
            for (a, b) in full.mean.iter().zip(chunked.mean.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-10);
            }
            for (a, b) in full.variance.iter().zip(chunked.variance.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn variance_is_population_variance_of_draws() {
        let model = BnnModel::new(2, &[4], 1, Activation::Tanh).unwrap();
        let samples = fake_samples(2, 4, 10);
        let x = inputs();
        let key = RngKey::new(8);
        let draws = sample_from_posterior(&model, &samples, x.view(), 2, Device::Default, key).unwrap();
        assert_eq!(draws.shape(), &[10, 5, 1]);
        let pred = predict(&model, &samples, x.view(), 2, Device::Default, key).unwrap();
        let expected = draws.var_axis(Axis(0), 0.0);
        for (a, b) in pred.variance.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert!(pred.variance.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn mean_is_average_location() {
        let model = BnnModel::new(2, &[4], 1, Activation::Tanh).unwrap();
        let samples = fake_samples(2, 4, 6);
        let x = inputs();
        let pred = predict(&model, &samples, x.view(), 1, Device::Default, RngKey::new(0)).unwrap();
        let mut expected = Array2::<f64>::zeros((5, 1));
        for s in 0..6 {
            let params: Params = samples.draw(s).unwrap();
            let mut rng = RngKey::new(0).to_rng();
            expected += &model.predict_draw(&params, x.view(), 1, &mut rng).unwrap().0;
        }
        expected /= 6.0;
        for (a, b) in pred.mean.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn device_pool_does_not_change_results() {
        let model = BnnModel::new(2, &[4], 1, Activation::Tanh).unwrap();
        let samples = fake_samples(2, 4, 9);
        let x = inputs();
        let key = RngKey::new(3);
        let a = predict(&model, &samples, x.view(), 2, Device::Default, key).unwrap();
        let b = predict(&model, &samples, x.view(), 2, Device::Cpu { threads: Some(2) }, key).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_draws_rejected() {
        let model = BnnModel::new(2, &[4], 1, Activation::Tanh).unwrap();
        let samples = fake_samples(2, 4, 2);
        let x = inputs();
        assert!(predict(&model, &samples, x.view(), 0, Device::Default, RngKey::new(0)).is_err());
    }
}
