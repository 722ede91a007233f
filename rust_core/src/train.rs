//! Deterministic MAP pretraining.
//!
//! Produces the point-estimate weights that partial models freeze or center
//! their priors on: Adam on the negative log joint under an isotropic Normal
//! prior, with stochastic weight averaging over the final epochs.

use crate::autodiff::grad_logp;
use crate::error::{BnnError, Result};
use crate::model::{build_dense_stack, ModelGraph, StackOutput};
use crate::nn::{LayerConfig, Network, Params, Topology};
use crate::priors::PriorPolicy;
use crate::rng::RngKey;
use log::{debug, info};
use ndarray::{ArrayView2, Axis};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Settings of the pretraining run used when weights are not supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Full batch when `None`.
    pub batch_size: Option<usize>,
    /// Trailing epochs whose end-of-epoch weights are averaged.
    pub swa_epochs: usize,
    /// Scale of the isotropic Normal weight prior.
    pub map_sigma: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 500,
            learning_rate: 0.01,
            batch_size: None,
            swa_epochs: 10,
            map_sigma: 1.0,
        }
    }
}

/// A routine that fits network weights deterministically.
pub trait DeterministicTrainer {
    fn train(
        &self,
        network: &Network,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        epochs: usize,
        batch_size: Option<usize>,
        key: RngKey,
    ) -> Result<Params>;
}

/// Adam + SWA maximum-a-posteriori trainer.
#[derive(Debug, Clone, PartialEq)]
pub struct MapTrainer {
    pub learning_rate: f64,
    pub swa_epochs: usize,
    pub map_sigma: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for MapTrainer {
    fn default() -> Self {
        Self::from_config(&TrainConfig::default())
    }
}

impl MapTrainer {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            swa_epochs: config.swa_epochs,
            map_sigma: config.map_sigma,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    fn objective(
        &self,
        network: &Network,
        configs: &[LayerConfig],
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
    ) -> Result<ModelGraph> {
        let policy = PriorPolicy::Isotropic { sigma: self.map_sigma };
        let mut mg = ModelGraph::new();
        let input = mg.graph.add_constant(x.to_owned());
        let two_head = network.topology == Topology::Mlp2Head;
        let obs = mg.graph.add_observed(y.to_owned());
        match build_dense_stack(&mut mg, input, configs, &policy, &Params::new(), two_head)? {
            StackOutput::Single(mu) => {
                let unit = mg.graph.add_scalar(1.0);
                mg.graph.normal_obs_logp(mu, unit, obs);
            }
            StackOutput::TwoHead { mean, variance } => {
                mg.graph.normal_obs_logp(mean, variance, obs);
            }
        }
        Ok(mg)
    }
}

impl DeterministicTrainer for MapTrainer {
    fn train(
        &self,
        network: &Network,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        epochs: usize,
        batch_size: Option<usize>,
        key: RngKey,
    ) -> Result<Params> {
        if network.topology == Topology::ConvNet {
            return Err(BnnError::InvalidConfig(
                "MAP pretraining supports dense networks only; supply pretrained weights".into(),
            ));
        }
        if x.nrows() != y.nrows() {
            return Err(BnnError::RowMismatch {
                x_rows: x.nrows(),
                y_rows: y.nrows(),
            });
        }
        if x.nrows() == 0 {
            return Err(BnnError::InvalidConfig("cannot pretrain on an empty dataset".into()));
        }
        let configs: Vec<LayerConfig> = network
            .dense_configs()?
            .into_iter()
            .map(|c| LayerConfig {
                is_probabilistic: true,
                ..c
            })
            .collect();

        let (init_key, shuffle_key) = key.split2();
        let full = self.objective(network, &configs, x, y)?;
        let mut q = full.unconstrain(&network.init_params(init_key)?)?;
        let dim = q.len();
        let mut m = vec![0.0; dim];
        let mut v = vec![0.0; dim];
        let mut t = 0i32;
        let mut swa = vec![0.0; dim];
        let mut swa_count = 0usize;
        let swa_start = epochs.saturating_sub(self.swa_epochs);

        let n = x.nrows();
        let bs = batch_size.unwrap_or(n).clamp(1, n);
        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = shuffle_key.to_rng();
        info!(
            "MAP pretraining {} network: {epochs} epochs, batch size {bs}, lr {}",
            network.topology, self.learning_rate
        );

        for epoch in 0..epochs {
            if bs < n {
                order.shuffle(&mut rng);
            }
            let mut epoch_loss = 0.0;
            for batch in order.chunks(bs) {
                let owned;
                let graph = if bs == n {
                    &full
                } else {
                    owned = self.objective(
                        network,
                        &configs,
                        x.select(Axis(0), batch).view(),
                        y.select(Axis(0), batch).view(),
                    )?;
                    &owned
                };
                let (logp, grad) = grad_logp(&graph.graph, &q);
                if !logp.is_finite() {
                    return Err(BnnError::InvalidConfig(format!(
                        "pretraining objective became non-finite at epoch {epoch}"
                    )));
                }
                epoch_loss -= logp;
                t += 1;
                let scale = 1.0 / batch.len() as f64;
                let c1 = 1.0 - self.beta1.powi(t);
                let c2 = 1.0 - self.beta2.powi(t);
                for i in 0..dim {
                    let g = -grad[i] * scale;
                    m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                    v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                    q[i] -= self.learning_rate * (m[i] / c1) / ((v[i] / c2).sqrt() + self.epsilon);
                }
            }
            if epoch >= swa_start {
                for (acc, &value) in swa.iter_mut().zip(&q) {
                    *acc += value;
                }
                swa_count += 1;
            }
            if epoch % 100 == 0 {
                debug!("epoch {epoch}: loss {:.4}", epoch_loss / n as f64);
            }
        }

        if swa_count > 0 {
            for (value, acc) in q.iter_mut().zip(&swa) {
                *value = acc / swa_count as f64;
            }
        }
        full.constrain(&q)
    }
}

/// Pretrain `network` with [`MapTrainer`] under `config`.
pub fn pretrain(
    network: &Network,
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    config: &TrainConfig,
    key: RngKey,
) -> Result<Params> {
    MapTrainer::from_config(config).train(network, x, y, config.epochs, config.batch_size, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Activation;
    use ndarray::Array2;

    fn linear_data(n: usize) -> (Array2<f64>, Array2<f64>) {
        let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / n as f64);
        let y = x.mapv(|v| 2.0 * v - 0.5);
        (x, y)
    }

    #[test]
    fn fits_a_line() {
        let (x, y) = linear_data(40);
        let net = Network::mlp(1, &[8], 1, Activation::Tanh);
        let config = TrainConfig {
            epochs: 400,
            map_sigma: 10.0,
            ..TrainConfig::default()
        };
        let params = pretrain(&net, x.view(), y.view(), &config, RngKey::new(0)).unwrap();
        net.check_params(&params).unwrap();
        let pred = net.apply(&params, x.view()).unwrap().into_single().unwrap();
        let mse = (&pred - &y).mapv(|r| r * r).mean().unwrap();
        assert!(mse < 0.05, "mse {mse}");
    }

    #[test]
    fn minibatches_and_two_heads() {
        let (x, y) = linear_data(30);
        let net = Network::mlp_2head(1, &[6], 1, Activation::Tanh);
        let config = TrainConfig {
            epochs: 20,
            batch_size: Some(8),
            ..TrainConfig::default()
        };
        let params = pretrain(&net, x.view(), y.view(), &config, RngKey::new(1)).unwrap();
        net.check_params(&params).unwrap();
        assert!(params.contains_key("VarianceHead.kernel"));
    }

    #[test]
    fn same_key_same_weights() {
        let (x, y) = linear_data(10);
        let net = Network::mlp(1, &[4], 1, Activation::Tanh);
        let config = TrainConfig {
            epochs: 15,
            batch_size: Some(3),
            ..TrainConfig::default()
        };
        let a = pretrain(&net, x.view(), y.view(), &config, RngKey::new(2)).unwrap();
        let b = pretrain(&net, x.view(), y.view(), &config, RngKey::new(2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn convnets_need_supplied_weights() {
        let (x, y) = linear_data(10);
        let net = Network::convnet(10, &[(2, 3)], &[4], 1, Activation::Relu);
        assert!(matches!(
            pretrain(&net, x.view(), y.view(), &TrainConfig::default(), RngKey::new(0)),
            Err(BnnError::InvalidConfig(_))
        ));
    }
}
