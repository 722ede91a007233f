//! Prior policies: which distribution each network parameter gets.

use crate::distributions::Prior;
use crate::error::{BnnError, Result};
use crate::nn::{self, Params};

/// Which tensor of a dense layer a prior is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Kernel,
    Bias,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamKind::Kernel => "kernel",
            ParamKind::Bias => "bias",
        }
    }
}

/// How priors over stochastic layer parameters are chosen.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PriorPolicy {
    /// Kernels ~ Normal(0, 1), biases ~ Cauchy(0, 1).
    #[default]
    Default,
    /// Kernels and biases ~ Normal(pretrained value, sigma).
    PretrainedCentered { params: Params, sigma: f64 },
    /// Everything ~ Normal(0, sigma); the regularizer of MAP pretraining.
    Isotropic { sigma: f64 },
}

impl PriorPolicy {
    pub fn pretrained(params: Params, sigma: f64) -> Self {
        PriorPolicy::PretrainedCentered { params, sigma }
    }

    /// Prior for `{layer}.{kind}` of the given shape.
    pub fn prior_for(&self, layer: &str, kind: ParamKind, shape: &[usize]) -> Result<Prior> {
        let prior = match self {
            PriorPolicy::Default => match kind {
                ParamKind::Kernel => Prior::normal(0.0, 1.0),
                ParamKind::Bias => Prior::cauchy(0.0, 1.0),
            },
            PriorPolicy::PretrainedCentered { params, sigma } => {
                let center = nn::lookup(params, layer, kind.as_str())?;
                if center.shape() != shape {
                    return Err(BnnError::shape(
                        format!("pretrained `{layer}.{}`", kind.as_str()),
                        format!("{shape:?}"),
                        center.shape(),
                    ));
                }
                Prior::normal_centered(center, *sigma)
            }
            PriorPolicy::Isotropic { sigma } => Prior::normal(0.0, *sigma),
        };
        prior.validate(shape)?;
        Ok(prior)
    }
}

/// Observation noise scale prior shared by the homoskedastic and multi-task models.
pub fn noise_prior() -> Prior {
    Prior::half_normal(1.0)
}

/// Hyperpriors of the Gaussian-process head.
#[derive(Debug, Clone, PartialEq)]
pub struct GpPriors {
    pub lengthscale: Prior,
    pub output_scale: Prior,
    pub noise: Prior,
}

impl Default for GpPriors {
    fn default() -> Self {
        Self {
            lengthscale: Prior::log_normal(0.0, 1.0),
            output_scale: Prior::log_normal(0.0, 1.0),
            noise: Prior::half_normal(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Activation, Network};
    use crate::rng::RngKey;

    #[test]
    fn default_policy_uses_cauchy_biases() {
        let p = PriorPolicy::Default;
        assert_eq!(
            p.prior_for("Dense0", ParamKind::Bias, &[3]).unwrap(),
            Prior::cauchy(0.0, 1.0)
        );
        assert_eq!(
            p.prior_for("Dense0", ParamKind::Kernel, &[2, 3]).unwrap(),
            Prior::normal(0.0, 1.0)
        );
    }

    #[test]
    fn centered_policy_samples_near_pretrained() {
        let net = Network::mlp(2, &[4], 1, Activation::Tanh);
        let params = net.init_params(RngKey::new(5)).unwrap();
        let policy = PriorPolicy::pretrained(params.clone(), 1e-6);
        let prior = policy.prior_for("Dense0", ParamKind::Kernel, &[2, 4]).unwrap();
        let mut rng = RngKey::new(0).to_rng();
        let draw = prior.sample(&mut rng, &[2, 4]).unwrap();
        for (a, b) in draw.iter().zip(params["Dense0.kernel"].iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn centered_policy_missing_layer_fails() {
        let policy = PriorPolicy::pretrained(Params::new(), 0.1);
        let err = policy.prior_for("Dense7", ParamKind::Bias, &[3]).unwrap_err();
        assert!(matches!(err, BnnError::MissingPretrained { ref layer, ref param }
            if layer == "Dense7" && param == "bias"));
    }
}
