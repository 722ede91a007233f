use crate::error::{BnnError, Result};
use crate::graph::{Graph, NodeId};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Cauchy, Distribution, LogNormal, Normal, StandardNormal};
use std::f64::consts::{PI, TAU};

/// Location of a prior: either one value for every element or one value per
/// element (pretrained-centered priors).
#[derive(Debug, Clone, PartialEq)]
pub enum Loc {
    Scalar(f64),
    Tensor { values: Vec<f64>, shape: Vec<usize> },
}

impl Loc {
    pub fn tensor(values: &ArrayD<f64>) -> Self {
        Loc::Tensor {
            values: values.iter().copied().collect(),
            shape: values.shape().to_vec(),
        }
    }

    #[inline]
    fn at(&self, i: usize) -> f64 {
        match self {
            Loc::Scalar(v) => *v,
            Loc::Tensor { values, .. } => values[i],
        }
    }
}

/// How a site's unconstrained sampler coordinate maps onto its support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    /// `x = exp(raw)`, Jacobian `log|dx/draw| = raw`.
    Exp,
}

impl Transform {
    pub fn forward(self, raw: f64) -> f64 {
        match self {
            Transform::Identity => raw,
            Transform::Exp => raw.exp(),
        }
    }

    pub fn inverse(self, x: f64) -> f64 {
        match self {
            Transform::Identity => x,
            Transform::Exp => x.max(f64::MIN_POSITIVE).ln(),
        }
    }
}

/// An immutable prior distribution over every element of one parameter tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Prior {
    Normal { loc: Loc, scale: f64 },
    Cauchy { loc: Loc, scale: f64 },
    HalfNormal { scale: f64 },
    LogNormal { loc: f64, scale: f64 },
}

impl Prior {
    pub fn normal(loc: f64, scale: f64) -> Self {
        Prior::Normal {
            loc: Loc::Scalar(loc),
            scale,
        }
    }

    /// Normal prior centered element-wise on `values`.
    pub fn normal_centered(values: &ArrayD<f64>, scale: f64) -> Self {
        Prior::Normal {
            loc: Loc::tensor(values),
            scale,
        }
    }

    pub fn cauchy(loc: f64, scale: f64) -> Self {
        Prior::Cauchy {
            loc: Loc::Scalar(loc),
            scale,
        }
    }

    pub fn half_normal(scale: f64) -> Self {
        Prior::HalfNormal { scale }
    }

    pub fn log_normal(loc: f64, scale: f64) -> Self {
        Prior::LogNormal { loc, scale }
    }

    pub fn transform(&self) -> Transform {
        match self {
            Prior::Normal { .. } | Prior::Cauchy { .. } => Transform::Identity,
            Prior::HalfNormal { .. } | Prior::LogNormal { .. } => Transform::Exp,
        }
    }

    fn scale(&self) -> f64 {
        match self {
            Prior::Normal { scale, .. }
            | Prior::Cauchy { scale, .. }
            | Prior::HalfNormal { scale }
            | Prior::LogNormal { scale, .. } => *scale,
        }
    }

    /// Check the scale and, for tensor locations, that the shapes agree.
    pub fn validate(&self, shape: &[usize]) -> Result<()> {
        let scale = self.scale();
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(BnnError::InvalidConfig(format!(
                "prior scale must be positive and finite, got {scale}"
            )));
        }
        if let Prior::Normal {
            loc: Loc::Tensor { shape: loc_shape, .. },
            ..
        }
        | Prior::Cauchy {
            loc: Loc::Tensor { shape: loc_shape, .. },
            ..
        } = self
        {
            if loc_shape.as_slice() != shape {
                return Err(BnnError::shape("prior location", format!("{shape:?}"), loc_shape));
            }
        }
        Ok(())
    }

    /// Draw one tensor of the given shape.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, shape: &[usize]) -> Result<ArrayD<f64>> {
        self.validate(shape)?;
        let n: usize = shape.iter().product();
        let values: Vec<f64> = match self {
            Prior::Normal { loc, scale } => (0..n)
                .map(|i| {
                    let z: f64 = StandardNormal.sample(rng);
                    loc.at(i) + scale * z
                })
                .collect(),
            Prior::Cauchy { loc, scale } => {
                let dist = Cauchy::new(0.0, *scale).map_err(invalid)?;
                (0..n).map(|i| loc.at(i) + dist.sample(rng)).collect()
            }
            Prior::HalfNormal { scale } => {
                let dist = Normal::new(0.0, *scale).map_err(invalid)?;
                (0..n).map(|_| dist.sample(rng).abs()).collect()
            }
            Prior::LogNormal { loc, scale } => {
                let dist = LogNormal::new(*loc, *scale).map_err(invalid)?;
                (0..n).map(|_| dist.sample(rng)).collect()
            }
        };
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| BnnError::InvalidConfig(format!("prior sample shape: {e}")))
    }

    /// Log-density of element `i` at constrained value `x`.
    pub fn log_prob_elem(&self, i: usize, x: f64) -> f64 {
        match self {
            Prior::Normal { loc, scale } => {
                let d = (x - loc.at(i)) / scale;
                -0.5 * d * d - scale.ln() - 0.5 * TAU.ln()
            }
            Prior::Cauchy { loc, scale } => {
                let d = (x - loc.at(i)) / scale;
                -(PI * scale).ln() - (1.0 + d * d).ln()
            }
            Prior::HalfNormal { scale } => {
                if x < 0.0 {
                    return f64::NEG_INFINITY;
                }
                let d = x / scale;
                0.5 * (2.0 / PI).ln() - scale.ln() - 0.5 * d * d
            }
            Prior::LogNormal { loc, scale } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let d = (x.ln() - loc) / scale;
                -0.5 * d * d - x.ln() - scale.ln() - 0.5 * TAU.ln()
            }
        }
    }

    /// `d log p / d x` of element `i`.
    pub fn grad_elem(&self, i: usize, x: f64) -> f64 {
        match self {
            Prior::Normal { loc, scale } => -(x - loc.at(i)) / (scale * scale),
            Prior::Cauchy { loc, scale } => {
                let d = x - loc.at(i);
                -2.0 * d / (scale * scale + d * d)
            }
            Prior::HalfNormal { scale } => -x / (scale * scale),
            Prior::LogNormal { loc, scale } => {
                let lx = x.ln();
                -(lx - loc) / (scale * scale * x) - 1.0 / x
            }
        }
    }

    pub fn log_prob(&self, x: &ArrayD<f64>) -> f64 {
        x.iter()
            .enumerate()
            .map(|(i, &v)| self.log_prob_elem(i, v))
            .sum()
    }

    /// Register a random site of the given shape in `graph` under this prior.
    ///
    /// Returns the node holding the constrained value. Positive-support priors
    /// are sampled in log space and contribute their Jacobian term.
    pub fn register(&self, graph: &mut Graph, name: &str, shape: &[usize]) -> Result<NodeId> {
        self.validate(shape)?;
        let (rows, cols) = matrix_dims(shape)?;
        match self.transform() {
            Transform::Identity => {
                let param = graph.add_param(name, rows, cols);
                graph.prior_logp(param, self.clone());
                Ok(param)
            }
            Transform::Exp => {
                let raw = graph.add_param(name, rows, cols);
                let x = graph.exp(raw);
                graph.prior_logp(x, self.clone());
                let jacobian = graph.sum(raw);
                graph.add_logp_term(jacobian);
                Ok(x)
            }
        }
    }
}

fn invalid<E: std::fmt::Display>(e: E) -> BnnError {
    BnnError::InvalidConfig(format!("prior parameters: {e}"))
}

/// The 2-D layout a site of the given shape takes inside the graph.
pub(crate) fn matrix_dims(shape: &[usize]) -> Result<(usize, usize)> {
    match shape {
        [] => Ok((1, 1)),
        [k] => Ok((1, *k)),
        [r, c] => Ok((*r, *c)),
        _ => Err(BnnError::shape("random site", "rank <= 2", shape)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::RngKey;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn samples_have_declared_shape() {
        let mut rng = RngKey::new(0).to_rng();
        let priors = [
            Prior::normal(0.0, 1.0),
            Prior::cauchy(0.0, 1.0),
            Prior::half_normal(1.0),
            Prior::log_normal(0.0, 1.0),
        ];
        for prior in &priors {
            for shape in [vec![], vec![4], vec![3, 5]] {
                let s = prior.sample(&mut rng, &shape).unwrap();
                assert_eq!(s.shape(), shape.as_slice());
            }
        }
    }

    #[test]
    fn positive_priors_sample_positive() {
        let mut rng = RngKey::new(3).to_rng();
        let s = Prior::half_normal(2.0).sample(&mut rng, &[200]).unwrap();
        assert!(s.iter().all(|&v| v >= 0.0));
        let s = Prior::log_normal(0.0, 1.0).sample(&mut rng, &[200]).unwrap();
        assert!(s.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn centered_prior_requires_matching_shape() {
        let center = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let prior = Prior::normal_centered(&center, 0.1);
        let mut rng = RngKey::new(1).to_rng();
        assert!(prior.sample(&mut rng, &[2, 2]).is_ok());
        assert!(prior.sample(&mut rng, &[4]).is_err());
    }

    #[test]
    fn log_prob_gradients_match_finite_differences() {
        let priors = [
            Prior::normal(0.3, 1.5),
            Prior::cauchy(-0.2, 0.7),
            Prior::half_normal(1.2),
            Prior::log_normal(0.1, 0.8),
        ];
        let eps = 1e-6;
        for prior in &priors {
            let x = 0.9;
            let fd = (prior.log_prob_elem(0, x + eps) - prior.log_prob_elem(0, x - eps)) / (2.0 * eps);
            assert_abs_diff_eq!(prior.grad_elem(0, x), fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn normal_log_prob_value() {
        let p = Prior::normal(0.0, 1.0);
        assert_abs_diff_eq!(p.log_prob_elem(0, 0.0), -0.5 * TAU.ln(), epsilon = 1e-12);
        let x = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0);
        assert_abs_diff_eq!(p.log_prob(&x), 4.0 * (-0.5 - 0.5 * TAU.ln()), epsilon = 1e-12);
    }

    #[test]
    fn invalid_scale_rejected() {
        let mut rng = RngKey::new(0).to_rng();
        assert!(Prior::normal(0.0, -1.0).sample(&mut rng, &[2]).is_err());
    }
}
