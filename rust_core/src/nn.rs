//! Network architectures and their deterministic forward pass.
//!
//! A [`Network`] is a plain description (topology tag + ordered layers); the
//! parameters live separately in a [`Params`] dictionary keyed
//! `"{layer}.kernel"` / `"{layer}.bias"`. The same architecture is evaluated
//! here with fixed parameters (frozen prefixes, predictions) and inside the
//! model graph with random parameters.

use crate::error::{BnnError, Result};
use crate::rng::RngKey;
use ndarray::{Array2, ArrayD, ArrayView2, Ix1, Ix2, Ix3, IxDyn};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Parameter dictionary: `"{layer}.{kernel|bias}"` -> tensor.
pub type Params = BTreeMap<String, ArrayD<f64>>;

pub fn kernel_key(layer: &str) -> String {
    format!("{layer}.kernel")
}

pub fn bias_key(layer: &str) -> String {
    format!("{layer}.bias")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Identity,
    Tanh,
    Relu,
    Silu,
    Sigmoid,
    Softplus,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
            Activation::Silu => x * sigmoid(x),
            Activation::Sigmoid => sigmoid(x),
            Activation::Softplus => x.max(0.0) + (-x.abs()).exp().ln_1p(),
        }
    }

    /// Derivative given the input `x` and the already computed output `y`.
    #[inline]
    pub fn derivative(self, x: f64, y: f64) -> f64 {
        match self {
            Activation::Identity => 1.0,
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Silu => {
                let s = sigmoid(x);
                s * (1.0 + x * (1.0 - s))
            }
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Softplus => sigmoid(x),
        }
    }
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl FromStr for Activation {
    type Err = BnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "identity" | "linear" | "none" => Ok(Activation::Identity),
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::Silu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "softplus" => Ok(Activation::Softplus),
            other => Err(BnnError::InvalidConfig(format!("unknown activation `{other}`"))),
        }
    }
}

/// Tag naming the family a network belongs to; used to look up its splitting rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topology {
    /// Plain feed-forward stack with one output layer.
    Mlp,
    /// Shared dense trunk followed by a mean head and a variance head.
    Mlp2Head,
    /// 1-D convolutions followed by dense layers.
    ConvNet,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topology::Mlp => "mlp",
            Topology::Mlp2Head => "mlp-2head",
            Topology::ConvNet => "convnet",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Dense { features: usize },
    /// Valid-padding, stride-1 convolution over a single spatial axis.
    Conv1d { features: usize, kernel_size: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    pub activation: Activation,
}

impl LayerSpec {
    pub fn dense(name: impl Into<String>, features: usize, activation: Activation) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Dense { features },
            activation,
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.kind, LayerKind::Dense { .. })
    }
}

/// One dense layer as seen by a probabilistic model.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub layer_name: String,
    pub in_features: usize,
    pub features: usize,
    pub activation: Activation,
    pub is_probabilistic: bool,
}

impl LayerConfig {
    pub fn kernel_shape(&self) -> [usize; 2] {
        [self.in_features, self.features]
    }
}

/// Shapes of one layer's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamShapes {
    pub kernel: Vec<usize>,
    pub bias: Vec<usize>,
}

#[derive(Debug, Clone)]
pub enum NetworkOutput {
    Single(Array2<f64>),
    TwoHead {
        mean: Array2<f64>,
        variance: Array2<f64>,
    },
}

impl NetworkOutput {
    pub fn into_single(self) -> Result<Array2<f64>> {
        match self {
            NetworkOutput::Single(out) => Ok(out),
            NetworkOutput::TwoHead { .. } => Err(BnnError::InvalidConfig(
                "expected a single-output network, got a two-head network".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub topology: Topology,
    /// Feature width of a row of `X` (sequence length for convolutional nets).
    pub input_dim: usize,
    pub layers: Vec<LayerSpec>,
}

impl Network {
    /// `Dense0..DenseN`, hidden layers use `activation`, the output layer is linear.
    pub fn mlp(input_dim: usize, hidden: &[usize], output_dim: usize, activation: Activation) -> Self {
        let mut layers: Vec<LayerSpec> = hidden
            .iter()
            .enumerate()
            .map(|(i, &h)| LayerSpec::dense(format!("Dense{i}"), h, activation))
            .collect();
        layers.push(LayerSpec::dense(
            format!("Dense{}", hidden.len()),
            output_dim,
            Activation::Identity,
        ));
        Self {
            topology: Topology::Mlp,
            input_dim,
            layers,
        }
    }

    /// Shared trunk `Dense0..` plus `MeanHead` (linear) and `VarianceHead` (softplus).
    pub fn mlp_2head(input_dim: usize, hidden: &[usize], output_dim: usize, activation: Activation) -> Self {
        let mut layers: Vec<LayerSpec> = hidden
            .iter()
            .enumerate()
            .map(|(i, &h)| LayerSpec::dense(format!("Dense{i}"), h, activation))
            .collect();
        layers.push(LayerSpec::dense("MeanHead", output_dim, Activation::Identity));
        layers.push(LayerSpec::dense("VarianceHead", output_dim, Activation::Softplus));
        Self {
            topology: Topology::Mlp2Head,
            input_dim,
            layers,
        }
    }

    /// `Conv0..` over a single-channel sequence of length `input_len`, then a dense stack.
    pub fn convnet(
        input_len: usize,
        conv: &[(usize, usize)],
        hidden: &[usize],
        output_dim: usize,
        activation: Activation,
    ) -> Self {
        let mut layers: Vec<LayerSpec> = conv
            .iter()
            .enumerate()
            .map(|(i, &(features, kernel_size))| LayerSpec {
                name: format!("Conv{i}"),
                kind: LayerKind::Conv1d {
                    features,
                    kernel_size,
                },
                activation,
            })
            .collect();
        let mlp = Network::mlp(0, hidden, output_dim, activation);
        layers.extend(mlp.layers);
        Self {
            topology: Topology::ConvNet,
            input_dim: input_len,
            layers,
        }
    }

    /// Index of the first layer belonging to the heads (two-head nets only).
    pub(crate) fn head_start(&self) -> usize {
        match self.topology {
            Topology::Mlp2Head => self.layers.len().saturating_sub(2),
            _ => self.layers.len(),
        }
    }

    /// Parameter shapes for every layer, checking that widths chain.
    pub fn param_shapes(&self) -> Result<Vec<ParamShapes>> {
        if self.layers.is_empty() {
            return Err(BnnError::InvalidConfig("network has no layers".into()));
        }
        let head_start = self.head_start();
        if self.topology == Topology::Mlp2Head && self.layers.len() < 2 {
            return Err(BnnError::InvalidConfig("two-head network needs two head layers".into()));
        }
        let mut shapes = Vec::with_capacity(self.layers.len());
        // (length, channels) while convolving; (1, width) once flattened.
        let mut length = self.input_dim;
        let mut channels = 1usize;
        let mut flat: Option<usize> = None;
        let mut trunk_width = 0usize;
        for (i, layer) in self.layers.iter().enumerate() {
            match layer.kind {
                LayerKind::Conv1d {
                    features,
                    kernel_size,
                } => {
                    if flat.is_some() || self.topology != Topology::ConvNet {
                        return Err(BnnError::InvalidConfig(format!(
                            "convolution `{}` must precede all dense layers of a convnet",
                            layer.name
                        )));
                    }
                    if kernel_size == 0 || kernel_size > length {
                        return Err(BnnError::DimensionMismatch {
                            context: format!("kernel of `{}`", layer.name),
                            expected: length,
                            got: kernel_size,
                        });
                    }
                    shapes.push(ParamShapes {
                        kernel: vec![kernel_size, channels, features],
                        bias: vec![features],
                    });
                    length = length - kernel_size + 1;
                    channels = features;
                }
                LayerKind::Dense { features } => {
                    if features == 0 {
                        return Err(BnnError::InvalidConfig(format!(
                            "layer `{}` has zero features",
                            layer.name
                        )));
                    }
                    let in_width = if i > head_start {
                        trunk_width
                    } else {
                        *flat.get_or_insert(length * channels)
                    };
                    if i == head_start {
                        trunk_width = in_width;
                    }
                    shapes.push(ParamShapes {
                        kernel: vec![in_width, features],
                        bias: vec![features],
                    });
                    if i < head_start {
                        flat = Some(features);
                    }
                }
            }
        }
        if flat.is_none() && self.topology != Topology::Mlp2Head {
            return Err(BnnError::InvalidConfig("network has no dense output layer".into()));
        }
        Ok(shapes)
    }

    /// Dense-layer view of the network (convolutions excluded).
    pub fn dense_configs(&self) -> Result<Vec<LayerConfig>> {
        let shapes = self.param_shapes()?;
        Ok(self
            .layers
            .iter()
            .zip(shapes)
            .filter_map(|(layer, shape)| match layer.kind {
                LayerKind::Dense { features } => Some(LayerConfig {
                    layer_name: layer.name.clone(),
                    in_features: shape.kernel[0],
                    features,
                    activation: layer.activation,
                    is_probabilistic: false,
                }),
                LayerKind::Conv1d { .. } => None,
            })
            .collect())
    }

    /// Check that `params` holds every layer with the expected shapes.
    pub fn check_params(&self, params: &Params) -> Result<()> {
        for (layer, shape) in self.layers.iter().zip(self.param_shapes()?) {
            check_param(params, &layer.name, "kernel", &shape.kernel)?;
            check_param(params, &layer.name, "bias", &shape.bias)?;
        }
        Ok(())
    }

    /// Random initial parameters (scaled normal kernels, zero biases).
    pub fn init_params(&self, key: RngKey) -> Result<Params> {
        let mut params = Params::new();
        for ((i, layer), shape) in self.layers.iter().enumerate().zip(self.param_shapes()?) {
            let mut rng = key.fold_in(i as u64).to_rng();
            let fan_in: usize = shape.kernel[..shape.kernel.len() - 1].iter().product();
            let fan_out = shape.kernel[shape.kernel.len() - 1];
            let std = (2.0 / (fan_in + fan_out) as f64).sqrt();
            let n: usize = shape.kernel.iter().product();
            let values: Vec<f64> = (0..n)
                .map(|_| {
                    let z: f64 = StandardNormal.sample(&mut rng);
                    z * std
                })
                .collect();
            let kernel = ArrayD::from_shape_vec(IxDyn(&shape.kernel), values)
                .map_err(|e| BnnError::InvalidConfig(format!("kernel init: {e}")))?;
            params.insert(kernel_key(&layer.name), kernel);
            params.insert(bias_key(&layer.name), ArrayD::zeros(IxDyn(&shape.bias)));
        }
        Ok(params)
    }

    /// Deterministic forward pass.
    pub fn apply(&self, params: &Params, x: ArrayView2<f64>) -> Result<NetworkOutput> {
        if x.ncols() != self.input_dim {
            return Err(BnnError::DimensionMismatch {
                context: "network input".into(),
                expected: self.input_dim,
                got: x.ncols(),
            });
        }
        let head_start = self.head_start();
        let mut h = x.to_owned();
        let mut channels = 1usize;
        for layer in &self.layers[..head_start] {
            h = apply_layer(params, layer, h.view(), &mut channels)?;
        }
        match self.topology {
            Topology::Mlp2Head => {
                let mean = dense_forward(params, &self.layers[head_start], h.view())?;
                let variance = dense_forward(params, &self.layers[head_start + 1], h.view())?;
                Ok(NetworkOutput::TwoHead { mean, variance })
            }
            _ => Ok(NetworkOutput::Single(h)),
        }
    }
}

pub(crate) fn apply_layer(
    params: &Params,
    layer: &LayerSpec,
    x: ArrayView2<f64>,
    channels: &mut usize,
) -> Result<Array2<f64>> {
    match layer.kind {
        LayerKind::Dense { .. } => dense_forward(params, layer, x),
        LayerKind::Conv1d { features, .. } => {
            let out = conv1d_forward(params, layer, x, *channels)?;
            *channels = features;
            Ok(out)
        }
    }
}

fn check_param(params: &Params, layer: &str, which: &str, shape: &[usize]) -> Result<()> {
    let key = format!("{layer}.{which}");
    let value = params.get(&key).ok_or_else(|| BnnError::MissingPretrained {
        layer: layer.to_string(),
        param: which.to_string(),
    })?;
    if value.shape() != shape {
        return Err(BnnError::shape(key, format!("{shape:?}"), value.shape()));
    }
    Ok(())
}

pub(crate) fn lookup<'a>(params: &'a Params, layer: &str, which: &str) -> Result<&'a ArrayD<f64>> {
    params
        .get(&format!("{layer}.{which}"))
        .ok_or_else(|| BnnError::MissingPretrained {
            layer: layer.to_string(),
            param: which.to_string(),
        })
}

fn as_matrix(value: &ArrayD<f64>, key: &str) -> Result<Array2<f64>> {
    value
        .view()
        .into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|_| BnnError::shape(key, "rank 2", value.shape()))
}

fn as_row(value: &ArrayD<f64>, key: &str) -> Result<Array2<f64>> {
    value
        .view()
        .into_dimensionality::<Ix1>()
        .map(|v| v.to_owned().insert_axis(ndarray::Axis(0)))
        .map_err(|_| BnnError::shape(key, "rank 1", value.shape()))
}

/// `activation(x · kernel + bias)` for one dense layer.
pub fn dense_forward(params: &Params, layer: &LayerSpec, x: ArrayView2<f64>) -> Result<Array2<f64>> {
    dense_apply(params, &layer.name, layer.activation, x)
}

pub(crate) fn dense_apply(
    params: &Params,
    name: &str,
    activation: Activation,
    x: ArrayView2<f64>,
) -> Result<Array2<f64>> {
    let kernel = as_matrix(lookup(params, name, "kernel")?, &kernel_key(name))?;
    let bias = as_row(lookup(params, name, "bias")?, &bias_key(name))?;
    if kernel.nrows() != x.ncols() {
        return Err(BnnError::DimensionMismatch {
            context: format!("input of `{name}`"),
            expected: kernel.nrows(),
            got: x.ncols(),
        });
    }
    if bias.ncols() != kernel.ncols() {
        return Err(BnnError::DimensionMismatch {
            context: format!("bias of `{name}`"),
            expected: kernel.ncols(),
            got: bias.ncols(),
        });
    }
    let mut out = x.dot(&kernel) + &bias;
    if activation != Activation::Identity {
        out.mapv_inplace(|v| activation.apply(v));
    }
    Ok(out)
}

/// Forward pass of a stack of dense layer configs (the stochastic part of a
/// partial network) with fixed parameters. For two-head stacks pass
/// `two_head = true`: the last two configs are applied to the trunk output.
pub fn apply_dense_stack(
    configs: &[LayerConfig],
    params: &Params,
    x: ArrayView2<f64>,
    two_head: bool,
) -> Result<NetworkOutput> {
    let trunk_end = if two_head {
        configs.len().checked_sub(2).ok_or_else(|| {
            BnnError::InvalidConfig("two-head stack needs at least two layers".into())
        })?
    } else {
        configs.len()
    };
    let mut h = x.to_owned();
    for cfg in &configs[..trunk_end] {
        h = dense_apply(params, &cfg.layer_name, cfg.activation, h.view())?;
    }
    if two_head {
        let mean_cfg = &configs[trunk_end];
        let var_cfg = &configs[trunk_end + 1];
        let mean = dense_apply(params, &mean_cfg.layer_name, mean_cfg.activation, h.view())?;
        let variance = dense_apply(params, &var_cfg.layer_name, var_cfg.activation, h.view())?;
        Ok(NetworkOutput::TwoHead { mean, variance })
    } else {
        Ok(NetworkOutput::Single(h))
    }
}

/// Rows are flattened `[position, channel]` sequences; the output uses the
/// same layout with `features` channels and `length - kernel_size + 1` positions.
fn conv1d_forward(
    params: &Params,
    layer: &LayerSpec,
    x: ArrayView2<f64>,
    in_channels: usize,
) -> Result<Array2<f64>> {
    let name = &layer.name;
    let kernel_d = lookup(params, name, "kernel")?;
    let kernel = kernel_d
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| BnnError::shape(kernel_key(name), "rank 3", kernel_d.shape()))?;
    let bias_d = lookup(params, name, "bias")?;
    let bias = bias_d
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| BnnError::shape(bias_key(name), "rank 1", bias_d.shape()))?;
    let (k, c_in, c_out) = kernel.dim();
    if c_in != in_channels || x.ncols() % c_in != 0 {
        return Err(BnnError::DimensionMismatch {
            context: format!("channels of `{name}`"),
            expected: c_in,
            got: in_channels,
        });
    }
    let length = x.ncols() / c_in;
    if k > length {
        return Err(BnnError::DimensionMismatch {
            context: format!("kernel of `{name}`"),
            expected: length,
            got: k,
        });
    }
    let out_len = length - k + 1;
    let act = layer.activation;
    Ok(Array2::from_shape_fn((x.nrows(), out_len * c_out), |(row, col)| {
        let pos = col / c_out;
        let f = col % c_out;
        let mut acc = bias[f];
        for dk in 0..k {
            for c in 0..c_in {
                acc += x[[row, (pos + dk) * c_in + c]] * kernel[[dk, c, f]];
            }
        }
        act.apply(acc)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn mlp_shapes_chain() {
        let net = Network::mlp(3, &[8, 4], 2, Activation::Tanh);
        let shapes = net.param_shapes().unwrap();
        assert_eq!(shapes[0].kernel, vec![3, 8]);
        assert_eq!(shapes[1].kernel, vec![8, 4]);
        assert_eq!(shapes[2].kernel, vec![4, 2]);
        assert_eq!(shapes[2].bias, vec![2]);
    }

    #[test]
    fn two_head_heads_share_trunk_width() {
        let net = Network::mlp_2head(2, &[6, 5], 1, Activation::Relu);
        let shapes = net.param_shapes().unwrap();
        assert_eq!(shapes[2].kernel, vec![5, 1]);
        assert_eq!(shapes[3].kernel, vec![5, 1]);
    }

    #[test]
    fn convnet_flattens_into_dense() {
        let net = Network::convnet(10, &[(4, 3), (2, 2)], &[5], 1, Activation::Relu);
        let shapes = net.param_shapes().unwrap();
        assert_eq!(shapes[0].kernel, vec![3, 1, 4]);
        assert_eq!(shapes[1].kernel, vec![2, 4, 2]);
        // length 10 -> 8 -> 7, 2 channels
        assert_eq!(shapes[2].kernel, vec![14, 5]);
        let params = net.init_params(RngKey::new(0)).unwrap();
        let x = Array2::from_shape_fn((3, 10), |(i, j)| (i + j) as f64 * 0.1);
        let out = net.apply(&params, x.view()).unwrap().into_single().unwrap();
        assert_eq!(out.dim(), (3, 1));
    }

    #[test]
    fn dense_forward_matches_hand_computation() {
        let net = Network::mlp(2, &[], 1, Activation::Tanh);
        let mut params = Params::new();
        params.insert("Dense0.kernel".into(), array![[2.0], [-1.0]].into_dyn());
        params.insert("Dense0.bias".into(), array![0.5].into_dyn());
        let out = net
            .apply(&params, array![[1.0, 3.0]].view())
            .unwrap()
            .into_single()
            .unwrap();
        assert_abs_diff_eq!(out[[0, 0]], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn missing_param_reported() {
        let net = Network::mlp(2, &[3], 1, Activation::Tanh);
        let mut params = net.init_params(RngKey::new(1)).unwrap();
        params.remove("Dense1.bias");
        assert!(matches!(
            net.check_params(&params),
            Err(BnnError::MissingPretrained { ref layer, .. }) if layer == "Dense1"
        ));
    }

    #[test]
    fn input_width_checked() {
        let net = Network::mlp(2, &[3], 1, Activation::Tanh);
        let params = net.init_params(RngKey::new(1)).unwrap();
        let x = Array2::<f64>::zeros((4, 3));
        assert!(matches!(
            net.apply(&params, x.view()),
            Err(BnnError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn softplus_is_positive_and_stable() {
        for x in [-800.0, -5.0, 0.0, 5.0, 800.0] {
            let y = Activation::Softplus.apply(x);
            assert!(y >= 0.0 && y.is_finite());
        }
    }
}
