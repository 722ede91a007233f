//! Partial-network splitting.
//!
//! A pretrained network is cut into a frozen prefix (applied with its
//! pretrained parameters captured by value) and a stochastic suffix described
//! by [`LayerConfig`]s. Each [`Topology`] registers its own rule in a
//! [`SplitterRegistry`]; asking for an unregistered topology fails at lookup.

use crate::error::{BnnError, Result};
use crate::nn::{self, LayerConfig, LayerKind, LayerSpec, Network, Params, Topology};
use log::debug;
use ndarray::{Array2, ArrayView2};
use std::collections::{BTreeMap, BTreeSet};

/// Which layers become stochastic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Boundary {
    /// The last `k` eligible layers.
    Count(usize),
    /// Exactly the named layers.
    Names(BTreeSet<String>),
}

impl Boundary {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Boundary::Names(names.into_iter().map(Into::into).collect())
    }
}

/// The frozen part of a partial network.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenPrefix {
    input_dim: usize,
    output_dim: usize,
    layers: Vec<LayerSpec>,
    params: Params,
}

impl FrozenPrefix {
    /// A prefix with no layers; `apply` returns its input.
    pub fn identity(input_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim: input_dim,
            layers: Vec::new(),
            params: Params::new(),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run the frozen layers. Pure: same inputs give bit-identical outputs.
    pub fn apply(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.input_dim {
            return Err(BnnError::DimensionMismatch {
                context: "frozen prefix input".into(),
                expected: self.input_dim,
                got: x.ncols(),
            });
        }
        let mut h = x.to_owned();
        let mut channels = 1;
        for layer in &self.layers {
            h = nn::apply_layer(&self.params, layer, h.view(), &mut channels)?;
        }
        Ok(h)
    }
}

/// Result of a split: `forward = stochastic ∘ frozen`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialNetwork {
    pub topology: Topology,
    pub frozen: FrozenPrefix,
    pub stochastic: Vec<LayerConfig>,
    /// Pretrained values of the stochastic layers (for centered priors).
    pub pretrained: Params,
    pub two_head: bool,
}

impl PartialNetwork {
    pub fn output_dim(&self) -> usize {
        self.stochastic.last().map_or(0, |c| c.features)
    }
}

pub type SplitFn = fn(&Network, &Params, &Boundary, Option<usize>) -> Result<PartialNetwork>;
pub type LayerConfigFn = fn(&Network, &Boundary) -> Result<Vec<LayerConfig>>;

/// Splitting behaviour of one topology.
#[derive(Debug, Clone, Copy)]
pub struct TopologyRule {
    pub split: SplitFn,
    pub layer_configs: LayerConfigFn,
}

/// Closed map from topology tag to its rule.
#[derive(Debug, Clone)]
pub struct SplitterRegistry {
    rules: BTreeMap<Topology, TopologyRule>,
}

impl SplitterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `Mlp`, `Mlp2Head` and `ConvNet` rules.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            Topology::Mlp,
            TopologyRule {
                split: split_trailing,
                layer_configs: trailing_configs,
            },
        );
        registry.register(
            Topology::Mlp2Head,
            TopologyRule {
                split: split_mlp2head,
                layer_configs: mlp2head_configs,
            },
        );
        registry.register(
            Topology::ConvNet,
            TopologyRule {
                split: split_trailing,
                layer_configs: trailing_configs,
            },
        );
        registry
    }

    pub fn register(&mut self, topology: Topology, rule: TopologyRule) {
        self.rules.insert(topology, rule);
    }

    pub fn rule(&self, topology: Topology) -> Result<&TopologyRule> {
        self.rules
            .get(&topology)
            .ok_or_else(|| BnnError::UnsupportedTopology(topology.to_string()))
    }

    pub fn split(&self, network: &Network, pretrained: &Params, boundary: &Boundary) -> Result<PartialNetwork> {
        (self.rule(network.topology)?.split)(network, pretrained, boundary, None)
    }

    /// Split and replace the width of the last stochastic layer by `latent_dim`.
    pub fn split_with_latent(
        &self,
        network: &Network,
        pretrained: &Params,
        boundary: &Boundary,
        latent_dim: usize,
    ) -> Result<PartialNetwork> {
        (self.rule(network.topology)?.split)(network, pretrained, boundary, Some(latent_dim))
    }

    pub fn layer_configs(&self, network: &Network, boundary: &Boundary) -> Result<Vec<LayerConfig>> {
        (self.rule(network.topology)?.layer_configs)(network, boundary)
    }
}

impl Default for SplitterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// MLPs and conv nets both split at a trailing block of layers.
fn trailing_configs(network: &Network, boundary: &Boundary) -> Result<Vec<LayerConfig>> {
    configs_from_mask(network, &trailing_mask(network, boundary)?)
}

fn mlp2head_configs(network: &Network, boundary: &Boundary) -> Result<Vec<LayerConfig>> {
    configs_from_mask(network, &two_head_mask(network, boundary)?)
}

fn split_trailing(
    network: &Network,
    pretrained: &Params,
    boundary: &Boundary,
    latent: Option<usize>,
) -> Result<PartialNetwork> {
    let mask = trailing_mask(network, boundary)?;
    split_at_mask(network, pretrained, &mask, latent)
}

fn split_mlp2head(
    network: &Network,
    pretrained: &Params,
    boundary: &Boundary,
    latent: Option<usize>,
) -> Result<PartialNetwork> {
    if latent.is_some() {
        return Err(BnnError::InvalidConfig(
            "a latent output width cannot be applied to a two-head network".into(),
        ));
    }
    let mask = two_head_mask(network, boundary)?;
    split_at_mask(network, pretrained, &mask, None)
}

fn expect_topology(network: &Network, topology: Topology) -> Result<()> {
    if network.topology != topology {
        return Err(BnnError::UnsupportedTopology(network.topology.to_string()));
    }
    Ok(())
}

/// Mask over all layers for topologies whose stochastic part is a dense suffix.
fn trailing_mask(network: &Network, boundary: &Boundary) -> Result<Vec<bool>> {
    if network.topology == Topology::Mlp2Head {
        return Err(BnnError::UnsupportedTopology(network.topology.to_string()));
    }
    let dense: Vec<usize> = network
        .layers
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_dense())
        .map(|(i, _)| i)
        .collect();
    let mut mask = vec![false; network.layers.len()];
    match boundary {
        Boundary::Count(k) => {
            if *k == 0 || *k > dense.len() {
                return Err(BnnError::InvalidBoundary(format!(
                    "{k} stochastic layers requested, network has {} dense layers",
                    dense.len()
                )));
            }
            for &i in &dense[dense.len() - k..] {
                mask[i] = true;
            }
        }
        Boundary::Names(names) => mark_names(network, names, &mut mask)?,
    }
    Ok(mask)
}

fn two_head_mask(network: &Network, boundary: &Boundary) -> Result<Vec<bool>> {
    expect_topology(network, Topology::Mlp2Head)?;
    let n = network.layers.len();
    let head_start = network.head_start();
    let mut mask = vec![false; n];
    match boundary {
        Boundary::Count(k) => {
            if *k == 0 || k - 1 > head_start {
                return Err(BnnError::InvalidBoundary(format!(
                    "{k} stochastic layers requested, network has {head_start} trunk layers plus two heads"
                )));
            }
            for m in mask[head_start + 1 - k..].iter_mut() {
                *m = true;
            }
        }
        Boundary::Names(names) => mark_names(network, names, &mut mask)?,
    }
    Ok(mask)
}

fn mark_names(network: &Network, names: &BTreeSet<String>, mask: &mut [bool]) -> Result<()> {
    if names.is_empty() {
        return Err(BnnError::InvalidBoundary("no stochastic layer names given".into()));
    }
    for name in names {
        let idx = network
            .layers
            .iter()
            .position(|l| &l.name == name)
            .ok_or_else(|| BnnError::InvalidBoundary(format!("network has no layer `{name}`")))?;
        if !network.layers[idx].is_dense() {
            return Err(BnnError::InvalidBoundary(format!(
                "`{name}` is a convolution; convolution layers are always frozen"
            )));
        }
        mask[idx] = true;
    }
    Ok(())
}

fn configs_from_mask(network: &Network, mask: &[bool]) -> Result<Vec<LayerConfig>> {
    let flags = network
        .layers
        .iter()
        .zip(mask)
        .filter(|(l, _)| l.is_dense())
        .map(|(_, &m)| m);
    Ok(network
        .dense_configs()?
        .into_iter()
        .zip(flags)
        .map(|(cfg, is_probabilistic)| LayerConfig {
            is_probabilistic,
            ..cfg
        })
        .collect())
}

fn split_at_mask(
    network: &Network,
    pretrained: &Params,
    mask: &[bool],
    latent: Option<usize>,
) -> Result<PartialNetwork> {
    network.check_params(pretrained)?;
    let start = mask
        .iter()
        .position(|&m| m)
        .ok_or_else(|| BnnError::InvalidBoundary("no stochastic layers selected".into()))?;
    if !mask[start..].iter().all(|&m| m) {
        return Err(BnnError::InvalidBoundary(
            "stochastic layers must form a contiguous trailing block".into(),
        ));
    }

    let frozen_layers: Vec<LayerSpec> = network.layers[..start].to_vec();
    let mut frozen_params = Params::new();
    for layer in &frozen_layers {
        for key in [nn::kernel_key(&layer.name), nn::bias_key(&layer.name)] {
            if let Some(value) = pretrained.get(&key) {
                frozen_params.insert(key, value.clone());
            }
        }
    }

    let configs = configs_from_mask(network, mask)?;
    let mut stochastic: Vec<LayerConfig> = configs.into_iter().filter(|c| c.is_probabilistic).collect();
    let frozen_out = stochastic
        .first()
        .map(|c| c.in_features)
        .ok_or_else(|| BnnError::InvalidBoundary("no stochastic layers selected".into()))?;

    let mut suffix_pretrained = Params::new();
    for cfg in &stochastic {
        for key in [nn::kernel_key(&cfg.layer_name), nn::bias_key(&cfg.layer_name)] {
            if let Some(value) = pretrained.get(&key) {
                suffix_pretrained.insert(key, value.clone());
            }
        }
    }

    if let Some(latent_dim) = latent {
        if latent_dim == 0 {
            return Err(BnnError::InvalidConfig("latent dimension must be positive".into()));
        }
        if let Some(last) = stochastic.last_mut() {
            if last.features != latent_dim {
                suffix_pretrained.remove(&nn::kernel_key(&last.layer_name));
                suffix_pretrained.remove(&nn::bias_key(&last.layer_name));
                last.features = latent_dim;
            }
        }
    }

    debug!(
        "split {} network: {} frozen layers, {} stochastic layers ({})",
        network.topology,
        frozen_layers.len(),
        stochastic.len(),
        stochastic
            .iter()
            .map(|c| c.layer_name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(PartialNetwork {
        topology: network.topology,
        frozen: FrozenPrefix {
            input_dim: network.input_dim,
            output_dim: frozen_out,
            layers: frozen_layers,
            params: frozen_params,
        },
        stochastic,
        pretrained: suffix_pretrained,
        two_head: network.topology == Topology::Mlp2Head,
    })
}

/// True if any frozen layer is a convolution.
pub fn has_conv_prefix(partial: &PartialNetwork) -> bool {
    partial
        .frozen
        .layers()
        .iter()
        .any(|l| matches!(l.kind, LayerKind::Conv1d { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{apply_dense_stack, Activation, NetworkOutput};
    use crate::rng::RngKey;
    use approx::assert_abs_diff_eq;

    fn inputs(n: usize, d: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, d), |(i, j)| ((i * d + j) as f64 * 0.37).sin())
    }

    #[test]
    fn mlp_count_split_keeps_order_and_values() {
        let net = Network::mlp(3, &[6, 5, 4], 1, Activation::Tanh);
        let params = net.init_params(RngKey::new(2)).unwrap();
        let partial = SplitterRegistry::default()
            .split(&net, &params, &Boundary::Count(2))
            .unwrap();
        let frozen_names: Vec<_> = partial.frozen.layers().iter().map(|l| l.name.clone()).collect();
        assert_eq!(frozen_names, vec!["Dense0", "Dense1"]);
        let names: Vec<_> = partial.stochastic.iter().map(|c| c.layer_name.clone()).collect();
        assert_eq!(names, vec!["Dense2", "Dense3"]);
        assert_eq!(partial.frozen.output_dim(), 5);
        assert_eq!(partial.frozen.params()["Dense1.kernel"], params["Dense1.kernel"]);
        assert!(partial.pretrained.contains_key("Dense3.bias"));
    }

    #[test]
    fn composition_matches_full_network() {
        let net = Network::mlp(2, &[8, 8], 2, Activation::Silu);
        let params = net.init_params(RngKey::new(9)).unwrap();
        let partial = SplitterRegistry::default()
            .split(&net, &params, &Boundary::Count(1))
            .unwrap();
        let x = inputs(7, 2);
        let full = net.apply(&params, x.view()).unwrap().into_single().unwrap();
        let h = partial.frozen.apply(x.view()).unwrap();
        let out = apply_dense_stack(&partial.stochastic, &params, h.view(), false)
            .unwrap()
            .into_single()
            .unwrap();
        for (a, b) in full.iter().zip(out.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn frozen_prefix_is_reproducible() {
        let net = Network::convnet(12, &[(3, 3)], &[6, 4], 1, Activation::Relu);
        let params = net.init_params(RngKey::new(4)).unwrap();
        let partial = SplitterRegistry::default()
            .split(&net, &params, &Boundary::Count(1))
            .unwrap();
        assert!(has_conv_prefix(&partial));
        let x = inputs(5, 12);
        let a = partial.frozen.apply(x.view()).unwrap();
        let b = partial.frozen.apply(x.view()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ncols(), partial.frozen.output_dim());
    }

    #[test]
    fn convnet_count_cannot_exceed_dense_layers() {
        let net = Network::convnet(12, &[(3, 3)], &[6], 1, Activation::Relu);
        let params = net.init_params(RngKey::new(4)).unwrap();
        let err = SplitterRegistry::default()
            .split(&net, &params, &Boundary::Count(3))
            .unwrap_err();
        assert!(matches!(err, BnnError::InvalidBoundary(_)));
        let err = SplitterRegistry::default()
            .split(&net, &params, &Boundary::names(["Conv0", "Dense0", "Dense1"]))
            .unwrap_err();
        assert!(matches!(err, BnnError::InvalidBoundary(_)));
    }

    #[test]
    fn mlp_and_convnet_share_the_trailing_rule() {
        let registry = SplitterRegistry::default();
        for net in [
            Network::mlp(12, &[6, 4], 1, Activation::Relu),
            Network::convnet(12, &[(3, 3)], &[6, 4], 1, Activation::Relu),
        ] {
            let configs = registry.layer_configs(&net, &Boundary::Count(2)).unwrap();
            let flags: Vec<bool> = configs.iter().map(|c| c.is_probabilistic).collect();
            let n = flags.len();
            assert_eq!(flags[n - 2..], [true, true], "{}", net.topology);
            assert!(flags[..n - 2].iter().all(|f| !f), "{}", net.topology);
        }
    }

    #[test]
    fn two_head_count_always_includes_heads() {
        let net = Network::mlp_2head(2, &[5, 4], 1, Activation::Tanh);
        let registry = SplitterRegistry::default();
        let configs = registry.layer_configs(&net, &Boundary::Count(1)).unwrap();
        let flags: Vec<bool> = configs.iter().map(|c| c.is_probabilistic).collect();
        assert_eq!(flags, vec![false, false, true, true]);
        let configs = registry.layer_configs(&net, &Boundary::Count(2)).unwrap();
        let flags: Vec<bool> = configs.iter().map(|c| c.is_probabilistic).collect();
        assert_eq!(flags, vec![false, true, true, true]);

        let params = net.init_params(RngKey::new(1)).unwrap();
        let partial = registry.split(&net, &params, &Boundary::Count(2)).unwrap();
        assert!(partial.two_head);
        let x = inputs(4, 2);
        let full = net.apply(&params, x.view()).unwrap();
        let h = partial.frozen.apply(x.view()).unwrap();
        let out = apply_dense_stack(&partial.stochastic, &params, h.view(), true).unwrap();
        match (full, out) {
            (
                NetworkOutput::TwoHead { mean: m1, variance: v1 },
                NetworkOutput::TwoHead { mean: m2, variance: v2 },
            ) => {
                assert_eq!(m1, m2);
                assert_eq!(v1, v2);
            }
            _ => panic!("expected two-head outputs"),
        }
    }

    #[test]
    fn named_layers_marked_independently() {
        let net = Network::mlp_2head(2, &[5, 4], 1, Activation::Tanh);
        let registry = SplitterRegistry::default();
        let configs = registry
            .layer_configs(&net, &Boundary::names(["Dense0", "MeanHead"]))
            .unwrap();
        let flags: Vec<bool> = configs.iter().map(|c| c.is_probabilistic).collect();
        assert_eq!(flags, vec![true, false, true, false]);

        let params = net.init_params(RngKey::new(1)).unwrap();
        let err = registry
            .split(&net, &params, &Boundary::names(["Dense0", "MeanHead"]))
            .unwrap_err();
        assert!(matches!(err, BnnError::InvalidBoundary(_)));
    }

    #[test]
    fn unknown_name_rejected() {
        let net = Network::mlp(2, &[3], 1, Activation::Tanh);
        let err = SplitterRegistry::default()
            .layer_configs(&net, &Boundary::names(["Nope"]))
            .unwrap_err();
        assert!(matches!(err, BnnError::InvalidBoundary(_)));
    }

    #[test]
    fn unregistered_topology_fails_at_lookup() {
        let net = Network::mlp(2, &[3], 1, Activation::Tanh);
        let params = net.init_params(RngKey::new(0)).unwrap();
        let err = SplitterRegistry::new()
            .split(&net, &params, &Boundary::Count(1))
            .unwrap_err();
        assert!(matches!(err, BnnError::UnsupportedTopology(ref t) if t == "mlp"));
    }

    #[test]
    fn missing_pretrained_weights_fail_before_split() {
        let net = Network::mlp(2, &[3], 1, Activation::Tanh);
        let mut params = net.init_params(RngKey::new(0)).unwrap();
        params.remove("Dense0.kernel");
        let err = SplitterRegistry::default()
            .split(&net, &params, &Boundary::Count(1))
            .unwrap_err();
        assert!(matches!(err, BnnError::MissingPretrained { .. }));
    }

    #[test]
    fn latent_override_replaces_last_width() {
        let net = Network::mlp(3, &[6, 4], 1, Activation::Tanh);
        let params = net.init_params(RngKey::new(0)).unwrap();
        let partial = SplitterRegistry::default()
            .split_with_latent(&net, &params, &Boundary::Count(2), 2)
            .unwrap();
        assert_eq!(partial.output_dim(), 2);
        assert!(!partial.pretrained.contains_key("Dense2.kernel"));
        assert!(partial.pretrained.contains_key("Dense1.kernel"));
    }
}
