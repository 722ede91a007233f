//! Probabilistic models.
//!
//! A model turns a batch `(X, y)` into a [`ModelGraph`]: the joint
//! log-density graph plus the layout of its random sites inside the flat
//! sampler vector. Graphs are rebuilt from scratch for every batch, so a model
//! holds configuration only (plus what `prepare` records at fit time).
//!
//! For prediction the same model evaluates one posterior draw
//! deterministically on new inputs and adds observation noise.

use crate::autodiff;
use crate::distributions::{Prior, Transform};
use crate::error::{BnnError, Result};
use crate::gp::{self, KernelParams};
use crate::graph::{Graph, NodeId};
use crate::nn::{self, Activation, LayerConfig, Network, NetworkOutput, Params, Topology};
use crate::priors::{self, GpPriors, ParamKind, PriorPolicy};
use crate::rng::RngKey;
use crate::split::{Boundary, PartialNetwork, SplitterRegistry};
use crate::tasks::TaskStructure;
use crate::train::{self, TrainConfig};
use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayD, ArrayView2, Axis, Ix1, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Site name of the multi-task embedding table.
pub const TASK_EMBEDDING: &str = "TaskEmbedding.table";

/// One random site: its slice of the flat unconstrained vector and its prior.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub name: String,
    pub shape: Vec<usize>,
    pub offset: usize,
    pub size: usize,
    pub prior: Prior,
}

/// A model log-density graph with named random sites.
#[derive(Debug, Clone, Default)]
pub struct ModelGraph {
    pub graph: Graph,
    sites: Vec<Site>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a random site; returns the node holding its constrained value.
    pub fn add_site(&mut self, name: &str, prior: Prior, shape: &[usize]) -> Result<NodeId> {
        let offset = self.graph.param_count;
        let node = prior.register(&mut self.graph, name, shape)?;
        self.sites.push(Site {
            name: name.to_string(),
            shape: shape.to_vec(),
            offset,
            size: shape.iter().product(),
            prior,
        });
        Ok(node)
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn site(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.name == name)
    }

    /// Dimension of the unconstrained sampler space.
    pub fn dim(&self) -> usize {
        self.graph.param_count
    }

    /// Map a flat unconstrained vector to constrained site values.
    pub fn constrain(&self, q: &[f64]) -> Result<Params> {
        if q.len() != self.dim() {
            return Err(BnnError::DimensionMismatch {
                context: "sampler position".into(),
                expected: self.dim(),
                got: q.len(),
            });
        }
        let mut params = Params::new();
        for site in &self.sites {
            let t = site.prior.transform();
            let values: Vec<f64> = q[site.offset..site.offset + site.size]
                .iter()
                .map(|&v| t.forward(v))
                .collect();
            let value = ArrayD::from_shape_vec(IxDyn(&site.shape), values)
                .map_err(|e| BnnError::InvalidConfig(format!("site `{}`: {e}", site.name)))?;
            params.insert(site.name.clone(), value);
        }
        Ok(params)
    }

    /// Inverse of [`constrain`](Self::constrain).
    pub fn unconstrain(&self, params: &Params) -> Result<Vec<f64>> {
        let mut q = vec![0.0; self.dim()];
        for site in &self.sites {
            let value = params
                .get(&site.name)
                .ok_or_else(|| BnnError::UnknownSite(site.name.clone()))?;
            if value.shape() != site.shape.as_slice() {
                return Err(BnnError::shape(site.name.clone(), format!("{:?}", site.shape), value.shape()));
            }
            let t = site.prior.transform();
            for (dst, &v) in q[site.offset..site.offset + site.size].iter_mut().zip(value.iter()) {
                *dst = t.inverse(v);
            }
        }
        Ok(q)
    }

    /// Draw every site from its prior.
    pub fn sample_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Params> {
        let mut params = Params::new();
        for site in &self.sites {
            params.insert(site.name.clone(), site.prior.sample(rng, &site.shape)?);
        }
        Ok(params)
    }

    /// True if every site maps its coordinates through the identity.
    pub fn is_unconstrained(&self) -> bool {
        self.sites.iter().all(|s| s.prior.transform() == Transform::Identity)
    }

    /// Value of a named derived quantity (e.g. `mu`) at a sampler position.
    pub fn derived(&self, q: &[f64], name: &str) -> Result<Array2<f64>> {
        let node = self
            .graph
            .node_by_name(name)
            .ok_or_else(|| BnnError::UnknownSite(name.to_string()))?;
        Ok(autodiff::eval_node(&self.graph, q, node))
    }
}

/// A probabilistic regression model usable by the sampler and the predictive engine.
pub trait ProbabilisticModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Width of a row of `X` as passed to `fit`/`predict`.
    fn input_dim(&self) -> usize;

    /// Number of target columns.
    fn output_dim(&self) -> usize;

    /// Fit-time preparation on the normalized training data (pretraining,
    /// recording the training task structure, storing GP training data).
    fn prepare(&mut self, _x: ArrayView2<f64>, _y: ArrayView2<f64>, _key: RngKey) -> Result<()> {
        Ok(())
    }

    /// Joint log-density graph of `(x, y)`.
    fn build(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<ModelGraph>;

    /// Validate and transform new inputs once before they are mapped over samples.
    fn predictive_inputs(&self, x_new: ArrayView2<f64>) -> Result<Array2<f64>> {
        Ok(x_new.to_owned())
    }

    /// `(loc, draw)` for one posterior sample: the deterministic location
    /// estimate and the mean of `n_draws` noisy predictive draws.
    fn predict_draw(
        &self,
        params: &Params,
        inputs: ArrayView2<f64>,
        n_draws: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array2<f64>)>;
}

pub(crate) enum StackOutput {
    Single(NodeId),
    TwoHead { mean: NodeId, variance: NodeId },
}

/// Add a dense stack to the graph. Stochastic layers become sites under
/// `policy`; frozen layers read their values from `frozen`.
pub(crate) fn build_dense_stack(
    mg: &mut ModelGraph,
    input: NodeId,
    configs: &[LayerConfig],
    policy: &PriorPolicy,
    frozen: &Params,
    two_head: bool,
) -> Result<StackOutput> {
    let trunk_end = if two_head {
        configs
            .len()
            .checked_sub(2)
            .ok_or_else(|| BnnError::InvalidConfig("two-head stack needs at least two layers".into()))?
    } else {
        configs.len()
    };
    let mut h = input;
    for cfg in &configs[..trunk_end] {
        h = build_dense_layer(mg, h, cfg, policy, frozen)?;
    }
    if two_head {
        let mean = build_dense_layer(mg, h, &configs[trunk_end], policy, frozen)?;
        let variance = build_dense_layer(mg, h, &configs[trunk_end + 1], policy, frozen)?;
        Ok(StackOutput::TwoHead { mean, variance })
    } else {
        Ok(StackOutput::Single(h))
    }
}

fn build_dense_layer(
    mg: &mut ModelGraph,
    h: NodeId,
    cfg: &LayerConfig,
    policy: &PriorPolicy,
    frozen: &Params,
) -> Result<NodeId> {
    let name = &cfg.layer_name;
    let kernel_shape = cfg.kernel_shape();
    let bias_shape = [cfg.features];
    let (kernel, bias) = if cfg.is_probabilistic {
        let kp = policy.prior_for(name, ParamKind::Kernel, &kernel_shape)?;
        let bp = policy.prior_for(name, ParamKind::Bias, &bias_shape)?;
        let kernel = mg.add_site(&nn::kernel_key(name), kp, &kernel_shape)?;
        let bias = mg.add_site(&nn::bias_key(name), bp, &bias_shape)?;
        (kernel, bias)
    } else {
        let k = nn::lookup(frozen, name, "kernel")?;
        let b = nn::lookup(frozen, name, "bias")?;
        if k.shape() != &kernel_shape[..] {
            return Err(BnnError::shape(nn::kernel_key(name), format!("{kernel_shape:?}"), k.shape()));
        }
        if b.shape() != &bias_shape[..] {
            return Err(BnnError::shape(nn::bias_key(name), format!("{bias_shape:?}"), b.shape()));
        }
        let k = Array2::from_shape_vec((kernel_shape[0], kernel_shape[1]), k.iter().copied().collect())
            .map_err(|e| BnnError::InvalidConfig(e.to_string()))?;
        let b = Array2::from_shape_vec((1, cfg.features), b.iter().copied().collect())
            .map_err(|e| BnnError::InvalidConfig(e.to_string()))?;
        (mg.graph.add_constant(k), mg.graph.add_constant(b))
    };
    let z = mg.graph.matmul(h, kernel);
    let z = mg.graph.add_bias(z, bias);
    Ok(mg.graph.activate(z, cfg.activation))
}

fn check_columns(context: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(BnnError::DimensionMismatch {
            context: context.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

fn scalar_param(params: &Params, name: &str) -> Result<f64> {
    let value = params
        .get(name)
        .ok_or_else(|| BnnError::UnknownSite(name.to_string()))?;
    if value.len() != 1 {
        return Err(BnnError::shape(name, "scalar", value.shape()));
    }
    Ok(value.iter().copied().sum())
}

fn vector_param(params: &Params, name: &str) -> Result<Array1<f64>> {
    let value = params
        .get(name)
        .ok_or_else(|| BnnError::UnknownSite(name.to_string()))?;
    value
        .view()
        .into_dimensionality::<Ix1>()
        .map(|v| v.to_owned())
        .map_err(|_| BnnError::shape(name, "1-D", value.shape()))
}

/// Mean of `n_draws` samples of `Normal(loc, scale)`; `scale` is `1×1`,
/// `n×1` or `n×k`.
fn mean_normal_draws(loc: &Array2<f64>, scale: &Array2<f64>, n_draws: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let (sr, sc) = scale.dim();
    let mut acc = Array2::<f64>::zeros(loc.raw_dim());
    for _ in 0..n_draws {
        for ((i, j), a) in acc.indexed_iter_mut() {
            let s = scale[[if sr == 1 { 0 } else { i }, if sc == 1 { 0 } else { j }]];
            let z: f64 = StandardNormal.sample(rng);
            *a += loc[[i, j]] + s * z;
        }
    }
    acc / n_draws.max(1) as f64
}

fn all_probabilistic(network: &Network) -> Result<Vec<LayerConfig>> {
    Ok(network
        .dense_configs()?
        .into_iter()
        .map(|c| LayerConfig {
            is_probabilistic: true,
            ..c
        })
        .collect())
}

/// Homoskedastic graph: `y ~ Normal(stack(h), sig)`.
fn homoskedastic_graph(
    h: Array2<f64>,
    y: ArrayView2<f64>,
    configs: &[LayerConfig],
    policy: &PriorPolicy,
    noise_prior: &Prior,
) -> Result<ModelGraph> {
    let mut mg = ModelGraph::new();
    let input = mg.graph.add_constant(h);
    let mu = match build_dense_stack(&mut mg, input, configs, policy, &Params::new(), false)? {
        StackOutput::Single(node) => node,
        StackOutput::TwoHead { .. } => unreachable!("single-output stack"),
    };
    mg.graph.set_name(mu, "mu");
    let sig = mg.add_site("sig", noise_prior.clone(), &[])?;
    let obs = mg.graph.add_observed(y.to_owned());
    mg.graph.normal_obs_logp(mu, sig, obs);
    Ok(mg)
}

fn homoskedastic_draw(
    configs: &[LayerConfig],
    params: &Params,
    inputs: ArrayView2<f64>,
    n_draws: usize,
    rng: &mut ChaCha8Rng,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let loc = nn::apply_dense_stack(configs, params, inputs, false)?.into_single()?;
    let sig = Array2::from_elem((1, 1), scalar_param(params, "sig")?);
    let draw = mean_normal_draws(&loc, &sig, n_draws, rng);
    Ok((loc, draw))
}

/// Fully stochastic MLP with homoskedastic Gaussian noise.
#[derive(Debug, Clone)]
pub struct BnnModel {
    network: Network,
    configs: Vec<LayerConfig>,
    noise_prior: Prior,
}

impl BnnModel {
    pub fn new(input_dim: usize, hidden: &[usize], output_dim: usize, activation: Activation) -> Result<Self> {
        Self::from_network(Network::mlp(input_dim, hidden, output_dim, activation))
    }

    pub fn from_network(network: Network) -> Result<Self> {
        if network.topology != Topology::Mlp {
            return Err(BnnError::UnsupportedTopology(network.topology.to_string()));
        }
        let configs = all_probabilistic(&network)?;
        Ok(Self {
            network,
            configs,
            noise_prior: priors::noise_prior(),
        })
    }

    pub fn with_noise_prior(mut self, prior: Prior) -> Self {
        self.noise_prior = prior;
        self
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl ProbabilisticModel for BnnModel {
    fn name(&self) -> &'static str {
        "BNN"
    }

    fn input_dim(&self) -> usize {
        self.network.input_dim
    }

    fn output_dim(&self) -> usize {
        self.configs.last().map_or(0, |c| c.features)
    }

    fn build(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<ModelGraph> {
        check_columns("model input", self.input_dim(), x.ncols())?;
        check_columns("targets", self.output_dim(), y.ncols())?;
        homoskedastic_graph(x.to_owned(), y, &self.configs, &PriorPolicy::Default, &self.noise_prior)
    }

    fn predict_draw(
        &self,
        params: &Params,
        inputs: ArrayView2<f64>,
        n_draws: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        homoskedastic_draw(&self.configs, params, inputs, n_draws, rng)
    }
}

/// Where a partial model's split comes from.
#[derive(Debug, Clone)]
enum PartialSource {
    Ready(PartialNetwork),
    /// No pretrained weights yet; the network is trained at `prepare`.
    Pending { network: Network, boundary: Boundary },
}

impl PartialSource {
    fn new(
        registry: &SplitterRegistry,
        network: Network,
        pretrained: Option<Params>,
        boundary: Boundary,
        latent: Option<usize>,
    ) -> Result<Self> {
        match pretrained {
            Some(params) => {
                let partial = match latent {
                    Some(dim) => registry.split_with_latent(&network, &params, &boundary, dim)?,
                    None => registry.split(&network, &params, &boundary)?,
                };
                Ok(PartialSource::Ready(partial))
            }
            None => {
                registry.rule(network.topology)?;
                // Validate the boundary now so a bad split fails before training.
                registry.layer_configs(&network, &boundary)?;
                if network.topology == Topology::ConvNet {
                    return Err(BnnError::InvalidConfig(
                        "convolutional networks need pretrained weights".into(),
                    ));
                }
                Ok(PartialSource::Pending { network, boundary })
            }
        }
    }

    fn resolve(
        &mut self,
        registry: &SplitterRegistry,
        config: &TrainConfig,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        key: RngKey,
        latent: Option<usize>,
    ) -> Result<()> {
        if let PartialSource::Pending { network, boundary } = self {
            info!("training deterministic {} network before sampling", network.topology);
            let params = train::pretrain(network, x, y, config, key)?;
            let partial = match latent {
                Some(dim) => registry.split_with_latent(network, &params, boundary, dim)?,
                None => registry.split(network, &params, boundary)?,
            };
            *self = PartialSource::Ready(partial);
        }
        Ok(())
    }

    fn partial(&self) -> Result<&PartialNetwork> {
        match self {
            PartialSource::Ready(p) => Ok(p),
            PartialSource::Pending { .. } => Err(BnnError::NotFitted),
        }
    }

    fn input_dim(&self) -> usize {
        match self {
            PartialSource::Ready(p) => p.frozen.input_dim(),
            PartialSource::Pending { network, .. } => network.input_dim,
        }
    }
}

/// Frozen pretrained prefix followed by a stochastic suffix, homoskedastic noise.
#[derive(Debug, Clone)]
pub struct PartialBnnModel {
    source: PartialSource,
    output_dim: usize,
    priors_sigma: Option<f64>,
    noise_prior: Prior,
    registry: SplitterRegistry,
    train_config: TrainConfig,
}

impl PartialBnnModel {
    /// Split `network` now (when `pretrained` is given) or after MAP
    /// pretraining at fit time.
    pub fn new(network: Network, pretrained: Option<Params>, boundary: Boundary) -> Result<Self> {
        Self::with_registry(network, pretrained, boundary, SplitterRegistry::default())
    }

    pub fn with_registry(
        network: Network,
        pretrained: Option<Params>,
        boundary: Boundary,
        registry: SplitterRegistry,
    ) -> Result<Self> {
        if network.topology == Topology::Mlp2Head {
            return Err(BnnError::InvalidConfig(
                "two-head networks are modelled by HeteroskedasticModel".into(),
            ));
        }
        let output_dim = network
            .layers
            .last()
            .map(|l| match l.kind {
                nn::LayerKind::Dense { features } => features,
                nn::LayerKind::Conv1d { features, .. } => features,
            })
            .unwrap_or(0);
        let source = PartialSource::new(&registry, network, pretrained, boundary, None)?;
        Ok(Self {
            source,
            output_dim,
            priors_sigma: None,
            noise_prior: priors::noise_prior(),
            registry,
            train_config: TrainConfig::default(),
        })
    }

    /// Center stochastic-layer priors on the pretrained values with this scale.
    pub fn with_pretrained_priors(mut self, sigma: f64) -> Self {
        self.priors_sigma = Some(sigma);
        self
    }

    pub fn with_train_config(mut self, config: TrainConfig) -> Self {
        self.train_config = config;
        self
    }

    pub fn with_noise_prior(mut self, prior: Prior) -> Self {
        self.noise_prior = prior;
        self
    }

    pub fn partial(&self) -> Result<&PartialNetwork> {
        self.source.partial()
    }

    fn policy(&self, partial: &PartialNetwork) -> PriorPolicy {
        match self.priors_sigma {
            Some(sigma) => PriorPolicy::pretrained(partial.pretrained.clone(), sigma),
            None => PriorPolicy::Default,
        }
    }
}

impl ProbabilisticModel for PartialBnnModel {
    fn name(&self) -> &'static str {
        "PartialBNN"
    }

    fn input_dim(&self) -> usize {
        self.source.input_dim()
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn prepare(&mut self, x: ArrayView2<f64>, y: ArrayView2<f64>, key: RngKey) -> Result<()> {
        self.source.resolve(&self.registry, &self.train_config, x, y, key, None)
    }

    fn build(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<ModelGraph> {
        let partial = self.partial()?;
        check_columns("targets", self.output_dim, y.ncols())?;
        let h = partial.frozen.apply(x)?;
        homoskedastic_graph(h, y, &partial.stochastic, &self.policy(partial), &self.noise_prior)
    }

    fn predictive_inputs(&self, x_new: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.partial()?.frozen.apply(x_new)
    }

    fn predict_draw(
        &self,
        params: &Params,
        inputs: ArrayView2<f64>,
        n_draws: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        homoskedastic_draw(&self.partial()?.stochastic, params, inputs, n_draws, rng)
    }
}

/// Two-head network: the mean head gives `mu`, the softplus variance head
/// gives the per-row noise scale `sig`. Any layer may be frozen.
#[derive(Debug, Clone)]
pub struct HeteroskedasticModel {
    network: Network,
    configs: Vec<LayerConfig>,
    pretrained: Option<Params>,
    priors_sigma: Option<f64>,
    train_config: TrainConfig,
}

impl HeteroskedasticModel {
    /// Fully stochastic two-head MLP.
    pub fn new(input_dim: usize, hidden: &[usize], output_dim: usize, activation: Activation) -> Result<Self> {
        let network = Network::mlp_2head(input_dim, hidden, output_dim, activation);
        let configs = all_probabilistic(&network)?;
        Ok(Self {
            network,
            configs,
            pretrained: None,
            priors_sigma: None,
            train_config: TrainConfig::default(),
        })
    }

    /// Partially stochastic: layers selected by `boundary` are random, the
    /// rest run with `pretrained` values (trained at fit time if absent).
    pub fn partial(network: Network, pretrained: Option<Params>, boundary: Boundary) -> Result<Self> {
        // The last two layers are read as mean and variance heads.
        if network.topology != Topology::Mlp2Head {
            return Err(BnnError::UnsupportedTopology(network.topology.to_string()));
        }
        let configs = SplitterRegistry::default().layer_configs(&network, &boundary)?;
        if let Some(params) = &pretrained {
            network.check_params(params)?;
        }
        Ok(Self {
            network,
            configs,
            pretrained,
            priors_sigma: None,
            train_config: TrainConfig::default(),
        })
    }

    pub fn with_pretrained_priors(mut self, sigma: f64) -> Self {
        self.priors_sigma = Some(sigma);
        self
    }

    pub fn with_train_config(mut self, config: TrainConfig) -> Self {
        self.train_config = config;
        self
    }

    pub fn layer_configs(&self) -> &[LayerConfig] {
        &self.configs
    }

    fn needs_pretrained(&self) -> bool {
        self.priors_sigma.is_some() || self.configs.iter().any(|c| !c.is_probabilistic)
    }

    fn frozen(&self) -> Result<&Params> {
        match &self.pretrained {
            Some(p) => Ok(p),
            None if self.needs_pretrained() => Err(BnnError::NotFitted),
            None => Ok(empty_params()),
        }
    }

    fn policy(&self) -> Result<PriorPolicy> {
        Ok(match self.priors_sigma {
            Some(sigma) => PriorPolicy::pretrained(self.frozen()?.clone(), sigma),
            None => PriorPolicy::Default,
        })
    }
}

fn empty_params() -> &'static Params {
    static EMPTY: std::sync::OnceLock<Params> = std::sync::OnceLock::new();
    EMPTY.get_or_init(Params::new)
}

impl ProbabilisticModel for HeteroskedasticModel {
    fn name(&self) -> &'static str {
        "HeteroskedasticBNN"
    }

    fn input_dim(&self) -> usize {
        self.network.input_dim
    }

    fn output_dim(&self) -> usize {
        self.configs.last().map_or(0, |c| c.features)
    }

    fn prepare(&mut self, x: ArrayView2<f64>, y: ArrayView2<f64>, key: RngKey) -> Result<()> {
        if self.pretrained.is_none() && self.needs_pretrained() {
            info!("training deterministic two-head network before sampling");
            let params = train::pretrain(&self.network, x, y, &self.train_config, key)?;
            self.pretrained = Some(params);
        }
        Ok(())
    }

    fn build(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<ModelGraph> {
        check_columns("model input", self.input_dim(), x.ncols())?;
        check_columns("targets", self.output_dim(), y.ncols())?;
        let policy = self.policy()?;
        let mut mg = ModelGraph::new();
        let input = mg.graph.add_constant(x.to_owned());
        let (mu, sig) = match build_dense_stack(&mut mg, input, &self.configs, &policy, self.frozen()?, true)? {
            StackOutput::TwoHead { mean, variance } => (mean, variance),
            StackOutput::Single(_) => unreachable!("two-head stack"),
        };
        mg.graph.set_name(mu, "mu");
        mg.graph.set_name(sig, "sig");
        let obs = mg.graph.add_observed(y.to_owned());
        mg.graph.normal_obs_logp(mu, sig, obs);
        Ok(mg)
    }

    fn predict_draw(
        &self,
        params: &Params,
        inputs: ArrayView2<f64>,
        n_draws: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let mut merged = self.frozen()?.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        match nn::apply_dense_stack(&self.configs, &merged, inputs, true)? {
            NetworkOutput::TwoHead { mean, variance } => {
                let draw = mean_normal_draws(&mean, &variance, n_draws, rng);
                Ok((mean, draw))
            }
            NetworkOutput::Single(_) => unreachable!("two-head stack"),
        }
    }
}

/// Multi-task MLP: features plus a learned task embedding feed a shared
/// stack whose output holds one slice per task; each task has its own noise scale.
#[derive(Debug, Clone)]
pub struct MultiTaskModel {
    feature_dim: usize,
    output_dim: usize,
    num_tasks: usize,
    embedding_dim: usize,
    configs: Vec<LayerConfig>,
    noise_prior: Prior,
    train_tasks: Option<TaskStructure>,
}

impl MultiTaskModel {
    /// `feature_dim` excludes the trailing task-index column.
    pub fn new(
        feature_dim: usize,
        output_dim: usize,
        num_tasks: usize,
        embedding_dim: usize,
        hidden: &[usize],
        activation: Activation,
    ) -> Result<Self> {
        if num_tasks == 0 || embedding_dim == 0 || output_dim == 0 {
            return Err(BnnError::InvalidConfig(
                "num_tasks, embedding_dim and output_dim must be positive".into(),
            ));
        }
        let network = Network::mlp(feature_dim + embedding_dim, hidden, num_tasks * output_dim, activation);
        Ok(Self {
            feature_dim,
            output_dim,
            num_tasks,
            embedding_dim,
            configs: all_probabilistic(&network)?,
            noise_prior: priors::noise_prior(),
            train_tasks: None,
        })
    }

    pub fn with_noise_prior(mut self, prior: Prior) -> Self {
        self.noise_prior = prior;
        self
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// Tasks seen at fit time.
    pub fn train_tasks(&self) -> Option<&TaskStructure> {
        self.train_tasks.as_ref()
    }

    /// Split `x` into features and validated task indices.
    fn split_tasks(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Vec<usize>, TaskStructure)> {
        check_columns("multi-task input (features + task column)", self.feature_dim + 1, x.ncols())?;
        let column = x.column(self.feature_dim);
        let structure = TaskStructure::from_column(column)?;
        if let Some(t) = structure.tasks().find(|&t| t as usize >= self.num_tasks) {
            return Err(BnnError::InvalidConfig(format!(
                "task index {t} is out of range for {} tasks",
                self.num_tasks
            )));
        }
        let tasks = column.iter().map(|&v| v as usize).collect();
        Ok((x.slice(s![.., ..self.feature_dim]).to_owned(), tasks, structure))
    }
}

impl ProbabilisticModel for MultiTaskModel {
    fn name(&self) -> &'static str {
        "MultiTaskBNN"
    }

    fn input_dim(&self) -> usize {
        self.feature_dim + 1
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn prepare(&mut self, x: ArrayView2<f64>, _y: ArrayView2<f64>, _key: RngKey) -> Result<()> {
        let (_, _, structure) = self.split_tasks(x)?;
        debug!("training task sizes: {:?}", structure.to_string_keys());
        self.train_tasks = Some(structure);
        Ok(())
    }

    fn build(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<ModelGraph> {
        check_columns("targets", self.output_dim, y.ncols())?;
        let (features, tasks, _) = self.split_tasks(x)?;
        let mut mg = ModelGraph::new();
        let feat = mg.graph.add_constant(features);
        let idx = mg.graph.add_indices(tasks);
        let table = mg.add_site(
            TASK_EMBEDDING,
            Prior::normal(0.0, 1.0),
            &[self.num_tasks, self.embedding_dim],
        )?;
        let emb = mg.graph.gather_rows(table, idx);
        let h = mg.graph.concat_cols(feat, emb);
        let out = match build_dense_stack(&mut mg, h, &self.configs, &PriorPolicy::Default, &Params::new(), false)? {
            StackOutput::Single(node) => node,
            StackOutput::TwoHead { .. } => unreachable!("single-output stack"),
        };
        let mu = mg.graph.task_slice(out, idx, self.output_dim);
        mg.graph.set_name(mu, "mu");
        let sig = mg.add_site("sig", self.noise_prior.clone(), &[self.num_tasks])?;
        let row_scale = mg.graph.gather_scale(sig, idx);
        let obs = mg.graph.add_observed(y.to_owned());
        mg.graph.normal_obs_logp(mu, row_scale, obs);
        Ok(mg)
    }

    fn predictive_inputs(&self, x_new: ArrayView2<f64>) -> Result<Array2<f64>> {
        let train = self.train_tasks.as_ref().ok_or(BnnError::NotFitted)?;
        check_columns("multi-task input (features + task column)", self.feature_dim + 1, x_new.ncols())?;
        let structure = TaskStructure::from_column(x_new.column(self.feature_dim))?;
        train.check_known(&structure)?;
        Ok(x_new.to_owned())
    }

    fn predict_draw(
        &self,
        params: &Params,
        inputs: ArrayView2<f64>,
        n_draws: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let (features, tasks, _) = self.split_tasks(inputs)?;
        let table = params
            .get(TASK_EMBEDDING)
            .ok_or_else(|| BnnError::UnknownSite(TASK_EMBEDDING.to_string()))?;
        let table = table
            .view()
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|_| BnnError::shape(TASK_EMBEDDING, "rank 2", table.shape()))?;
        let sig = vector_param(params, "sig")?;
        let n = features.nrows();
        let mut h = Array2::<f64>::zeros((n, self.feature_dim + self.embedding_dim));
        h.slice_mut(s![.., ..self.feature_dim]).assign(&features);
        for (i, &t) in tasks.iter().enumerate() {
            for j in 0..self.embedding_dim {
                h[[i, self.feature_dim + j]] = table[[t, j]];
            }
        }
        let out = nn::apply_dense_stack(&self.configs, params, h.view(), false)?.into_single()?;
        let w = self.output_dim;
        let loc = Array2::from_shape_fn((n, w), |(i, j)| out[[i, tasks[i] * w + j]]);
        let scale = Array2::from_shape_fn((n, 1), |(i, _)| sig[tasks[i]]);
        let draw = mean_normal_draws(&loc, &scale, n_draws, rng);
        Ok((loc, draw))
    }
}

/// Partially stochastic deep-kernel model: frozen prefix, stochastic compact
/// network to a latent `z`, Gaussian-process likelihood over `z`.
#[derive(Debug, Clone)]
pub struct PartialDklModel {
    source: PartialSource,
    latent_dim: usize,
    gp_priors: GpPriors,
    jitter: f64,
    registry: SplitterRegistry,
    train_config: TrainConfig,
    training: Option<(Array2<f64>, Array1<f64>)>,
}

impl PartialDklModel {
    pub fn new(network: Network, pretrained: Option<Params>, boundary: Boundary, latent_dim: usize) -> Result<Self> {
        let registry = SplitterRegistry::default();
        if network.topology == Topology::Mlp2Head {
            return Err(BnnError::UnsupportedTopology(network.topology.to_string()));
        }
        let source = PartialSource::new(&registry, network, pretrained, boundary, Some(latent_dim))?;
        Ok(Self {
            source,
            latent_dim,
            gp_priors: GpPriors::default(),
            jitter: 1e-6,
            registry,
            train_config: TrainConfig::default(),
            training: None,
        })
    }

    pub fn with_gp_priors(mut self, priors: GpPriors) -> Self {
        self.gp_priors = priors;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_train_config(mut self, config: TrainConfig) -> Self {
        self.train_config = config;
        self
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn latent(&self, params: &Params, h: ArrayView2<f64>) -> Result<Array2<f64>> {
        let partial = self.source.partial()?;
        nn::apply_dense_stack(&partial.stochastic, params, h, false)?.into_single()
    }
}

impl ProbabilisticModel for PartialDklModel {
    fn name(&self) -> &'static str {
        "PartialDKL"
    }

    fn input_dim(&self) -> usize {
        self.source.input_dim()
    }

    fn output_dim(&self) -> usize {
        1
    }

    fn prepare(&mut self, x: ArrayView2<f64>, y: ArrayView2<f64>, key: RngKey) -> Result<()> {
        check_columns("deep-kernel targets", 1, y.ncols())?;
        self.source
            .resolve(&self.registry, &self.train_config, x, y, key, Some(self.latent_dim))?;
        let h = self.source.partial()?.frozen.apply(x)?;
        self.training = Some((h, y.column(0).to_owned()));
        Ok(())
    }

    fn build(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<ModelGraph> {
        check_columns("deep-kernel targets", 1, y.ncols())?;
        let partial = self.source.partial()?;
        let h = partial.frozen.apply(x)?;
        let mut mg = ModelGraph::new();
        let input = mg.graph.add_constant(h);
        let z = match build_dense_stack(&mut mg, input, &partial.stochastic, &PriorPolicy::Default, &Params::new(), false)? {
            StackOutput::Single(node) => node,
            StackOutput::TwoHead { .. } => unreachable!("single-output stack"),
        };
        let lengthscale = mg.add_site("k_length", self.gp_priors.lengthscale.clone(), &[self.latent_dim])?;
        let scale = mg.add_site("k_scale", self.gp_priors.output_scale.clone(), &[])?;
        let noise = mg.add_site("noise", self.gp_priors.noise.clone(), &[])?;
        let cov = mg.graph.rbf_kernel(z, lengthscale, scale, noise, self.jitter);
        let obs = mg.graph.add_observed(y.to_owned());
        mg.graph.mvn_logp(cov, obs);
        Ok(mg)
    }

    fn predictive_inputs(&self, x_new: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.source.partial()?.frozen.apply(x_new)
    }

    fn predict_draw(
        &self,
        params: &Params,
        inputs: ArrayView2<f64>,
        n_draws: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let (h_train, y_train) = self.training.as_ref().ok_or(BnnError::NotFitted)?;
        let kernel = KernelParams {
            lengthscale: vector_param(params, "k_length")?,
            scale: scalar_param(params, "k_scale")?,
            noise: scalar_param(params, "noise")?,
        };
        let z_train = self.latent(params, h_train.view())?;
        let z_new = self.latent(params, inputs)?;
        let (mean, mut cov) = gp::posterior(z_train.view(), y_train.view(), z_new.view(), &kernel, self.jitter, true)?;
        crate::linalg::add_diagonal(&mut cov, kernel.noise);
        let mut acc = Array1::<f64>::zeros(mean.len());
        for _ in 0..n_draws {
            acc += &gp::sample_mvn(mean.view(), cov.view(), rng)?;
        }
        let draw = acc / n_draws.max(1) as f64;
        Ok((mean.insert_axis(Axis(1)), draw.insert_axis(Axis(1))))
    }
}
