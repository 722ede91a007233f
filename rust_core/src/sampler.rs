use crate::error::{BnnError, Result};
use crate::model::ModelGraph;
use crate::nuts::{NutsChain, NutsSettings, Transition};
use crate::progress::ProgressState;
use crate::rng::RngKey;
use log::{info, warn};
use ndarray::{Array2, ArrayD, IxDyn};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How multiple chains share the machine. Never changes the draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMethod {
    /// One chain after another.
    #[default]
    Sequential,
    /// All chains advanced in lockstep on the calling thread.
    Vectorized,
    /// Chains run concurrently on the rayon pool.
    Parallel,
}

impl FromStr for ChainMethod {
    type Err = BnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ChainMethod::Sequential),
            "vectorized" => Ok(ChainMethod::Vectorized),
            "parallel" => Ok(ChainMethod::Parallel),
            other => Err(BnnError::InvalidConfig(format!("unknown chain method `{other}`"))),
        }
    }
}

impl fmt::Display for ChainMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChainMethod::Sequential => "sequential",
            ChainMethod::Vectorized => "vectorized",
            ChainMethod::Parallel => "parallel",
        })
    }
}

/// Per-iteration statistics that can be collected next to the draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraField {
    AcceptProb,
    Diverging,
    StepSize,
    TreeDepth,
    NumSteps,
    PotentialEnergy,
    Energy,
}

impl ExtraField {
    pub const ALL: [ExtraField; 7] = [
        ExtraField::AcceptProb,
        ExtraField::Diverging,
        ExtraField::StepSize,
        ExtraField::TreeDepth,
        ExtraField::NumSteps,
        ExtraField::PotentialEnergy,
        ExtraField::Energy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExtraField::AcceptProb => "accept_prob",
            ExtraField::Diverging => "diverging",
            ExtraField::StepSize => "step_size",
            ExtraField::TreeDepth => "tree_depth",
            ExtraField::NumSteps => "num_steps",
            ExtraField::PotentialEnergy => "potential_energy",
            ExtraField::Energy => "energy",
        }
    }

    fn value(self, t: &Transition) -> f64 {
        match self {
            ExtraField::AcceptProb => t.accept_prob,
            ExtraField::Diverging => f64::from(u8::from(t.diverging)),
            ExtraField::StepSize => t.step_size,
            ExtraField::TreeDepth => t.tree_depth as f64,
            ExtraField::NumSteps => t.num_steps as f64,
            ExtraField::PotentialEnergy => t.potential_energy,
            ExtraField::Energy => t.energy,
        }
    }
}

impl FromStr for ExtraField {
    type Err = BnnError;

    fn from_str(s: &str) -> Result<Self> {
        ExtraField::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| BnnError::UnknownExtraField(s.to_string()))
    }
}

/// Configuration for the multi-chain sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub num_warmup: usize,
    pub num_samples: usize,
    pub num_chains: usize,
    pub chain_method: ChainMethod,
    pub max_tree_depth: usize,
    pub target_accept: f64,
    /// Prior draws whose element-wise median is the initial point.
    pub init_samples: usize,
    pub extra_fields: Vec<ExtraField>,
    pub progress_bar: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_warmup: 2000,
            num_samples: 2000,
            num_chains: 1,
            chain_method: ChainMethod::Sequential,
            max_tree_depth: 10,
            target_accept: 0.8,
            init_samples: 10,
            extra_fields: Vec::new(),
            progress_bar: true,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 || self.num_chains == 0 || self.init_samples == 0 {
            return Err(BnnError::InvalidConfig(
                "num_samples, num_chains and init_samples must be positive".into(),
            ));
        }
        if self.max_tree_depth == 0 {
            return Err(BnnError::InvalidConfig("max_tree_depth must be positive".into()));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(BnnError::InvalidConfig(format!(
                "target_accept must lie in (0, 1), got {}",
                self.target_accept
            )));
        }
        Ok(())
    }

    fn nuts_settings(&self) -> NutsSettings {
        NutsSettings {
            num_warmup: self.num_warmup,
            max_tree_depth: self.max_tree_depth,
            target_accept: self.target_accept,
            step_size: None,
        }
    }
}

/// Result of sampling across all chains.
#[derive(Debug, Clone)]
pub struct McmcRun {
    /// draws[chain][draw][param], unconstrained.
    pub draws: Vec<Vec<Vec<f64>>>,
    /// extra[field][chain][draw]
    pub extra: BTreeMap<ExtraField, Vec<Vec<f64>>>,
    /// Divergent post-warmup transitions per chain.
    pub divergences: Vec<usize>,
    /// Mean post-warmup acceptance statistic per chain.
    pub accept_rates: Vec<f64>,
    /// Adapted step size per chain.
    pub step_sizes: Vec<f64>,
}

impl McmcRun {
    pub fn num_chains(&self) -> usize {
        self.draws.len()
    }

    pub fn total_divergences(&self) -> usize {
        self.divergences.iter().sum()
    }

    /// Collected extra fields keyed by name, `[chains, draws]` or flattened
    /// to `[chains * draws]`.
    pub fn extra_fields(&self, chain_dim: bool) -> Result<BTreeMap<String, ArrayD<f64>>> {
        let mut out = BTreeMap::new();
        for (field, per_chain) in &self.extra {
            let chains = per_chain.len();
            let draws = per_chain.first().map_or(0, Vec::len);
            let flat: Vec<f64> = per_chain.iter().flatten().copied().collect();
            let shape = if chain_dim { vec![chains, draws] } else { vec![chains * draws] };
            let value = ArrayD::from_shape_vec(IxDyn(&shape), flat)
                .map_err(|e| BnnError::InvalidConfig(format!("extra field `{}`: {e}", field.name())))?;
            out.insert(field.name().to_string(), value);
        }
        Ok(out)
    }
}

/// Draw `num_candidates` points from the priors and return their element-wise
/// median in unconstrained space.
pub fn init_to_median<R: Rng + ?Sized>(model: &ModelGraph, num_candidates: usize, rng: &mut R) -> Result<Vec<f64>> {
    if num_candidates == 0 {
        return Err(BnnError::InvalidConfig("init_samples must be positive".into()));
    }
    let dim = model.dim();
    let mut candidates = Array2::<f64>::zeros((num_candidates, dim));
    for mut row in candidates.rows_mut() {
        let params = model.sample_prior(rng)?;
        let q = model.unconstrain(&params)?;
        row.assign(&ndarray::ArrayView1::from(&q));
    }
    Ok(candidates.columns().into_iter().map(|c| median(c.to_vec())).collect())
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Draws and statistics accumulated by one chain.
struct ChainRecord {
    draws: Vec<Vec<f64>>,
    extra: Vec<Vec<f64>>,
    divergences: usize,
    accept_sum: f64,
    step_size: f64,
}

impl ChainRecord {
    fn new(num_samples: usize, fields: usize) -> Self {
        Self {
            draws: Vec::with_capacity(num_samples),
            extra: vec![Vec::with_capacity(num_samples); fields],
            divergences: 0,
            accept_sum: 0.0,
            step_size: 0.0,
        }
    }

    fn record(&mut self, t: Transition, fields: &[ExtraField], progress: &ProgressState) {
        progress.increment();
        if t.diverging {
            progress.add_divergence();
        }
        if t.warmup {
            return;
        }
        if t.diverging {
            self.divergences += 1;
        }
        self.accept_sum += t.accept_prob;
        self.step_size = t.step_size;
        for (slot, field) in self.extra.iter_mut().zip(fields) {
            slot.push(field.value(&t));
        }
        self.draws.push(t.position);
    }
}

fn start_chain<'g>(model: &'g ModelGraph, config: &SamplerConfig, key: RngKey, chain: usize) -> Result<NutsChain<'g>> {
    let (init_key, chain_key) = key.fold_in(chain as u64).split2();
    let init = init_to_median(model, config.init_samples, &mut init_key.to_rng())?;
    NutsChain::new(&model.graph, init, config.nuts_settings(), chain_key.to_rng()).map_err(|e| match e {
        BnnError::InitialPoint { reason, .. } => BnnError::InitialPoint { chain, reason },
        other => other,
    })
}

fn run_chain(
    model: &ModelGraph,
    config: &SamplerConfig,
    key: RngKey,
    chain: usize,
    progress: &ProgressState,
) -> Result<ChainRecord> {
    let mut nuts = start_chain(model, config, key, chain)?;
    let mut record = ChainRecord::new(config.num_samples, config.extra_fields.len());
    for _ in 0..config.num_warmup + config.num_samples {
        record.record(nuts.step(), &config.extra_fields, progress);
    }
    Ok(record)
}

fn run_lockstep(
    model: &ModelGraph,
    config: &SamplerConfig,
    key: RngKey,
    progress: &ProgressState,
) -> Result<Vec<ChainRecord>> {
    let mut chains = (0..config.num_chains)
        .map(|c| start_chain(model, config, key, c))
        .collect::<Result<Vec<_>>>()?;
    let mut records: Vec<ChainRecord> = (0..config.num_chains)
        .map(|_| ChainRecord::new(config.num_samples, config.extra_fields.len()))
        .collect();
    for _ in 0..config.num_warmup + config.num_samples {
        for (nuts, record) in chains.iter_mut().zip(records.iter_mut()) {
            record.record(nuts.step(), &config.extra_fields, progress);
        }
    }
    Ok(records)
}

/// Run NUTS chains on a model graph.
///
/// Each chain's randomness comes from `key.fold_in(chain)` only, so the three
/// chain methods return identical draws.
pub fn sample(model: &ModelGraph, config: &SamplerConfig, key: RngKey) -> Result<McmcRun> {
    config.validate()?;
    info!(
        "sampling {} chain(s) ({}): {} warmup + {} draws over {} parameters",
        config.num_chains,
        config.chain_method,
        config.num_warmup,
        config.num_samples,
        model.dim()
    );
    let progress = ProgressState::new(config.num_chains, config.num_warmup, config.num_samples, config.progress_bar);

    let records = match config.chain_method {
        ChainMethod::Sequential => (0..config.num_chains)
            .map(|c| run_chain(model, config, key, c, &progress))
            .collect::<Result<Vec<_>>>(),
        ChainMethod::Vectorized => run_lockstep(model, config, key, &progress),
        ChainMethod::Parallel => (0..config.num_chains)
            .into_par_iter()
            .map(|c| run_chain(model, config, key, c, &progress))
            .collect::<Result<Vec<_>>>(),
    };
    progress.finish();
    let records = records?;

    let mut extra: BTreeMap<ExtraField, Vec<Vec<f64>>> = BTreeMap::new();
    let mut run = McmcRun {
        draws: Vec::with_capacity(records.len()),
        extra: BTreeMap::new(),
        divergences: Vec::with_capacity(records.len()),
        accept_rates: Vec::with_capacity(records.len()),
        step_sizes: Vec::with_capacity(records.len()),
    };
    for record in records {
        for (field, values) in config.extra_fields.iter().zip(record.extra) {
            extra.entry(*field).or_default().push(values);
        }
        run.accept_rates.push(record.accept_sum / config.num_samples as f64);
        run.divergences.push(record.divergences);
        run.step_sizes.push(record.step_size);
        run.draws.push(record.draws);
    }
    run.extra = extra;

    let total = run.total_divergences();
    if total > 0 {
        warn!(
            "{total} divergent transition(s) after warmup across {} chain(s); inspect diagnostics",
            run.num_chains()
        );
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Prior;

    /// x ~ Normal(1, 2), s ~ HalfNormal(1)
    fn toy_model() -> ModelGraph {
        let mut mg = ModelGraph::new();
        mg.add_site("x", Prior::normal(1.0, 2.0), &[2]).unwrap();
        mg.add_site("s", Prior::half_normal(1.0), &[]).unwrap();
        mg
    }

    fn config(method: ChainMethod) -> SamplerConfig {
        SamplerConfig {
            num_warmup: 30,
            num_samples: 20,
            num_chains: 3,
            chain_method: method,
            extra_fields: vec![ExtraField::AcceptProb, ExtraField::Diverging],
            progress_bar: false,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn chain_methods_agree() {
        let mg = toy_model();
        let key = RngKey::new(17);
        let seq = sample(&mg, &config(ChainMethod::Sequential), key).unwrap();
        let vec = sample(&mg, &config(ChainMethod::Vectorized), key).unwrap();
        let par = sample(&mg, &config(ChainMethod::Parallel), key).unwrap();
        assert_eq!(seq.draws, vec.draws);
        assert_eq!(seq.draws, par.draws);
        assert_eq!(seq.extra, par.extra);
    }

    #[test]
    fn output_shapes_follow_config() {
        let mg = toy_model();
        let run = sample(&mg, &config(ChainMethod::Sequential), RngKey::new(1)).unwrap();
        assert_eq!(run.draws.len(), 3);
        assert!(run.draws.iter().all(|c| c.len() == 20 && c.iter().all(|d| d.len() == 3)));
        let extra = run.extra_fields(true).unwrap();
        assert_eq!(extra["accept_prob"].shape(), &[3, 20]);
        assert_eq!(run.extra_fields(false).unwrap()["diverging"].shape(), &[60]);
    }

    #[test]
    fn median_init_is_elementwise() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), 2.5);
        let mg = toy_model();
        let q = init_to_median(&mg, 9, &mut RngKey::new(0).to_rng()).unwrap();
        assert_eq!(q.len(), 3);
        assert!(q.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn unknown_extra_field_rejected() {
        assert!(matches!("bogus".parse::<ExtraField>(), Err(BnnError::UnknownExtraField(_))));
        assert_eq!("tree_depth".parse::<ExtraField>().unwrap(), ExtraField::TreeDepth);
    }

    #[test]
    fn invalid_config_fails_before_sampling() {
        let mg = toy_model();
        let bad = SamplerConfig {
            num_chains: 0,
            ..config(ChainMethod::Sequential)
        };
        assert!(matches!(sample(&mg, &bad, RngKey::new(0)), Err(BnnError::InvalidConfig(_))));
    }
}
