//! Posterior sample store: site name -> tensor with a leading sample axis.

use crate::error::{BnnError, Result};
use crate::model::ModelGraph;
use crate::nn::Params;
use crate::sampler::McmcRun;
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use std::collections::BTreeMap;

/// Posterior draws of every random site.
///
/// Flat layout: each tensor is `[S, ...site]`. With a chain axis: each tensor
/// is `[chains, draws, ...site]` and `S = chains * draws`. Sample `i` of the
/// flat view is draw `i % draws` of chain `i / draws`.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSamples {
    sites: BTreeMap<String, ArrayD<f64>>,
    num_chains: Option<usize>,
}

impl PosteriorSamples {
    /// Flat collection; every site must have the same leading sample count.
    pub fn new(sites: BTreeMap<String, ArrayD<f64>>) -> Result<Self> {
        check_leading(&sites, 1)?;
        Ok(Self { sites, num_chains: None })
    }

    /// Collection whose tensors lead with `[chains, draws]`.
    pub fn with_chains(sites: BTreeMap<String, ArrayD<f64>>) -> Result<Self> {
        let lead = check_leading(&sites, 2)?;
        Ok(Self {
            num_chains: Some(lead.first().copied().unwrap_or(0)),
            sites,
        })
    }

    /// Constrained site values of a sampler run, chain axis retained.
    pub fn from_run(model: &ModelGraph, run: &McmcRun) -> Result<Self> {
        let chains = run.draws.len();
        let draws = run.draws.first().map_or(0, Vec::len);
        let mut sites = BTreeMap::new();
        for site in model.sites() {
            let t = site.prior.transform();
            let mut values = Vec::with_capacity(chains * draws * site.size);
            for chain in &run.draws {
                for q in chain {
                    values.extend(q[site.offset..site.offset + site.size].iter().map(|&v| t.forward(v)));
                }
            }
            let mut shape = vec![chains, draws];
            shape.extend_from_slice(&site.shape);
            let value = ArrayD::from_shape_vec(IxDyn(&shape), values)
                .map_err(|e| BnnError::InvalidConfig(format!("site `{}`: {e}", site.name)))?;
            sites.insert(site.name.clone(), value);
        }
        Self::with_chains(sites)
    }

    pub fn has_chain_dim(&self) -> bool {
        self.num_chains.is_some()
    }

    pub fn num_chains(&self) -> usize {
        self.num_chains.unwrap_or(1)
    }

    /// Total number of samples `S` across chains.
    pub fn num_samples(&self) -> usize {
        let lead = if self.has_chain_dim() { 2 } else { 1 };
        self.sites
            .values()
            .next()
            .map_or(0, |v| v.shape()[..lead].iter().product())
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub fn get(&self, name: &str) -> Result<&ArrayD<f64>> {
        self.sites.get(name).ok_or_else(|| BnnError::UnknownSite(name.to_string()))
    }

    pub fn site_names(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f64>)> {
        self.sites.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge the chain axis into the sample axis.
    pub fn flatten(&self) -> Result<Self> {
        if !self.has_chain_dim() {
            return Ok(self.clone());
        }
        let mut sites = BTreeMap::new();
        for (name, value) in &self.sites {
            let mut shape = vec![value.shape()[0] * value.shape()[1]];
            shape.extend_from_slice(&value.shape()[2..]);
            let flat = ArrayD::from_shape_vec(IxDyn(&shape), value.iter().copied().collect())
                .map_err(|e| BnnError::InvalidConfig(format!("site `{name}`: {e}")))?;
            sites.insert(name.clone(), flat);
        }
        Ok(Self { sites, num_chains: None })
    }

    /// Split the flat sample axis into `[num_chains, S / num_chains]`.
    pub fn group_by_chain(&self, num_chains: usize) -> Result<Self> {
        let flat = self.flatten()?;
        let total = flat.num_samples();
        if num_chains == 0 || total % num_chains != 0 {
            return Err(BnnError::InvalidConfig(format!(
                "{total} samples cannot be split into {num_chains} chains"
            )));
        }
        let mut sites = BTreeMap::new();
        for (name, value) in flat.sites {
            let mut shape = vec![num_chains, total / num_chains];
            shape.extend_from_slice(&value.shape()[1..]);
            let grouped = ArrayD::from_shape_vec(IxDyn(&shape), value.iter().copied().collect())
                .map_err(|e| BnnError::InvalidConfig(format!("site `{name}`: {e}")))?;
            sites.insert(name, grouped);
        }
        Ok(Self {
            sites,
            num_chains: Some(num_chains),
        })
    }

    /// Parameters of flat sample `index`.
    pub fn draw(&self, index: usize) -> Result<Params> {
        let total = self.num_samples();
        if index >= total {
            return Err(BnnError::InvalidConfig(format!(
                "sample index {index} out of range for {total} samples"
            )));
        }
        let mut params = Params::new();
        for (name, value) in &self.sites {
            let one = match self.num_chains {
                Some(chains) => {
                    let per_chain = total / chains;
                    value
                        .index_axis(Axis(0), index / per_chain)
                        .index_axis(Axis(0), index % per_chain)
                        .to_owned()
                }
                None => value.index_axis(Axis(0), index).to_owned(),
            };
            params.insert(name.clone(), one);
        }
        Ok(params)
    }

    /// Flat samples `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self> {
        let flat = self.flatten()?;
        let end = end.min(flat.num_samples());
        let start = start.min(end);
        let sites = flat
            .sites
            .iter()
            .map(|(k, v)| (k.clone(), v.slice_axis(Axis(0), Slice::from(start..end)).to_owned()))
            .collect();
        Ok(Self { sites, num_chains: None })
    }
}

/// Validate that all sites agree on their first `lead` axes; return them.
fn check_leading(sites: &BTreeMap<String, ArrayD<f64>>, lead: usize) -> Result<Vec<usize>> {
    let mut expected: Option<Vec<usize>> = None;
    for (name, value) in sites {
        if value.ndim() < lead {
            return Err(BnnError::shape(
                format!("samples of `{name}`"),
                format!("at least {lead} leading axes"),
                value.shape(),
            ));
        }
        let got = value.shape()[..lead].to_vec();
        match &expected {
            None => expected = Some(got),
            Some(e) if *e != got => {
                return Err(BnnError::shape(
                    format!("samples of `{name}`"),
                    format!("leading axes {e:?}"),
                    value.shape(),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(expected.unwrap_or_default())
}
