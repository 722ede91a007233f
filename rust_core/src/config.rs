//! Fit-time settings, loadable from TOML.

use crate::device::Device;
use crate::error::Result;
use crate::sampler::{ChainMethod, ExtraField, SamplerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Everything `fit` needs besides the data and the key.
///
/// Missing TOML keys take their default:
///
/// ```toml
/// num_warmup = 500
/// num_samples = 500
/// num_chains = 4
/// chain_method = "parallel"
/// device = "cpu:4"
/// extra_fields = ["accept_prob", "diverging"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    pub num_warmup: usize,
    pub num_samples: usize,
    pub num_chains: usize,
    pub chain_method: ChainMethod,
    pub progress_bar: bool,
    pub device: Device,
    pub extra_fields: Vec<ExtraField>,
    pub max_tree_depth: usize,
    pub target_accept: f64,
    pub init_samples: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        let sampler = SamplerConfig::default();
        Self {
            num_warmup: sampler.num_warmup,
            num_samples: sampler.num_samples,
            num_chains: sampler.num_chains,
            chain_method: sampler.chain_method,
            progress_bar: sampler.progress_bar,
            device: Device::Default,
            extra_fields: sampler.extra_fields,
            max_tree_depth: sampler.max_tree_depth,
            target_accept: sampler.target_accept,
            init_samples: sampler.init_samples,
        }
    }
}

impl FitConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: FitConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.sampler_config().validate()
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            num_warmup: self.num_warmup,
            num_samples: self.num_samples,
            num_chains: self.num_chains,
            chain_method: self.chain_method,
            max_tree_depth: self.max_tree_depth,
            target_accept: self.target_accept,
            init_samples: self.init_samples,
            extra_fields: self.extra_fields.clone(),
            progress_bar: self.progress_bar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BnnError;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = FitConfig::from_toml_str(
            r#"
            num_chains = 4
            chain_method = "vectorized"
            device = "cpu:2"
            extra_fields = ["accept_prob", "tree_depth"]
            "#,
        )
        .unwrap();
        assert_eq!(config.num_chains, 4);
        assert_eq!(config.chain_method, ChainMethod::Vectorized);
        assert_eq!(config.device, Device::Cpu { threads: Some(2) });
        assert_eq!(config.extra_fields, vec![ExtraField::AcceptProb, ExtraField::TreeDepth]);
        assert_eq!(config.num_warmup, 2000);
        assert_eq!(config.target_accept, 0.8);
    }

    #[test]
    fn bad_values_rejected() {
        assert!(matches!(
            FitConfig::from_toml_str("device = \"gpu\""),
            Err(BnnError::Config(_))
        ));
        assert!(matches!(
            FitConfig::from_toml_str("extra_fields = [\"mass\"]"),
            Err(BnnError::Config(_))
        ));
        assert!(matches!(
            FitConfig::from_toml_str("target_accept = 1.5"),
            Err(BnnError::InvalidConfig(_))
        ));
        assert!(matches!(
            FitConfig::from_toml_str("num_chain = 2"),
            Err(BnnError::Config(_))
        ));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.toml");
        let config = FitConfig {
            num_samples: 300,
            chain_method: ChainMethod::Parallel,
            device: Device::Cpu { threads: None },
            extra_fields: vec![ExtraField::Energy],
            progress_bar: false,
            ..FitConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(FitConfig::from_path(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FitConfig::from_path(dir.path().join("absent.toml")),
            Err(BnnError::Io(_))
        ));
    }
}
