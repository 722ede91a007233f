//! Execution placement.
//!
//! Everything lives in host memory; a device only selects the rayon pool work
//! runs on. Placement never changes results.

use crate::error::{BnnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    /// The global rayon pool.
    #[default]
    Default,
    /// A dedicated pool; `threads: None` means the global pool.
    Cpu { threads: Option<usize> },
}

impl Device {
    /// Run `op` on this device's pool.
    pub fn install<R, F>(&self, op: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match self {
            Device::Default | Device::Cpu { threads: None } => Ok(op()),
            Device::Cpu { threads: Some(n) } => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(*n)
                    .build()
                    .map_err(|e| BnnError::InvalidConfig(format!("cannot build a {n}-thread pool: {e}")))?;
                Ok(pool.install(op))
            }
        }
    }
}

/// Stage tensors on the named device. Host memory is the only location, so
/// the tensors come back unchanged once the name is validated.
pub fn place<T>(device: &str, tensors: Vec<T>) -> Result<Vec<T>> {
    device.parse::<Device>()?;
    Ok(tensors)
}

impl FromStr for Device {
    type Err = BnnError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "" | "default" => Ok(Device::Default),
            "cpu" => Ok(Device::Cpu { threads: None }),
            other => match other.strip_prefix("cpu:").map(str::parse::<usize>) {
                Some(Ok(n)) if n > 0 => Ok(Device::Cpu { threads: Some(n) }),
                _ => Err(BnnError::UnsupportedDevice(s.to_string())),
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Default => f.write_str("default"),
            Device::Cpu { threads: None } => f.write_str("cpu"),
            Device::Cpu { threads: Some(n) } => write!(f, "cpu:{n}"),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = BnnError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Device> for String {
    fn from(d: Device) -> Self {
        d.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_names() {
        assert_eq!("default".parse::<Device>().unwrap(), Device::Default);
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu { threads: None });
        assert_eq!("cpu:2".parse::<Device>().unwrap(), Device::Cpu { threads: Some(2) });
        assert!(matches!("gpu".parse::<Device>(), Err(BnnError::UnsupportedDevice(_))));
        assert!(matches!("cpu:0".parse::<Device>(), Err(BnnError::UnsupportedDevice(_))));
    }

    #[test]
    fn display_round_trips() {
        for d in [Device::Default, Device::Cpu { threads: None }, Device::Cpu { threads: Some(3) }] {
            assert_eq!(d.to_string().parse::<Device>().unwrap(), d);
        }
    }

    #[test]
    fn dedicated_pool_runs_with_requested_threads() {
        let n = Device::Cpu { threads: Some(2) }
            .install(rayon::current_num_threads)
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn place_validates_name() {
        assert_eq!(place("cpu", vec![1, 2]).unwrap(), vec![1, 2]);
        assert!(place("tpu", vec![1]).is_err());
    }
}
