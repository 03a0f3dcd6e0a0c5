//! Execution backends and the capability-checked registry that picks one.
//!
//! A search asks for a [`Backend`] in its configuration.  CPU backends are
//! always available; the GPU backend needs a [`Device`] to have been
//! registered.  [`BackendRegistry::resolve`] never fails: a request it cannot
//! honour degrades to the best CPU backend with a warning.

use std::fmt;
use std::str::FromStr;

use log::warn;
#[cfg(feature = "python")]
use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::types::ConfigError;

/// Where the hot kernels run.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sequential,
    Parallel,
    /// Stokes-I imaging on an accelerator device.
    Gpu,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Sequential => "sequential",
            Backend::Parallel => "parallel",
            Backend::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Backend::Sequential),
            "parallel" => Ok(Backend::Parallel),
            "gpu" | "cuda" => Ok(Backend::Gpu),
            other => Err(ConfigError::Invalid(format!("backend '{other}' not recognized"))),
        }
    }
}

/// Resolved backend.  Holds the device when the GPU path is taken.
pub enum SelectedBackend<'a> {
    Sequential,
    Parallel,
    Gpu(&'a mut dyn Device),
}

impl SelectedBackend<'_> {
    pub fn kind(&self) -> Backend {
        match self {
            SelectedBackend::Sequential => Backend::Sequential,
            SelectedBackend::Parallel => Backend::Parallel,
            SelectedBackend::Gpu(_) => Backend::Gpu,
        }
    }
}

/// Backends available to a search.
#[derive(Default)]
pub struct BackendRegistry {
    device: Option<Box<dyn Device>>,
}

impl BackendRegistry {
    /// CPU backends only.
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU backends plus a GPU device.
    pub fn with_device(device: Box<dyn Device>) -> Self {
        Self { device: Some(device) }
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device.as_deref().map(|d| d.name())
    }

    /// Pick the backend to run.  `nthread` chooses between the CPU
    /// backends when a fallback is needed.
    pub fn resolve(&mut self, requested: Backend, nthread: usize) -> SelectedBackend<'_> {
        let cpu = if nthread > 1 {
            SelectedBackend::Parallel
        } else {
            SelectedBackend::Sequential
        };
        match requested {
            Backend::Sequential => SelectedBackend::Sequential,
            Backend::Parallel => SelectedBackend::Parallel,
            Backend::Gpu => match self.device.as_deref_mut() {
                Some(device) => SelectedBackend::Gpu(device),
                None => {
                    warn!("No GPU device registered; falling back to {} backend", cpu.kind());
                    cpu
                }
            },
        }
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("device", &self.device_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    #[test]
    fn gpu_request_degrades_without_device() {
        let mut registry = BackendRegistry::new();
        assert_eq!(registry.resolve(Backend::Gpu, 1).kind(), Backend::Sequential);
        assert_eq!(registry.resolve(Backend::Gpu, 4).kind(), Backend::Parallel);
    }

    #[test]
    fn gpu_request_uses_registered_device() {
        let mut registry = BackendRegistry::with_device(Box::new(HostDevice::new()));
        assert!(registry.has_device());
        assert_eq!(registry.resolve(Backend::Gpu, 1).kind(), Backend::Gpu);
        assert_eq!(registry.resolve(Backend::Sequential, 8).kind(), Backend::Sequential);
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("cuda".parse::<Backend>().unwrap(), Backend::Gpu);
        assert_eq!("parallel".parse::<Backend>().unwrap(), Backend::Parallel);
        assert!("opencl".parse::<Backend>().is_err());
    }
}
