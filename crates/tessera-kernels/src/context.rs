//! Runtime selection from configuration.

use std::sync::Arc;

use tessera_core::{BackendKind, BridgeConfig, Result};

use crate::runtime::SharedRuntime;
use crate::sim::SimRuntime;

/// Open the runtime `config` asks for.
pub fn open_runtime(config: &BridgeConfig) -> Result<SharedRuntime> {
    config.validate()?;
    match config.backend {
        BackendKind::Simulated => {
            tracing::debug!(device = config.device_index, "opening simulated device");
            Ok(Arc::new(SimRuntime::with_device_index(
                config.sim.clone(),
                config.device_index,
            )))
        }
        BackendKind::Hip => open_hip(config),
    }
}

#[cfg(feature = "rocm")]
fn open_hip(config: &BridgeConfig) -> Result<SharedRuntime> {
    Ok(Arc::new(crate::rocm::HipRuntime::open(config.device_index)?))
}

#[cfg(not(feature = "rocm"))]
fn open_hip(_config: &BridgeConfig) -> Result<SharedRuntime> {
    Err(tessera_core::TesseraError::Config(
        "backend \"hip\" requires tessera-kernels to be built with the `rocm` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_by_default() {
        let rt = open_runtime(&BridgeConfig::default()).unwrap();
        assert_eq!(rt.name(), "sim");
        assert_eq!(rt.device_index(), 0);
    }

    #[cfg(not(feature = "rocm"))]
    #[test]
    fn test_hip_without_feature_is_config_error() {
        let config = BridgeConfig {
            backend: BackendKind::Hip,
            ..Default::default()
        };
        let err = open_runtime(&config).err().unwrap();
        assert!(matches!(err, tessera_core::TesseraError::Config(_)));
    }
}
