//! Session configuration for the host/device bridge.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, TesseraError};

/// Which device runtime backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process emulated device. Always available.
    #[default]
    Simulated,
    /// AMD HIP runtime loaded at run time (requires the `rocm` feature).
    Hip,
}

/// Stream every layer of a session enqueues on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPolicy {
    /// The device's implicit ordering queue.
    #[default]
    Default,
    /// A freshly created stream owned by the session.
    Dedicated,
}

/// Properties of the emulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimDeviceConfig {
    pub multiprocessors: u32,
    pub max_threads_per_block: u32,
    pub max_threads_per_multiprocessor: u32,
    pub warp_size: u32,
    /// Total device memory; allocations beyond it fail.
    pub memory_bytes: usize,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            multiprocessors: 8,
            max_threads_per_block: 1024,
            max_threads_per_multiprocessor: 2048,
            warp_size: 32,
            memory_bytes: 256 << 20,
        }
    }
}

/// Configuration for a device session.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub backend: BackendKind,

    /// Device ordinal. Only one device is driven per session.
    pub device_index: usize,

    pub stream: StreamPolicy,

    /// Lower bound on the block size picked for small problems.
    pub min_block_size: u32,

    /// Upper bound on the scratch workspace the layers may request.
    pub max_scratch_bytes: usize,

    pub sim: SimDeviceConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Simulated,
            device_index: 0,
            stream: StreamPolicy::Default,
            min_block_size: 64,
            max_scratch_bytes: 64 << 20,
            sim: SimDeviceConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(text)
            .map_err(|e| TesseraError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TesseraError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_block_size == 0 {
            return Err(TesseraError::Config("min_block_size must be at least 1".into()));
        }
        let sim = &self.sim;
        if sim.multiprocessors == 0 || sim.warp_size == 0 {
            return Err(TesseraError::Config(
                "sim.multiprocessors and sim.warp_size must be non-zero".into(),
            ));
        }
        if sim.max_threads_per_block < sim.warp_size
            || sim.max_threads_per_multiprocessor < sim.max_threads_per_block
        {
            return Err(TesseraError::Config(format!(
                "inconsistent sim thread limits: block {} / multiprocessor {} / warp {}",
                sim.max_threads_per_block, sim.max_threads_per_multiprocessor, sim.warp_size
            )));
        }
        if self.min_block_size > sim.max_threads_per_block {
            return Err(TesseraError::Config(format!(
                "min_block_size {} exceeds max_threads_per_block {}",
                self.min_block_size, sim.max_threads_per_block
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_block_size, 64);
        assert_eq!(config.stream, StreamPolicy::Default);
    }

    #[test]
    fn test_partial_json() {
        let config = BridgeConfig::from_json(r#"{ "stream": "dedicated", "sim": { "multiprocessors": 2 } }"#).unwrap();
        assert_eq!(config.stream, StreamPolicy::Dedicated);
        assert_eq!(config.sim.multiprocessors, 2);
        assert_eq!(config.sim.warp_size, 32);
        assert_eq!(config.backend, BackendKind::Simulated);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = BridgeConfig::from_json(r#"{ "min_block_size": 0 }"#).unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));

        let err = BridgeConfig::from_json(r#"{ "backend": "metal" }"#).unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "backend": "hip", "device_index": 1 }}"#).unwrap();
        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.backend, BackendKind::Hip);
        assert_eq!(config.device_index, 1);

        let missing = BridgeConfig::from_file(Path::new("/nonexistent/tessera.json"));
        assert!(missing.is_err());
    }
}
