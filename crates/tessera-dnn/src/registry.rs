//! Layer construction by kind.

use std::collections::HashMap;

use tessera_core::{Result, TesseraError};

use crate::layer::{DeviceLayer, LayerKind, LayerParams};
use crate::layers::{ConstLayer, ReluLayer, ScaleLayer};

/// Builds a device layer from its parameters.
pub type LayerFactory = fn(&LayerParams) -> Result<Box<dyn DeviceLayer>>;

/// Maps layer kinds to device implementations.
///
/// A kind without a factory has no device path; the engine runs it on the
/// CPU instead.
#[derive(Clone)]
pub struct LayerRegistry {
    factories: HashMap<LayerKind, LayerFactory>,
}

impl LayerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in layer.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(LayerKind::Const, |p| Ok(Box::new(ConstLayer::from_params(p)?)));
        registry.register(LayerKind::Scale, |p| Ok(Box::new(ScaleLayer::from_params(p)?)));
        registry.register(LayerKind::Relu, |p| Ok(Box::new(ReluLayer::from_params(p)?)));
        registry
    }

    /// Install `factory` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: LayerKind, factory: LayerFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn supports(&self, kind: LayerKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn create(&self, params: &LayerParams) -> Result<Box<dyn DeviceLayer>> {
        let factory = self.factories.get(&params.kind).ok_or_else(|| {
            TesseraError::invalid(format!("{}: no device implementation for {}", params.name, params.kind))
        })?;
        factory(params)
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::HostTensor;

    #[test]
    fn test_builtin_kinds() {
        let registry = LayerRegistry::with_builtin();
        for kind in [LayerKind::Const, LayerKind::Scale, LayerKind::Relu] {
            assert!(registry.supports(kind));
        }
        let layer = registry
            .create(&LayerParams::new("s", LayerKind::Scale).with_value("alpha", 3.0))
            .unwrap();
        assert_eq!(layer.kind(), LayerKind::Scale);
    }

    #[test]
    fn test_empty_registry_has_no_device_path() {
        let registry = LayerRegistry::new();
        assert!(!registry.supports(LayerKind::Relu));
        let err = registry.create(&LayerParams::new("r", LayerKind::Relu)).err().unwrap();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_const_requires_one_blob() {
        let registry = LayerRegistry::with_builtin();
        assert!(registry.create(&LayerParams::new("c", LayerKind::Const)).is_err());
        let params = LayerParams::new("c", LayerKind::Const).with_blob(HostTensor::zeros(&[2]));
        assert!(registry.create(&params).is_ok());
    }
}
