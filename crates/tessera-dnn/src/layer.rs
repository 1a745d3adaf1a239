//! The per-operator device integration point.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_core::{HostTensor, Result, Shape, TesseraError};
use tessera_kernels::{ComputeHandles, DeviceTensorSpan, DeviceTensorView, ExecutionStream, DEFAULT_MIN_BLOCK_SIZE};

use crate::workspace::{ScratchBudget, Workspace};

/// Operators with a device implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Const,
    Scale,
    Relu,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Const => write!(f, "const"),
            LayerKind::Scale => write!(f, "scale"),
            LayerKind::Relu => write!(f, "relu"),
        }
    }
}

/// Host-side description of one layer instance.
///
/// Scalar attributes come from the model description; constant blobs are
/// attached by the engine after loading weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerParams {
    pub name: String,
    pub kind: LayerKind,
    #[serde(default)]
    pub values: BTreeMap<String, f32>,
    #[serde(skip)]
    pub blobs: Vec<HostTensor>,
}

impl LayerParams {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            values: BTreeMap::new(),
            blobs: Vec::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: f32) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_blob(mut self, blob: HostTensor) -> Self {
        self.blobs.push(blob);
        self
    }

    /// Scalar attribute `key`, or `default` when absent.
    pub fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.values.get(key).copied().unwrap_or(default)
    }
}

/// Device resources a session hands to each layer at preparation time.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub stream: ExecutionStream,
    pub handles: ComputeHandles,
    /// Floor for launch block sizes on small problems.
    pub min_block_size: u32,
}

impl DeviceContext {
    pub fn new(stream: ExecutionStream, handles: ComputeHandles) -> Self {
        Self {
            stream,
            handles,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
        }
    }
}

/// A layer that can run on the device.
///
/// The session calls [`prepare_for_device`](DeviceLayer::prepare_for_device)
/// once, then [`execute_on_device`](DeviceLayer::execute_on_device) once per
/// forward pass. Everything a layer enqueues goes on the stream it was
/// prepared with.
pub trait DeviceLayer: Send {
    fn kind(&self) -> LayerKind;

    fn supports_device_execution(&self) -> bool {
        true
    }

    /// Output shapes for the given input shapes.
    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>>;

    /// Bind device resources, upload constants and report scratch needs.
    fn prepare_for_device(&mut self, context: &DeviceContext, scratch: &mut ScratchBudget) -> Result<()>;

    /// Enqueue the layer's work. Inputs are up to date on the device; every
    /// output is treated as overwritten.
    fn execute_on_device(
        &mut self,
        inputs: &[DeviceTensorView],
        outputs: &[DeviceTensorSpan],
        workspace: &mut Workspace,
    ) -> Result<()>;
}

/// Fail with `InvalidArgument` unless exactly `expected` tensors were given.
pub(crate) fn expect_count(layer: LayerKind, what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(TesseraError::invalid(format!(
            "{layer}: expected {expected} {what}, got {actual}"
        )))
    }
}

/// Fail with `InvalidArgument` if the layer was never prepared.
pub(crate) fn prepared<T>(layer: LayerKind, value: Option<&T>) -> Result<&T> {
    value.ok_or_else(|| TesseraError::invalid(format!("{layer}: executed before prepare_for_device")))
}
