//! Engine-side glue: one device, one stream, one set of library handles.

use tessera_core::{BridgeConfig, HostTensor, Result, StreamPolicy, TesseraError};
use tessera_kernels::{open_runtime, ComputeHandles, ExecutionStream, SharedRuntime};

use crate::block::BlockArena;
use crate::coherent::CoherentBuffer;
use crate::layer::{DeviceContext, DeviceLayer, LayerKind, LayerParams};
use crate::registry::LayerRegistry;
use crate::workspace::{ScratchBudget, Workspace};

/// Drives device execution of layers for an inference engine.
pub struct DeviceSession {
    config: BridgeConfig,
    runtime: SharedRuntime,
    context: DeviceContext,
    arena: BlockArena,
    registry: LayerRegistry,
    workspace: Workspace,
}

impl DeviceSession {
    /// Open the runtime named by `config` and set up a session on it.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let runtime = open_runtime(&config)?;
        Self::with_runtime(config, runtime)
    }

    /// Set up a session on an already opened runtime.
    pub fn with_runtime(config: BridgeConfig, runtime: SharedRuntime) -> Result<Self> {
        config.validate()?;
        let stream = match config.stream {
            StreamPolicy::Default => ExecutionStream::default_stream(&runtime),
            StreamPolicy::Dedicated => ExecutionStream::create(&runtime)?,
        };
        let handles = ComputeHandles::create(&stream)?;
        let mut context = DeviceContext::new(stream, handles);
        context.min_block_size = config.min_block_size;
        tracing::info!(
            backend = runtime.name(),
            device = runtime.device_index(),
            stream = ?config.stream,
            "device session ready"
        );
        Ok(Self {
            config,
            runtime,
            context,
            arena: BlockArena::new(),
            registry: LayerRegistry::with_builtin(),
            workspace: Workspace::empty(),
        })
    }

    /// Replace the layer registry.
    pub fn with_registry(mut self, registry: LayerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    pub fn stream(&self) -> &ExecutionStream {
        &self.context.stream
    }

    pub fn handles(&self) -> &ComputeHandles {
        &self.context.handles
    }

    pub fn arena(&self) -> &BlockArena {
        &self.arena
    }

    pub fn workspace_bytes(&self) -> usize {
        self.workspace.len()
    }

    /// Whether `kind` has a device implementation in this session.
    pub fn supports_device_execution(&self, kind: LayerKind) -> bool {
        self.registry.supports(kind)
    }

    /// Wrap an engine tensor so it can cross to the device.
    pub fn wrap_host(&self, host: HostTensor) -> Result<CoherentBuffer> {
        CoherentBuffer::from_host(&self.arena, host, &self.context.stream)
    }

    /// Build a layer from `params` and prepare it for this session.
    pub fn create_layer(&mut self, params: &LayerParams) -> Result<Box<dyn DeviceLayer>> {
        let mut layer = self.registry.create(params)?;
        self.prepare(layer.as_mut())?;
        Ok(layer)
    }

    /// Bind session resources to `layer` and grow the workspace to its needs.
    pub fn prepare(&mut self, layer: &mut dyn DeviceLayer) -> Result<()> {
        let mut scratch = ScratchBudget::new(self.config.max_scratch_bytes);
        layer.prepare_for_device(&self.context, &mut scratch)?;
        self.workspace.reserve(&self.runtime, scratch.required())?;
        tracing::debug!(layer = %layer.kind(), scratch = scratch.required(), "prepared layer");
        Ok(())
    }

    /// Run one pass of `layer` on the device.
    ///
    /// Inputs are brought up to date on the device first. Every output is
    /// marked device-ahead before the layer runs, so a later host read copies
    /// the result back.
    pub fn forward(
        &mut self,
        layer: &mut dyn DeviceLayer,
        inputs: &[CoherentBuffer],
        outputs: &mut [CoherentBuffer],
    ) -> Result<()> {
        if !layer.supports_device_execution() {
            return Err(TesseraError::invalid(format!("{}: no device execution", layer.kind())));
        }
        let input_shapes: Vec<_> = inputs.iter().map(|b| b.shape().clone()).collect();
        let expected = layer.output_shapes(&input_shapes)?;
        if expected.len() != outputs.len() {
            return Err(TesseraError::invalid(format!(
                "{}: produces {} outputs, {} given",
                layer.kind(),
                expected.len(),
                outputs.len()
            )));
        }
        for (shape, output) in expected.iter().zip(outputs.iter()) {
            if shape.numel() != output.shape().numel() {
                return Err(TesseraError::invalid(format!(
                    "{}: output {} does not match expected {}",
                    layer.kind(),
                    output.shape(),
                    shape
                )));
            }
        }

        let views = inputs.iter().map(CoherentBuffer::device_view).collect::<Result<Vec<_>>>()?;
        let spans = outputs
            .iter_mut()
            .map(CoherentBuffer::device_span)
            .collect::<Result<Vec<_>>>()?;
        tracing::trace!(layer = %layer.kind(), inputs = views.len(), outputs = spans.len(), "forward");
        layer.execute_on_device(&views, &spans, &mut self.workspace)
    }

    /// Wait for everything queued on the session stream.
    pub fn synchronize(&self) -> Result<()> {
        self.context.stream.synchronize()
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("backend", &self.runtime.name())
            .field("stream", &self.context.stream)
            .field("arena", &self.arena)
            .field("workspace_bytes", &self.workspace.len())
            .finish()
    }
}
