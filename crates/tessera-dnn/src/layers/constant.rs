//! Constant layer: emits a fixed blob.

use tessera_core::{HostTensor, Result, Shape};
use tessera_kernels::ops::{copy_dtod, copy_htod};
use tessera_kernels::{DeviceBuffer, DeviceTensorSpan, DeviceTensorView, ExecutionStream};

use crate::layer::{expect_count, prepared, DeviceContext, DeviceLayer, LayerKind, LayerParams};
use crate::workspace::{ScratchBudget, Workspace};

/// Output = the layer's single blob. Takes no inputs.
///
/// The blob is uploaded once during preparation; each pass is a
/// device-to-device copy into the output.
pub struct ConstLayer {
    blob: HostTensor,
    device: Option<(DeviceBuffer, ExecutionStream)>,
}

impl ConstLayer {
    pub fn new(blob: HostTensor) -> Self {
        Self { blob, device: None }
    }

    pub fn from_params(params: &LayerParams) -> Result<Self> {
        expect_count(LayerKind::Const, "blobs", 1, params.blobs.len())?;
        Ok(Self::new(params.blobs[0].clone()))
    }
}

impl DeviceLayer for ConstLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Const
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        expect_count(LayerKind::Const, "inputs", 0, inputs.len())?;
        Ok(vec![self.blob.shape().clone()])
    }

    fn prepare_for_device(&mut self, context: &DeviceContext, _scratch: &mut ScratchBudget) -> Result<()> {
        let stream = &context.stream;
        let mut constant = DeviceBuffer::alloc_f32(stream.runtime(), self.blob.numel())?;
        let dst = constant.span(self.blob.shape().clone())?;
        {
            let src = self.blob.read();
            // SAFETY: the read guard is held until the stream is synchronized.
            unsafe { copy_htod(stream, &dst, &src)? };
            stream.synchronize()?;
        }
        tracing::debug!(shape = %self.blob.shape(), "uploaded constant blob");
        self.device = Some((constant, stream.clone()));
        Ok(())
    }

    fn execute_on_device(
        &mut self,
        inputs: &[DeviceTensorView],
        outputs: &[DeviceTensorSpan],
        _workspace: &mut Workspace,
    ) -> Result<()> {
        expect_count(LayerKind::Const, "inputs", 0, inputs.len())?;
        expect_count(LayerKind::Const, "outputs", 1, outputs.len())?;
        let (constant, stream) = prepared(LayerKind::Const, self.device.as_ref())?;
        let src = constant.view(self.blob.shape().clone())?;
        copy_dtod(stream, &outputs[0], &src)
    }
}
