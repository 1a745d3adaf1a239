//! Scale layer: `y = alpha * x + beta`.

use tessera_core::{Result, Shape};
use tessera_kernels::ops::{copy_dtod, scale_shift};
use tessera_kernels::{DeviceTensorSpan, DeviceTensorView, LibraryCall};

use crate::layer::{expect_count, prepared, DeviceContext, DeviceLayer, LayerKind, LayerParams};
use crate::workspace::{ScratchBudget, Workspace};

/// Elementwise affine transform.
///
/// Without a shift the work maps onto BLAS (copy, then `scal` in place on the
/// output). With a shift it runs the `scale_shift` kernel.
pub struct ScaleLayer {
    alpha: f32,
    beta: f32,
    context: Option<DeviceContext>,
}

impl ScaleLayer {
    pub fn new(alpha: f32, beta: f32) -> Self {
        Self {
            alpha,
            beta,
            context: None,
        }
    }

    /// Reads `alpha` (default 1) and `beta` (default 0).
    pub fn from_params(params: &LayerParams) -> Result<Self> {
        Ok(Self::new(params.get_f32("alpha", 1.0), params.get_f32("beta", 0.0)))
    }

    /// Whether execution goes through the BLAS library.
    pub fn uses_blas(&self) -> bool {
        self.beta == 0.0
    }
}

impl DeviceLayer for ScaleLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Scale
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        expect_count(LayerKind::Scale, "inputs", 1, inputs.len())?;
        Ok(inputs.to_vec())
    }

    fn prepare_for_device(&mut self, context: &DeviceContext, _scratch: &mut ScratchBudget) -> Result<()> {
        self.context = Some(context.clone());
        Ok(())
    }

    fn execute_on_device(
        &mut self,
        inputs: &[DeviceTensorView],
        outputs: &[DeviceTensorSpan],
        _workspace: &mut Workspace,
    ) -> Result<()> {
        expect_count(LayerKind::Scale, "inputs", 1, inputs.len())?;
        expect_count(LayerKind::Scale, "outputs", 1, outputs.len())?;
        let ctx = prepared(LayerKind::Scale, self.context.as_ref())?;
        let (input, output) = (&inputs[0], &outputs[0]);

        if self.uses_blas() {
            if output.device_ptr() != input.device_ptr() {
                copy_dtod(&ctx.stream, output, input)?;
            }
            ctx.handles.blas.dispatch(&LibraryCall::Scal {
                n: output.numel(),
                alpha: self.alpha,
                x: output.device_ptr(),
            })
        } else {
            scale_shift(&ctx.stream, output, input, self.alpha, self.beta, ctx.min_block_size)
        }
    }
}
