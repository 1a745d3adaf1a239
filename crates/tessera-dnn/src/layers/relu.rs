//! ReLU through the DNN library.

use tessera_core::{Result, Shape, TesseraError};
use tessera_kernels::{DeviceTensorSpan, DeviceTensorView, LibraryCall, SharedHandle};

use crate::layer::{expect_count, prepared, DeviceContext, DeviceLayer, LayerKind, LayerParams};
use crate::workspace::{ScratchBudget, Workspace};

/// `y = max(x, 0)`, dispatched to the DNN library handle.
#[derive(Default)]
pub struct ReluLayer {
    dnn: Option<SharedHandle>,
}

impl ReluLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(_params: &LayerParams) -> Result<Self> {
        Ok(Self::new())
    }
}

impl DeviceLayer for ReluLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Relu
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        expect_count(LayerKind::Relu, "inputs", 1, inputs.len())?;
        Ok(inputs.to_vec())
    }

    fn prepare_for_device(&mut self, context: &DeviceContext, _scratch: &mut ScratchBudget) -> Result<()> {
        if !context.handles.dnn.is_valid() {
            return Err(TesseraError::invalid("relu: session has no DNN handle"));
        }
        self.dnn = Some(context.handles.dnn.clone());
        Ok(())
    }

    fn execute_on_device(
        &mut self,
        inputs: &[DeviceTensorView],
        outputs: &[DeviceTensorSpan],
        _workspace: &mut Workspace,
    ) -> Result<()> {
        expect_count(LayerKind::Relu, "inputs", 1, inputs.len())?;
        expect_count(LayerKind::Relu, "outputs", 1, outputs.len())?;
        let dnn = prepared(LayerKind::Relu, self.dnn.as_ref())?;
        let (input, output) = (&inputs[0], &outputs[0]);
        if input.numel() != output.numel() || !input.is_contiguous() || !output.is_contiguous() {
            return Err(TesseraError::invalid(format!(
                "relu: input {} and output {} must be contiguous and equally sized",
                input.shape(),
                output.shape()
            )));
        }
        dnn.dispatch(&LibraryCall::ReluForward {
            n: input.numel(),
            x: input.device_ptr(),
            y: output.device_ptr(),
        })
    }
}
