//! Scratch memory shared by the layers of a session.

use tessera_core::{Result, TesseraError};
use tessera_kernels::{DeviceBuffer, DevicePtr, DeviceTensorSpan, SharedRuntime};

/// Collects the scratch requirement of every layer during preparation.
///
/// Layers run one after another on one stream, so a single workspace sized to
/// the largest request serves all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchBudget {
    limit: usize,
    required: usize,
}

impl ScratchBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, required: 0 }
    }

    /// Record that a layer needs `bytes` of scratch.
    pub fn require(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.limit {
            return Err(TesseraError::resource(
                "scratch workspace",
                format!("{bytes} bytes requested, limit is {}", self.limit),
            ));
        }
        self.required = self.required.max(bytes);
        Ok(())
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Device scratch buffer handed to `execute_on_device`.
#[derive(Debug)]
pub struct Workspace {
    buffer: Option<DeviceBuffer>,
}

impl Workspace {
    pub fn empty() -> Self {
        Self { buffer: None }
    }

    /// Grow to at least `bytes`. Existing contents are not preserved.
    pub fn reserve(&mut self, runtime: &SharedRuntime, bytes: usize) -> Result<()> {
        if bytes <= self.len() {
            return Ok(());
        }
        self.buffer = None;
        self.buffer = Some(DeviceBuffer::alloc(runtime, bytes)?);
        tracing::debug!(bytes, "reserved scratch workspace");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, DeviceBuffer::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first `numel` floats of the workspace.
    pub fn span_f32(&mut self, numel: usize) -> Result<DeviceTensorSpan> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.span([numel]),
            None if numel == 0 => DeviceTensorSpan::new(DevicePtr::NULL, 0, [0]),
            None => Err(TesseraError::invalid(format!(
                "workspace is empty, {numel} floats requested"
            ))),
        }
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_kernels::SimRuntime;

    #[test]
    fn test_budget_tracks_maximum() {
        let mut budget = ScratchBudget::new(1024);
        budget.require(100).unwrap();
        budget.require(600).unwrap();
        budget.require(50).unwrap();
        assert_eq!(budget.required(), 600);
        assert!(budget.require(2048).unwrap_err().is_resource_creation());
        assert_eq!(budget.required(), 600);
    }

    #[test]
    fn test_workspace_grows_only() {
        let rt: SharedRuntime = Arc::new(SimRuntime::default());
        let mut ws = Workspace::empty();
        assert!(ws.span_f32(1).is_err());
        ws.reserve(&rt, 64).unwrap();
        ws.reserve(&rt, 16).unwrap();
        assert_eq!(ws.len(), 64);
        assert_eq!(ws.span_f32(16).unwrap().numel(), 16);
        assert!(ws.span_f32(17).is_err());
    }
}
