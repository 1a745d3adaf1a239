//! Error taxonomy shared by every tessera crate.

/// Errors surfaced by the host/device bridge.
///
/// Every variant is reported synchronously by the call that detects it. Nothing
/// in this workspace retries or falls back to the CPU path on its own; that is
/// an engine-level decision.
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    /// A handle, stream, device allocation or host pin could not be created.
    /// Fatal to the session.
    #[error("failed to create {resource}: {reason}")]
    ResourceCreation { resource: String, reason: String },

    /// Inconsistent shapes, ranges or arguments. Programmer error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An enqueued operation or library call reported a non-success status.
    #[error("device error {status} in {context}")]
    Device { status: i32, context: String },

    /// Configuration could not be read or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TesseraError {
    pub fn resource(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        TesseraError::ResourceCreation {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        TesseraError::InvalidArgument(msg.into())
    }

    pub fn device(status: i32, context: impl Into<String>) -> Self {
        TesseraError::Device {
            status,
            context: context.into(),
        }
    }

    /// Library or runtime status code, if this is a device error.
    pub fn status(&self) -> Option<i32> {
        match self {
            TesseraError::Device { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_device_error(&self) -> bool {
        matches!(self, TesseraError::Device { .. })
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, TesseraError::InvalidArgument(_))
    }

    pub fn is_resource_creation(&self) -> bool {
        matches!(self, TesseraError::ResourceCreation { .. })
    }
}

/// Success status shared by every runtime and library we wrap.
pub const STATUS_SUCCESS: i32 = 0;

/// Check a runtime or library return code.
///
/// Non-zero codes become [`TesseraError::Device`] tagged with `context`.
pub fn check_status(code: i32, context: &str) -> Result<(), TesseraError> {
    if code == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(TesseraError::device(code, context))
    }
}
