//! Sharable compute-library handles.

use std::fmt;
use std::sync::Arc;

use tessera_core::{Result, TesseraError};

use crate::runtime::{ComputeLibrary, LibraryCall, RawHandle, SharedRuntime};
use crate::stream::ExecutionStream;

/// Owns one library context. Destroyed exactly once, by the last
/// [`SharedHandle`] referring to it. The stream it is bound to is a field, so
/// the context is always destroyed before its stream reference is released.
struct UniqueHandle {
    library: ComputeLibrary,
    raw: RawHandle,
    stream: ExecutionStream,
}

impl Drop for UniqueHandle {
    fn drop(&mut self) {
        tracing::debug!(library = %self.library, handle = self.raw.0, "destroying compute handle");
        if let Err(e) = self.stream.runtime().destroy_handle(self.library, self.raw) {
            tracing::warn!(library = %self.library, handle = self.raw.0, "handle destroy failed: {e}");
        }
    }
}

/// Reference-counted wrapper around an expensive library context.
///
/// Cloning adds a reference to the same context. `SharedHandle::default()`
/// is an invalid placeholder; [`take`](SharedHandle::take) moves the context
/// out and leaves such a placeholder behind.
#[derive(Clone, Default)]
pub struct SharedHandle {
    inner: Option<Arc<UniqueHandle>>,
}

impl SharedHandle {
    /// Create a context whose calls run on the default stream.
    pub fn create(runtime: &SharedRuntime, library: ComputeLibrary) -> Result<Self> {
        Self::create_on(library, &ExecutionStream::default_stream(runtime))
    }

    /// Create a context bound to `stream` for every call made through it.
    pub fn create_on(library: ComputeLibrary, stream: &ExecutionStream) -> Result<Self> {
        let raw = stream
            .runtime()
            .create_handle(library, stream.raw())
            .map_err(|e| TesseraError::resource(format!("{library} handle"), e.to_string()))?;
        tracing::debug!(library = %library, handle = raw.0, stream = stream.raw().0, "created compute handle");
        Ok(Self {
            inner: Some(Arc::new(UniqueHandle {
                library,
                raw,
                stream: stream.clone(),
            })),
        })
    }

    /// Whether this wraps a live context.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Move the context out, leaving an invalid handle in `self`.
    pub fn take(&mut self) -> SharedHandle {
        std::mem::take(self)
    }

    pub fn library(&self) -> Option<ComputeLibrary> {
        self.inner.as_ref().map(|h| h.library)
    }

    /// Stream the context is bound to.
    pub fn stream(&self) -> Option<&ExecutionStream> {
        self.inner.as_ref().map(|h| &h.stream)
    }

    /// Number of handles sharing the context (0 when invalid).
    pub fn use_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }

    /// Queue a library operation on the handle's stream.
    pub fn dispatch(&self, call: &LibraryCall) -> Result<()> {
        let h = self.inner.as_ref().ok_or_else(|| {
            TesseraError::invalid(format!("{}: dispatch through an invalid handle", call.name()))
        })?;
        tracing::trace!(library = %h.library, call = call.name(), "dispatch");
        h.stream.runtime().dispatch(h.library, h.raw, call)
    }
}

impl fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(h) => f
                .debug_struct("SharedHandle")
                .field("library", &h.library)
                .field("raw", &h.raw.0)
                .field("stream", &h.stream)
                .finish(),
            None => write!(f, "SharedHandle(invalid)"),
        }
    }
}

/// The library contexts a session hands to every layer.
#[derive(Debug, Clone, Default)]
pub struct ComputeHandles {
    pub blas: SharedHandle,
    pub dnn: SharedHandle,
}

impl ComputeHandles {
    /// Create one context per library, all bound to `stream`.
    pub fn create(stream: &ExecutionStream) -> Result<Self> {
        Ok(Self {
            blas: SharedHandle::create_on(ComputeLibrary::Blas, stream)?,
            dnn: SharedHandle::create_on(ComputeLibrary::Dnn, stream)?,
        })
    }

    pub fn get(&self, library: ComputeLibrary) -> &SharedHandle {
        match library {
            ComputeLibrary::Blas => &self.blas,
            ComputeLibrary::Dnn => &self.dnn,
        }
    }
}
