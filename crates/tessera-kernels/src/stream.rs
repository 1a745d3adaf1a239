//! Reference-counted execution streams.

use std::fmt;
use std::sync::Arc;

use tessera_core::{Result, TesseraError};

use crate::runtime::{RawStream, SharedRuntime};

/// A stream created by us, destroyed when the last reference goes away.
struct OwnedStream {
    runtime: SharedRuntime,
    raw: RawStream,
}

impl Drop for OwnedStream {
    fn drop(&mut self) {
        tracing::debug!(stream = self.raw.0, "destroying stream");
        if let Err(e) = self.runtime.destroy_stream(self.raw) {
            tracing::warn!(stream = self.raw.0, "stream destroy failed: {e}");
        }
    }
}

/// Value-semantics handle to one device command queue.
///
/// Clones refer to the same queue. Work queued on one stream runs in
/// submission order; work on different streams is unordered unless the
/// caller synchronizes in between.
#[derive(Clone)]
pub struct ExecutionStream {
    runtime: SharedRuntime,
    /// `None` is the device's default stream, which is never created or destroyed.
    owned: Option<Arc<OwnedStream>>,
}

impl ExecutionStream {
    /// The device's implicit ordering queue. Requires no creation.
    pub fn default_stream(runtime: &SharedRuntime) -> Self {
        Self {
            runtime: Arc::clone(runtime),
            owned: None,
        }
    }

    /// Create a new stream, independent of every other stream.
    pub fn create(runtime: &SharedRuntime) -> Result<Self> {
        let raw = runtime
            .create_stream()
            .map_err(|e| TesseraError::resource("execution stream", e.to_string()))?;
        tracing::debug!(stream = raw.0, backend = runtime.name(), "created stream");
        Ok(Self {
            runtime: Arc::clone(runtime),
            owned: Some(Arc::new(OwnedStream {
                runtime: Arc::clone(runtime),
                raw,
            })),
        })
    }

    pub fn raw(&self) -> RawStream {
        self.owned.as_ref().map_or(RawStream::DEFAULT, |s| s.raw)
    }

    pub fn is_default(&self) -> bool {
        self.owned.is_none()
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Block until everything queued so far has completed.
    ///
    /// Reports the fault of any queued operation that failed; the stream stays
    /// faulted afterwards.
    pub fn synchronize(&self) -> Result<()> {
        tracing::trace!(stream = self.raw().0, "synchronize");
        self.runtime.synchronize(self.raw())
    }

    /// `true` when no queued work is outstanding.
    pub fn is_idle(&self) -> Result<bool> {
        self.runtime.stream_is_idle(self.raw())
    }

    /// Number of references to the underlying queue (0 for the default stream).
    pub fn use_count(&self) -> usize {
        self.owned.as_ref().map_or(0, Arc::strong_count)
    }

    /// Whether `other` runs on the same runtime instance.
    pub fn same_runtime(&self, other: &SharedRuntime) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.runtime) as *const (),
            Arc::as_ptr(other) as *const (),
        )
    }
}

impl PartialEq for ExecutionStream {
    fn eq(&self, other: &Self) -> bool {
        self.same_runtime(&other.runtime) && self.raw() == other.raw()
    }
}

impl Eq for ExecutionStream {}

impl fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("backend", &self.runtime.name())
            .field("raw", &self.raw().0)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::status;
    use crate::sim::SimRuntime;

    fn sim() -> (Arc<SimRuntime>, SharedRuntime) {
        let sim = Arc::new(SimRuntime::default());
        let rt: SharedRuntime = sim.clone();
        (sim, rt)
    }

    #[test]
    fn test_default_stream_needs_no_creation() {
        let (sim, rt) = sim();
        let s = ExecutionStream::default_stream(&rt);
        assert!(s.is_default());
        assert_eq!(s.raw(), RawStream::DEFAULT);
        s.synchronize().unwrap();
        assert_eq!(sim.stats().streams_created, 0);
    }

    #[test]
    fn test_equality() {
        let (_sim, rt) = sim();
        let a = ExecutionStream::create(&rt).unwrap();
        let b = ExecutionStream::create(&rt).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(ExecutionStream::default_stream(&rt), ExecutionStream::default_stream(&rt));

        let (_other_sim, other_rt) = sim();
        assert_ne!(ExecutionStream::default_stream(&rt), ExecutionStream::default_stream(&other_rt));
    }

    #[test]
    fn test_destroyed_with_last_reference() {
        let (sim, rt) = sim();
        let a = ExecutionStream::create(&rt).unwrap();
        let b = a.clone();
        assert_eq!(a.use_count(), 2);
        drop(a);
        assert_eq!(sim.live_streams(), 1);
        drop(b);
        assert_eq!(sim.live_streams(), 0);
        assert_eq!(sim.stats().streams_destroyed, 1);
    }

    #[test]
    fn test_creation_failure() {
        let (sim, rt) = sim();
        sim.fail_stream_creation(true);
        let err = ExecutionStream::create(&rt).unwrap_err();
        assert!(err.is_resource_creation());
    }

    #[test]
    fn test_synchronize_reports_fault() {
        let (sim, rt) = sim();
        let s = ExecutionStream::create(&rt).unwrap();
        let ptr = rt.alloc(4).unwrap();
        sim.fault_next_operation(status::ILLEGAL_ADDRESS);
        rt.memcpy_dtod_async(ptr, ptr, 4, s.raw()).unwrap();
        assert!(s.is_idle().is_err());
        let err = s.synchronize().unwrap_err();
        assert_eq!(err.status(), Some(status::ILLEGAL_ADDRESS));
        // Poisoned until recreated.
        assert!(s.synchronize().is_err());
    }
}
