//! GPU completion fences.
//!
//! A [`Fence`] wraps a native timeline: the GPU advances a completed value,
//! the host records the value it needs and blocks until the GPU gets there.
//! Waiting for `v` also satisfies every wait for a smaller value, so the
//! recorded target only ever moves forward.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::fp_native;
use crate::gpu::{GpuBackend, NativeFence, QueueKind};
use crate::sync::atomics::MonotonicU64;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The awaited value completed.
    Completed,
    /// The timeout elapsed first.
    TimedOut,
}

impl WaitStatus {
    /// Whether the wait completed.
    pub fn is_completed(self) -> bool {
        self == WaitStatus::Completed
    }
}

/// A monotonic GPU completion counter with a blocking host wait.
pub struct Fence {
    backend: Arc<dyn GpuBackend>,
    native: NativeFence,
    target: MonotonicU64,
}

impl Fence {
    /// Create a fence with completed value 0 and no pending target.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Result<Self> {
        let native = backend.create_fence().map_err(|e| fp_native!(FP104, e))?;
        Ok(Self {
            backend,
            native,
            target: MonotonicU64::new(0),
        })
    }

    /// Native handle.
    pub fn native(&self) -> NativeFence {
        self.native
    }

    /// The value the next [`wait`](Self::wait) blocks for.
    pub fn target(&self) -> u64 {
        self.target.get()
    }

    /// Record that the next wait must block until `value`.
    ///
    /// Stale values (not above the current target) are ignored.
    pub fn request_completion(&self, value: u64) {
        if !self.target.raise(value) {
            log::trace!("fence {:?}: ignoring stale completion request {}", self.native, value);
        }
    }

    /// Enqueue a GPU signal of `value` on `queue` and request its completion.
    pub fn signal(&self, queue: QueueKind, value: u64) -> Result<()> {
        self.backend
            .signal_fence(queue, self.native, value)
            .map_err(|e| fp_native!(FP103, e))?;
        self.request_completion(value);
        Ok(())
    }

    /// The last value the GPU reported complete.
    pub fn completed_value(&self) -> Result<u64> {
        self.backend
            .fence_completed_value(self.native)
            .map_err(|e| fp_native!(FP101, e))
    }

    /// Whether `value` has completed.
    pub fn is_completed(&self, value: u64) -> Result<bool> {
        Ok(value == 0 || self.completed_value()? >= value)
    }

    /// Block until the recorded target completes.
    ///
    /// Returns immediately when there is no target or it already completed.
    /// `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitStatus> {
        self.wait_for(self.target(), timeout)
    }

    /// Block until `value` completes.
    pub fn wait_for(&self, value: u64, timeout: Option<Duration>) -> Result<WaitStatus> {
        if self.is_completed(value)? {
            return Ok(WaitStatus::Completed);
        }

        let completed = self
            .backend
            .wait_fence(self.native, value, timeout)
            .map_err(|e| fp_native!(FP102, e))?;

        if completed {
            Ok(WaitStatus::Completed)
        } else {
            log::debug!("fence {:?}: wait for {} timed out", self.native, value);
            Ok(WaitStatus::TimedOut)
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.backend.destroy_fence(self.native);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("native", &self.native)
            .field("target", &self.target.get())
            .finish()
    }
}

/// A fence together with the value that marks one GPU operation.
#[derive(Debug, Clone)]
pub struct FenceMark {
    /// The fence
    pub fence: Arc<Fence>,
    /// Value signaled when the operation completes
    pub value: u64,
}

impl FenceMark {
    /// Create a mark.
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    /// Whether the marked operation completed.
    pub fn is_completed(&self) -> Result<bool> {
        self.fence.is_completed(self.value)
    }

    /// Block until the marked operation completes.
    pub fn wait(&self) -> Result<()> {
        self.fence.wait_for(self.value, None).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{codes, DummyBackend};
    use std::thread;

    #[test]
    fn test_wait_without_target_returns() {
        let backend = Arc::new(DummyBackend::new(0).with_manual_completion());
        let fence = Fence::new(backend.clone()).unwrap();
        assert_eq!(fence.wait(None).unwrap(), WaitStatus::Completed);
        assert_eq!(backend.counters().blocking_waits.get(), 0);
    }

    #[test]
    fn test_request_completion_is_monotonic() {
        let backend = Arc::new(DummyBackend::new(0));
        let fence = Fence::new(backend).unwrap();
        fence.request_completion(7);
        fence.request_completion(3);
        assert_eq!(fence.target(), 7);
    }

    #[test]
    fn test_wait_times_out_then_completes() {
        let backend = Arc::new(DummyBackend::new(0).with_manual_completion());
        let fence = Arc::new(Fence::new(backend.clone()).unwrap());
        fence.signal(QueueKind::Copy, 2).unwrap();

        let status = fence.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(status, WaitStatus::TimedOut);

        let native = fence.native();
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            backend.complete_fence(native, 2);
        });
        assert!(fence.wait(None).unwrap().is_completed());
        completer.join().unwrap();

        // Waiting for an older value is satisfied by the newer completion
        assert!(fence.wait_for(1, Some(Duration::ZERO)).unwrap().is_completed());
    }

    #[test]
    fn test_query_failure_propagates() {
        let backend = Arc::new(DummyBackend::new(0).with_manual_completion());
        let fence = Fence::new(backend.clone()).unwrap();
        fence.signal(QueueKind::Copy, 1).unwrap();

        backend.fail_next("fence_completed_value", codes::INVALID_CONTEXT);
        let err = fence.wait(None).unwrap_err();
        assert_eq!(err.native_code(), Some(codes::INVALID_CONTEXT));
    }
}
