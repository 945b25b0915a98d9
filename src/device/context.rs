//! Native context push/pop and the recursive lock serializing it.
//!
//! The native "current context" is per thread, so one thread may push the
//! same device several times while another thread waits for its turn.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::Result;
use crate::gpu::{GpuBackend, NativeResource};
use crate::sync::mutex::{Condvar, Mutex};
use crate::{fp_native, FrameError};

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// A lock that the owning thread may take again without blocking.
#[derive(Default)]
pub(crate) struct ContextLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl ContextLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take the lock, blocking while another thread owns it.
    pub(crate) fn lock(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    return;
                }
                Some(id) if id == me => {
                    owner.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut owner),
            }
        }
    }

    /// Release one level. The lock is free again once depth reaches zero.
    pub(crate) fn unlock(&self) {
        let mut owner = self.owner.lock();
        debug_assert_eq!(owner.thread, Some(thread::current().id()));
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }
    }

    /// Depth held by the calling thread.
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        let owner = self.owner.lock();
        if owner.thread == Some(thread::current().id()) {
            owner.depth
        } else {
            0
        }
    }
}

/// A backend plus the lock that serializes its current-context use.
///
/// Shared by the device and by every native allocation made on it, so
/// allocations can be freed with the context pushed even after the device
/// handle is gone.
pub(crate) struct NativeContext {
    backend: Arc<dyn GpuBackend>,
    lock: ContextLock,
}

impl NativeContext {
    pub(crate) fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            lock: ContextLock::new(),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Take the context lock and make the native context current.
    pub(crate) fn push(&self) -> Result<ContextGuard<'_>> {
        self.lock.lock();
        if let Err(err) = self.backend.push_context() {
            self.lock.unlock();
            return Err(fp_native!(FP001, err));
        }
        Ok(ContextGuard {
            context: self,
            popped: false,
            _not_send: PhantomData,
        })
    }

    /// Destroy a resource with the context pushed, reporting failures.
    pub(crate) fn destroy_resource(&self, resource: NativeResource) {
        let result = self.push().and_then(|ctx| {
            let destroyed = self
                .backend
                .destroy_resource(resource)
                .map_err(|e| fp_native!(FP207, e));
            ctx.pop()?;
            destroyed
        });
        if let Err(err) = result {
            log::debug!("resource {:#x} release failed: {}", resource.handle, err);
        }
    }

    /// Unmap and destroy a staging resource.
    pub(crate) fn destroy_staging(&self, resource: NativeResource) {
        if let Err(err) = self.backend.unmap_host(&resource) {
            crate::diagnostics::emit_native(&crate::diagnostics::FP207, &err);
        }
        self.destroy_resource(resource);
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.lock.depth()
    }
}

/// Keeps a device context current on this thread.
///
/// Dropping the guard pops the context; [`ContextGuard::pop`] does the same
/// and reports a failing pop. The guard is tied to its thread.
pub struct ContextGuard<'a> {
    context: &'a NativeContext,
    popped: bool,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for ContextGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("popped", &self.popped)
            .finish()
    }
}

impl ContextGuard<'_> {
    /// Restore the previous context.
    pub fn pop(mut self) -> Result<()> {
        self.popped = true;
        self.release()
    }

    fn release(&self) -> Result<()> {
        let result = self.context.backend.pop_context();
        self.context.lock.unlock();
        result.map_err(|e| -> FrameError { fp_native!(FP002, e) })
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if !self.popped {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_reentrant_on_same_thread() {
        let lock = ContextLock::new();
        lock.lock();
        lock.lock();
        assert_eq!(lock.depth(), 2);
        lock.unlock();
        lock.unlock();
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_guard_pairs_push_and_pop() {
        let backend = Arc::new(crate::gpu::DummyBackend::new(0));
        let context = NativeContext::new(backend.clone());
        {
            let _outer = context.push().unwrap();
            let inner = context.push().unwrap();
            assert_eq!(backend.context_depth(), 2);
            assert_eq!(context.depth(), 2);
            inner.pop().unwrap();
        }
        assert_eq!(backend.context_depth(), 0);
        assert_eq!(context.depth(), 0);
    }

    #[test]
    fn test_failed_push_releases_lock() {
        let backend = Arc::new(crate::gpu::DummyBackend::new(0));
        backend.fail_next("push_context", crate::gpu::codes::INVALID_CONTEXT);
        let context = NativeContext::new(backend.clone());
        assert!(context.push().is_err());
        assert_eq!(context.depth(), 0);
        assert!(context.push().is_ok());
    }

    #[test]
    fn test_other_thread_waits() {
        let lock = Arc::new(ContextLock::new());
        let entered = Arc::new(AtomicBool::new(false));
        lock.lock();

        let handle = {
            let lock = Arc::clone(&lock);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                lock.lock();
                entered.store(true, Ordering::SeqCst);
                lock.unlock();
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));
        lock.unlock();
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
