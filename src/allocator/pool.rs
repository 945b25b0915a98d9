//! Bounded pool of same-shape Memories.
//!
//! All pool state lives behind one mutex with one condvar for waiters.
//! Allocations made by acquire and frees made by release run with the lock
//! dropped. The pool counts a Memory as created before its allocation starts,
//! so the cap holds while allocations are in flight.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::direct::DirectAllocator;
use crate::api::config::PoolConfig;
use crate::api::stats::PoolStats;
use crate::device::Device;
use crate::error::{FrameError, Result};
use crate::fp_emit;
use crate::memory::{Memory, MemoryShape};
use crate::sync::mutex::{Condvar, Mutex, MutexGuard};

/// Lifecycle phase of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// Holds no Memories; may be configured
    Inactive,
    /// Serving acquires
    Active,
    /// Rejecting acquires until every outstanding Memory is back
    Flushing,
}

#[derive(Clone, Copy)]
enum WaitMode {
    Block,
    Never,
    Until(Instant),
}

struct PoolState {
    shape: MemoryShape,
    min_count: usize,
    max_count: usize,
    phase: PoolPhase,
    queue: VecDeque<Memory>,
    outstanding: usize,
    created: usize,
    element_size: usize,
    peak_outstanding: usize,
    acquires: u64,
    waits: u64,
}

impl PoolState {
    fn can_grow(&self) -> bool {
        !self.shape.is_array() && (self.max_count == 0 || self.created < self.max_count)
    }

    fn hand_out(&mut self) {
        self.outstanding += 1;
        self.acquires += 1;
        self.peak_outstanding = self.peak_outstanding.max(self.outstanding);
    }

    /// Move to Inactive, returning the queued Memories for release.
    fn stop(&mut self, name: &str) -> VecDeque<Memory> {
        let freed = std::mem::take(&mut self.queue);
        self.created -= freed.len();
        self.phase = PoolPhase::Inactive;
        log::debug!("{}: stopped, releasing {} memories", name, freed.len());
        freed
    }
}

pub(crate) struct PoolShared {
    device: Device,
    name: String,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolShared {
    fn release(&self, memory: Memory) {
        let mut state = self.state.lock();
        if state.outstanding == 0 {
            drop(state);
            fp_emit!(FP901, format!("{}: release with nothing outstanding", self.name));
            drop(memory);
            return;
        }
        state.outstanding -= 1;

        match state.phase {
            PoolPhase::Active => {
                state.queue.push_back(memory);
                drop(state);
                self.available.notify_one();
            }
            PoolPhase::Flushing => {
                // Everything is freed together once the last one is back.
                state.queue.push_back(memory);
                let freed = if state.outstanding == 0 {
                    state.stop(&self.name)
                } else {
                    VecDeque::new()
                };
                drop(state);
                drop(freed);
            }
            PoolPhase::Inactive => {
                state.created -= 1;
                drop(state);
                drop(memory);
            }
        }
    }
}

/// A pool of Memories sharing one shape.
///
/// Dropping the pool deactivates it. Outstanding handles keep the pool state
/// alive; the last release frees every Memory of the pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = PoolAllocator::new(&device, shape);
/// pool.configure(shape, 0, 3)?;
/// pool.set_active(true)?;
///
/// let frame = pool.acquire()?;
/// // frame derefs to Memory
/// drop(frame); // back to the queue
/// ```
pub struct PoolAllocator {
    shared: Arc<PoolShared>,
}

impl PoolAllocator {
    /// An inactive, unbounded pool of `shape` on `device`.
    pub fn new(device: &Device, shape: MemoryShape) -> Self {
        Self::build(device, shape, None)
    }

    /// An inactive pool configured from `config`.
    pub fn with_config(device: &Device, config: &PoolConfig) -> Result<Self> {
        let pool = Self::build(device, config.shape, config.name.clone());
        pool.configure_with(config)?;
        Ok(pool)
    }

    fn build(device: &Device, shape: MemoryShape, name: Option<String>) -> Self {
        let element_size = DirectAllocator::layout_for(device, &shape).size();
        let name = name.unwrap_or_else(|| {
            format!(
                "pool({} {:?} {}x{})",
                device.name(),
                shape.format,
                shape.width,
                shape.height
            )
        });
        Self {
            shared: Arc::new(PoolShared {
                device: device.clone(),
                name,
                state: Mutex::new(PoolState {
                    shape,
                    min_count: 0,
                    max_count: 0,
                    phase: PoolPhase::Inactive,
                    queue: VecDeque::new(),
                    outstanding: 0,
                    created: 0,
                    element_size,
                    peak_outstanding: 0,
                    acquires: 0,
                    waits: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Log name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Owning device.
    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    /// Current phase.
    pub fn phase(&self) -> PoolPhase {
        self.shared.state.lock().phase
    }

    /// Whether acquires are served.
    pub fn is_active(&self) -> bool {
        self.phase() == PoolPhase::Active
    }

    /// Current shape.
    pub fn shape(&self) -> MemoryShape {
        self.shared.state.lock().shape
    }

    /// Set shape and bounds. Returns the size of one Memory.
    ///
    /// Only allowed while inactive with nothing outstanding. An array shape
    /// fixes the pool size at `array_size`.
    pub fn configure(&self, shape: MemoryShape, min_count: usize, max_count: usize) -> Result<usize> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.phase != PoolPhase::Inactive || state.outstanding > 0 {
            fp_emit!(FP302, shared.name.clone());
            return Err(FrameError::InvalidState("pool must be inactive to configure"));
        }
        if max_count != 0 && min_count > max_count {
            return Err(FrameError::InvalidState("min_count exceeds max_count"));
        }
        if let Err(err) = shared.device.validate_shape(&shape) {
            fp_emit!(FP301, format!("{}: {}", shared.name, err));
            return Err(err);
        }

        let (min_count, max_count) = if shape.is_array() {
            let n = shape.array_size as usize;
            (n, n)
        } else {
            (min_count, max_count)
        };

        state.shape = shape;
        state.min_count = min_count;
        state.max_count = max_count;
        state.element_size = DirectAllocator::layout_for(&shared.device, &shape).size();

        log::debug!(
            "{}: configured min {} max {} ({} bytes each)",
            shared.name,
            min_count,
            max_count,
            state.element_size
        );
        Ok(state.element_size)
    }

    /// [`configure`](Self::configure) from a [`PoolConfig`].
    pub fn configure_with(&self, config: &PoolConfig) -> Result<usize> {
        self.configure(config.shape, config.min_count, config.max_count)
    }

    /// Activate or deactivate the pool.
    ///
    /// Activating allocates an array shape's every slice, or `min_count`
    /// Memories otherwise; a flushing pool resumes with what it still holds.
    /// Deactivating fails pending and future acquires with
    /// [`FrameError::Flushing`] and frees everything once all outstanding
    /// Memories are back.
    pub fn set_active(&self, active: bool) -> Result<()> {
        if active {
            self.activate()
        } else {
            self.deactivate();
            Ok(())
        }
    }

    fn activate(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        match state.phase {
            PoolPhase::Active => return Ok(()),
            PoolPhase::Flushing => {
                state.phase = PoolPhase::Active;
                log::debug!("{}: resumed while flushing", shared.name);
                return Ok(());
            }
            PoolPhase::Inactive => {}
        }

        let shape = state.shape;
        let memories = if shape.is_array() {
            DirectAllocator::alloc_array(&shared.device, shape)?
        } else {
            (0..state.min_count)
                .map(|_| DirectAllocator::alloc(&shared.device, shape))
                .collect::<Result<Vec<_>>>()?
        };

        state.created += memories.len();
        state.queue.extend(memories);
        state.phase = PoolPhase::Active;
        log::debug!("{}: active with {} preallocated", shared.name, state.created);
        Ok(())
    }

    fn deactivate(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.phase != PoolPhase::Active {
            return;
        }

        state.phase = PoolPhase::Flushing;
        log::debug!("{}: flushing with {} outstanding", shared.name, state.outstanding);
        let freed = if state.outstanding == 0 {
            state.stop(&shared.name)
        } else {
            VecDeque::new()
        };
        drop(state);
        shared.available.notify_all();
        drop(freed);
    }

    /// Take a Memory, blocking while the pool is at its cap.
    pub fn acquire(&self) -> Result<MemoryHandle> {
        self.acquire_with(WaitMode::Block)
    }

    /// Take a Memory, failing with [`FrameError::PoolExhausted`] instead of
    /// blocking.
    pub fn try_acquire(&self) -> Result<MemoryHandle> {
        self.acquire_with(WaitMode::Never)
    }

    /// Take a Memory, failing with [`FrameError::TimedOut`] after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<MemoryHandle> {
        self.acquire_with(WaitMode::Until(Instant::now() + timeout))
    }

    fn acquire_with(&self, mode: WaitMode) -> Result<MemoryHandle> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let mut waited = false;

        loop {
            if state.phase != PoolPhase::Active {
                log::debug!("{}: acquire while {:?}", shared.name, state.phase);
                return Err(FrameError::Flushing);
            }

            if let Some(memory) = state.queue.pop_front() {
                state.hand_out();
                return Ok(self.handle(memory));
            }

            if state.can_grow() {
                state.created += 1;
                state.hand_out();
                let shape = state.shape;
                drop(state);
                return self.grow(shape);
            }

            if !waited {
                waited = true;
                state.waits += 1;
            }
            state = self.wait(state, mode)?;
        }
    }

    fn wait<'a>(&'a self, mut state: MutexGuard<'a, PoolState>, mode: WaitMode) -> Result<MutexGuard<'a, PoolState>> {
        match mode {
            WaitMode::Never => {
                log::debug!("{}: exhausted at {}", self.shared.name, state.created);
                Err(FrameError::PoolExhausted)
            }
            WaitMode::Block => {
                self.shared.available.wait(&mut state);
                Ok(state)
            }
            WaitMode::Until(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(FrameError::TimedOut);
                }
                self.shared.available.wait_for(&mut state, deadline - now);
                Ok(state)
            }
        }
    }

    /// Allocate a new Memory for an acquire that already counted it.
    fn grow(&self, shape: MemoryShape) -> Result<MemoryHandle> {
        match DirectAllocator::alloc(&self.shared.device, shape) {
            Ok(memory) => Ok(self.handle(memory)),
            Err(err) => {
                let shared = &self.shared;
                let mut state = shared.state.lock();
                state.created -= 1;
                state.outstanding -= 1;
                let freed = if state.phase == PoolPhase::Flushing && state.outstanding == 0 {
                    state.stop(&shared.name)
                } else {
                    VecDeque::new()
                };
                drop(state);
                shared.available.notify_one();
                drop(freed);
                Err(err)
            }
        }
    }

    fn handle(&self, memory: Memory) -> MemoryHandle {
        MemoryHandle {
            memory: Some(memory),
            pool: Some(Arc::clone(&self.shared)),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            created: state.created,
            outstanding: state.outstanding,
            queued: state.queue.len(),
            peak_outstanding: state.peak_outstanding,
            acquires: state.acquires,
            waits: state.waits,
            element_size: state.element_size,
            max_count: state.max_count,
        }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("name", &self.shared.name)
            .field("phase", &self.phase())
            .finish()
    }
}

/// A Memory on loan from a pool, or owned outright.
///
/// Dropping a pooled handle returns the Memory to its pool.
pub struct MemoryHandle {
    memory: Option<Memory>,
    pool: Option<Arc<PoolShared>>,
}

impl MemoryHandle {
    /// A handle that frees its Memory on drop.
    pub fn owned(memory: Memory) -> Self {
        Self {
            memory: Some(memory),
            pool: None,
        }
    }

    /// Whether the Memory goes back to a pool on drop.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// The Memory.
    pub fn memory(&self) -> &Memory {
        match &self.memory {
            Some(memory) => memory,
            None => unreachable!("memory taken before drop"),
        }
    }
}

impl Deref for MemoryHandle {
    type Target = Memory;

    fn deref(&self) -> &Memory {
        self.memory()
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        if let (Some(memory), Some(pool)) = (self.memory.take(), self.pool.take()) {
            pool.release(memory);
        }
    }
}

impl std::fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("memory", &self.memory)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DeviceConfig;
    use crate::device::DeviceRegistry;
    use crate::gpu::{codes, DummyBackend, ResourceKind};
    use crate::memory::VideoFormat;
    use std::thread;

    fn setup() -> (Arc<DummyBackend>, Device) {
        let backend = Arc::new(DummyBackend::new(0));
        let device = DeviceRegistry::new()
            .open(backend.clone(), DeviceConfig::default())
            .unwrap();
        (backend, device)
    }

    fn shape() -> MemoryShape {
        MemoryShape::new(VideoFormat::NV12, 64, 32)
    }

    #[test]
    fn test_inactive_pool_rejects() {
        let (_backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        assert!(pool.acquire().unwrap_err().is_flushing());
    }

    #[test]
    fn test_released_memory_is_reused() {
        let (backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.configure(shape(), 0, 2).unwrap();
        pool.set_active(true).unwrap();

        let first = pool.acquire().unwrap();
        let id = first.id();
        drop(first);
        let again = pool.acquire().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 1);
    }

    #[test]
    fn test_min_count_preallocates() {
        let (backend, device) = setup();
        let pool = PoolAllocator::with_config(&device, &PoolConfig::bounded(shape(), 4).with_min_count(2)).unwrap();
        pool.set_active(true).unwrap();
        assert_eq!(pool.stats().queued, 2);
        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 2);
    }

    #[test]
    fn test_try_acquire_exhausted() {
        let (_backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.configure(shape(), 0, 1).unwrap();
        pool.set_active(true).unwrap();

        let _held = pool.try_acquire().unwrap();
        assert_eq!(pool.try_acquire().unwrap_err(), FrameError::PoolExhausted);
        assert_eq!(
            pool.acquire_timeout(Duration::from_millis(10)).unwrap_err(),
            FrameError::TimedOut
        );
    }

    #[test]
    fn test_configure_requires_inactive() {
        let (_backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.set_active(true).unwrap();
        assert!(matches!(pool.configure(shape(), 0, 2), Err(FrameError::InvalidState(_))));
        pool.set_active(false).unwrap();
        assert!(pool.configure(shape(), 0, 2).is_ok());
    }

    #[test]
    fn test_configure_rejects_bad_shape() {
        let (_backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        let err = pool
            .configure(MemoryShape::new(VideoFormat::NV12, 0, 32), 0, 2)
            .unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedShape(_)));
    }

    #[test]
    fn test_flush_waits_for_outstanding() {
        let (backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.set_active(true).unwrap();

        let held = pool.acquire().unwrap();
        let queued = pool.acquire().unwrap();
        drop(queued);
        pool.set_active(false).unwrap();

        assert_eq!(pool.phase(), PoolPhase::Flushing);
        assert!(pool.acquire().unwrap_err().is_flushing());
        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 2);

        drop(held);
        assert_eq!(pool.phase(), PoolPhase::Inactive);
        assert_eq!(pool.stats().created, 0);
        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 0);
    }

    #[test]
    fn test_flush_frees_only_at_last_release() {
        let (backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.set_active(true).unwrap();

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        pool.set_active(false).unwrap();

        drop(first);
        assert_eq!(pool.phase(), PoolPhase::Flushing);
        assert_eq!(pool.stats().created, 2);
        assert_eq!(backend.counters().device_resources_destroyed.get(), 0);

        drop(second);
        assert_eq!(pool.phase(), PoolPhase::Inactive);
        assert_eq!(backend.counters().device_resources_destroyed.get(), 2);
    }

    #[test]
    fn test_flush_wakes_waiter() {
        let (_backend, device) = setup();
        let pool = Arc::new(PoolAllocator::new(&device, shape()));
        pool.configure(shape(), 0, 1).unwrap();
        pool.set_active(true).unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|m| m.id()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.set_active(false).unwrap();

        assert!(waiter.join().unwrap().unwrap_err().is_flushing());
        drop(held);
    }

    #[test]
    fn test_resume_while_flushing() {
        let (_backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.set_active(true).unwrap();
        let held = pool.acquire().unwrap();

        pool.set_active(false).unwrap();
        pool.set_active(true).unwrap();
        assert!(pool.is_active());
        let id = held.id();
        drop(held);
        assert_eq!(pool.acquire().unwrap().id(), id);
    }

    #[test]
    fn test_array_pool_is_fixed() {
        let (backend, device) = setup();
        let array = shape().with_array_size(2);
        let pool = PoolAllocator::new(&device, array);
        pool.configure(array, 0, 0).unwrap();
        pool.set_active(true).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.native(), b.native());
        assert_eq!(pool.try_acquire().unwrap_err(), FrameError::PoolExhausted);
        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 1);

        drop(a);
        pool.set_active(false).unwrap();
        drop(b);
        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 0);
    }

    #[test]
    fn test_failed_growth_releases_slot() {
        let (backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.configure(shape(), 0, 1).unwrap();
        pool.set_active(true).unwrap();

        backend.fail_next("create_resource", codes::OUT_OF_MEMORY);
        assert!(pool.acquire().is_err());
        let stats = pool.stats();
        assert_eq!((stats.created, stats.outstanding), (0, 0));
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_handle_outlives_pool() {
        let (backend, device) = setup();
        let pool = PoolAllocator::new(&device, shape());
        pool.set_active(true).unwrap();
        let held = pool.acquire().unwrap();
        drop(pool);

        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 1);
        drop(held);
        assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 0);
    }
}
