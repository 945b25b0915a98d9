//! Dummy GPU backend for testing
//!
//! Resources are plain host allocations and copies execute immediately. Fence
//! completion is controllable: by default a signal completes at once, but a
//! backend built with [`DummyBackend::with_manual_completion`] holds every
//! signal until the test calls [`DummyBackend::complete_all`] or
//! [`DummyBackend::complete_fence`]. Counters record every transfer, resource
//! and registration so tests can assert how many native calls were made.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::traits::*;
use crate::interop::{ContextThread, ForeignBuffer};
use crate::memory::{FrameLayout, TokenCache, VideoFormat};
use crate::sync::atomics::AtomicCounter;
use crate::sync::mutex::{Condvar, Mutex};

enum Storage {
    Owned(Box<[u8]>),
    Foreign(Arc<Mutex<Vec<u8>>>),
}

struct DummyResource {
    kind: ResourceKind,
    storage: Storage,
}

impl DummyResource {
    fn read_rows(&self, offset: u64, stride: u64, width: u64, rows: u32) -> Result<Vec<u8>, NativeError> {
        let mut out = Vec::with_capacity((width * rows as u64) as usize);
        let mut read = |data: &[u8]| -> Result<(), NativeError> {
            for row in 0..rows as u64 {
                let start = (offset + row * stride) as usize;
                let end = start + width as usize;
                let src = data
                    .get(start..end)
                    .ok_or_else(|| NativeError::new("copy_regions", codes::INVALID_VALUE, "source region out of bounds"))?;
                out.extend_from_slice(src);
            }
            Ok(())
        };
        match &self.storage {
            Storage::Owned(data) => read(data)?,
            Storage::Foreign(data) => read(&data.lock())?,
        }
        Ok(out)
    }

    fn write_rows(&mut self, offset: u64, stride: u64, width: u64, rows: u32, bytes: &[u8]) -> Result<(), NativeError> {
        if width == 0 {
            return Ok(());
        }
        let mut write = |data: &mut [u8]| -> Result<(), NativeError> {
            for (row, chunk) in bytes.chunks(width as usize).take(rows as usize).enumerate() {
                let start = (offset + row as u64 * stride) as usize;
                let dst = data
                    .get_mut(start..start + chunk.len())
                    .ok_or_else(|| NativeError::new("copy_regions", codes::INVALID_VALUE, "destination region out of bounds"))?;
                dst.copy_from_slice(chunk);
            }
            Ok(())
        };
        match &mut self.storage {
            Storage::Owned(data) => write(data),
            Storage::Foreign(data) => write(&mut data.lock()),
        }
    }

    fn is_foreign(&self) -> bool {
        matches!(self.storage, Storage::Foreign(_))
    }
}

#[derive(Default)]
struct FenceTimeline {
    signaled: u64,
    completed: u64,
}

struct Registration {
    api: ForeignApi,
    data: Arc<Mutex<Vec<u8>>>,
    mapped: Option<u64>,
}

/// Counters for every native operation the dummy backend served.
#[derive(Debug, Default)]
pub struct DummyCounters {
    /// Staging to device copy commands
    pub uploads: AtomicCounter,
    /// Device to staging copy commands
    pub downloads: AtomicCounter,
    /// Device to device copy commands on one backend
    pub device_copies: AtomicCounter,
    /// Copy commands reading another backend's memory
    pub peer_copies: AtomicCounter,
    /// Copy commands touching a mapped foreign resource
    pub interop_copies: AtomicCounter,
    /// Device-local resources created
    pub device_resources_created: AtomicCounter,
    /// Device-local resources destroyed
    pub device_resources_destroyed: AtomicCounter,
    /// Staging resources created
    pub staging_created: AtomicCounter,
    /// Staging resources destroyed
    pub staging_destroyed: AtomicCounter,
    /// Foreign registrations made
    pub registrations: AtomicCounter,
    /// Foreign registrations dropped
    pub unregistrations: AtomicCounter,
    /// Fence waits that actually had to block
    pub blocking_waits: AtomicCounter,
}

/// Simulated foreign API (a stand-in for a GL or D3D11 context).
///
/// Buffers created here can be registered with any dummy backend that was
/// built with [`DummyBackend::with_foreign_api`].
pub struct DummyForeignApi {
    api: ForeignApi,
    buffers: Mutex<HashMap<u64, Arc<Mutex<Vec<u8>>>>>,
    next_handle: AtomicU64,
    context: Option<ContextThread>,
}

impl DummyForeignApi {
    /// Create a foreign API without thread affinity
    pub fn new(api: ForeignApi) -> Arc<Self> {
        Arc::new(Self {
            api,
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            context: None,
        })
    }

    /// Create a foreign API whose calls must run on a dedicated context thread
    pub fn with_context_thread(api: ForeignApi, name: &str) -> std::io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            api,
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            context: Some(ContextThread::spawn(name)?),
        }))
    }

    /// The context thread, if this API is thread-affine
    pub fn context_thread(&self) -> Option<&ContextThread> {
        self.context.as_ref()
    }

    /// Create a foreign buffer laid out as `layout`, filled with `fill`
    pub fn create_buffer(self: &Arc<Self>, layout: FrameLayout, fill: u8) -> DummyForeignBuffer {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let data = Arc::new(Mutex::new(vec![fill; layout.size()]));
        self.buffers.lock().insert(handle, Arc::clone(&data));
        DummyForeignBuffer {
            tokens: TokenCache::new(),
            owner: Arc::clone(self),
            handle: ForeignHandle(handle),
            layout,
            data,
        }
    }

    fn lookup(&self, handle: ForeignHandle) -> Option<Arc<Mutex<Vec<u8>>>> {
        self.buffers.lock().get(&handle.0).cloned()
    }
}

/// A buffer owned by a [`DummyForeignApi`].
pub struct DummyForeignBuffer {
    // Dropped first so cached registrations go before the buffer itself.
    tokens: TokenCache,
    owner: Arc<DummyForeignApi>,
    handle: ForeignHandle,
    layout: FrameLayout,
    data: Arc<Mutex<Vec<u8>>>,
}

impl DummyForeignBuffer {
    /// Snapshot of the buffer contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl ForeignBuffer for DummyForeignBuffer {
    fn api(&self) -> ForeignApi {
        self.owner.api
    }

    fn handle(&self) -> ForeignHandle {
        self.handle
    }

    fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    fn context_thread(&self) -> Option<&ContextThread> {
        self.owner.context.as_ref()
    }

    fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    fn read_host(&self, dst: &mut [u8]) -> crate::Result<()> {
        let data = self.data.lock();
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn write_host(&self, src: &[u8]) -> crate::Result<()> {
        let mut data = self.data.lock();
        let len = src.len().min(data.len());
        data[..len].copy_from_slice(&src[..len]);
        Ok(())
    }
}

impl Drop for DummyForeignBuffer {
    fn drop(&mut self) {
        self.owner.buffers.lock().remove(&self.handle.0);
    }
}

/// In-memory GPU backend
pub struct DummyBackend {
    adapter: AdapterInfo,
    unsupported_formats: Vec<VideoFormat>,
    foreign: Vec<Arc<DummyForeignApi>>,
    resources: Mutex<HashMap<u64, DummyResource>>,
    fences: Mutex<HashMap<u64, FenceTimeline>>,
    fence_cond: Condvar,
    registrations: Mutex<HashMap<u64, Registration>>,
    peers: Mutex<HashSet<Luid>>,
    failures: Mutex<HashMap<&'static str, i32>>,
    next_handle: AtomicU64,
    auto_complete: AtomicBool,
    context_depth: AtomicI64,
    interop_threads: Mutex<Vec<ThreadId>>,
    counters: DummyCounters,
}

impl DummyBackend {
    /// Create a dummy adapter with every capability and default limits
    pub fn new(index: u32) -> Self {
        Self {
            adapter: AdapterInfo {
                index,
                luid: Luid(0x1000 + index as u64),
                name: format!("Dummy Adapter {}", index),
                caps: DeviceCaps::all(),
                limits: DeviceLimits::default(),
            },
            unsupported_formats: Vec::new(),
            foreign: Vec::new(),
            resources: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            fence_cond: Condvar::new(),
            registrations: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            auto_complete: AtomicBool::new(true),
            context_depth: AtomicI64::new(0),
            interop_threads: Mutex::new(Vec::new()),
            counters: DummyCounters::default(),
        }
    }

    /// Replace the capability set
    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.adapter.caps = caps;
        self
    }

    /// Replace the limits
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.adapter.limits = limits;
        self
    }

    /// Override the LUID (two backends with one LUID model the same adapter)
    pub fn with_luid(mut self, luid: Luid) -> Self {
        self.adapter.luid = luid;
        self
    }

    /// Report `format` as unsupported
    pub fn with_unsupported_format(mut self, format: VideoFormat) -> Self {
        self.unsupported_formats.push(format);
        self
    }

    /// Allow registering buffers of `api`
    pub fn with_foreign_api(mut self, api: Arc<DummyForeignApi>) -> Self {
        self.foreign.push(api);
        self
    }

    /// Hold fence signals until completed explicitly
    pub fn with_manual_completion(self) -> Self {
        self.auto_complete.store(false, Ordering::Relaxed);
        self
    }

    /// Switch between immediate and manual fence completion
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Relaxed);
        if enabled {
            self.complete_all();
        }
    }

    /// Complete every signaled fence value
    pub fn complete_all(&self) {
        let mut fences = self.fences.lock();
        for timeline in fences.values_mut() {
            timeline.completed = timeline.completed.max(timeline.signaled);
        }
        drop(fences);
        self.fence_cond.notify_all();
    }

    /// Complete `fence` up to `value`
    pub fn complete_fence(&self, fence: NativeFence, value: u64) {
        let mut fences = self.fences.lock();
        if let Some(timeline) = fences.get_mut(&fence.0) {
            timeline.completed = timeline.completed.max(value);
        }
        drop(fences);
        self.fence_cond.notify_all();
    }

    /// Make the next call named `call` fail with `code`
    pub fn fail_next(&self, call: &'static str, code: i32) {
        self.failures.lock().insert(call, code);
    }

    /// Operation counters
    pub fn counters(&self) -> &DummyCounters {
        &self.counters
    }

    /// Current push depth summed over all threads
    pub fn context_depth(&self) -> i64 {
        self.context_depth.load(Ordering::Acquire)
    }

    /// Number of live resources of `kind`
    pub fn live_resources(&self, kind: ResourceKind) -> usize {
        self.resources
            .lock()
            .values()
            .filter(|r| r.kind == kind && !r.is_foreign())
            .count()
    }

    /// Whether peer access to `luid` is enabled
    pub fn has_peer(&self, luid: Luid) -> bool {
        self.peers.lock().contains(&luid)
    }

    /// Threads that issued interop calls, in call order
    pub fn interop_threads(&self) -> Vec<ThreadId> {
        self.interop_threads.lock().clone()
    }

    /// Read a whole resource, as a kernel would see it
    pub fn read_resource(&self, resource: &NativeResource) -> Option<Vec<u8>> {
        let resources = self.resources.lock();
        let res = resources.get(&resource.handle)?;
        res.read_rows(0, resource.size, resource.size, 1).ok()
    }

    /// Overwrite part of a resource, as a kernel would
    pub fn write_resource(&self, resource: &NativeResource, offset: u64, bytes: &[u8]) -> Result<(), NativeError> {
        let mut resources = self.resources.lock();
        let res = resources
            .get_mut(&resource.handle)
            .ok_or_else(|| NativeError::new("write_resource", codes::INVALID_HANDLE, "unknown resource"))?;
        res.write_rows(offset, bytes.len() as u64, bytes.len() as u64, 1, bytes)
    }

    fn check(&self, call: &'static str) -> Result<(), NativeError> {
        match self.failures.lock().remove(call) {
            Some(code) => Err(NativeError::new(call, code, "injected failure")),
            None => Ok(()),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn is_self(&self, other: &dyn GpuBackend) -> bool {
        other
            .as_any()
            .downcast_ref::<DummyBackend>()
            .map_or(false, |other| std::ptr::eq(other, self))
    }

    fn foreign_caps(&self, api: ForeignApi) -> bool {
        match api {
            ForeignApi::Gl => self.adapter.caps.contains(DeviceCaps::GL_INTEROP),
            ForeignApi::D3D11 => self.adapter.caps.contains(DeviceCaps::D3D11_INTEROP),
        }
    }
}

impl GpuBackend for DummyBackend {
    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn push_context(&self) -> Result<(), NativeError> {
        self.check("push_context")?;
        self.context_depth.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn pop_context(&self) -> Result<(), NativeError> {
        self.check("pop_context")?;
        let prev = self.context_depth.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            self.context_depth.fetch_add(1, Ordering::AcqRel);
            return Err(NativeError::new("pop_context", codes::INVALID_CONTEXT, "context stack is empty"));
        }
        Ok(())
    }

    fn supports_format(&self, format: VideoFormat) -> bool {
        !self.unsupported_formats.contains(&format)
    }

    fn enable_peer_access(&self, peer: &dyn GpuBackend) -> Result<(), NativeError> {
        self.check("enable_peer_access")?;
        let peer_caps = peer.adapter().caps;
        if peer.as_any().downcast_ref::<DummyBackend>().is_none()
            || !self.adapter.caps.contains(DeviceCaps::PEER_ACCESS)
            || !peer_caps.contains(DeviceCaps::PEER_ACCESS)
        {
            return Err(NativeError::new(
                "enable_peer_access",
                codes::PEER_ACCESS_UNSUPPORTED,
                "peer access unsupported between adapters",
            ));
        }
        self.peers.lock().insert(peer.adapter().luid);
        Ok(())
    }

    fn disable_peer_access(&self, peer: &dyn GpuBackend) -> Result<(), NativeError> {
        self.peers.lock().remove(&peer.adapter().luid);
        Ok(())
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<NativeResource, NativeError> {
        self.check("create_resource")?;
        if desc.size == 0 {
            return Err(NativeError::new("create_resource", codes::INVALID_VALUE, "zero sized resource"));
        }
        let handle = self.next_handle();
        let data = vec![0u8; desc.size as usize].into_boxed_slice();
        self.resources.lock().insert(
            handle,
            DummyResource {
                kind: desc.kind,
                storage: Storage::Owned(data),
            },
        );
        match desc.kind {
            ResourceKind::DeviceLocal => self.counters.device_resources_created.increment(),
            ResourceKind::Staging => self.counters.staging_created.increment(),
        }
        Ok(NativeResource {
            handle,
            size: desc.size,
        })
    }

    fn destroy_resource(&self, resource: NativeResource) -> Result<(), NativeError> {
        self.check("destroy_resource")?;
        let removed = self.resources.lock().remove(&resource.handle);
        match removed {
            Some(res) => {
                match res.kind {
                    ResourceKind::DeviceLocal => self.counters.device_resources_destroyed.increment(),
                    ResourceKind::Staging => self.counters.staging_destroyed.increment(),
                }
                Ok(())
            }
            None => Err(NativeError::new("destroy_resource", codes::INVALID_HANDLE, "double free or unknown resource")),
        }
    }

    fn map_host(&self, resource: &NativeResource) -> Result<NonNull<u8>, NativeError> {
        self.check("map_host")?;
        let mut resources = self.resources.lock();
        let res = resources
            .get_mut(&resource.handle)
            .ok_or_else(|| NativeError::new("map_host", codes::INVALID_HANDLE, "unknown resource"))?;
        match (&mut res.storage, res.kind) {
            (Storage::Owned(data), ResourceKind::Staging) => NonNull::new(data.as_mut_ptr())
                .ok_or_else(|| NativeError::new("map_host", codes::INVALID_VALUE, "null mapping")),
            _ => Err(NativeError::new("map_host", codes::INVALID_VALUE, "resource is not host visible")),
        }
    }

    fn unmap_host(&self, _resource: &NativeResource) -> Result<(), NativeError> {
        Ok(())
    }

    fn copy_regions(
        &self,
        _queue: QueueKind,
        src: ResourceRef<'_>,
        dst: &NativeResource,
        regions: &[CopyRegion],
    ) -> Result<(), NativeError> {
        self.check("copy_regions")?;

        let same_backend = self.is_self(src.backend);
        if !same_backend && !self.has_peer(src.backend.adapter().luid) {
            return Err(NativeError::new(
                "copy_regions",
                codes::PEER_ACCESS_UNSUPPORTED,
                "source belongs to a device without peer access",
            ));
        }

        let source_owner = if same_backend {
            self
        } else {
            src.backend
                .as_any()
                .downcast_ref::<DummyBackend>()
                .ok_or_else(|| NativeError::new("copy_regions", codes::INVALID_HANDLE, "foreign backend kind"))?
        };

        // Read everything first so the two resource tables are never locked together.
        let (src_kind, src_foreign, chunks) = {
            let resources = source_owner.resources.lock();
            let res = resources
                .get(&src.resource.handle)
                .ok_or_else(|| NativeError::new("copy_regions", codes::INVALID_HANDLE, "unknown source"))?;
            let mut chunks = Vec::with_capacity(regions.len());
            for region in regions {
                chunks.push(res.read_rows(region.src_offset, region.src_stride, region.width_bytes, region.rows)?);
            }
            (res.kind, res.is_foreign(), chunks)
        };

        let mut resources = self.resources.lock();
        let res = resources
            .get_mut(&dst.handle)
            .ok_or_else(|| NativeError::new("copy_regions", codes::INVALID_HANDLE, "unknown destination"))?;
        for (region, chunk) in regions.iter().zip(&chunks) {
            res.write_rows(region.dst_offset, region.dst_stride, region.width_bytes, region.rows, chunk)?;
        }

        let counter = if src_foreign || res.is_foreign() {
            &self.counters.interop_copies
        } else if !same_backend {
            &self.counters.peer_copies
        } else {
            match (src_kind, res.kind) {
                (ResourceKind::Staging, ResourceKind::DeviceLocal) => &self.counters.uploads,
                (ResourceKind::DeviceLocal, ResourceKind::Staging) => &self.counters.downloads,
                _ => &self.counters.device_copies,
            }
        };
        counter.increment();
        Ok(())
    }

    fn create_fence(&self) -> Result<NativeFence, NativeError> {
        self.check("create_fence")?;
        let handle = self.next_handle();
        self.fences.lock().insert(handle, FenceTimeline::default());
        Ok(NativeFence(handle))
    }

    fn destroy_fence(&self, fence: NativeFence) {
        self.fences.lock().remove(&fence.0);
    }

    fn signal_fence(&self, _queue: QueueKind, fence: NativeFence, value: u64) -> Result<(), NativeError> {
        self.check("signal_fence")?;
        let mut fences = self.fences.lock();
        let timeline = fences
            .get_mut(&fence.0)
            .ok_or_else(|| NativeError::new("signal_fence", codes::INVALID_HANDLE, "unknown fence"))?;
        timeline.signaled = timeline.signaled.max(value);
        if self.auto_complete.load(Ordering::Relaxed) {
            timeline.completed = timeline.completed.max(value);
        }
        drop(fences);
        self.fence_cond.notify_all();
        Ok(())
    }

    fn fence_completed_value(&self, fence: NativeFence) -> Result<u64, NativeError> {
        self.check("fence_completed_value")?;
        self.fences
            .lock()
            .get(&fence.0)
            .map(|t| t.completed)
            .ok_or_else(|| NativeError::new("fence_completed_value", codes::INVALID_HANDLE, "unknown fence"))
    }

    fn wait_fence(&self, fence: NativeFence, value: u64, timeout: Option<Duration>) -> Result<bool, NativeError> {
        self.check("wait_fence")?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut fences = self.fences.lock();
        let mut blocked = false;
        loop {
            let completed = fences
                .get(&fence.0)
                .map(|t| t.completed)
                .ok_or_else(|| NativeError::new("wait_fence", codes::INVALID_HANDLE, "unknown fence"))?;
            if completed >= value {
                return Ok(true);
            }
            if !blocked {
                blocked = true;
                self.counters.blocking_waits.increment();
            }
            match deadline {
                None => self.fence_cond.wait(&mut fences),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.fence_cond.wait_for(&mut fences, deadline - now);
                }
            }
        }
    }

    fn register_foreign(
        &self,
        api: ForeignApi,
        handle: ForeignHandle,
        _flags: RegisterFlags,
    ) -> Result<NativeRegistration, NativeError> {
        self.check("register_foreign")?;
        self.interop_threads.lock().push(thread::current().id());
        if !self.foreign_caps(api) {
            return Err(NativeError::unsupported("register_foreign"));
        }
        let data = self
            .foreign
            .iter()
            .filter(|f| f.api == api)
            .find_map(|f| f.lookup(handle))
            .ok_or_else(|| NativeError::new("register_foreign", codes::INVALID_HANDLE, "unknown foreign handle"))?;
        let id = self.next_handle();
        self.registrations.lock().insert(id, Registration { api, data, mapped: None });
        self.counters.registrations.increment();
        Ok(NativeRegistration(id))
    }

    fn map_foreign(
        &self,
        registration: NativeRegistration,
        _stream: StreamId,
        _flags: RegisterFlags,
    ) -> Result<NativeResource, NativeError> {
        self.check("map_foreign")?;
        self.interop_threads.lock().push(thread::current().id());
        let mut registrations = self.registrations.lock();
        let reg = registrations
            .get_mut(&registration.0)
            .ok_or_else(|| NativeError::new("map_foreign", codes::INVALID_HANDLE, "unknown registration"))?;
        if reg.mapped.is_some() {
            return Err(NativeError::new("map_foreign", codes::INVALID_VALUE, "already mapped"));
        }
        let handle = self.next_handle();
        let size = reg.data.lock().len() as u64;
        self.resources.lock().insert(
            handle,
            DummyResource {
                kind: ResourceKind::DeviceLocal,
                storage: Storage::Foreign(Arc::clone(&reg.data)),
            },
        );
        reg.mapped = Some(handle);
        log::trace!("dummy: mapped {:?} registration {} as {}", reg.api, registration.0, handle);
        Ok(NativeResource { handle, size })
    }

    fn unmap_foreign(&self, registration: NativeRegistration, _stream: StreamId) -> Result<(), NativeError> {
        self.check("unmap_foreign")?;
        self.interop_threads.lock().push(thread::current().id());
        let mut registrations = self.registrations.lock();
        let reg = registrations
            .get_mut(&registration.0)
            .ok_or_else(|| NativeError::new("unmap_foreign", codes::INVALID_HANDLE, "unknown registration"))?;
        if let Some(handle) = reg.mapped.take() {
            self.resources.lock().remove(&handle);
        }
        Ok(())
    }

    fn unregister_foreign(&self, registration: NativeRegistration) -> Result<(), NativeError> {
        self.check("unregister_foreign")?;
        self.interop_threads.lock().push(thread::current().id());
        let reg = self
            .registrations
            .lock()
            .remove(&registration.0)
            .ok_or_else(|| NativeError::new("unregister_foreign", codes::INVALID_HANDLE, "unknown registration"))?;
        if let Some(handle) = reg.mapped {
            self.resources.lock().remove(&handle);
        }
        self.counters.unregistrations.increment();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging(backend: &DummyBackend, size: u64) -> NativeResource {
        backend
            .create_resource(&ResourceDesc { kind: ResourceKind::Staging, size })
            .unwrap()
    }

    fn device_local(backend: &DummyBackend, size: u64) -> NativeResource {
        backend
            .create_resource(&ResourceDesc { kind: ResourceKind::DeviceLocal, size })
            .unwrap()
    }

    #[test]
    fn test_zero_size_rejected() {
        let backend = DummyBackend::new(0);
        let err = backend
            .create_resource(&ResourceDesc { kind: ResourceKind::DeviceLocal, size: 0 })
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_VALUE);
    }

    #[test]
    fn test_device_local_cannot_map() {
        let backend = DummyBackend::new(0);
        let res = device_local(&backend, 64);
        assert!(backend.map_host(&res).is_err());
        let res = staging(&backend, 64);
        assert!(backend.map_host(&res).is_ok());
    }

    #[test]
    fn test_copy_classification() {
        let backend = DummyBackend::new(0);
        let host = staging(&backend, 16);
        let dev = device_local(&backend, 16);
        let region = CopyRegion {
            src_offset: 0,
            src_stride: 16,
            dst_offset: 0,
            dst_stride: 16,
            width_bytes: 16,
            rows: 1,
        };

        backend
            .copy_regions(QueueKind::Copy, ResourceRef { backend: &backend, resource: host }, &dev, &[region])
            .unwrap();
        backend
            .copy_regions(QueueKind::Copy, ResourceRef { backend: &backend, resource: dev }, &host, &[region])
            .unwrap();

        assert_eq!(backend.counters().uploads.get(), 1);
        assert_eq!(backend.counters().downloads.get(), 1);
    }

    #[test]
    fn test_double_destroy_is_error() {
        let backend = DummyBackend::new(0);
        let res = device_local(&backend, 8);
        backend.destroy_resource(res).unwrap();
        assert!(backend.destroy_resource(res).is_err());
        assert_eq!(backend.counters().device_resources_destroyed.get(), 1);
    }

    #[test]
    fn test_manual_completion_blocks_until_completed() {
        let backend = Arc::new(DummyBackend::new(0).with_manual_completion());
        let fence = backend.create_fence().unwrap();
        backend.signal_fence(QueueKind::Copy, fence, 3).unwrap();
        assert_eq!(backend.fence_completed_value(fence).unwrap(), 0);

        assert!(!backend.wait_fence(fence, 3, Some(Duration::from_millis(5))).unwrap());

        let completer = Arc::clone(&backend);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete_fence(fence, 3);
        });
        assert!(backend.wait_fence(fence, 3, None).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let backend = DummyBackend::new(0);
        backend.fail_next("push_context", codes::INVALID_CONTEXT);
        assert!(backend.push_context().is_err());
        assert!(backend.push_context().is_ok());
        assert!(backend.pop_context().is_ok());
        assert!(backend.pop_context().is_err());
    }
}
