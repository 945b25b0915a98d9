//! Sharing frames with foreign graphics APIs (GL, D3D11).
//!
//! A foreign buffer is registered with a device once and the registration is
//! cached on the buffer itself, so it lives exactly as long as the buffer.
//! Copies map the registration, run a device copy and unmap again. When
//! registration is not available the copy goes through host memory instead.
//!
//! GL calls must run on the thread owning the GL context. Buffers report that
//! thread as a [`ContextThread`] and every native call for them is sent there.

mod worker;

pub use worker::ContextThread;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::device::Device;
use crate::diagnostics;
use crate::error::{FrameError, Result};
use crate::fp_native;
use crate::gpu::{ForeignApi, ForeignHandle, NativeRegistration, NativeResource, RegisterFlags, ResourceRef, StreamId};
use crate::memory::{
    copy_planes_host, copy_regions, select_copy_path, CopyPath, EndpointKind, FrameLayout, MapFlags, Memory,
    TokenCache,
};
use crate::sync::mutex::Mutex;

/// A buffer owned by a foreign graphics API.
pub trait ForeignBuffer: Send + Sync {
    /// Owning API
    fn api(&self) -> ForeignApi;

    /// Native handle
    fn handle(&self) -> ForeignHandle;

    /// Plane layout of the buffer contents
    fn layout(&self) -> &FrameLayout;

    /// Thread the API's calls must run on, if any
    fn context_thread(&self) -> Option<&ContextThread>;

    /// Per-buffer cache; registrations are stored here
    fn tokens(&self) -> &TokenCache;

    /// Read the contents through the foreign API
    fn read_host(&self, dst: &mut [u8]) -> Result<()>;

    /// Write the contents through the foreign API
    fn write_host(&self, src: &[u8]) -> Result<()>;
}

/// A registration made through [`Device::register_foreign_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InteropToken(u64);

fn endpoint(api: ForeignApi) -> EndpointKind {
    match api {
        ForeignApi::Gl => EndpointKind::Gl,
        ForeignApi::D3D11 => EndpointKind::D3D11,
    }
}

impl Device {
    fn registration(&self, token: InteropToken) -> Result<NativeRegistration> {
        self.inner
            .interop
            .lock()
            .get(&token.0)
            .copied()
            .ok_or(FrameError::InvalidState("unknown interop token"))
    }

    /// Register a foreign buffer for device copies.
    ///
    /// Any native failure is reported as [`FrameError::InteropUnavailable`]
    /// so callers can take the host path.
    pub fn register_foreign_buffer(
        &self,
        api: ForeignApi,
        handle: ForeignHandle,
        flags: RegisterFlags,
    ) -> Result<InteropToken> {
        let backend = self.backend();
        let ctx = self.push()?;
        let registration = match backend.register_foreign(api, handle, flags) {
            Ok(registration) => registration,
            Err(err) => {
                diagnostics::emit_native(&diagnostics::FP401, &err);
                return Err(FrameError::InteropUnavailable(err.to_string()));
            }
        };
        if let Err(err) = ctx.pop() {
            if let Err(unregister) = backend.unregister_foreign(registration) {
                diagnostics::emit_native(&diagnostics::FP404, &unregister);
            }
            return Err(err);
        }

        let id = self.inner.next_interop.fetch_add(1, Ordering::Relaxed);
        self.inner.interop.lock().insert(id, registration);
        log::trace!("{}: registered {:?} {:?} as {}", self.name(), api, handle, id);
        Ok(InteropToken(id))
    }

    /// Map a registered buffer, returning it as a copy source or destination.
    pub fn map_foreign_resource(
        &self,
        token: InteropToken,
        stream: StreamId,
        flags: RegisterFlags,
    ) -> Result<NativeResource> {
        let registration = self.registration(token)?;
        let ctx = self.push()?;
        let resource = self
            .backend()
            .map_foreign(registration, stream, flags)
            .map_err(|e| fp_native!(FP402, e))?;
        ctx.pop()?;
        Ok(resource)
    }

    /// Unmap a registered buffer.
    pub fn unmap_foreign_resource(&self, token: InteropToken, stream: StreamId) -> Result<()> {
        let registration = self.registration(token)?;
        let ctx = self.push()?;
        self.backend()
            .unmap_foreign(registration, stream)
            .map_err(|e| fp_native!(FP402, e))?;
        ctx.pop()
    }

    /// Drop a registration. Unknown tokens are ignored.
    pub fn unregister_foreign_resource(&self, token: InteropToken) -> Result<()> {
        let registration = match self.inner.interop.lock().remove(&token.0) {
            Some(registration) => registration,
            None => return Ok(()),
        };
        let ctx = self.push()?;
        self.backend()
            .unregister_foreign(registration)
            .map_err(|e| fp_native!(FP404, e))?;
        ctx.pop()
    }
}

#[derive(Default)]
struct ResourceState {
    token: Option<InteropToken>,
    mapped: Option<(StreamId, NativeResource)>,
}

/// One foreign resource registered with a device.
///
/// Every native call runs on the resource's context thread when it has one.
/// Dropping the resource unregisters it.
pub struct GraphicsResource {
    device: Device,
    api: ForeignApi,
    context: Option<ContextThread>,
    state: Mutex<ResourceState>,
}

impl GraphicsResource {
    /// An unregistered resource of `api` on `device`.
    pub fn new(device: &Device, api: ForeignApi, context: Option<ContextThread>) -> Self {
        Self {
            device: device.clone(),
            api,
            context,
            state: Mutex::new(ResourceState::default()),
        }
    }

    /// Device the resource is registered with.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Owning API.
    pub fn api(&self) -> ForeignApi {
        self.api
    }

    /// The registration, if registered.
    pub fn token(&self) -> Option<InteropToken> {
        self.state.lock().token
    }

    /// Whether registered.
    pub fn is_registered(&self) -> bool {
        self.state.lock().token.is_some()
    }

    /// Whether mapped.
    pub fn is_mapped(&self) -> bool {
        self.state.lock().mapped.is_some()
    }

    fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Device) -> Result<R> + Send + 'static,
    {
        match &self.context {
            Some(thread) => {
                let device = self.device.clone();
                thread.run(move || f(&device))?
            }
            None => f(&self.device),
        }
    }

    /// Register `handle`. Fails if already registered.
    pub fn register(&self, handle: ForeignHandle, flags: RegisterFlags) -> Result<()> {
        let mut state = self.state.lock();
        if state.token.is_some() {
            return Err(FrameError::InvalidState("graphics resource is already registered"));
        }
        let api = self.api;
        let token = self.call(move |device| device.register_foreign_buffer(api, handle, flags))?;
        state.token = Some(token);
        Ok(())
    }

    /// Map for copies on `stream`. Mapping again returns the same resource.
    pub fn map(&self, stream: StreamId, flags: RegisterFlags) -> Result<NativeResource> {
        let mut state = self.state.lock();
        let token = state
            .token
            .ok_or(FrameError::InvalidState("graphics resource is not registered"))?;
        if let Some((_, resource)) = state.mapped {
            return Ok(resource);
        }
        let resource = self.call(move |device| device.map_foreign_resource(token, stream, flags))?;
        state.mapped = Some((stream, resource));
        Ok(resource)
    }

    /// Unmap. Does nothing when not mapped.
    pub fn unmap(&self) -> Result<()> {
        let mut state = self.state.lock();
        let (token, (stream, _)) = match (state.token, state.mapped) {
            (Some(token), Some(mapped)) => (token, mapped),
            _ => return Ok(()),
        };
        self.call(move |device| device.unmap_foreign_resource(token, stream))?;
        state.mapped = None;
        Ok(())
    }

    /// Unregister, unmapping first. Does nothing when not registered.
    pub fn unregister(&self) -> Result<()> {
        let mut state = self.state.lock();
        let token = match state.token.take() {
            Some(token) => token,
            None => return Ok(()),
        };
        let mapped = state.mapped.take();
        drop(state);

        self.call(move |device| {
            if let Some((stream, _)) = mapped {
                device.unmap_foreign_resource(token, stream)?;
            }
            device.unregister_foreign_resource(token)
        })
    }

    /// Map, run `f` with the mapped resource, then unmap, all on the context
    /// thread.
    pub fn with_mapped<R, F>(&self, stream: StreamId, flags: RegisterFlags, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Device, NativeResource) -> Result<R> + Send + 'static,
    {
        let state = self.state.lock();
        let token = state
            .token
            .ok_or(FrameError::InvalidState("graphics resource is not registered"))?;
        if state.mapped.is_some() {
            return Err(FrameError::InvalidState("graphics resource is already mapped"));
        }

        self.call(move |device| {
            let resource = device.map_foreign_resource(token, stream, flags)?;
            let result = f(device, resource);
            let unmapped = device.unmap_foreign_resource(token, stream);
            let value = result?;
            unmapped?;
            Ok(value)
        })
    }
}

impl Drop for GraphicsResource {
    fn drop(&mut self) {
        if let Err(err) = self.unregister() {
            log::warn!("{}: {:?} resource leaked: {}", self.device.name(), self.api, err);
        }
    }
}

impl std::fmt::Debug for GraphicsResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsResource")
            .field("device", &self.device.name())
            .field("api", &self.api)
            .field("token", &self.token())
            .finish()
    }
}

/// The registration of `foreign` on `device`, made on first use.
///
/// The registration is cached in the buffer's [`TokenCache`] and dropped
/// with it.
pub fn ensure_registered(device: &Device, foreign: &dyn ForeignBuffer) -> Result<Arc<GraphicsResource>> {
    foreign
        .tokens()
        .get_or_try_insert_with(device.inner.interop_cache, || {
            let resource = GraphicsResource::new(device, foreign.api(), foreign.context_thread().cloned());
            resource.register(foreign.handle(), RegisterFlags::empty())?;
            Ok(Arc::new(resource))
        })
}

/// Copy a foreign buffer into `dst`.
pub fn copy_from_foreign(dst: &Memory, foreign: &dyn ForeignBuffer) -> Result<CopyPath> {
    if dst.layout().format() != foreign.layout().format() {
        return Err(FrameError::InvalidCopy("source and destination formats differ"));
    }

    match device_copy_from_foreign(dst, foreign) {
        Err(FrameError::InteropUnavailable(reason)) => {
            log::warn!("{}: foreign copy through host memory: {}", dst.device().name(), reason);
            let mut staged = vec![0u8; foreign.layout().size()];
            foreign.read_host(&mut staged)?;

            let mut map = dst.map_for_host(MapFlags::WRITE)?;
            let layout = *map.layout();
            let bytes = map
                .as_mut_slice()
                .ok_or(FrameError::InvalidState("write mapping is not writable"))?;
            copy_planes_host(bytes, &layout, &staged, foreign.layout())?;
            Ok(CopyPath::HostStaging)
        }
        other => other,
    }
}

fn device_copy_from_foreign(dst: &Memory, foreign: &dyn ForeignBuffer) -> Result<CopyPath> {
    let resource = ensure_registered(dst.device(), foreign)?;
    let map = dst.map_for_device(MapFlags::WRITE | MapFlags::DEVICE)?;
    let target = map.handle();
    let regions = copy_regions(foreign.layout(), 0, dst.layout(), target.offset)?;

    let mark = resource.with_mapped(StreamId::default(), RegisterFlags::READ_ONLY, move |device, mapped| {
        let source = ResourceRef {
            backend: device.backend().as_ref(),
            resource: mapped,
        };
        device.submit_copy(source, &target.resource, &regions, &diagnostics::FP205)
    })?;
    dst.set_fence(mark.fence, mark.value);
    Ok(select_copy_path(EndpointKind::Device, endpoint(foreign.api()), true, false))
}

/// Copy `src` into a foreign buffer.
pub fn copy_to_foreign(dst: &dyn ForeignBuffer, src: &Memory) -> Result<CopyPath> {
    if dst.layout().format() != src.layout().format() {
        return Err(FrameError::InvalidCopy("source and destination formats differ"));
    }

    match device_copy_to_foreign(dst, src) {
        Err(FrameError::InteropUnavailable(reason)) => {
            log::warn!("{}: foreign copy through host memory: {}", src.device().name(), reason);
            let mut staged = vec![0u8; dst.layout().size()];
            dst.read_host(&mut staged)?;

            let map = src.map_for_host(MapFlags::READ)?;
            copy_planes_host(&mut staged, dst.layout(), map.as_slice(), src.layout())?;
            map.unmap();
            dst.write_host(&staged)?;
            Ok(CopyPath::HostStaging)
        }
        other => other,
    }
}

fn device_copy_to_foreign(dst: &dyn ForeignBuffer, src: &Memory) -> Result<CopyPath> {
    let resource = ensure_registered(src.device(), dst)?;
    let map = src.map_for_device(MapFlags::READ | MapFlags::DEVICE)?;
    let source = map.handle();
    let regions = copy_regions(src.layout(), source.offset, dst.layout(), 0)?;

    let mark = resource.with_mapped(StreamId::default(), RegisterFlags::WRITE_DISCARD, move |device, mapped| {
        let from = ResourceRef {
            backend: device.backend().as_ref(),
            resource: source.resource,
        };
        device.submit_copy(from, &mapped, &regions, &diagnostics::FP205)
    })?;
    mark.wait()?;
    Ok(select_copy_path(endpoint(dst.api()), EndpointKind::Device, true, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DirectAllocator;
    use crate::api::config::DeviceConfig;
    use crate::device::DeviceRegistry;
    use crate::gpu::{DeviceCaps, DummyBackend, DummyForeignApi};
    use crate::memory::{MemoryShape, SystemFrame, VideoFormat};

    fn setup(api: Arc<DummyForeignApi>, caps: DeviceCaps) -> (Arc<DummyBackend>, Device) {
        let backend = Arc::new(DummyBackend::new(0).with_caps(caps).with_foreign_api(api));
        let device = DeviceRegistry::new()
            .open(backend.clone(), DeviceConfig::default())
            .unwrap();
        (backend, device)
    }

    fn nv12() -> MemoryShape {
        MemoryShape::new(VideoFormat::NV12, 32, 16)
    }

    #[test]
    fn test_register_twice_is_cached() {
        let api = DummyForeignApi::new(ForeignApi::D3D11);
        let (backend, device) = setup(Arc::clone(&api), DeviceCaps::all());
        let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 32, 16), 0x11);

        let first = ensure_registered(&device, &buffer).unwrap();
        let second = ensure_registered(&device, &buffer).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.counters().registrations.get(), 1);

        drop((first, second));
        drop(buffer);
        assert_eq!(backend.counters().unregistrations.get(), 1);
    }

    #[test]
    fn test_register_on_registered_fails() {
        let api = DummyForeignApi::new(ForeignApi::D3D11);
        let (_backend, device) = setup(Arc::clone(&api), DeviceCaps::all());
        let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 32, 16), 0);

        let resource = GraphicsResource::new(&device, ForeignApi::D3D11, None);
        resource.register(buffer.handle(), RegisterFlags::empty()).unwrap();
        assert!(matches!(
            resource.register(buffer.handle(), RegisterFlags::empty()),
            Err(FrameError::InvalidState(_))
        ));

        resource.unmap().unwrap();
        resource.map(StreamId::default(), RegisterFlags::READ_ONLY).unwrap();
        assert!(resource.is_mapped());
        resource.unregister().unwrap();
        resource.unregister().unwrap();
        assert!(!resource.is_registered());
    }

    #[test]
    fn test_failed_register_reports_unregister_failure() {
        let api = DummyForeignApi::new(ForeignApi::D3D11);
        let (backend, device) = setup(Arc::clone(&api), DeviceCaps::all());
        let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 32, 16), 0);
        let sink = Arc::new(crate::diagnostics::CollectingSink::new());
        let _guard = crate::diagnostics::install_thread_sink(sink.clone());

        backend.fail_next("pop_context", crate::gpu::codes::INVALID_CONTEXT);
        backend.fail_next("unregister_foreign", crate::gpu::codes::INVALID_HANDLE);
        assert!(device
            .register_foreign_buffer(ForeignApi::D3D11, buffer.handle(), RegisterFlags::empty())
            .is_err());
        assert_eq!(sink.codes(), vec!["FP002", "FP404"]);
    }

    #[test]
    fn test_copy_from_foreign_uses_device_copy() {
        let api = DummyForeignApi::new(ForeignApi::D3D11);
        let (backend, device) = setup(Arc::clone(&api), DeviceCaps::all());
        let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 32, 16), 0x5A);
        let memory = DirectAllocator::alloc(&device, nv12()).unwrap();

        assert_eq!(copy_from_foreign(&memory, &buffer).unwrap(), CopyPath::D3D11Interop);
        assert_eq!(backend.counters().interop_copies.get(), 1);

        let mut out = SystemFrame::new(VideoFormat::NV12, 32, 16);
        crate::memory::copy_to_system(&mut out, &memory).unwrap();
        assert!(out.row(0, 0).iter().all(|&b| b == 0x5A));
        assert!(out.row(1, 7).iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_gl_calls_run_on_context_thread() {
        let api = DummyForeignApi::with_context_thread(ForeignApi::Gl, "test-gl-interop").unwrap();
        let (backend, device) = setup(Arc::clone(&api), DeviceCaps::all());
        let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 32, 16), 0);
        let memory = DirectAllocator::alloc(&device, nv12()).unwrap();

        assert_eq!(copy_to_foreign(&buffer, &memory).unwrap(), CopyPath::GlInterop);
        let gl_thread = api.context_thread().unwrap().thread_id();
        let threads = backend.interop_threads();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|id| *id == gl_thread));
    }

    #[test]
    fn test_missing_interop_falls_back_to_host() {
        let api = DummyForeignApi::new(ForeignApi::Gl);
        let (backend, device) = setup(Arc::clone(&api), DeviceCaps::all() - DeviceCaps::GL_INTEROP);
        let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 32, 16), 0x33);
        let memory = DirectAllocator::alloc(&device, nv12()).unwrap();

        assert_eq!(copy_from_foreign(&memory, &buffer).unwrap(), CopyPath::HostStaging);
        assert_eq!(backend.counters().interop_copies.get(), 0);
        assert!(buffer.tokens().is_empty());

        let map = memory.map_for_host(MapFlags::READ).unwrap();
        assert!(map.plane(0)[..32].iter().all(|&b| b == 0x33));
    }
}
