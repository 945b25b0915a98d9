//! GPU-backed frame memory with lazy host visibility.
//!
//! A [`Memory`] is one device allocation (or one slice of a shared array
//! allocation) plus a staging allocation created on first host access.
//! Two dirty bits decide which side holds the newest data:
//!
//! - a host write sets `NEED_UPLOAD`, cleared by the next device map;
//! - a device write sets `NEED_DOWNLOAD`, cleared by the next host map.
//!
//! Unmapping never transfers anything, so repeated device writes never bounce
//! through staging. Transfers are synchronous: when a map returns, the data
//! is visible on the requested side.

pub mod layout;
pub mod token;
pub mod transfer;

pub use layout::{
    alloc_height, copy_planes_host, copy_regions, FrameLayout, MemoryShape, PlaneLayout, ShapeUsage,
    VideoFormat, MAX_PLANES,
};
pub use token::{Token, TokenCache};
pub use transfer::{
    copy_from_system, copy_memory, copy_system, copy_to_system, select_copy_path, CopyPath,
    EndpointKind, SystemFrame,
};

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::device::{Device, NativeContext};
use crate::error::{FrameError, Result};
use crate::fence::{Fence, FenceMark};
use crate::fp_native;
use crate::gpu::{DeviceCaps, NativeResource, ResourceDesc, ResourceKind, ResourceRef};
use crate::sync::mutex::Mutex;

bitflags! {
    /// Access requested by a map
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Map for device access instead of host access
        const DEVICE = 1 << 2;
    }
}

bitflags! {
    /// Pending transfers between device memory and staging
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransferFlags: u32 {
        /// Staging holds host writes the device has not seen
        const NEED_UPLOAD = 1 << 0;
        /// Device memory holds writes staging has not seen
        const NEED_DOWNLOAD = 1 << 1;
    }
}

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

type FreeFn = Box<dyn FnOnce(NativeResource) + Send>;

/// The native allocation one or more Memories live in.
///
/// Array slices share one `Arc<Backing>`; the allocation goes when the last
/// slice does.
pub(crate) struct Backing {
    context: Arc<NativeContext>,
    resource: NativeResource,
    on_free: Mutex<Option<FreeFn>>,
}

impl Backing {
    /// A backing destroyed through the backend when released.
    pub(crate) fn owned(context: Arc<NativeContext>, resource: NativeResource) -> Arc<Self> {
        Arc::new(Self {
            context,
            resource,
            on_free: Mutex::new(None),
        })
    }

    /// A backing owned elsewhere; `on_free` is called instead of destroying it.
    pub(crate) fn wrapped(context: Arc<NativeContext>, resource: NativeResource, on_free: FreeFn) -> Arc<Self> {
        Arc::new(Self {
            context,
            resource,
            on_free: Mutex::new(Some(on_free)),
        })
    }

    pub(crate) fn resource(&self) -> NativeResource {
        self.resource
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        let on_free = self.on_free.lock().take();
        match on_free {
            Some(notify) => notify(self.resource),
            None => self.context.destroy_resource(self.resource),
        }
    }
}

/// Resources of a dropped Memory, freed when this value drops.
pub(crate) struct Retired {
    context: Arc<NativeContext>,
    staging: Option<NativeResource>,
    backing: Option<Arc<Backing>>,
}

impl Drop for Retired {
    fn drop(&mut self) {
        if let Some(staging) = self.staging.take() {
            self.context.destroy_staging(staging);
        }
        drop(self.backing.take());
    }
}

struct HostPtr(NonNull<u8>);

// SAFETY: the pointer refers to a staging allocation owned by the Memory and
// is only dereferenced through mappings that borrow that Memory.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

struct Staging {
    resource: NativeResource,
    ptr: HostPtr,
}

#[derive(Default)]
struct MemoryState {
    staging: Option<Staging>,
    flags: TransferFlags,
    host_readers: usize,
    host_writer: bool,
    device_writers: usize,
    fence: Option<FenceMark>,
}

impl Default for TransferFlags {
    fn default() -> Self {
        TransferFlags::empty()
    }
}

/// One frame of GPU memory.
pub struct Memory {
    id: u64,
    device: Device,
    shape: MemoryShape,
    layout: FrameLayout,
    backing: Option<Arc<Backing>>,
    offset: u64,
    state: Mutex<MemoryState>,
    tokens: TokenCache,
}

impl Memory {
    pub(crate) fn new(device: Device, shape: MemoryShape, layout: FrameLayout, backing: Arc<Backing>, offset: u64) -> Self {
        Self {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            device,
            shape,
            layout,
            backing: Some(backing),
            offset,
            state: Mutex::new(MemoryState::default()),
            tokens: TokenCache::new(),
        }
    }

    /// Process-unique id, stable for the lifetime of the Memory.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Shape the Memory was allocated for.
    pub fn shape(&self) -> &MemoryShape {
        &self.shape
    }

    /// Plane layout.
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Bytes of one frame.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Byte offset of this frame in its backing allocation.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The native backing allocation.
    pub fn native(&self) -> NativeResource {
        self.backing().resource()
    }

    fn backing(&self) -> &Backing {
        // Only taken in Drop
        match &self.backing {
            Some(backing) => backing,
            None => unreachable!("memory backing released before drop"),
        }
    }

    /// Pending transfer flags.
    pub fn transfer_flags(&self) -> TransferFlags {
        self.state.lock().flags
    }

    /// Whether the staging allocation exists.
    pub fn has_staging(&self) -> bool {
        self.state.lock().staging.is_some()
    }

    /// Data attached under `token`.
    pub fn token_data<T: Clone + 'static>(&self, token: Token) -> Option<T> {
        self.tokens.get(token)
    }

    /// Attach data under `token`, replacing any previous value.
    pub fn set_token_data<T: Send + Sync + 'static>(&self, token: Token, value: T) {
        self.tokens.set(token, value);
    }

    /// Per-Memory data cache.
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Record the last GPU operation touching this Memory.
    pub fn set_fence(&self, fence: Arc<Fence>, value: u64) {
        fence.request_completion(value);
        self.state.lock().fence = Some(FenceMark::new(fence, value));
    }

    /// The last recorded GPU operation.
    pub fn fence(&self) -> Option<FenceMark> {
        self.state.lock().fence.clone()
    }

    /// Block until the last recorded GPU operation completes.
    pub fn sync(&self) -> Result<()> {
        match self.fence() {
            Some(mark) => mark.wait(),
            None => Ok(()),
        }
    }

    /// Map with `flags`; `MapFlags::DEVICE` selects the device side.
    pub fn map(&self, flags: MapFlags) -> Result<Mapping<'_>> {
        if flags.contains(MapFlags::DEVICE) {
            self.map_for_device(flags).map(Mapping::Device)
        } else {
            self.map_for_host(flags).map(Mapping::Host)
        }
    }

    /// Map for host access.
    ///
    /// The first host map creates staging. Pending device writes are
    /// downloaded before the map returns. Many readers or one writer may hold
    /// host mappings at a time, and none while a device write map is held.
    pub fn map_for_host(&self, flags: MapFlags) -> Result<HostMapping<'_>> {
        let write = flags.contains(MapFlags::WRITE);
        let mut state = self.state.lock();

        if state.device_writers > 0 {
            return Err(FrameError::InvalidState("memory is mapped for device write"));
        }
        if state.host_writer || (write && state.host_readers > 0) {
            return Err(FrameError::InvalidState("memory is already mapped for host access"));
        }

        if state.staging.is_none() {
            let staging = self.create_staging()?;
            state.staging = Some(staging);
            state.flags |= TransferFlags::NEED_DOWNLOAD;
        }

        if state.flags.contains(TransferFlags::NEED_DOWNLOAD) {
            if let Some(mark) = &state.fence {
                mark.wait()?;
            }
            let staging = match &state.staging {
                Some(staging) => staging.resource,
                None => unreachable!("staging created above"),
            };
            let mark = self.download(staging)?;
            state.fence = Some(mark);
            state.flags.remove(TransferFlags::NEED_DOWNLOAD);
        }

        if write {
            state.host_writer = true;
            state.flags |= TransferFlags::NEED_UPLOAD;
        } else {
            state.host_readers += 1;
        }

        let ptr = match &state.staging {
            Some(staging) => staging.ptr.0,
            None => unreachable!("staging created above"),
        };
        Ok(HostMapping {
            memory: self,
            ptr,
            len: self.layout.size(),
            write,
            active: true,
        })
    }

    /// Map for device access.
    ///
    /// Pending host writes are uploaded first. A write map marks the Memory
    /// for download on the next host map and needs every host map released.
    pub fn map_for_device(&self, flags: MapFlags) -> Result<DeviceMapping<'_>> {
        let write = flags.contains(MapFlags::WRITE);
        let mut state = self.state.lock();

        if state.host_writer {
            return Err(FrameError::InvalidState("memory is mapped for host write"));
        }
        if write && state.host_readers > 0 {
            return Err(FrameError::InvalidState("memory is mapped for host read"));
        }

        if state.flags.contains(TransferFlags::NEED_UPLOAD) {
            let staging = match &state.staging {
                Some(staging) => staging.resource,
                None => return Err(FrameError::InvalidState("pending upload without staging")),
            };
            let mark = self.upload(staging)?;
            state.fence = Some(mark);
            state.flags.remove(TransferFlags::NEED_UPLOAD);
        }

        if write {
            state.flags |= TransferFlags::NEED_DOWNLOAD;
            state.device_writers += 1;
        }

        Ok(DeviceMapping {
            memory: self,
            handle: DeviceHandle {
                resource: self.native(),
                offset: self.offset,
            },
            write,
            active: true,
        })
    }

    fn create_staging(&self) -> Result<Staging> {
        if !self.shape.usage.contains(ShapeUsage::HOST_ACCESS) {
            return Err(FrameError::UnsupportedShape("shape was not created for host access".into()));
        }
        if !self.device.caps().contains(DeviceCaps::SIMULTANEOUS_ACCESS) {
            return Err(FrameError::UnsupportedShape(format!(
                "{} cannot stage device memory for host access",
                self.device.name()
            )));
        }

        let backend = self.device.backend();
        let ctx = self.device.push()?;
        let resource = backend
            .create_resource(&ResourceDesc {
                kind: ResourceKind::Staging,
                size: self.layout.size() as u64,
            })
            .map_err(|e| fp_native!(FP202, e))?;

        let ptr = match backend.map_host(&resource) {
            Ok(ptr) => ptr,
            Err(err) => {
                let err = fp_native!(FP202, err);
                self.device.native_context().destroy_resource(resource);
                return Err(err);
            }
        };

        if let Err(err) = ctx.pop() {
            self.device.native_context().destroy_staging(resource);
            return Err(err);
        }

        log::trace!("memory {}: created {} byte staging", self.id, self.layout.size());
        Ok(Staging {
            resource,
            ptr: HostPtr(ptr),
        })
    }

    fn upload(&self, staging: NativeResource) -> Result<FenceMark> {
        let regions = copy_regions(&self.layout, 0, &self.layout, self.offset)?;
        let src = ResourceRef {
            backend: self.device.backend().as_ref(),
            resource: staging,
        };
        let mark = self
            .device
            .submit_copy(src, &self.native(), &regions, &crate::diagnostics::FP203)?;
        log::trace!("memory {}: uploaded {} planes", self.id, regions.len());
        Ok(mark)
    }

    fn download(&self, staging: NativeResource) -> Result<FenceMark> {
        let regions = copy_regions(&self.layout, self.offset, &self.layout, 0)?;
        let src = ResourceRef {
            backend: self.device.backend().as_ref(),
            resource: self.native(),
        };
        let mark = self
            .device
            .submit_copy(src, &staging, &regions, &crate::diagnostics::FP204)?;
        log::trace!("memory {}: downloaded {} planes", self.id, regions.len());
        Ok(mark)
    }

    fn end_host_map(&self, write: bool) {
        let mut state = self.state.lock();
        if write {
            state.host_writer = false;
            state.flags |= TransferFlags::NEED_UPLOAD;
        } else {
            state.host_readers = state.host_readers.saturating_sub(1);
        }
    }

    fn end_device_map(&self, write: bool) {
        if write {
            let mut state = self.state.lock();
            state.device_writers = state.device_writers.saturating_sub(1);
            state.flags |= TransferFlags::NEED_DOWNLOAD;
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let staging = state.staging.take().map(|s| s.resource);
        let mark = state.fence.take();
        drop(state);

        let retired = Retired {
            context: Arc::clone(self.device.native_context()),
            staging,
            backing: self.backing.take(),
        };

        if let Some(mark) = mark {
            match mark.is_completed() {
                Ok(true) => {}
                Ok(false) => {
                    log::trace!("memory {}: release deferred until fence {}", self.id, mark.value);
                    self.device.inner.deferred.push(mark, retired);
                    return;
                }
                Err(err) => {
                    log::error!("memory {}: waiting for fence {} before release: {}", self.id, mark.value, err);
                    if let Err(err) = mark.wait() {
                        log::error!("memory {}: released after failed fence wait: {}", self.id, err);
                    }
                }
            }
        }
        drop(retired);
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Native device address of a mapped Memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Backing allocation
    pub resource: NativeResource,
    /// Byte offset of the frame within it
    pub offset: u64,
}

/// A device-side mapping. Unmaps on drop.
pub struct DeviceMapping<'a> {
    memory: &'a Memory,
    handle: DeviceHandle,
    write: bool,
    active: bool,
}

impl<'a> DeviceMapping<'a> {
    /// Native handle for kernels or copy commands.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// The mapped Memory.
    pub fn memory(&self) -> &'a Memory {
        self.memory
    }

    /// Unmap explicitly.
    pub fn unmap(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.active {
            self.active = false;
            self.memory.end_device_map(self.write);
        }
    }
}

impl Drop for DeviceMapping<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A host-side mapping of the staging allocation. Unmaps on drop.
pub struct HostMapping<'a> {
    memory: &'a Memory,
    ptr: NonNull<u8>,
    len: usize,
    write: bool,
    active: bool,
}

impl std::fmt::Debug for HostMapping<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMapping")
            .field("memory", &self.memory)
            .field("len", &self.len)
            .field("write", &self.write)
            .finish()
    }
}

impl<'a> HostMapping<'a> {
    /// The whole frame.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: staging is at least `len` bytes and outlives the borrow of
        // the Memory; no writer exists while this mapping reads.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole frame, writable. `None` for read mappings.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.write {
            return None;
        }
        // SAFETY: a write mapping is the only host mapping of this Memory.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Bytes of plane `index`, from its first row to the end of its last row.
    pub fn plane(&self, index: usize) -> &[u8] {
        let plane = self.memory.layout.plane(index);
        let end = (plane.offset + plane.stride * plane.rows as usize).min(self.len);
        &self.as_slice()[plane.offset..end]
    }

    /// Plane layout.
    pub fn layout(&self) -> &'a FrameLayout {
        &self.memory.layout
    }

    /// The mapped Memory.
    pub fn memory(&self) -> &'a Memory {
        self.memory
    }

    /// Unmap explicitly.
    pub fn unmap(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.active {
            self.active = false;
            self.memory.end_host_map(self.write);
        }
    }
}

impl Drop for HostMapping<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A mapping on either side.
pub enum Mapping<'a> {
    /// Host mapping
    Host(HostMapping<'a>),
    /// Device mapping
    Device(DeviceMapping<'a>),
}
