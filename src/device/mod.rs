//! GPU devices.
//!
//! A [`Device`] owns one opened native context. Devices are created through a
//! [`DeviceRegistry`], which hands out one shared device per adapter LUID and
//! wires peer access between the devices it holds.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use framepool::{DeviceConfig, DeviceRegistry, DummyBackend};
//! use std::sync::Arc;
//!
//! let registry = DeviceRegistry::new();
//! let device = registry.open(Arc::new(DummyBackend::new(0)), DeviceConfig::default())?;
//!
//! let ctx = device.push()?;
//! // native calls run with the context current
//! ctx.pop()?;
//! ```

mod context;
mod deferred;
mod registry;

pub use context::ContextGuard;
pub use registry::DeviceRegistry;

pub(crate) use context::NativeContext;
pub(crate) use deferred::DeferredQueue;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::api::config::DeviceConfig;
use crate::diagnostics::{self, Diagnostic};
use crate::error::{FrameError, Result};
use crate::fence::{Fence, FenceMark};
use crate::fp_emit;
use crate::gpu::{
    AdapterInfo, CopyRegion, DeviceCaps, DeviceLimits, GpuBackend, Luid, NativeRegistration,
    NativeResource, QueueKind, ResourceRef,
};
use crate::memory::transfer::{select_copy_path, CopyPath, EndpointKind};
use crate::memory::{MemoryShape, Retired, Token, VideoFormat};
use crate::sync::atomics::MonotonicU64;
use crate::sync::mutex::Mutex;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// A shared handle to one opened GPU context.
///
/// Cloning is cheap; every clone refers to the same native context.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
    id: u64,
    name: String,
    config: DeviceConfig,
    context: Arc<NativeContext>,
    fence_values: MonotonicU64,
    transfer_fence: Arc<Fence>,
    /// Ids of devices whose memory this device can address
    peers: Mutex<HashSet<u64>>,
    copy_paths: Mutex<HashMap<u64, CopyPath>>,
    pub(crate) deferred: DeferredQueue<Retired>,
    pub(crate) interop: Mutex<HashMap<u64, NativeRegistration>>,
    pub(crate) next_interop: AtomicU64,
    pub(crate) interop_cache: Token,
    registry: Weak<registry::RegistryShared>,
}

impl DeviceInner {
    fn new(
        backend: Arc<dyn GpuBackend>,
        config: DeviceConfig,
        registry: Weak<registry::RegistryShared>,
    ) -> Result<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| backend.adapter().name.clone());
        let context = Arc::new(NativeContext::new(Arc::clone(&backend)));

        // Fail construction, not first use, when the context is unusable
        context.push()?.pop()?;
        let transfer_fence = Arc::new(Fence::new(backend)?);

        Ok(Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            config,
            context,
            fence_values: MonotonicU64::new(0),
            transfer_fence,
            peers: Mutex::new(HashSet::new()),
            copy_paths: Mutex::new(HashMap::new()),
            deferred: DeferredQueue::new(),
            interop: Mutex::new(HashMap::new()),
            next_interop: AtomicU64::new(1),
            interop_cache: Token::new(),
            registry,
        })
    }

    fn backend(&self) -> &dyn GpuBackend {
        self.context.backend().as_ref()
    }

    fn luid(&self) -> Luid {
        self.backend().adapter().luid
    }

    fn wants_peer_access(&self) -> bool {
        self.config.enable_peer_access && self.backend().adapter().caps.contains(DeviceCaps::PEER_ACCESS)
    }

    /// Let this device address `other`'s allocations.
    fn enable_peer(&self, other: &DeviceInner) {
        let result = self.context.push().and_then(|ctx| {
            let enabled = self.backend().enable_peer_access(other.backend());
            ctx.pop()?;
            Ok(enabled)
        });
        match result {
            Ok(Ok(())) => {
                self.peers.lock().insert(other.id);
                log::info!("{}: peer access to {} enabled", self.name, other.name);
            }
            Ok(Err(err)) => diagnostics::emit_native(&diagnostics::FP003, &err),
            Err(_) => {}
        }
    }

    /// Revoke access to `other`, if it was granted.
    fn disable_peer(&self, other: &DeviceInner) {
        if !self.peers.lock().remove(&other.id) {
            return;
        }
        if let Err(err) = self.backend().disable_peer_access(other.backend()) {
            log::warn!("{}: failed to disable peer access to {}: {}", self.name, other.name, err);
        } else {
            log::info!("{}: peer access to {} disabled", self.name, other.name);
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let retired = self.deferred.drain_blocking();
        if !retired.is_empty() {
            log::debug!("{}: released {} deferred resources", self.name, retired.len());
        }
        drop(retired);

        let registrations: Vec<_> = self.interop.lock().drain().map(|(_, reg)| reg).collect();
        for registration in registrations {
            if let Err(err) = self.backend().unregister_foreign(registration) {
                log::warn!("{}: leaked interop registration: {}", self.name, err);
            }
        }

        // Strong handles taken under the registry lock drop after it is released
        let mut live = Vec::new();
        if let Some(registry) = self.registry.upgrade() {
            let mut devices = registry.devices.lock();
            devices.retain(|weak| weak.strong_count() > 0);
            live.extend(devices.iter().filter_map(Weak::upgrade));
            for other in &live {
                other.disable_peer(self);
                self.disable_peer(other);
            }
            drop(devices);
        }
        drop(live);

        log::info!("{}: closed", self.name);
    }
}

impl Device {
    /// Process-unique device id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Log name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adapter description.
    pub fn adapter(&self) -> &AdapterInfo {
        self.inner.backend().adapter()
    }

    /// Adapter LUID.
    pub fn luid(&self) -> Luid {
        self.inner.luid()
    }

    /// Capability flags.
    pub fn caps(&self) -> DeviceCaps {
        self.adapter().caps
    }

    /// Hardware limits.
    pub fn limits(&self) -> DeviceLimits {
        self.adapter().limits
    }

    /// Whether frames of `format` can be allocated.
    pub fn supports_format(&self, format: VideoFormat) -> bool {
        self.inner.backend().supports_format(format)
    }

    /// The native backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        self.inner.context.backend()
    }

    pub(crate) fn native_context(&self) -> &Arc<NativeContext> {
        &self.inner.context
    }

    /// Make this device's context current on the calling thread.
    ///
    /// Blocks while another thread holds the context. The returned guard
    /// pops the context when dropped.
    pub fn push(&self) -> Result<ContextGuard<'_>> {
        self.inner.context.push()
    }

    /// A fresh fence value, strictly greater than every value returned before.
    pub fn next_fence_value(&self) -> u64 {
        self.inner.fence_values.next()
    }

    /// Whether this device can address `other`'s allocations directly.
    pub fn can_access_peer(&self, other: &Device) -> bool {
        self.inner.peers.lock().contains(&other.inner.id)
    }

    /// Create a fence on this device.
    pub fn create_fence(&self) -> Result<Arc<Fence>> {
        Ok(Arc::new(Fence::new(Arc::clone(self.backend()))?))
    }

    /// The fence used by uploads, downloads and copies on this device.
    pub fn transfer_fence(&self) -> &Arc<Fence> {
        &self.inner.transfer_fence
    }

    /// Check that this device can allocate `shape`.
    pub fn validate_shape(&self, shape: &MemoryShape) -> Result<()> {
        let limits = self.limits();
        if shape.width == 0 || shape.height == 0 {
            return Err(FrameError::UnsupportedShape(format!(
                "{}x{} has a zero dimension",
                shape.width, shape.height
            )));
        }
        if shape.width > limits.max_dimension || shape.height > limits.max_dimension {
            return Err(FrameError::UnsupportedShape(format!(
                "{}x{} exceeds the {} pixel limit",
                shape.width, shape.height, limits.max_dimension
            )));
        }
        if !self.supports_format(shape.format) {
            return Err(FrameError::UnsupportedShape(format!(
                "{:?} is not supported by {}",
                shape.format, self.inner.name
            )));
        }
        if shape.is_array() {
            if !self.caps().contains(DeviceCaps::TEXTURE_ARRAY) {
                return Err(FrameError::UnsupportedShape(format!(
                    "{} cannot slice one allocation into an array",
                    self.inner.name
                )));
            }
            if shape.array_size > limits.max_array_layers {
                return Err(FrameError::UnsupportedShape(format!(
                    "array of {} exceeds the {} layer limit",
                    shape.array_size, limits.max_array_layers
                )));
            }
        }
        Ok(())
    }

    /// Free deferred resources whose fence completed. Returns how many.
    pub fn collect_completed(&self) -> usize {
        let ready = self.inner.deferred.take_completed();
        let count = ready.len();
        drop(ready);
        if count > 0 {
            log::trace!("{}: collected {} deferred releases", self.inner.name, count);
        }
        count
    }

    /// Number of resources waiting for a fence before they can be freed.
    pub fn pending_releases(&self) -> usize {
        self.inner.deferred.len()
    }

    /// How copies from `src` memory into this device's memory are done.
    ///
    /// Decided once per device pair and cached.
    pub fn copy_path_from(&self, src: &Device) -> CopyPath {
        if let Some(path) = self.inner.copy_paths.lock().get(&src.id()) {
            return *path;
        }

        let path = select_copy_path(
            EndpointKind::Device,
            EndpointKind::Device,
            self == src,
            self.can_access_peer(src),
        );
        if path == CopyPath::HostStaging {
            fp_emit!(FP206, format!("{} -> {}", src.name(), self.name()));
        } else {
            log::trace!("{} -> {}: {:?}", src.name(), self.name(), path);
        }
        self.inner.copy_paths.lock().insert(src.id(), path);
        path
    }

    /// Run region copies on the copy queue and wait for them.
    ///
    /// All planes go out in a single copy command, so one transfer is one
    /// backend call. The returned mark has already completed.
    pub(crate) fn submit_copy(
        &self,
        src: ResourceRef<'_>,
        dst: &NativeResource,
        regions: &[CopyRegion],
        diag: &Diagnostic,
    ) -> Result<FenceMark> {
        let fence = &self.inner.transfer_fence;
        let ctx = self.push()?;
        self.backend()
            .copy_regions(QueueKind::Copy, src, dst, regions)
            .map_err(|e| {
                diagnostics::emit_native(diag, &e);
                FrameError::Device(e)
            })?;
        let value = self.next_fence_value();
        fence.signal(QueueKind::Copy, value)?;
        ctx.pop()?;

        fence.wait_for(value, None)?;
        Ok(FenceMark::new(Arc::clone(fence), value))
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("luid", &self.luid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyBackend;

    fn open(backend: DummyBackend) -> (DeviceRegistry, Device) {
        let registry = DeviceRegistry::new();
        let device = registry.open(Arc::new(backend), DeviceConfig::default()).unwrap();
        (registry, device)
    }

    #[test]
    fn test_fence_values_strictly_increase() {
        let (_registry, device) = open(DummyBackend::new(0));
        let a = device.next_fence_value();
        let b = device.next_fence_value();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[test]
    fn test_validate_shape() {
        let backend = DummyBackend::new(0)
            .with_unsupported_format(VideoFormat::P016)
            .with_caps(DeviceCaps::all() - DeviceCaps::TEXTURE_ARRAY);
        let (_registry, device) = open(backend);

        assert!(device.validate_shape(&MemoryShape::new(VideoFormat::NV12, 64, 64)).is_ok());
        assert!(device.validate_shape(&MemoryShape::new(VideoFormat::P016, 64, 64)).is_err());
        assert!(device.validate_shape(&MemoryShape::new(VideoFormat::NV12, 0, 64)).is_err());
        assert!(device
            .validate_shape(&MemoryShape::new(VideoFormat::NV12, 64, 64).with_array_size(4))
            .is_err());
    }

    #[test]
    fn test_push_failure_is_device_error() {
        let backend = Arc::new(DummyBackend::new(0));
        let registry = DeviceRegistry::new();
        let device = registry.open(backend.clone(), DeviceConfig::default()).unwrap();

        backend.fail_next("push_context", crate::gpu::codes::INVALID_CONTEXT);
        let err = device.push().unwrap_err();
        assert_eq!(err.native_code(), Some(crate::gpu::codes::INVALID_CONTEXT));
        assert_eq!(backend.context_depth(), 0);
    }

    #[test]
    fn test_same_device_copy_path() {
        let (_registry, device) = open(DummyBackend::new(0));
        assert_eq!(device.copy_path_from(&device), CopyPath::DeviceCopy);
    }
}
