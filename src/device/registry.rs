//! Process-wide device registry.
//!
//! Opening a device is the only place registry state changes, and it happens
//! under one lock, as does a device's removal when its last handle drops.

use std::sync::{Arc, OnceLock, Weak};

use super::{Device, DeviceInner};
use crate::api::config::DeviceConfig;
use crate::error::Result;
use crate::fp_emit;
use crate::gpu::{GpuBackend, Luid};
use crate::sync::mutex::Mutex;

pub(crate) struct RegistryShared {
    pub(crate) devices: Mutex<Vec<Weak<DeviceInner>>>,
}

/// Keeps one device per adapter and wires peer access between them.
///
/// Devices hold only a weak reference back, so a registry may be dropped
/// while its devices are still in use.
#[derive(Clone)]
pub struct DeviceRegistry {
    shared: Arc<RegistryShared>,
}

static GLOBAL: OnceLock<DeviceRegistry> = OnceLock::new();

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                devices: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The lazily created process-wide registry.
    pub fn global() -> &'static DeviceRegistry {
        GLOBAL.get_or_init(DeviceRegistry::new)
    }

    /// Open a device on `backend`.
    ///
    /// If a live device already exists for the backend's LUID it is returned
    /// and `backend` is dropped. A new device gets peer access to and from
    /// every live device that allows it.
    pub fn open(&self, backend: Arc<dyn GpuBackend>, config: DeviceConfig) -> Result<Device> {
        let luid = backend.adapter().luid;

        // Declared before the guard so these drop after it is released
        let mut live: Vec<Arc<DeviceInner>> = Vec::new();
        let mut devices = self.shared.devices.lock();
        devices.retain(|weak| weak.strong_count() > 0);
        live.extend(devices.iter().filter_map(Weak::upgrade));

        if let Some(existing) = live.iter().find(|d| d.luid() == luid) {
            log::debug!("{}: reusing device for {:?}", existing.name, luid);
            return Ok(Device {
                inner: Arc::clone(existing),
            });
        }

        let inner = DeviceInner::new(backend, config, Arc::downgrade(&self.shared)).map_err(|err| {
            fp_emit!(FP004, format!("{:?}: {}", luid, err));
            err
        })?;
        let inner = Arc::new(inner);

        if inner.wants_peer_access() {
            for other in live.iter().filter(|d| d.wants_peer_access()) {
                inner.enable_peer(other);
                other.enable_peer(&inner);
            }
        }

        devices.push(Arc::downgrade(&inner));
        drop(devices);

        log::info!(
            "opened device {} ({:?}, {} live)",
            inner.name,
            luid,
            live.len() + 1
        );
        Ok(Device { inner })
    }

    /// The live device for `luid`, if any.
    pub fn find(&self, luid: Luid) -> Option<Device> {
        let mut live = Vec::new();
        let devices = self.shared.devices.lock();
        live.extend(devices.iter().filter_map(Weak::upgrade));
        drop(devices);
        live.into_iter()
            .find(|d| d.luid() == luid)
            .map(|inner| Device { inner })
    }

    /// Every live device.
    pub fn devices(&self) -> Vec<Device> {
        let devices = self.shared.devices.lock();
        let live: Vec<_> = devices.iter().filter_map(Weak::upgrade).collect();
        drop(devices);
        live.into_iter().map(|inner| Device { inner }).collect()
    }

    /// Number of live devices.
    pub fn len(&self) -> usize {
        self.shared
            .devices
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no device is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceCaps, DummyBackend};

    #[test]
    fn test_reuse_by_luid() {
        let registry = DeviceRegistry::new();
        let first = registry
            .open(Arc::new(DummyBackend::new(0)), DeviceConfig::default())
            .unwrap();
        let again = registry
            .open(Arc::new(DummyBackend::new(0)), DeviceConfig::default())
            .unwrap();
        let other = registry
            .open(Arc::new(DummyBackend::new(1)), DeviceConfig::default())
            .unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(first.luid()), Some(first.clone()));
    }

    #[test]
    fn test_dropped_device_unregisters() {
        let registry = DeviceRegistry::new();
        let device = registry
            .open(Arc::new(DummyBackend::new(0)), DeviceConfig::default())
            .unwrap();
        let luid = device.luid();
        drop(device);
        assert!(registry.is_empty());
        assert!(registry.find(luid).is_none());
    }

    #[test]
    fn test_peer_wiring_is_symmetric() {
        let registry = DeviceRegistry::new();
        let a_backend = Arc::new(DummyBackend::new(0));
        let b_backend = Arc::new(DummyBackend::new(1));
        let a = registry.open(a_backend.clone(), DeviceConfig::default()).unwrap();
        let b = registry.open(b_backend.clone(), DeviceConfig::default()).unwrap();

        assert!(a.can_access_peer(&b));
        assert!(b.can_access_peer(&a));
        assert!(a_backend.has_peer(b.luid()));
        assert!(b_backend.has_peer(a.luid()));

        let b_luid = b.luid();
        drop(b);
        assert!(!a_backend.has_peer(b_luid));
    }

    #[test]
    fn test_peer_access_requires_caps() {
        let registry = DeviceRegistry::new();
        let a = registry
            .open(Arc::new(DummyBackend::new(0)), DeviceConfig::default())
            .unwrap();
        let b = registry
            .open(
                Arc::new(DummyBackend::new(1).with_caps(DeviceCaps::all() - DeviceCaps::PEER_ACCESS)),
                DeviceConfig::default(),
            )
            .unwrap();
        let c = registry
            .open(Arc::new(DummyBackend::new(2)), DeviceConfig::isolated())
            .unwrap();

        assert!(!a.can_access_peer(&b));
        assert!(!b.can_access_peer(&a));
        assert!(!a.can_access_peer(&c));
        assert!(!c.can_access_peer(&a));
    }

    #[test]
    fn test_failed_open_returns_no_device() {
        let registry = DeviceRegistry::new();
        let backend = DummyBackend::new(0);
        backend.fail_next("create_fence", crate::gpu::codes::OUT_OF_MEMORY);
        assert!(registry.open(Arc::new(backend), DeviceConfig::default()).is_err());
        assert!(registry.is_empty());
    }
}
