//! Device and pool configuration.

use crate::memory::MemoryShape;

/// Configuration for opening a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Wire peer access to other live devices at open (default: true)
    pub enable_peer_access: bool,

    /// Name used in log lines (default: the adapter name)
    pub name: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enable_peer_access: true,
            name: None,
        }
    }
}

impl DeviceConfig {
    /// Create a config that never enables peer access.
    pub fn isolated() -> Self {
        Self {
            enable_peer_access: false,
            name: None,
        }
    }

    /// Builder pattern: enable or disable peer access.
    pub fn with_peer_access(mut self, enabled: bool) -> Self {
        self.enable_peer_access = enabled;
        self
    }

    /// Builder pattern: set the log name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Configuration for a pool allocator.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Shape of every memory in the pool
    pub shape: MemoryShape,

    /// Memories created when the pool is activated
    pub min_count: usize,

    /// Cap on memories in existence (0 = unbounded)
    pub max_count: usize,

    /// Name used in log lines
    pub name: Option<String>,
}

impl PoolConfig {
    /// A pool of at most `max_count` memories.
    pub fn bounded(shape: MemoryShape, max_count: usize) -> Self {
        Self {
            shape,
            min_count: 0,
            max_count,
            name: None,
        }
    }

    /// A pool that grows on demand.
    pub fn unbounded(shape: MemoryShape) -> Self {
        Self {
            shape,
            min_count: 0,
            max_count: 0,
            name: None,
        }
    }

    /// Builder pattern: set the number preallocated at activation.
    pub fn with_min_count(mut self, min_count: usize) -> Self {
        self.min_count = min_count;
        self
    }

    /// Builder pattern: set the cap.
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    /// Builder pattern: set the log name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
