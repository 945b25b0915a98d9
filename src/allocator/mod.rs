//! Memory allocators.
//!
//! [`DirectAllocator`] creates Memories on demand; [`PoolAllocator`] keeps a
//! bounded set of same-shape Memories and recycles them. [`FrameAllocator`]
//! lets callers hold either behind one type.

mod direct;
mod pool;

pub use direct::DirectAllocator;
pub use pool::{MemoryHandle, PoolAllocator, PoolPhase};

use crate::device::Device;
use crate::error::Result;
use crate::memory::MemoryShape;

/// Either a direct allocator bound to one shape, or a pool.
#[derive(Debug)]
pub enum FrameAllocator {
    /// Allocate a fresh Memory on every call
    Direct {
        /// Device to allocate on
        device: Device,
        /// Shape of every allocation
        shape: MemoryShape,
    },
    /// Recycle Memories through a pool
    Pool(PoolAllocator),
}

impl FrameAllocator {
    /// A direct allocator for `shape`.
    pub fn direct(device: &Device, shape: MemoryShape) -> Self {
        FrameAllocator::Direct {
            device: device.clone(),
            shape,
        }
    }

    /// Allocate one Memory. Pools may block; see [`PoolAllocator::acquire`].
    pub fn allocate(&self) -> Result<MemoryHandle> {
        match self {
            FrameAllocator::Direct { device, shape } => {
                DirectAllocator::alloc(device, *shape).map(MemoryHandle::owned)
            }
            FrameAllocator::Pool(pool) => pool.acquire(),
        }
    }

    /// Activate or deactivate. Direct allocators are always active.
    pub fn set_active(&self, active: bool) -> Result<()> {
        match self {
            FrameAllocator::Direct { .. } => Ok(()),
            FrameAllocator::Pool(pool) => pool.set_active(active),
        }
    }

    /// The device allocations come from.
    pub fn device(&self) -> &Device {
        match self {
            FrameAllocator::Direct { device, .. } => device,
            FrameAllocator::Pool(pool) => pool.device(),
        }
    }
}

impl From<PoolAllocator> for FrameAllocator {
    fn from(pool: PoolAllocator) -> Self {
        FrameAllocator::Pool(pool)
    }
}
