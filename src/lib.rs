//! # framepool
//!
//! Pooled GPU frame memory for video pipelines.
//!
//! ## Features
//!
//! - Device handles shared per adapter, with peer access wired between them
//! - Frame memory with lazily created host staging and dirty-bit transfers
//! - Timeline fences with deferred release of in-flight allocations
//! - Bounded, thread-safe pools with flushing shutdown
//! - Array-backed pools slicing one allocation into many frames
//! - Copies across devices, host memory and foreign APIs (GL, D3D11)
//! - Coded diagnostics routed through `log`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use framepool::{DeviceConfig, DeviceRegistry, DummyBackend, MapFlags, MemoryShape, PoolAllocator, VideoFormat};
//!
//! # fn main() -> framepool::Result<()> {
//! let device = DeviceRegistry::global().open(Arc::new(DummyBackend::new(0)), DeviceConfig::default())?;
//! let shape = MemoryShape::new(VideoFormat::NV12, 1920, 1080);
//!
//! let pool = PoolAllocator::new(&device, shape);
//! pool.configure(shape, 2, 8)?;
//! pool.set_active(true)?;
//!
//! let frame = pool.acquire()?;
//! let mut map = frame.map_for_host(MapFlags::WRITE)?;
//! if let Some(bytes) = map.as_mut_slice() {
//!     bytes.fill(0x80);
//! }
//! map.unmap();
//! let _device_side = frame.map_for_device(MapFlags::READ | MapFlags::DEVICE)?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod api;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod fence;
pub mod gpu;
pub mod interop;
pub mod memory;

mod sync;
mod util;

pub use error::{FrameError, Result};

// Devices
pub use api::config::{DeviceConfig, PoolConfig};
pub use device::{ContextGuard, Device, DeviceRegistry};

// Fences
pub use fence::{Fence, FenceMark, WaitStatus};

// Memory
pub use memory::{
    copy_from_system, copy_memory, copy_system, copy_to_system, CopyPath, DeviceHandle, DeviceMapping,
    EndpointKind, FrameLayout, HostMapping, MapFlags, Mapping, Memory, MemoryShape, PlaneLayout, ShapeUsage,
    SystemFrame, Token, TokenCache, TransferFlags, VideoFormat,
};

// Allocators
pub use allocator::{DirectAllocator, FrameAllocator, MemoryHandle, PoolAllocator, PoolPhase};
pub use api::stats::PoolStats;

// Interop
pub use interop::{
    copy_from_foreign, copy_to_foreign, ensure_registered, ContextThread, ForeignBuffer, GraphicsResource,
    InteropToken,
};

// Backends
pub use gpu::{DummyBackend, GpuBackend};
#[cfg(feature = "gpu-vulkan")]
pub use gpu::vulkan::VulkanBackend;

// Diagnostics
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use diagnostics::{set_strict_mode, StrictMode, StrictModeGuard};

static_assertions::assert_impl_all!(Device: Send, Sync);
static_assertions::assert_impl_all!(Memory: Send, Sync);
static_assertions::assert_impl_all!(MemoryHandle: Send, Sync);
static_assertions::assert_impl_all!(PoolAllocator: Send, Sync);
static_assertions::assert_impl_all!(Fence: Send, Sync);
static_assertions::assert_impl_all!(GraphicsResource: Send, Sync);
static_assertions::assert_impl_all!(ContextThread: Send, Sync);
