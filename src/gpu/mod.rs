//! Native GPU backends
//!
//! The [`traits`] module defines the backend interface without pulling in any
//! backend-specific dependencies.
//!
//! ## Backends
//! - `dummy`: host-memory backend with controllable fences (always available)
//! - `vulkan`: via the `ash` and `gpu-allocator` crates (enable `gpu-vulkan`)

pub mod traits;
pub use traits::{
    codes, AdapterInfo, CopyRegion, DeviceCaps, DeviceLimits, ForeignApi, ForeignHandle,
    GpuBackend, Luid, NativeError, NativeFence, NativeRegistration, NativeResource, QueueKind,
    RegisterFlags, ResourceDesc, ResourceKind, ResourceRef, StreamId,
};

pub mod dummy;
pub use dummy::{DummyBackend, DummyCounters, DummyForeignApi, DummyForeignBuffer};

#[cfg(feature = "gpu-vulkan")]
pub mod vulkan;
