//! Native backend interface and handle types
//!
//! Everything above this module talks to the GPU through [`GpuBackend`]. One
//! backend value represents one opened adapter context. The trait is
//! object-safe so devices hold `Arc<dyn GpuBackend>`.

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use bitflags::bitflags;

use crate::memory::VideoFormat;

/// Native error codes shared by the shipped backends.
///
/// Values follow the CUDA driver API where one exists so logs read the same
/// regardless of backend.
pub mod codes {
    /// An argument was out of range.
    pub const INVALID_VALUE: i32 = 1;
    /// The device ran out of memory.
    pub const OUT_OF_MEMORY: i32 = 2;
    /// The context is not current or was destroyed.
    pub const INVALID_CONTEXT: i32 = 201;
    /// Peer access is not supported between the two devices.
    pub const PEER_ACCESS_UNSUPPORTED: i32 = 217;
    /// A handle did not refer to a live object.
    pub const INVALID_HANDLE: i32 = 400;
    /// A wait did not complete in time.
    pub const TIMEOUT: i32 = 702;
    /// The operation is not supported by this backend.
    pub const NOT_SUPPORTED: i32 = 801;
}

/// A failed native call: which call, its native code, and a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    /// Name of the failing native call
    pub call: &'static str,
    /// Native error code
    pub code: i32,
    /// Human readable detail
    pub message: String,
}

impl NativeError {
    /// Create a new native error
    pub fn new(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            call,
            code,
            message: message.into(),
        }
    }

    /// Shorthand for an unsupported operation
    pub fn unsupported(call: &'static str) -> Self {
        Self::new(call, codes::NOT_SUPPORTED, "not supported by this backend")
    }

    /// Whether the backend reported the operation as unsupported
    pub fn is_unsupported(&self) -> bool {
        self.code == codes::NOT_SUPPORTED || self.code == codes::PEER_ACCESS_UNSUPPORTED
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.call, self.code, self.message)
    }
}

impl std::error::Error for NativeError {}

/// Locally unique adapter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Luid(pub u64);

bitflags! {
    /// Optional device capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCaps: u32 {
        /// Device memory can be addressed from other devices
        const PEER_ACCESS = 1 << 0;
        /// Resources can be copied to host-visible staging while in use
        const SIMULTANEOUS_ACCESS = 1 << 2;
        /// One allocation can be sliced into array layers
        const TEXTURE_ARRAY = 1 << 3;
        /// OpenGL buffers can be registered
        const GL_INTEROP = 1 << 4;
        /// D3D11 textures can be registered
        const D3D11_INTEROP = 1 << 5;
    }
}

/// Hardware limits that shape allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Row pitch alignment in bytes (power of two)
    pub pitch_alignment: usize,
    /// Maximum number of array layers in one backing allocation
    pub max_array_layers: u32,
    /// Maximum width or height of a frame
    pub max_dimension: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            pitch_alignment: 256,
            max_array_layers: 2048,
            max_dimension: 16384,
        }
    }
}

/// Static description of an opened adapter
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Enumeration index
    pub index: u32,
    /// Adapter LUID, the registry key
    pub luid: Luid,
    /// Display name
    pub name: String,
    /// Capabilities
    pub caps: DeviceCaps,
    /// Limits
    pub limits: DeviceLimits,
}

/// Where a resource lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// GPU-only memory
    DeviceLocal,
    /// Host-visible staging memory
    Staging,
}

/// Resource creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Memory kind
    pub kind: ResourceKind,
    /// Size in bytes
    pub size: u64,
}

/// Opaque native resource handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeResource {
    /// Backend-specific handle value
    pub handle: u64,
    /// Size in bytes
    pub size: u64,
}

/// Opaque native fence handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFence(pub u64);

/// Opaque native interop registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeRegistration(pub u64);

/// Queue a command is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Dedicated copy engine
    Copy,
    /// General purpose queue
    Direct,
}

/// Stream an interop map is ordered against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId(pub u64);

/// Foreign graphics API owning an interop resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForeignApi {
    /// OpenGL, calls must run on the GL context thread
    Gl,
    /// Direct3D 11
    D3D11,
}

/// Foreign resource handle (GL buffer name, D3D11 texture pointer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignHandle(pub u64);

bitflags! {
    /// Access hints for interop registration and mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegisterFlags: u32 {
        /// The device only reads the resource
        const READ_ONLY = 1 << 0;
        /// The device overwrites the whole resource
        const WRITE_DISCARD = 1 << 1;
    }
}

/// One 2D region copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Source byte offset
    pub src_offset: u64,
    /// Source row stride
    pub src_stride: u64,
    /// Destination byte offset
    pub dst_offset: u64,
    /// Destination row stride
    pub dst_stride: u64,
    /// Bytes per row to copy
    pub width_bytes: u64,
    /// Number of rows
    pub rows: u32,
}

/// A resource together with the backend that owns it
#[derive(Clone, Copy)]
pub struct ResourceRef<'a> {
    /// Owning backend
    pub backend: &'a dyn GpuBackend,
    /// The resource
    pub resource: NativeResource,
}

/// One opened native GPU context
///
/// This trait is object-safe for use with `Arc<dyn GpuBackend>`. Methods
/// taking `&self` may be called from any thread; callers bracket context
/// sensitive calls with `push_context`/`pop_context`.
pub trait GpuBackend: Send + Sync + 'static {
    /// Adapter description
    fn adapter(&self) -> &AdapterInfo;

    /// Downcast support, used for peer wiring between same-kind backends
    fn as_any(&self) -> &dyn Any;

    /// Make this context current on the calling thread
    fn push_context(&self) -> Result<(), NativeError>;

    /// Restore the previously current context
    fn pop_context(&self) -> Result<(), NativeError>;

    /// Whether frames of `format` can be allocated
    fn supports_format(&self, format: VideoFormat) -> bool;

    /// Allow this context to address `peer`'s allocations
    fn enable_peer_access(&self, peer: &dyn GpuBackend) -> Result<(), NativeError> {
        let _ = peer;
        Err(NativeError::unsupported("enable_peer_access"))
    }

    /// Revoke access granted by `enable_peer_access`
    fn disable_peer_access(&self, peer: &dyn GpuBackend) -> Result<(), NativeError> {
        let _ = peer;
        Ok(())
    }

    /// Allocate a resource
    fn create_resource(&self, desc: &ResourceDesc) -> Result<NativeResource, NativeError>;

    /// Free a resource
    fn destroy_resource(&self, resource: NativeResource) -> Result<(), NativeError>;

    /// Map a staging resource for host access
    ///
    /// The pointer stays valid for `resource.size` bytes until `unmap_host`
    /// or `destroy_resource`.
    fn map_host(&self, resource: &NativeResource) -> Result<NonNull<u8>, NativeError>;

    /// Unmap a staging resource
    fn unmap_host(&self, resource: &NativeResource) -> Result<(), NativeError>;

    /// Enqueue region copies from `src` into `dst`
    ///
    /// `src` may belong to another backend when peer access is enabled.
    fn copy_regions(
        &self,
        queue: QueueKind,
        src: ResourceRef<'_>,
        dst: &NativeResource,
        regions: &[CopyRegion],
    ) -> Result<(), NativeError>;

    /// Create a fence with completed value 0
    fn create_fence(&self) -> Result<NativeFence, NativeError>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: NativeFence);

    /// Enqueue a signal of `value` after all prior work on `queue`
    fn signal_fence(&self, queue: QueueKind, fence: NativeFence, value: u64) -> Result<(), NativeError>;

    /// Last value the GPU reported complete
    fn fence_completed_value(&self, fence: NativeFence) -> Result<u64, NativeError>;

    /// Block until `value` completes. Returns `false` on timeout.
    fn wait_fence(
        &self,
        fence: NativeFence,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, NativeError>;

    /// Register a foreign resource with this context
    fn register_foreign(
        &self,
        api: ForeignApi,
        handle: ForeignHandle,
        flags: RegisterFlags,
    ) -> Result<NativeRegistration, NativeError> {
        let _ = (api, handle, flags);
        Err(NativeError::unsupported("register_foreign"))
    }

    /// Map a registered resource, returning it as a copy source/destination
    fn map_foreign(
        &self,
        registration: NativeRegistration,
        stream: StreamId,
        flags: RegisterFlags,
    ) -> Result<NativeResource, NativeError> {
        let _ = (registration, stream, flags);
        Err(NativeError::unsupported("map_foreign"))
    }

    /// Unmap a registered resource
    fn unmap_foreign(&self, registration: NativeRegistration, stream: StreamId) -> Result<(), NativeError> {
        let _ = (registration, stream);
        Err(NativeError::unsupported("unmap_foreign"))
    }

    /// Drop a registration
    fn unregister_foreign(&self, registration: NativeRegistration) -> Result<(), NativeError> {
        let _ = registration;
        Err(NativeError::unsupported("unregister_foreign"))
    }
}

impl fmt::Debug for dyn GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adapter = self.adapter();
        f.debug_struct("GpuBackend")
            .field("index", &adapter.index)
            .field("luid", &adapter.luid)
            .field("name", &adapter.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_are_the_gated_features() {
        let names: Vec<_> = DeviceCaps::all().iter_names().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            ["PEER_ACCESS", "SIMULTANEOUS_ACCESS", "TEXTURE_ARRAY", "GL_INTEROP", "D3D11_INTEROP"]
        );
    }
}
