//! Stateless allocation of Memories.

use std::sync::Arc;

use crate::device::Device;
use crate::error::{FrameError, Result};
use crate::fp_native;
use crate::gpu::{NativeResource, ResourceDesc, ResourceKind};
use crate::memory::{Backing, FrameLayout, Memory, MemoryShape};

/// Creates Memories straight from the device, one native allocation each.
///
/// Array shapes are the exception: [`DirectAllocator::alloc_array`] makes one
/// allocation and slices it into `array_size` Memories sharing the backing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAllocator;

impl DirectAllocator {
    /// Layout a Memory of `shape` gets on `device`.
    pub fn layout_for(device: &Device, shape: &MemoryShape) -> FrameLayout {
        FrameLayout::pitched(shape, device.limits().pitch_alignment)
    }

    /// Allocate one Memory.
    pub fn alloc(device: &Device, shape: MemoryShape) -> Result<Memory> {
        if shape.is_array() {
            return Err(FrameError::UnsupportedShape(
                "array shapes are allocated with alloc_array".into(),
            ));
        }
        device.collect_completed();
        device.validate_shape(&shape)?;

        let layout = Self::layout_for(device, &shape);
        let backing = Self::create_backing(device, layout.size() as u64)?;
        Ok(Memory::new(device.clone(), shape, layout, backing, 0))
    }

    /// Allocate every slice of an array shape from one native allocation.
    pub fn alloc_array(device: &Device, shape: MemoryShape) -> Result<Vec<Memory>> {
        device.collect_completed();
        device.validate_shape(&shape)?;

        let layout = Self::layout_for(device, &shape);
        let slice = layout.size() as u64;
        let count = shape.array_size.max(1) as u64;
        let backing = Self::create_backing(device, slice * count)?;

        log::debug!(
            "{}: array of {} x {:?} {}x{} ({} bytes each)",
            device.name(),
            count,
            shape.format,
            shape.width,
            shape.height,
            slice
        );
        Ok((0..count)
            .map(|i| Memory::new(device.clone(), shape, layout, Arc::clone(&backing), i * slice))
            .collect())
    }

    /// Adopt an allocation made elsewhere.
    ///
    /// `on_free` is called with the resource once the Memory and every
    /// deferred use of it are gone; the resource is never destroyed here.
    pub fn wrap<F>(device: &Device, shape: MemoryShape, resource: NativeResource, on_free: F) -> Result<Memory>
    where
        F: FnOnce(NativeResource) + Send + 'static,
    {
        let layout = Self::layout_for(device, &shape);
        if resource.size < layout.size() as u64 {
            return Err(FrameError::InvalidState("wrapped resource is smaller than the frame"));
        }
        let backing = Backing::wrapped(Arc::clone(device.native_context()), resource, Box::new(on_free));
        Ok(Memory::new(device.clone(), shape, layout, backing, 0))
    }

    fn create_backing(device: &Device, size: u64) -> Result<Arc<Backing>> {
        let ctx = device.push()?;
        let resource = device
            .backend()
            .create_resource(&ResourceDesc {
                kind: ResourceKind::DeviceLocal,
                size,
            })
            .map_err(|e| fp_native!(FP201, e))?;
        let backing = Backing::owned(Arc::clone(device.native_context()), resource);
        ctx.pop()?;
        Ok(backing)
    }
}
