//! [`GpuBackend`] over a Vulkan device.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;

use crate::gpu::traits::*;
use crate::memory::VideoFormat;
use crate::sync::mutex::Mutex;

fn vk_error(call: &'static str, result: vk::Result) -> NativeError {
    NativeError::new(call, result.as_raw(), format!("{:?}", result))
}

fn alloc_error(call: &'static str, err: gpu_allocator::AllocationError) -> NativeError {
    NativeError::new(call, codes::OUT_OF_MEMORY, err.to_string())
}

struct VulkanResource {
    buffer: vk::Buffer,
    allocation: Allocation,
    kind: ResourceKind,
}

/// A Vulkan logical device and one queue family.
///
/// Frames live in linear buffers. Fences are timeline semaphores, so the
/// device must be created with Vulkan 1.2 and `timelineSemaphore` enabled.
/// The instance and device stay owned by the caller and must outlive the
/// backend. Vulkan has no current context, so push and pop do nothing.
pub struct VulkanBackend {
    adapter: AdapterInfo,
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    command_pool: Mutex<vk::CommandPool>,
    allocator: Mutex<Option<Allocator>>,
    resources: Mutex<HashMap<u64, VulkanResource>>,
    semaphores: Mutex<HashMap<u64, vk::Semaphore>>,
    next_handle: AtomicU64,
}

impl VulkanBackend {
    /// Wrap an opened device. `queue_family` must support transfer.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family: u32,
    ) -> Result<Self, NativeError> {
        let mut id_props = vk::PhysicalDeviceIDProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut id_props);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
        let props = props2.properties;

        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let luid = if id_props.device_luid_valid == vk::TRUE {
            Luid(u64::from_le_bytes(id_props.device_luid))
        } else {
            // No LUID outside Windows; the device UUID prefix is just as unique
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&id_props.device_uuid[..8]);
            Luid(u64::from_le_bytes(bytes))
        };

        let limits = DeviceLimits {
            pitch_alignment: (props.limits.optimal_buffer_copy_row_pitch_alignment as usize)
                .next_power_of_two()
                .max(4),
            max_array_layers: props.limits.max_image_array_layers,
            max_dimension: props.limits.max_image_dimension2_d,
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| alloc_error("create_allocator", e))?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| vk_error("create_command_pool", e))?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        log::info!("vulkan: {} ({:?}), pitch {}", name, luid, limits.pitch_alignment);

        Ok(Self {
            adapter: AdapterInfo {
                index: props.device_id,
                luid,
                name,
                caps: DeviceCaps::SIMULTANEOUS_ACCESS | DeviceCaps::TEXTURE_ARRAY,
                limits,
            },
            device,
            queue: Mutex::new(queue),
            command_pool: Mutex::new(command_pool),
            allocator: Mutex::new(Some(allocator)),
            resources: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// The wrapped device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The Vulkan buffer behind `resource`.
    pub fn buffer(&self, resource: &NativeResource) -> Option<vk::Buffer> {
        self.resources.lock().get(&resource.handle).map(|r| r.buffer)
    }

    fn semaphore(&self, fence: NativeFence, call: &'static str) -> Result<vk::Semaphore, NativeError> {
        self.semaphores
            .lock()
            .get(&fence.0)
            .copied()
            .ok_or_else(|| NativeError::new(call, codes::INVALID_HANDLE, "unknown fence"))
    }

    fn is_self(&self, other: &dyn GpuBackend) -> bool {
        other
            .as_any()
            .downcast_ref::<VulkanBackend>()
            .map_or(false, |other| std::ptr::eq(other, self))
    }

    /// Record `copies` into a one-shot command buffer and run it to completion.
    fn run_copies(&self, src: vk::Buffer, dst: vk::Buffer, copies: &[vk::BufferCopy]) -> Result<(), NativeError> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_error("allocate_command_buffers", e))?[0];

        let result = (|| unsafe {
            let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin)
                .map_err(|e| vk_error("begin_command_buffer", e))?;
            self.device.cmd_copy_buffer(cmd, src, dst, copies);
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| vk_error("end_command_buffer", e))?;

            let cmds = [cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&cmds);
            let queue = self.queue.lock();
            self.device
                .queue_submit(*queue, &[submit.build()], vk::Fence::null())
                .map_err(|e| vk_error("queue_submit", e))?;
            self.device
                .queue_wait_idle(*queue)
                .map_err(|e| vk_error("queue_wait_idle", e))
        })();

        unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
        result
    }
}

impl GpuBackend for VulkanBackend {
    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn push_context(&self) -> Result<(), NativeError> {
        Ok(())
    }

    fn pop_context(&self) -> Result<(), NativeError> {
        Ok(())
    }

    fn supports_format(&self, _format: VideoFormat) -> bool {
        // Frames are linear buffers, every layout fits
        true
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<NativeResource, NativeError> {
        if desc.size == 0 {
            return Err(NativeError::new("create_resource", codes::INVALID_VALUE, "zero sized resource"));
        }

        let info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(|e| vk_error("create_buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let (name, location) = match desc.kind {
            ResourceKind::DeviceLocal => ("frame", MemoryLocation::GpuOnly),
            ResourceKind::Staging => ("frame staging", MemoryLocation::GpuToCpu),
        };

        let mut allocator = self.allocator.lock();
        let allocator = match allocator.as_mut() {
            Some(allocator) => allocator,
            None => return Err(NativeError::new("create_resource", codes::INVALID_CONTEXT, "backend is shutting down")),
        };
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(alloc_error("create_resource", err));
            }
        };

        if let Err(err) = unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            let _ = allocator.free(allocation);
            return Err(vk_error("bind_buffer_memory", err));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.resources.lock().insert(
            handle,
            VulkanResource {
                buffer,
                allocation,
                kind: desc.kind,
            },
        );
        Ok(NativeResource {
            handle,
            size: desc.size,
        })
    }

    fn destroy_resource(&self, resource: NativeResource) -> Result<(), NativeError> {
        let removed = self
            .resources
            .lock()
            .remove(&resource.handle)
            .ok_or_else(|| NativeError::new("destroy_resource", codes::INVALID_HANDLE, "double free or unknown resource"))?;

        unsafe { self.device.destroy_buffer(removed.buffer, None) };
        match self.allocator.lock().as_mut() {
            Some(allocator) => allocator
                .free(removed.allocation)
                .map_err(|e| alloc_error("destroy_resource", e)),
            None => Ok(()),
        }
    }

    fn map_host(&self, resource: &NativeResource) -> Result<NonNull<u8>, NativeError> {
        let resources = self.resources.lock();
        let res = resources
            .get(&resource.handle)
            .ok_or_else(|| NativeError::new("map_host", codes::INVALID_HANDLE, "unknown resource"))?;
        if res.kind != ResourceKind::Staging {
            return Err(NativeError::new("map_host", codes::INVALID_VALUE, "resource is not host visible"));
        }
        res.allocation
            .mapped_ptr()
            .map(|ptr| ptr.cast::<u8>())
            .ok_or_else(|| NativeError::new("map_host", codes::INVALID_VALUE, "allocation is not mapped"))
    }

    fn unmap_host(&self, _resource: &NativeResource) -> Result<(), NativeError> {
        // Staging stays persistently mapped until freed
        Ok(())
    }

    fn copy_regions(
        &self,
        _queue: QueueKind,
        src: ResourceRef<'_>,
        dst: &NativeResource,
        regions: &[CopyRegion],
    ) -> Result<(), NativeError> {
        if !self.is_self(src.backend) {
            return Err(NativeError::new(
                "copy_regions",
                codes::PEER_ACCESS_UNSUPPORTED,
                "source belongs to another device",
            ));
        }

        let (src_buffer, dst_buffer) = {
            let resources = self.resources.lock();
            let lookup = |handle: u64| {
                resources
                    .get(&handle)
                    .map(|r| r.buffer)
                    .ok_or_else(|| NativeError::new("copy_regions", codes::INVALID_HANDLE, "unknown resource"))
            };
            (lookup(src.resource.handle)?, lookup(dst.handle)?)
        };

        let mut copies = Vec::new();
        for region in regions {
            let contiguous = region.src_stride == region.width_bytes && region.dst_stride == region.width_bytes;
            if contiguous {
                copies.push(vk::BufferCopy {
                    src_offset: region.src_offset,
                    dst_offset: region.dst_offset,
                    size: region.width_bytes * region.rows as u64,
                });
            } else {
                copies.extend((0..region.rows as u64).map(|row| vk::BufferCopy {
                    src_offset: region.src_offset + row * region.src_stride,
                    dst_offset: region.dst_offset + row * region.dst_stride,
                    size: region.width_bytes,
                }));
            }
        }
        copies.retain(|c| c.size > 0);
        if copies.is_empty() {
            return Ok(());
        }
        self.run_copies(src_buffer, dst_buffer, &copies)
    }

    fn create_fence(&self) -> Result<NativeFence, NativeError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore =
            unsafe { self.device.create_semaphore(&info, None) }.map_err(|e| vk_error("create_semaphore", e))?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.semaphores.lock().insert(handle, semaphore);
        Ok(NativeFence(handle))
    }

    fn destroy_fence(&self, fence: NativeFence) {
        if let Some(semaphore) = self.semaphores.lock().remove(&fence.0) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn signal_fence(&self, _queue: QueueKind, fence: NativeFence, value: u64) -> Result<(), NativeError> {
        let semaphores = [self.semaphore(fence, "signal_fence")?];
        let values = [value];
        let mut timeline = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline);

        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit.build()], vk::Fence::null()) }
            .map_err(|e| vk_error("signal_fence", e))
    }

    fn fence_completed_value(&self, fence: NativeFence) -> Result<u64, NativeError> {
        let semaphore = self.semaphore(fence, "fence_completed_value")?;
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
            .map_err(|e| vk_error("fence_completed_value", e))
    }

    fn wait_fence(&self, fence: NativeFence, value: u64, timeout: Option<Duration>) -> Result<bool, NativeError> {
        let semaphores = [self.semaphore(fence, "wait_fence")?];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);

        match unsafe { self.device.wait_semaphores(&info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(vk_error("wait_fence", e)),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let queue = *self.queue.lock();
        unsafe {
            let _ = self.device.queue_wait_idle(queue);
        }

        let resources: Vec<_> = self.resources.lock().drain().map(|(_, r)| r).collect();
        let mut allocator = self.allocator.lock().take();
        for resource in resources {
            unsafe { self.device.destroy_buffer(resource.buffer, None) };
            if let Some(allocator) = allocator.as_mut() {
                let _ = allocator.free(resource.allocation);
            }
        }
        if !self.resources.lock().is_empty() {
            log::warn!("vulkan: resources created during shutdown were leaked");
        }
        drop(allocator);

        for (_, semaphore) in self.semaphores.lock().drain() {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
        let pool = *self.command_pool.lock();
        unsafe { self.device.destroy_command_pool(pool, None) };
    }
}

// SAFETY: objects Vulkan requires external synchronization for sit behind
// mutexes. Everything else is a plain handle.
unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}
