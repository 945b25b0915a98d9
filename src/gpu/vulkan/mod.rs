//! Vulkan backend
//!
//! Frames are linear buffers allocated through `gpu-allocator`, fences are
//! timeline semaphores.

pub mod backend;

pub use backend::VulkanBackend;
