//! Copies between frames and the table deciding how they are done.

use super::layout::{copy_planes_host, copy_regions, FrameLayout, PlaneLayout, VideoFormat};
use super::{MapFlags, Memory};
use crate::error::{FrameError, Result};
use crate::gpu::ResourceRef;

/// How a copy is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyPath {
    /// Row memcpy between host frames
    SystemCopy,
    /// Device copy within one device
    DeviceCopy,
    /// Device copy reading another device's memory
    PeerCopy,
    /// Through host mappings on both sides
    HostStaging,
    /// Through a registered GL resource
    GlInterop,
    /// Through a registered D3D11 resource
    D3D11Interop,
}

/// Where one side of a copy lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Host memory
    System,
    /// Device memory
    Device,
    /// A GL buffer
    Gl,
    /// A D3D11 resource
    D3D11,
}

/// Pick the copy path between two endpoints.
///
/// `same_device` and `peer_access` only matter when both sides are device
/// memory.
pub fn select_copy_path(dst: EndpointKind, src: EndpointKind, same_device: bool, peer_access: bool) -> CopyPath {
    use EndpointKind::*;

    let has_device = dst == Device || src == Device;
    if !has_device {
        return CopyPath::SystemCopy;
    }
    if dst == Gl || src == Gl {
        return CopyPath::GlInterop;
    }
    if dst == D3D11 || src == D3D11 {
        return CopyPath::D3D11Interop;
    }
    match (dst, src) {
        (Device, Device) if same_device => CopyPath::DeviceCopy,
        (Device, Device) if peer_access => CopyPath::PeerCopy,
        _ => CopyPath::HostStaging,
    }
}

/// Copy `src` into `dst`, possibly across devices.
///
/// Uses a device copy when both live on one device or the destination device
/// can read the source device, and host mappings on both sides otherwise.
/// Rows and widths are clipped to the smaller frame per plane.
pub fn copy_memory(dst: &Memory, src: &Memory) -> Result<CopyPath> {
    if dst.layout().format() != src.layout().format() {
        return Err(FrameError::InvalidCopy("source and destination formats differ"));
    }
    if dst.id() == src.id() {
        return Err(FrameError::InvalidCopy("source and destination are the same memory"));
    }

    let path = dst.device().copy_path_from(src.device());
    match path {
        CopyPath::DeviceCopy | CopyPath::PeerCopy => {
            let src_map = src.map_for_device(MapFlags::READ | MapFlags::DEVICE)?;
            let dst_map = dst.map_for_device(MapFlags::WRITE | MapFlags::DEVICE)?;
            let src_handle = src_map.handle();
            let dst_handle = dst_map.handle();

            let regions = copy_regions(src.layout(), src_handle.offset, dst.layout(), dst_handle.offset)?;
            let source = ResourceRef {
                backend: src.device().backend().as_ref(),
                resource: src_handle.resource,
            };
            let mark = dst
                .device()
                .submit_copy(source, &dst_handle.resource, &regions, &crate::diagnostics::FP205)?;
            dst.set_fence(mark.fence, mark.value);
            log::trace!("memory {} -> {}: {:?}", src.id(), dst.id(), path);
            Ok(path)
        }
        _ => {
            copy_through_host(dst, src)?;
            log::trace!("memory {} -> {}: host staging", src.id(), dst.id());
            Ok(CopyPath::HostStaging)
        }
    }
}

fn copy_through_host(dst: &Memory, src: &Memory) -> Result<()> {
    let src_map = src.map_for_host(MapFlags::READ)?;
    let mut dst_map = dst.map_for_host(MapFlags::WRITE)?;
    let dst_layout = *dst_map.layout();
    let dst_bytes = dst_map
        .as_mut_slice()
        .ok_or(FrameError::InvalidState("write mapping is not writable"))?;
    copy_planes_host(dst_bytes, &dst_layout, src_map.as_slice(), src.layout())
}

/// A frame in plain host memory with a packed layout.
#[derive(Clone)]
pub struct SystemFrame {
    layout: FrameLayout,
    data: Vec<u8>,
}

impl SystemFrame {
    /// A zeroed frame.
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        let layout = FrameLayout::packed(format, width, height);
        Self {
            data: vec![0; layout.size()],
            layout,
        }
    }

    /// Wrap existing bytes laid out as `layout`.
    pub fn from_bytes(layout: FrameLayout, data: Vec<u8>) -> Result<Self> {
        if data.len() < layout.size() {
            return Err(FrameError::InvalidCopy("buffer is smaller than its layout"));
        }
        Ok(Self { layout, data })
    }

    /// Plane layout.
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// The whole frame.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The whole frame, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Row `row` of plane `plane`, without padding.
    pub fn row(&self, plane: usize, row: u32) -> &[u8] {
        let PlaneLayout {
            offset,
            stride,
            row_bytes,
            ..
        } = *self.layout.plane(plane);
        let start = offset + stride * row as usize;
        &self.data[start..start + row_bytes]
    }

    /// Fill every visible byte of plane `plane` with `value`.
    pub fn fill_plane(&mut self, plane: usize, value: u8) {
        let p = *self.layout.plane(plane);
        for row in 0..p.rows as usize {
            let start = p.offset + p.stride * row;
            self.data[start..start + p.row_bytes].fill(value);
        }
    }

    /// Take the bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for SystemFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemFrame")
            .field("format", &self.layout.format())
            .field("width", &self.layout.width())
            .field("height", &self.layout.height())
            .finish()
    }
}

/// Download `src` into a host frame.
pub fn copy_to_system(dst: &mut SystemFrame, src: &Memory) -> Result<CopyPath> {
    if dst.layout.format() != src.layout().format() {
        return Err(FrameError::InvalidCopy("source and destination formats differ"));
    }
    let map = src.map_for_host(MapFlags::READ)?;
    let layout = dst.layout;
    copy_planes_host(&mut dst.data, &layout, map.as_slice(), src.layout())?;
    Ok(select_copy_path(EndpointKind::System, EndpointKind::Device, false, false))
}

/// Upload a host frame into `dst`.
pub fn copy_from_system(dst: &Memory, src: &SystemFrame) -> Result<CopyPath> {
    if dst.layout().format() != src.layout.format() {
        return Err(FrameError::InvalidCopy("source and destination formats differ"));
    }
    let mut map = dst.map_for_host(MapFlags::WRITE)?;
    let layout = *map.layout();
    let bytes = map
        .as_mut_slice()
        .ok_or(FrameError::InvalidState("write mapping is not writable"))?;
    copy_planes_host(bytes, &layout, &src.data, &src.layout)?;
    Ok(select_copy_path(EndpointKind::Device, EndpointKind::System, false, false))
}

/// Copy between two host frames.
pub fn copy_system(dst: &mut SystemFrame, src: &SystemFrame) -> Result<CopyPath> {
    if dst.layout.format() != src.layout.format() {
        return Err(FrameError::InvalidCopy("source and destination formats differ"));
    }
    let layout = dst.layout;
    copy_planes_host(&mut dst.data, &layout, &src.data, &src.layout)?;
    Ok(CopyPath::SystemCopy)
}
