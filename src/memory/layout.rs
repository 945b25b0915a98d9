//! Video formats, memory shapes and per-plane layouts.
//!
//! A [`FrameLayout`] is computed once when a Memory is created and never
//! changes. Device memory uses the pitched layout: every plane shares one row
//! pitch aligned to the device's pitch alignment, so a kernel can address
//! any plane with the same stride. System memory uses the packed layout.

use bitflags::bitflags;

use crate::error::{FrameError, Result};
use crate::gpu::CopyRegion;
use crate::util::layout::{align_up, div_ceil_shift, round_up_2};

/// Maximum number of planes of any supported format.
pub const MAX_PLANES: usize = 4;

/// Raw video formats the pool can lay out.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoFormat {
    /// Planar 4:2:0 YUV, U before V
    I420,
    /// Planar 4:2:0 YUV, V before U
    YV12,
    /// Planar 4:2:0 YUV, 10 bits in 16, little endian
    I420_10LE,
    /// Planar 4:2:2 YUV
    Y42B,
    /// Semi-planar 4:2:0 YUV, interleaved UV
    NV12,
    /// Semi-planar 4:2:0 YUV, interleaved VU
    NV21,
    /// Semi-planar 4:2:0 YUV, 10 bits in 16
    P010,
    /// Semi-planar 4:2:0 YUV, 16 bits
    P016,
    /// Planar 4:4:4 YUV
    Y444,
    /// Planar 4:4:4 YUV, 16 bits
    Y444_16LE,
    /// Planar RGB, G plane first
    GBR,
    /// Planar RGB with alpha
    GBRA,
    /// Packed RGBA
    RGBA,
    /// Packed BGRA
    BGRA,
    /// Packed RGB with padding byte
    RGBx,
    /// Packed BGR with padding byte
    BGRx,
    /// Packed ARGB
    ARGB,
    /// Packed ABGR
    ABGR,
    /// Packed 24-bit RGB
    RGB,
    /// Packed 24-bit BGR
    BGR,
    /// Packed 10-bit BGR with 2-bit alpha
    BGR10A2,
    /// Packed 10-bit RGB with 2-bit alpha
    RGB10A2,
    /// Packed 4:2:2 YUV, Y0 U Y1 V
    YUY2,
    /// Packed 4:2:2 YUV, U Y0 V Y1
    UYVY,
}

/// How one plane of a format is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneFormat {
    /// Bytes per sample (per pixel pair for packed 4:2:2)
    pixel_stride: usize,
    /// Horizontal subsampling shift
    w_shift: u32,
    /// Vertical subsampling shift
    h_shift: u32,
}

const fn plane(pixel_stride: usize, w_shift: u32, h_shift: u32) -> PlaneFormat {
    PlaneFormat {
        pixel_stride,
        w_shift,
        h_shift,
    }
}

/// Layout family, which decides plane offsets and allocation height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    /// Three planes, chroma subsampled in both directions
    Planar420,
    /// Three planes, chroma subsampled horizontally
    Planar422,
    /// Luma plane plus one interleaved chroma plane
    SemiPlanar420,
    /// Three full resolution planes
    Planar444,
    /// Four full resolution planes
    Planar4444,
    /// One plane
    Packed,
}

impl VideoFormat {
    fn family(self) -> Family {
        use VideoFormat::*;
        match self {
            I420 | YV12 | I420_10LE => Family::Planar420,
            Y42B => Family::Planar422,
            NV12 | NV21 | P010 | P016 => Family::SemiPlanar420,
            Y444 | Y444_16LE | GBR => Family::Planar444,
            GBRA => Family::Planar4444,
            RGBA | BGRA | RGBx | BGRx | ARGB | ABGR | RGB | BGR | BGR10A2 | RGB10A2 | YUY2 | UYVY => {
                Family::Packed
            }
        }
    }

    fn planes(self) -> &'static [PlaneFormat] {
        use VideoFormat::*;
        match self {
            I420 | YV12 => {
                const P: &[PlaneFormat] = &[plane(1, 0, 0), plane(1, 1, 1), plane(1, 1, 1)];
                P
            }
            I420_10LE => {
                const P: &[PlaneFormat] = &[plane(2, 0, 0), plane(2, 1, 1), plane(2, 1, 1)];
                P
            }
            Y42B => {
                const P: &[PlaneFormat] = &[plane(1, 0, 0), plane(1, 1, 0), plane(1, 1, 0)];
                P
            }
            NV12 | NV21 => {
                const P: &[PlaneFormat] = &[plane(1, 0, 0), plane(2, 1, 1)];
                P
            }
            P010 | P016 => {
                const P: &[PlaneFormat] = &[plane(2, 0, 0), plane(4, 1, 1)];
                P
            }
            Y444 | GBR => {
                const P: &[PlaneFormat] = &[plane(1, 0, 0), plane(1, 0, 0), plane(1, 0, 0)];
                P
            }
            Y444_16LE => {
                const P: &[PlaneFormat] = &[plane(2, 0, 0), plane(2, 0, 0), plane(2, 0, 0)];
                P
            }
            GBRA => {
                const P: &[PlaneFormat] = &[plane(1, 0, 0), plane(1, 0, 0), plane(1, 0, 0), plane(1, 0, 0)];
                P
            }
            RGBA | BGRA | RGBx | BGRx | ARGB | ABGR | BGR10A2 | RGB10A2 => {
                const P: &[PlaneFormat] = &[plane(4, 0, 0)];
                P
            }
            RGB | BGR => {
                const P: &[PlaneFormat] = &[plane(3, 0, 0)];
                P
            }
            // Two bytes per pixel, addressed in macro-pixel pairs
            YUY2 | UYVY => {
                const P: &[PlaneFormat] = &[plane(4, 1, 0)];
                P
            }
        }
    }

    /// Number of planes.
    pub fn n_planes(self) -> usize {
        self.planes().len()
    }

    /// Whether the format has 4:2:0 chroma.
    pub fn is_420(self) -> bool {
        matches!(self.family(), Family::Planar420 | Family::SemiPlanar420)
    }
}

bitflags! {
    /// What a memory shape must support beyond device access
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShapeUsage: u32 {
        /// The memory can be mapped for host access through staging
        const HOST_ACCESS = 1 << 0;
        /// The memory can take part in foreign API copies
        const INTEROP = 1 << 1;
    }
}

/// The device-side shape of a frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryShape {
    /// Pixel format
    pub format: VideoFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Number of slices sharing one backing allocation (1 = independent)
    pub array_size: u32,
    /// Required usage
    pub usage: ShapeUsage,
}

impl MemoryShape {
    /// A host accessible, independently allocated shape.
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            array_size: 1,
            usage: ShapeUsage::HOST_ACCESS,
        }
    }

    /// Builder pattern: share one backing between `array_size` slices.
    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size.max(1);
        self
    }

    /// Builder pattern: set usage.
    pub fn with_usage(mut self, usage: ShapeUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Whether every slice lives in one shared backing.
    pub fn is_array(&self) -> bool {
        self.array_size > 1
    }
}

/// One plane within a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneLayout {
    /// Byte offset from the start of the frame
    pub offset: usize,
    /// Row stride in bytes
    pub stride: usize,
    /// Meaningful bytes per row
    pub row_bytes: usize,
    /// Number of rows
    pub rows: u32,
}

/// Plane strides and offsets of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    format: VideoFormat,
    width: u32,
    height: u32,
    planes: [PlaneLayout; MAX_PLANES],
    n_planes: usize,
    size: usize,
}

impl FrameLayout {
    /// Device layout: all planes share a pitch aligned to `pitch_alignment`.
    pub fn pitched(shape: &MemoryShape, pitch_alignment: usize) -> Self {
        let format = shape.format;
        let width = shape.width;
        let height = shape.height;
        let formats = format.planes();

        let width_in_bytes = div_ceil_shift(width, formats[0].w_shift) as usize * formats[0].pixel_stride;
        let pitch = align_up(width_in_bytes, pitch_alignment.max(1));
        let luma = pitch * height as usize;

        let offsets: [usize; MAX_PLANES] = match format.family() {
            Family::Planar420 => {
                let chroma_rows = round_up_2(height) as usize / 2;
                [0, luma, luma + pitch * chroma_rows, 0]
            }
            Family::Planar422 | Family::Planar444 => [0, luma, luma * 2, 0],
            Family::SemiPlanar420 => [0, luma, 0, 0],
            Family::Planar4444 => [0, luma, luma * 2, luma * 3],
            Family::Packed => [0; MAX_PLANES],
        };

        let mut planes = [PlaneLayout::default(); MAX_PLANES];
        for (i, pf) in formats.iter().enumerate() {
            planes[i] = PlaneLayout {
                offset: offsets[i],
                stride: pitch,
                row_bytes: div_ceil_shift(width, pf.w_shift) as usize * pf.pixel_stride,
                rows: div_ceil_shift(height, pf.h_shift),
            };
        }

        Self {
            format,
            width,
            height,
            planes,
            n_planes: formats.len(),
            size: pitch * alloc_height(format, height) as usize,
        }
    }

    /// System memory layout: planes back to back, rows aligned to 4 bytes.
    pub fn packed(format: VideoFormat, width: u32, height: u32) -> Self {
        let formats = format.planes();
        let mut planes = [PlaneLayout::default(); MAX_PLANES];
        let mut offset = 0;
        for (i, pf) in formats.iter().enumerate() {
            let row_bytes = div_ceil_shift(width, pf.w_shift) as usize * pf.pixel_stride;
            let stride = align_up(row_bytes, 4);
            let rows = div_ceil_shift(height, pf.h_shift);
            planes[i] = PlaneLayout {
                offset,
                stride,
                row_bytes,
                rows,
            };
            offset += stride * rows as usize;
        }

        Self {
            format,
            width,
            height,
            planes,
            n_planes: formats.len(),
            size: offset,
        }
    }

    /// Pixel format.
    pub fn format(&self) -> VideoFormat {
        self.format
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Total bytes of one frame.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of planes.
    pub fn n_planes(&self) -> usize {
        self.n_planes
    }

    /// Plane `index`.
    ///
    /// # Panics
    /// Panics if `index >= n_planes()`.
    pub fn plane(&self, index: usize) -> &PlaneLayout {
        &self.planes[..self.n_planes][index]
    }

    /// All planes.
    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes[..self.n_planes]
    }
}

/// Height in rows of the single pitched allocation holding every plane.
pub fn alloc_height(format: VideoFormat, height: u32) -> u32 {
    let height = if format.is_420() { round_up_2(height) } else { height };
    match format.family() {
        Family::Planar420 => height * 2,
        Family::SemiPlanar420 => height + height / 2,
        Family::Planar422 | Family::Planar444 => height * 3,
        Family::Planar4444 => height * 4,
        Family::Packed => height,
    }
}

/// One copy region per plane from `src` (at `src_base`) to `dst` (at `dst_base`).
///
/// Each plane copies the smaller of the two row widths and row counts.
pub fn copy_regions(src: &FrameLayout, src_base: u64, dst: &FrameLayout, dst_base: u64) -> Result<Vec<CopyRegion>> {
    if src.format != dst.format {
        return Err(FrameError::InvalidCopy("source and destination formats differ"));
    }

    Ok(src
        .planes()
        .iter()
        .zip(dst.planes())
        .map(|(s, d)| CopyRegion {
            src_offset: src_base + s.offset as u64,
            src_stride: s.stride as u64,
            dst_offset: dst_base + d.offset as u64,
            dst_stride: d.stride as u64,
            width_bytes: s.row_bytes.min(d.row_bytes) as u64,
            rows: s.rows.min(d.rows),
        })
        .collect())
}

/// Row-by-row host copy between two laid out byte buffers.
pub fn copy_planes_host(dst: &mut [u8], dst_layout: &FrameLayout, src: &[u8], src_layout: &FrameLayout) -> Result<()> {
    for region in copy_regions(src_layout, 0, dst_layout, 0)? {
        let width = region.width_bytes as usize;
        for row in 0..region.rows as usize {
            let s = region.src_offset as usize + row * region.src_stride as usize;
            let d = region.dst_offset as usize + row * region.dst_stride as usize;
            let src_row = src
                .get(s..s + width)
                .ok_or(FrameError::InvalidCopy("source buffer smaller than its layout"))?;
            let dst_row = dst
                .get_mut(d..d + width)
                .ok_or(FrameError::InvalidCopy("destination buffer smaller than its layout"))?;
            dst_row.copy_from_slice(src_row);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i420_pitched_offsets() {
        let shape = MemoryShape::new(VideoFormat::I420, 1920, 1081);
        let layout = FrameLayout::pitched(&shape, 512);
        let pitch = 2048;

        assert_eq!(layout.n_planes(), 3);
        assert!(layout.planes().iter().all(|p| p.stride == pitch));
        assert_eq!(layout.plane(1).offset, pitch * 1081);
        assert_eq!(layout.plane(2).offset, pitch * 1081 + pitch * 541);
        assert_eq!(layout.plane(1).rows, 541);
        assert_eq!(layout.plane(1).row_bytes, 960);
        assert_eq!(layout.size(), pitch * 1082 * 2);
    }

    #[test]
    fn test_nv12_pitched_offsets() {
        let shape = MemoryShape::new(VideoFormat::NV12, 1920, 1080);
        let layout = FrameLayout::pitched(&shape, 128);

        assert_eq!(layout.n_planes(), 2);
        assert_eq!(layout.plane(1).offset, 1920 * 1080);
        assert_eq!(layout.plane(1).row_bytes, 1920);
        assert_eq!(layout.size(), 1920 * 1620);
    }

    #[test]
    fn test_planar_rgb_offsets() {
        let shape = MemoryShape::new(VideoFormat::GBRA, 100, 10);
        let layout = FrameLayout::pitched(&shape, 256);
        let offsets: Vec<_> = layout.planes().iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 2560, 5120, 7680]);
        assert_eq!(layout.size(), 256 * 40);

        let shape = MemoryShape::new(VideoFormat::Y444, 100, 10);
        let layout = FrameLayout::pitched(&shape, 256);
        let offsets: Vec<_> = layout.planes().iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 2560, 5120]);
    }

    #[test]
    fn test_packed_single_plane() {
        let shape = MemoryShape::new(VideoFormat::BGRA, 640, 480);
        let layout = FrameLayout::pitched(&shape, 256);
        assert_eq!(layout.n_planes(), 1);
        assert_eq!(layout.plane(0).stride, 2560);
        assert_eq!(layout.size(), 2560 * 480);

        let yuy2 = FrameLayout::pitched(&MemoryShape::new(VideoFormat::YUY2, 3, 2), 4);
        assert_eq!(yuy2.plane(0).row_bytes, 8);
    }

    #[test]
    fn test_alloc_height_rules() {
        assert_eq!(alloc_height(VideoFormat::I420, 1081), 2164);
        assert_eq!(alloc_height(VideoFormat::NV12, 1081), 1623);
        assert_eq!(alloc_height(VideoFormat::Y42B, 1081), 3243);
        assert_eq!(alloc_height(VideoFormat::GBRA, 10), 40);
        assert_eq!(alloc_height(VideoFormat::RGBA, 1081), 1081);
    }

    #[test]
    fn test_packed_layout_is_tight() {
        let layout = FrameLayout::packed(VideoFormat::I420, 6, 3);
        assert_eq!(layout.plane(0).stride, 8);
        assert_eq!(layout.plane(1).offset, 24);
        assert_eq!(layout.plane(1).stride, 4);
        assert_eq!(layout.plane(1).rows, 2);
        assert_eq!(layout.size(), 24 + 8 + 8);
    }

    #[test]
    fn test_copy_regions_use_minimum_extent() {
        let small = FrameLayout::packed(VideoFormat::NV12, 4, 2);
        let large = FrameLayout::pitched(&MemoryShape::new(VideoFormat::NV12, 8, 4), 16);
        let regions = copy_regions(&large, 0, &small, 100).unwrap();

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].width_bytes, 4);
        assert_eq!(regions[0].rows, 2);
        assert_eq!(regions[1].dst_offset, 100 + small.plane(1).offset as u64);

        let other = FrameLayout::packed(VideoFormat::I420, 4, 2);
        assert!(copy_regions(&other, 0, &small, 0).is_err());
    }

    #[test]
    fn test_copy_planes_host() {
        let src_layout = FrameLayout::pitched(&MemoryShape::new(VideoFormat::RGBA, 2, 2), 16);
        let dst_layout = FrameLayout::packed(VideoFormat::RGBA, 2, 2);
        let src: Vec<u8> = (0..src_layout.size() as u8).collect();
        let mut dst = vec![0u8; dst_layout.size()];

        copy_planes_host(&mut dst, &dst_layout, &src, &src_layout).unwrap();
        assert_eq!(&dst[..8], &src[..8]);
        assert_eq!(&dst[8..16], &src[16..24]);
    }
}
