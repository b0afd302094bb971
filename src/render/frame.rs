//! Captured frame data structure
//!
//! Represents the output frame handed to the host, with its layout.

use crate::engine::PixelFormat;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Frame contents: CPU pixels or a shareable buffer descriptor
#[derive(Debug, Clone, Copy)]
pub enum FrameData<'a> {
    /// `stride * height` bytes
    Pixels(&'a [u8]),
    /// Descriptor owned by the backend until the next capture
    Dmabuf(BorrowedFd<'a>),
}

/// Frame captured from the primary output
///
/// Borrows the backend's storage; the next capture invalidates it.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Bytes per row, possibly padded
    pub stride: u32,

    /// Pixel format
    pub format: PixelFormat,

    pub data: FrameData<'a>,
}

impl CapturedFrame<'_> {
    pub fn pixels(&self) -> Option<&[u8]> {
        match self.data {
            FrameData::Pixels(p) => Some(p),
            FrameData::Dmabuf(_) => None,
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.data, FrameData::Dmabuf(_))
    }

    /// Copy into a host buffer of another size and stride
    pub fn render_to_buffer(&self, dst: &mut [u8], dst_width: u32, dst_height: u32, dst_stride: u32) -> bool {
        match self.pixels() {
            Some(src) => copy_pixels(
                src,
                self.width,
                self.height,
                self.stride,
                dst,
                dst_width,
                dst_height,
                dst_stride,
            ),
            None => false,
        }
    }
}

impl fmt::Display for CapturedFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data {
            FrameData::Pixels(p) => write!(
                f,
                "Frame({}x{}, stride={}, {}, {} bytes)",
                self.width,
                self.height,
                self.stride,
                self.format,
                p.len()
            ),
            FrameData::Dmabuf(fd) => write!(
                f,
                "Frame({}x{}, stride={}, {}, fd={})",
                self.width,
                self.height,
                self.stride,
                self.format,
                fd.as_raw_fd()
            ),
        }
    }
}

/// Stride-aware copy of the overlapping region of two 32-bit images
///
/// Returns false when either buffer is too small for its declared layout.
#[allow(clippy::too_many_arguments)]
pub fn copy_pixels(
    src: &[u8],
    src_width: u32,
    src_height: u32,
    src_stride: u32,
    dst: &mut [u8],
    dst_width: u32,
    dst_height: u32,
    dst_stride: u32,
) -> bool {
    let width = src_width.min(dst_width) as usize;
    let height = src_height.min(dst_height) as usize;
    let row = width * 4;
    let (src_stride, dst_stride) = (src_stride as usize, dst_stride as usize);

    if height == 0 || row == 0 {
        return true;
    }
    if src_stride < row || dst_stride < row {
        return false;
    }
    if src.len() < (height - 1) * src_stride + row || dst.len() < (height - 1) * dst_stride + row {
        return false;
    }

    for y in 0..height {
        let s = y * src_stride;
        let d = y * dst_stride;
        dst[d..d + row].copy_from_slice(&src[s..s + row]);
    }
    true
}

/// Frame statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    /// Total frames captured
    pub total_frames: u64,

    /// Total bytes copied
    pub total_bytes: u64,

    /// Frames handed over as a shared descriptor
    pub zero_copy_frames: u64,

    /// Capture attempts that found no frame
    pub missed_frames: u64,

    /// Total capture time in microseconds
    pub total_capture_time_us: u64,

    /// Last capture time in microseconds
    pub last_capture_time_us: u64,
}

impl FrameStats {
    /// Record a copied frame
    pub fn record_capture(&mut self, bytes: usize, time_us: u64) {
        self.total_frames += 1;
        self.total_bytes += bytes as u64;
        self.last_capture_time_us = time_us;
        self.total_capture_time_us += time_us;
    }

    /// Record a frame shared without copying
    pub fn record_zero_copy(&mut self, time_us: u64) {
        self.record_capture(0, time_us);
        self.zero_copy_frames += 1;
    }

    pub fn record_miss(&mut self) {
        self.missed_frames += 1;
    }

    pub fn average_capture_time_us(&self) -> u64 {
        if self.total_frames == 0 {
            0
        } else {
            self.total_capture_time_us / self.total_frames
        }
    }
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames ({} zero-copy, {} missed), {} bytes, avg {}us",
            self.total_frames,
            self.zero_copy_frames,
            self.missed_frames,
            self.total_bytes,
            self.average_capture_time_us()
        )
    }
}
