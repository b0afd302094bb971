//! Client-side pixel buffers of the simulated driver

use crate::engine::{PixelData, PixelFormat};

/// Owned 32-bit pixel buffer with a possibly padded stride
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer; `row_align` rounds the stride up (0 or 1 = packed)
    pub fn new(width: u32, height: u32, format: PixelFormat, row_align: u32) -> Self {
        let packed = width * format.bytes_per_pixel();
        let stride = if row_align > 1 {
            packed.div_ceil(row_align) * row_align
        } else {
            packed
        };
        Self {
            width,
            height,
            stride,
            format,
            data: vec![0; stride as usize * height as usize],
        }
    }

    /// Buffer filled with one ARGB color
    pub fn solid(width: u32, height: u32, argb: u32, format: PixelFormat) -> Self {
        let mut buffer = Self::new(width, height, format, 0);
        buffer.fill(argb);
        buffer
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel_data(&self) -> PixelData<'_> {
        PixelData {
            data: &self.data,
            stride: self.stride,
            format: self.format,
        }
    }

    pub fn fill(&mut self, argb: u32) {
        let bytes = argb.to_le_bytes();
        for row in self.data.chunks_exact_mut(self.stride as usize) {
            for px in row[..(self.width * 4) as usize].chunks_exact_mut(4) {
                px.copy_from_slice(&bytes);
            }
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let off = (y * self.stride + x * 4) as usize;
        let px = &self.data[off..off + 4];
        Some(u32::from_le_bytes([px[0], px[1], px[2], px[3]]))
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, argb: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let off = (y * self.stride + x * 4) as usize;
        self.data[off..off + 4].copy_from_slice(&argb.to_le_bytes());
    }

    /// Copy `src` with its top-left corner at `(dx, dy)`, clipped to this buffer
    ///
    /// Copies are opaque; an XRGB destination gets its padding byte forced to
    /// 0xff so the result reads back as opaque ARGB.
    pub fn blit(&mut self, src: &PixelBuffer, dx: i32, dy: i32) {
        let x0 = dx.max(0);
        let y0 = dy.max(0);
        let x1 = (dx + src.width as i32).min(self.width as i32);
        let y1 = (dy + src.height as i32).min(self.height as i32);
        if x0 >= x1 || y0 >= y1 {
            return;
        }

        let span = ((x1 - x0) * 4) as usize;
        let opaque = !self.format.has_alpha();
        for y in y0..y1 {
            let sx = (x0 - dx) as usize * 4;
            let sy = (y - dy) as usize;
            let s_off = sy * src.stride as usize + sx;
            let d_off = y as usize * self.stride as usize + x0 as usize * 4;
            let dst = &mut self.data[d_off..d_off + span];
            dst.copy_from_slice(&src.data[s_off..s_off + span]);
            if opaque {
                for px in dst.chunks_exact_mut(4) {
                    px[3] = 0xff;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_stride() {
        let buffer = PixelBuffer::new(10, 4, PixelFormat::Xrgb8888, 64);
        assert_eq!(buffer.stride(), 64);
        assert_eq!(buffer.data().len(), 256);

        let packed = PixelBuffer::new(10, 4, PixelFormat::Xrgb8888, 0);
        assert_eq!(packed.stride(), 40);
    }

    #[test]
    fn test_fill_leaves_padding() {
        let mut buffer = PixelBuffer::new(2, 2, PixelFormat::Argb8888, 16);
        buffer.fill(0xff11_2233);
        assert_eq!(buffer.pixel(1, 1), Some(0xff11_2233));
        assert_eq!(&buffer.data()[8..16], &[0u8; 8]);
    }

    #[test]
    fn test_blit_clips() {
        let mut dst = PixelBuffer::new(4, 4, PixelFormat::Xrgb8888, 0);
        let src = PixelBuffer::solid(3, 3, 0x0000_ff00, PixelFormat::Argb8888);
        dst.blit(&src, 2, -1);

        assert_eq!(dst.pixel(2, 0), Some(0xff00_ff00));
        assert_eq!(dst.pixel(3, 1), Some(0xff00_ff00));
        assert_eq!(dst.pixel(1, 0), Some(0));
        assert_eq!(dst.pixel(2, 2), Some(0));
    }
}
