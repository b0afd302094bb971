// CPU render path: pixel copy into a reusable buffer

use super::capturer::{FrameCapturer, FrameDimensions};
use super::frame::{CapturedFrame, FrameData, FrameStats};
use super::{RenderError, RenderMode, Result};
use crate::engine::{BufferRef, Engine, PixelFormat, RendererKind, SceneOutputId};
use log::{debug, trace};
use std::time::Instant;

/// Software capturer
///
/// Owns a single buffer that only ever grows; each capture copies
/// `stride * height` bytes of the presented frame into it.
#[derive(Debug)]
pub struct SoftwareBackend {
    buffer: Vec<u8>,
    dimensions: FrameDimensions,
    format: PixelFormat,
    stats: FrameStats,
    active: bool,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dimensions: FrameDimensions::default(),
            format: PixelFormat::Xrgb8888,
            stats: FrameStats::default(),
            active: true,
        }
    }

    /// Allocated size of the reusable buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Copy the CPU pixels of `buffer`
    pub(crate) fn copy_from(&mut self, buffer: BufferRef<'_>, start: Instant) -> Result<CapturedFrame<'_>> {
        let Some(pixels) = buffer.pixels else {
            self.stats.record_miss();
            return Err(RenderError::NoFrameAvailable);
        };
        let size = pixels.stride as usize * buffer.height as usize;
        if pixels.data.len() < size {
            self.stats.record_miss();
            return Err(RenderError::InvalidBuffer(format!(
                "{} bytes for {} rows of stride {}",
                pixels.data.len(),
                buffer.height,
                pixels.stride
            )));
        }

        if self.buffer.len() < size {
            debug!("Growing capture buffer {} -> {} bytes", self.buffer.len(), size);
            self.buffer.resize(size, 0);
        }
        self.buffer[..size].copy_from_slice(&pixels.data[..size]);

        self.dimensions = FrameDimensions {
            width: buffer.width,
            height: buffer.height,
            stride: pixels.stride,
        };
        self.format = pixels.format;
        self.stats.record_capture(size, start.elapsed().as_micros() as u64);
        trace!("Captured {}x{} stride {}", buffer.width, buffer.height, pixels.stride);

        Ok(CapturedFrame {
            width: buffer.width,
            height: buffer.height,
            stride: pixels.stride,
            format: pixels.format,
            data: FrameData::Pixels(&self.buffer[..size]),
        })
    }
}

impl FrameCapturer for SoftwareBackend {
    fn mode(&self) -> RenderMode {
        RenderMode::Software
    }

    fn renderer_kind(&self) -> RendererKind {
        RendererKind::Pixman
    }

    fn init(&mut self, engine: &mut dyn Engine) -> Result<()> {
        engine
            .create_renderer(RendererKind::Pixman)
            .map_err(|e| RenderError::RendererInit(e.to_string()))?;
        engine
            .create_allocator()
            .map_err(|e| RenderError::AllocatorInit(e.to_string()))?;
        Ok(())
    }

    fn capture_frame<'a>(
        &'a mut self,
        engine: &dyn Engine,
        scene_output: SceneOutputId,
    ) -> Result<CapturedFrame<'a>> {
        let start = Instant::now();
        match engine.scene_output_buffer(scene_output) {
            Some(buffer) => self.copy_from(buffer, start),
            None => {
                self.stats.record_miss();
                Err(RenderError::NoFrameAvailable)
            }
        }
    }

    fn dimensions(&self) -> FrameDimensions {
        self.dimensions
    }

    fn stats(&self) -> &FrameStats {
        &self.stats
    }

    fn destroy(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.buffer = Vec::new();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PixelBuffer;

    fn buffer_ref(buffer: &PixelBuffer) -> BufferRef<'_> {
        BufferRef {
            width: buffer.width(),
            height: buffer.height(),
            pixels: Some(buffer.pixel_data()),
            dmabuf: None,
        }
    }

    #[test]
    fn test_buffer_grows_only() {
        let mut backend = SoftwareBackend::new();
        let large = PixelBuffer::new(16, 16, PixelFormat::Xrgb8888, 64);
        let small = PixelBuffer::new(4, 4, PixelFormat::Xrgb8888, 64);

        let frame = backend.copy_from(buffer_ref(&large), Instant::now()).unwrap();
        assert_eq!(frame.stride, 64);
        assert_eq!(backend.capacity(), 64 * 16);

        let frame = backend.copy_from(buffer_ref(&small), Instant::now()).unwrap();
        assert_eq!(frame.pixels().map(|p| p.len()), Some(64 * 4));
        assert_eq!(backend.capacity(), 64 * 16);
        assert_eq!(
            backend.dimensions(),
            FrameDimensions { width: 4, height: 4, stride: 64 }
        );
    }

    #[test]
    fn test_missing_pixels_keep_dimensions() {
        let mut backend = SoftwareBackend::new();
        let empty = BufferRef {
            width: 8,
            height: 8,
            pixels: None,
            dmabuf: None,
        };
        assert!(matches!(
            backend.copy_from(empty, Instant::now()),
            Err(RenderError::NoFrameAvailable)
        ));
        assert_eq!(backend.dimensions(), FrameDimensions::default());
        assert_eq!(backend.stats().missed_frames, 1);
    }

    #[test]
    fn test_destroy_once() {
        let mut backend = SoftwareBackend::new();
        assert!(backend.destroy());
        assert!(!backend.destroy());
    }
}
