// GPU render path: zero-copy buffer sharing with a copy fallback

use super::capturer::{FrameCapturer, FrameDimensions};
use super::frame::{CapturedFrame, FrameData, FrameStats};
use super::software::SoftwareBackend;
use super::{RenderError, RenderMode, Result};
use crate::engine::{Engine, RendererKind, SceneOutputId};
use log::{debug, warn};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Instant;

/// Hardware capturer
///
/// Every capture that finds a shareable buffer duplicates its descriptor.
/// The duplicate is owned here and closed when the next capture replaces it
/// or the backend is destroyed, independently of the engine's original.
#[derive(Debug)]
pub struct HardwareBackend {
    shared: Option<OwnedFd>,
    fallback: SoftwareBackend,
    dimensions: FrameDimensions,
    stats: FrameStats,
    active: bool,
}

impl Default for HardwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBackend {
    pub fn new() -> Self {
        Self {
            shared: None,
            fallback: SoftwareBackend::new(),
            dimensions: FrameDimensions::default(),
            stats: FrameStats::default(),
            active: true,
        }
    }

    /// Descriptor held from the last zero-copy capture
    pub fn held_descriptor(&self) -> Option<std::os::fd::BorrowedFd<'_>> {
        self.shared.as_ref().map(|fd| fd.as_fd())
    }
}

impl FrameCapturer for HardwareBackend {
    fn mode(&self) -> RenderMode {
        RenderMode::Hardware
    }

    fn renderer_kind(&self) -> RendererKind {
        RendererKind::Gles2
    }

    fn init(&mut self, engine: &mut dyn Engine) -> Result<()> {
        engine
            .create_renderer(RendererKind::Gles2)
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
        let Some(buffer) = engine.scene_output_buffer(scene_output) else {
            self.stats.record_miss();
            return Err(RenderError::NoFrameAvailable);
        };

        if let Some(attrs) = buffer.dmabuf {
            let owned = attrs.fd.try_clone_to_owned()?;
            // Replacing closes the previous duplicate
            let fd: &OwnedFd = self.shared.insert(owned);
            debug!("Shared frame descriptor {} ({}x{})", fd.as_raw_fd(), attrs.width, attrs.height);

            self.dimensions = FrameDimensions {
                width: attrs.width,
                height: attrs.height,
                stride: attrs.stride,
            };
            self.stats.record_zero_copy(start.elapsed().as_micros() as u64);
            return Ok(CapturedFrame {
                width: attrs.width,
                height: attrs.height,
                stride: attrs.stride,
                format: attrs.format,
                data: FrameData::Dmabuf(fd.as_fd()),
            });
        }

        // No shareable handle for this buffer; copy instead
        self.shared = None;
        match self.fallback.copy_from(buffer, start) {
            Ok(frame) => {
                self.dimensions = FrameDimensions {
                    width: frame.width,
                    height: frame.height,
                    stride: frame.stride,
                };
                self.stats.record_capture(
                    frame.stride as usize * frame.height as usize,
                    start.elapsed().as_micros() as u64,
                );
                Ok(frame)
            }
            Err(e) => {
                self.stats.record_miss();
                Err(e)
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
        if let Some(fd) = self.shared.take() {
            debug!("Releasing shared frame descriptor {}", fd.as_raw_fd());
        }
        if !self.fallback.destroy() {
            warn!("Hardware fallback buffer already released");
        }
        true
    }
}
