//! Frame capture abstraction
//!
//! Provides a unified interface over the software and hardware render paths.

use super::frame::{CapturedFrame, FrameStats};
use super::{RenderMode, Result};
use crate::engine::{Engine, RendererKind, SceneOutputId};

/// Layout of the last successfully captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Trait for frame capture implementations
pub trait FrameCapturer {
    /// Render path this capturer implements
    fn mode(&self) -> RenderMode;

    /// Renderer the engine is asked for
    fn renderer_kind(&self) -> RendererKind;

    /// Create the renderer and allocator
    fn init(&mut self, engine: &mut dyn Engine) -> Result<()>;

    /// Capture the frame last presented on `scene_output`
    fn capture_frame<'a>(
        &'a mut self,
        engine: &dyn Engine,
        scene_output: SceneOutputId,
    ) -> Result<CapturedFrame<'a>>;

    /// Dimensions of the last successful capture
    fn dimensions(&self) -> FrameDimensions;

    /// Get capture statistics
    fn stats(&self) -> &FrameStats;

    /// Release owned resources; returns false if already released
    fn destroy(&mut self) -> bool;
}
