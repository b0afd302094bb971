//! Render backend abstraction
//!
//! Selects the software or hardware render path and exposes one
//! "capture last frame" operation for both.

mod capturer;
mod frame;
mod hardware;
mod hasher;
mod software;

pub use capturer::{FrameCapturer, FrameDimensions};
pub use frame::{copy_pixels, CapturedFrame, FrameData, FrameStats};
pub use hardware::HardwareBackend;
pub use hasher::{FrameHasher, HasherConfig};
pub use software::SoftwareBackend;

use crate::engine::{Engine, SceneOutputId};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Render path selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Software,
    Hardware,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderMode::Software => "software",
            RenderMode::Hardware => "hardware",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render backend errors
#[derive(Debug)]
pub enum RenderError {
    /// Backend could not be created (fatal)
    BackendCreation(String),
    /// Renderer could not be created (fatal)
    RendererInit(String),
    /// Buffer allocator could not be created (fatal)
    AllocatorInit(String),
    /// Nothing has been presented yet; retry on the next frame
    NoFrameAvailable,
    /// Presented buffer does not match its declared layout
    InvalidBuffer(String),
    /// Descriptor duplication failed
    Io(std::io::Error),
}

impl RenderError {
    /// Whether the compositor cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderError::BackendCreation(_) | RenderError::RendererInit(_) | RenderError::AllocatorInit(_)
        )
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::BackendCreation(msg) => write!(f, "Failed to create backend: {}", msg),
            RenderError::RendererInit(msg) => write!(f, "Failed to create renderer: {}", msg),
            RenderError::AllocatorInit(msg) => write!(f, "Failed to create allocator: {}", msg),
            RenderError::NoFrameAvailable => write!(f, "No frame available"),
            RenderError::InvalidBuffer(msg) => write!(f, "Invalid frame buffer: {}", msg),
            RenderError::Io(e) => write!(f, "Descriptor error: {}", e),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(e: std::io::Error) -> Self {
        RenderError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Active render path
#[derive(Debug)]
pub enum RenderBackend {
    Software(SoftwareBackend),
    Hardware(HardwareBackend),
}

impl RenderBackend {
    /// Create the engine backend and pick the render path
    ///
    /// Hardware is only used when the engine reports a GPU; otherwise the
    /// backend silently becomes software. Check [`RenderBackend::mode`] for
    /// the effective path.
    pub fn create(requested: RenderMode, engine: &mut dyn Engine) -> Result<Self> {
        engine
            .create_backend()
            .map_err(|e| RenderError::BackendCreation(e.to_string()))?;

        let mode = match requested {
            RenderMode::Hardware if !engine.hardware_available() => {
                info!("Hardware rendering unavailable, using software");
                RenderMode::Software
            }
            mode => mode,
        };

        Ok(match mode {
            RenderMode::Software => RenderBackend::Software(SoftwareBackend::new()),
            RenderMode::Hardware => RenderBackend::Hardware(HardwareBackend::new()),
        })
    }

    /// Create renderer and allocator; a failing GPU renderer falls back to software
    pub fn init_renderer(&mut self, engine: &mut dyn Engine) -> Result<()> {
        if let RenderBackend::Hardware(hw) = self {
            match hw.init(engine) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("{}, falling back to software rendering", e);
                    hw.destroy();
                    *self = RenderBackend::Software(SoftwareBackend::new());
                }
            }
        }
        self.capturer_mut().init(engine)
    }

    pub fn mode(&self) -> RenderMode {
        self.capturer().mode()
    }

    pub fn capture_frame(&mut self, engine: &dyn Engine, scene_output: SceneOutputId) -> Result<CapturedFrame<'_>> {
        self.capturer_mut().capture_frame(engine, scene_output)
    }

    pub fn dimensions(&self) -> FrameDimensions {
        self.capturer().dimensions()
    }

    pub fn stats(&self) -> &FrameStats {
        self.capturer().stats()
    }

    /// Release capture resources and the engine backend, once
    pub fn destroy(&mut self, engine: &mut dyn Engine) {
        if self.capturer_mut().destroy() {
            engine.destroy_backend();
            info!("Render backend destroyed");
        }
    }

    fn capturer(&self) -> &dyn FrameCapturer {
        match self {
            RenderBackend::Software(b) => b,
            RenderBackend::Hardware(b) => b,
        }
    }

    fn capturer_mut(&mut self) -> &mut dyn FrameCapturer {
        match self {
            RenderBackend::Software(b) => b,
            RenderBackend::Hardware(b) => b,
        }
    }
}
