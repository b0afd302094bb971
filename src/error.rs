//! Errors surfaced to the embedding host

use crate::engine::EngineError;
use crate::render::RenderError;
use std::fmt;

#[derive(Debug)]
pub enum CompositorError {
    /// Engine object creation failed during startup
    Init(&'static str, EngineError),
    /// Render backend setup or capture failed
    Render(RenderError),
    /// `init_backend` has not run, or ran already
    NotInitialized,
    AlreadyInitialized,
    /// `start` was called twice
    AlreadyStarted,
    /// Compositor has been torn down
    Destroyed,
    /// No output to present on
    NoOutput,
    /// Host passed a view index outside the view list
    InvalidViewIndex(usize),
    /// View has not committed any content yet
    NoContent,
    /// Destination buffer cannot hold the requested layout
    BufferTooSmall { needed: usize, got: usize },
}

impl CompositorError {
    /// Transient errors can be retried on a later frame or ignored
    pub fn is_transient(&self) -> bool {
        match self {
            CompositorError::InvalidViewIndex(_)
            | CompositorError::NoContent
            | CompositorError::NoOutput
            | CompositorError::BufferTooSmall { .. } => true,
            CompositorError::Render(e) => !e.is_fatal(),
            _ => false,
        }
    }
}

impl fmt::Display for CompositorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositorError::Init(what, e) => write!(f, "Failed to initialize {}: {}", what, e),
            CompositorError::Render(e) => write!(f, "Render error: {}", e),
            CompositorError::NotInitialized => write!(f, "Backend not initialized"),
            CompositorError::AlreadyInitialized => write!(f, "Backend already initialized"),
            CompositorError::AlreadyStarted => write!(f, "Compositor already started"),
            CompositorError::Destroyed => write!(f, "Compositor destroyed"),
            CompositorError::NoOutput => write!(f, "No output available"),
            CompositorError::InvalidViewIndex(index) => write!(f, "Invalid view index {}", index),
            CompositorError::NoContent => write!(f, "View has no content"),
            CompositorError::BufferTooSmall { needed, got } => {
                write!(f, "Destination buffer too small: need {} bytes, got {}", needed, got)
            }
        }
    }
}

impl std::error::Error for CompositorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompositorError::Init(_, e) => Some(e),
            CompositorError::Render(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RenderError> for CompositorError {
    fn from(e: RenderError) -> Self {
        CompositorError::Render(e)
    }
}

pub type Result<T> = std::result::Result<T, CompositorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CompositorError::InvalidViewIndex(3).is_transient());
        assert!(CompositorError::Render(RenderError::NoFrameAvailable).is_transient());
        assert!(!CompositorError::Render(RenderError::RendererInit("gpu".into())).is_transient());
        assert!(!CompositorError::Init("seat", EngineError::DisplayUnavailable).is_transient());
    }

    #[test]
    fn test_display() {
        let e = CompositorError::Init("xdg shell", EngineError::Subsystem("boom".into()));
        assert_eq!(e.to_string(), "Failed to initialize xdg shell: Subsystem error: boom");
    }
}
