// Parent display detection
//
// The compositor runs nested inside another display server. The demo host
// refuses to start when neither a Wayland nor an X11 parent can be found.

mod detector;

pub use detector::{DisplayDetector, DisplayStatus};

use std::fmt;

/// Kind of parent display server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentDisplay {
    /// Wayland socket name or path from `WAYLAND_DISPLAY`
    Wayland(String),
    /// X11 display string from `DISPLAY`
    X11(String),
}

impl fmt::Display for ParentDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentDisplay::Wayland(name) => write!(f, "Wayland display {}", name),
            ParentDisplay::X11(name) => write!(f, "X11 display {}", name),
        }
    }
}

/// Display detection errors
#[derive(Debug)]
pub enum DisplayError {
    /// Neither `WAYLAND_DISPLAY` nor `DISPLAY` is set
    NoDisplayAvailable,
    /// A display is configured but cannot be reached
    Unreachable(ParentDisplay, String),
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayError::NoDisplayAvailable => {
                write!(f, "No parent display available. Please set WAYLAND_DISPLAY or DISPLAY, or pass --no-parent-check.")
            }
            DisplayError::Unreachable(display, reason) => {
                write!(f, "{} is not reachable: {}", display, reason)
            }
        }
    }
}

impl std::error::Error for DisplayError {}

pub type Result<T> = std::result::Result<T, DisplayError>;
