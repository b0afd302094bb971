//! nestcomp - embeddable nested compositor core
//!
//! Accepts client windows, tracks their lifecycle, routes keyboard and
//! pointer input to the right window and hands rendered frames to the host.
//! The protocol and scene-graph work sits behind the [`engine::Engine`]
//! trait. [`engine::WaylandEngine`] implements it on smithay with a pixman
//! renderer and a listening Wayland socket.

pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod output;
pub mod render;
pub mod seat;
pub mod view;
pub mod compositor;

// Re-exports
pub use compositor::Compositor;
pub use config::Config;
pub use error::{CompositorError, Result};
pub use render::{CapturedFrame, RenderMode};
pub use view::ViewId;
