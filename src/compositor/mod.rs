//! Embedded nested compositor
//!
//! Ties views, seat and outputs together behind one handle the host drives:
//! initialize the backend, start, dispatch engine signals whenever the event
//! descriptor is readable, and pull or receive rendered frames.

pub mod state;
mod handlers;

#[cfg(test)]
mod tests;

pub use state::{CommitCallback, Compositor, FrameCallback, ViewCallback};
