//! Change detection using xxhash
//!
//! Lets the compositor skip frame-ready callbacks for identical frames.

use super::frame::{CapturedFrame, FrameData};
use xxhash_rust::xxh64::xxh64;

/// Hasher configuration
#[derive(Debug, Clone)]
pub struct HasherConfig {
    /// Hash seed
    pub seed: u64,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            seed: 0x123456789ABCDEF0,
        }
    }
}

/// Remembers the hash of the last frame it saw
pub struct FrameHasher {
    config: HasherConfig,
    last: Option<(u32, u32, u64)>,
}

impl FrameHasher {
    pub fn new(config: HasherConfig) -> Self {
        Self { config, last: None }
    }

    /// Hash a slice of data
    pub fn hash(&self, data: &[u8]) -> u64 {
        xxh64(data, self.config.seed)
    }

    /// Returns true if the frame differs from the previous one
    ///
    /// Shared-descriptor frames cannot be inspected and always count as changed.
    pub fn has_changed(&mut self, frame: &CapturedFrame<'_>) -> bool {
        let FrameData::Pixels(pixels) = frame.data else {
            self.last = None;
            return true;
        };
        let key = (frame.width, frame.height, self.hash(pixels));
        if self.last == Some(key) {
            return false;
        }
        self.last = Some(key);
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PixelFormat;

    fn frame(data: &[u8]) -> CapturedFrame<'_> {
        CapturedFrame {
            width: 2,
            height: 1,
            stride: 8,
            format: PixelFormat::Xrgb8888,
            data: FrameData::Pixels(data),
        }
    }

    #[test]
    fn test_hash() {
        let hasher = FrameHasher::new(HasherConfig::default());
        assert_eq!(hasher.hash(b"hello world"), hasher.hash(b"hello world"));
        assert_ne!(hasher.hash(b"hello world"), hasher.hash(b"hello world!"));
    }

    #[test]
    fn test_has_changed() {
        let mut hasher = FrameHasher::new(HasherConfig::default());
        let a = [1u8; 8];
        let b = [2u8; 8];

        assert!(hasher.has_changed(&frame(&a)));
        assert!(!hasher.has_changed(&frame(&a)));
        assert!(hasher.has_changed(&frame(&b)));

        hasher.reset();
        assert!(hasher.has_changed(&frame(&b)));
    }
}
