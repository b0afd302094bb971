//! Pixel formats shared by the engines and the capture paths
//!
//! 32-bit pixels stored little-endian (B, G, R, A in memory), matching the
//! DRM `ARGB8888`/`XRGB8888` formats. Rows may be padded: always go through
//! `stride`, never `width * 4`.

use smithay::backend::allocator::Fourcc;
use std::fmt;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Pixel format of a 32-bit buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
}

impl PixelFormat {
    /// DRM fourcc code
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 => fourcc(b'A', b'R', b'2', b'4'),
            PixelFormat::Xrgb8888 => fourcc(b'X', b'R', b'2', b'4'),
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        4
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::Argb8888)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Argb8888 => write!(f, "ARGB8888"),
            PixelFormat::Xrgb8888 => write!(f, "XRGB8888"),
        }
    }
}

impl PixelFormat {
    /// Formats the compositor knows how to hand to the host
    pub fn from_fourcc(code: Fourcc) -> Option<Self> {
        match code {
            Fourcc::Argb8888 => Some(PixelFormat::Argb8888),
            Fourcc::Xrgb8888 => Some(PixelFormat::Xrgb8888),
            _ => None,
        }
    }

    pub fn to_fourcc(self) -> Fourcc {
        match self {
            PixelFormat::Argb8888 => Fourcc::Argb8888,
            PixelFormat::Xrgb8888 => Fourcc::Xrgb8888,
        }
    }
}
