//! Pixel-format translation between the surface metadata the rendering
//! pipeline speaks (depth + bits-per-pixel) and the format codes the blit
//! channel consumes.
//!
//! The mapping is total over the formats the pipeline is allowed to
//! construct; anything else is a configuration error, never a default.

use thiserror::Error;

/// A (depth, bits-per-pixel) pair with no channel format code.
///
/// Surfaces are constructed with validated formats upstream, so hitting this
/// means broken configuration, not bad input. It is surfaced as a hard error
/// rather than mapped to a fallback format.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no pixel format for depth {depth} at {bits_per_pixel} bpp")]
pub struct FormatError {
    pub depth: u32,
    pub bits_per_pixel: u32,
}

/// Channel-facing pixel format codes.
///
/// Discriminants are the wire values carried in an
/// [`ImageDescriptor`](crate::ImageDescriptor).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PixelFormat {
    /// 32-bit ARGB.
    Argb8888 = 0x01,
    /// 32-bit RGB with a padding byte (depth 24 stored in 32 bits).
    Xrgb8888 = 0x02,
    /// Packed 24-bit RGB.
    Rgb888 = 0x03,
    /// 16-bit RGB 5-6-5.
    Rgb565 = 0x04,
    /// 8-bit indexed.
    Indexed8 = 0x05,
}

impl PixelFormat {
    /// Translates surface depth/bpp into a channel format code.
    pub fn from_depth_bpp(depth: u32, bits_per_pixel: u32) -> Result<Self, FormatError> {
        match (depth, bits_per_pixel) {
            (32, _) => Ok(Self::Argb8888),
            (24, 32) => Ok(Self::Xrgb8888),
            (24, 24) => Ok(Self::Rgb888),
            (16, _) => Ok(Self::Rgb565),
            (8, _) => Ok(Self::Indexed8),
            _ => Err(FormatError {
                depth,
                bits_per_pixel,
            }),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Argb8888 | Self::Xrgb8888 => 4,
            Self::Rgb888 => 3,
            Self::Rgb565 => 2,
            Self::Indexed8 => 1,
        }
    }

    /// Loads one pixel value from little-endian storage.
    ///
    /// `src` must be at least [`Self::bytes_per_pixel`] long.
    pub fn load_pixel(self, src: &[u8]) -> u32 {
        match self.bytes_per_pixel() {
            1 => u32::from(src[0]),
            2 => u32::from(u16::from_le_bytes([src[0], src[1]])),
            3 => u32::from_le_bytes([src[0], src[1], src[2], 0]),
            _ => u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
        }
    }

    /// Stores one pixel value into little-endian storage, truncating to the
    /// format's width.
    pub fn store_pixel(self, dst: &mut [u8], value: u32) {
        let bytes = value.to_le_bytes();
        dst[..self.bytes_per_pixel()].copy_from_slice(&bytes[..self.bytes_per_pixel()]);
    }
}
