//! Surfaces and their hardware-facing descriptors.

use kestrel_bo::{BufferId, BufferPool, DmaHandle};

use crate::error::EngineError;
use crate::format::{FormatError, PixelFormat};

/// A rectangular pixel buffer as the rendering pipeline sees it.
///
/// Plain metadata; the backing bytes live in the [`BufferPool`] and outlive
/// any single operation. Consistency against the pool (pitch, backing size)
/// is checked when an operation is prepared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bits_per_pixel: u32,
    /// Row stride in bytes.
    pub pitch: u32,
    pub buffer: BufferId,
}

impl Surface {
    pub fn format(&self) -> Result<PixelFormat, FormatError> {
        PixelFormat::from_depth_bpp(self.depth, self.bits_per_pixel)
    }
}

/// Hardware-facing view of a [`Surface`], built once per prepared operation.
///
/// Carries the channel format code and the DMA-importable handle instead of
/// a CPU mapping; the channel resolves the handle through the pool's device
/// view at flush time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub dma: DmaHandle,
    /// Fill operations only.
    pub fill_color: Option<u32>,
}

impl Surface {
    /// Builds the channel descriptor for this surface.
    ///
    /// The surface must have passed validation and the buffer must be
    /// importable (the support policy guarantees both on the device route).
    pub(crate) fn descriptor(
        &self,
        pool: &BufferPool,
        fill_color: Option<u32>,
    ) -> Result<ImageDescriptor, EngineError> {
        let format = self.format()?;
        let dma = pool
            .dma_handle(self.buffer)?
            .ok_or(kestrel_bo::AccessError::NotImportable {
                id: self.buffer.raw(),
            })?;
        Ok(ImageDescriptor {
            format,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
            dma,
            fill_color,
        })
    }
}

/// Byte range of `width_px` pixels starting at (`x`, `y`) in a buffer with
/// the given pitch. `None` on overflow or if the span exceeds `len`.
pub(crate) fn row_span(
    pitch: usize,
    x: u32,
    y: u32,
    width_px: u32,
    bytes_per_pixel: usize,
    len: usize,
) -> Option<core::ops::Range<usize>> {
    let start = (y as usize)
        .checked_mul(pitch)?
        .checked_add((x as usize).checked_mul(bytes_per_pixel)?)?;
    let end = start.checked_add((width_px as usize).checked_mul(bytes_per_pixel)?)?;
    if end <= len {
        Some(start..end)
    } else {
        None
    }
}
