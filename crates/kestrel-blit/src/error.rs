use thiserror::Error;

use crate::channel::ChannelError;
use crate::format::FormatError;
use crate::geom::Rect;
use kestrel_bo::AccessError;

/// Operation-level failures of the offload engine.
///
/// Ineligibility for the device path is never an error — it silently routes
/// to the software fallback. Everything here aborts the operation before any
/// surface memory is touched, except [`EngineError::Channel`], which leaves
/// the destination contents undefined (the caller reports upward; there is
/// no automatic retry).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Buffer access arbitration failed (busy buffer, unknown id, import
    /// failure). Partial holds from the same Prepare are already unwound.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// A surface carries a depth/bpp pair outside the supported domain.
    /// Configuration error; never mapped to a default format.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The blit channel rejected or failed a submission.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("rectangle {rect:?} exceeds the {width}x{height} surface")]
    OutOfBounds {
        rect: Rect,
        width: u32,
        height: u32,
    },

    #[error("pitch {pitch} too small for {width} pixels at {bits_per_pixel} bpp")]
    PitchTooSmall {
        pitch: u32,
        width: u32,
        bits_per_pixel: u32,
    },

    #[error("backing buffer too small: need {need} bytes, have {have}")]
    BackingTooSmall { need: usize, have: usize },

    #[error("arithmetic overflow computing pixel addresses")]
    AddressOverflow,

    #[error("invalid engine capabilities: {0}")]
    InvalidCaps(&'static str),
}
