//! Device-eligibility decisions.
//!
//! Every check here routes, it never fails: an ineligible operation silently
//! takes the software fallback, and the reason is logged at diagnostic level
//! only. The envelope is narrower than the software path on purpose — the
//! fixed-function engine only knows plain copies over full plane masks in a
//! handful of formats, and carries a per-operation setup cost that dominates
//! below a minimum extent.

use kestrel_bo::BufferPool;
use tracing::debug;

use crate::engine::{AccelOps, EngineCaps};
use crate::raster::{mask_covers_all, RasterOp, RasterState};
use crate::surface::Surface;

/// Minimum width and height for device dispatch. Rectangles and surfaces
/// below this in either dimension always execute on the CPU path.
pub const MIN_HW_EXTENT: u32 = 34;

/// Core eligibility contract: one surface (or none), the raster state.
///
/// A missing surface argument — a fill has no source — is automatically
/// eligible with respect to that argument.
pub(crate) fn is_eligible(
    caps: &EngineCaps,
    pool: &BufferPool,
    surface: Option<&Surface>,
    state: &RasterState,
) -> bool {
    if state.op != RasterOp::Copy {
        debug!(op = ?state.op, "raster function not device-eligible");
        return false;
    }

    let surface = match surface {
        Some(s) => s,
        None => return true,
    };

    if !mask_covers_all(state.plane_mask, surface.depth) {
        debug!(
            plane_mask = state.plane_mask,
            depth = surface.depth,
            "partial plane mask"
        );
        return false;
    }

    if surface.depth != 24 && surface.depth != 32 {
        debug!(depth = surface.depth, "depth not device-eligible");
        return false;
    }

    if surface.width < MIN_HW_EXTENT || surface.height < MIN_HW_EXTENT {
        debug!(
            width = surface.width,
            height = surface.height,
            "surface below minimum device extent"
        );
        return false;
    }

    if surface.width > caps.max_extent || surface.height > caps.max_extent {
        debug!(
            width = surface.width,
            height = surface.height,
            max = caps.max_extent,
            "surface exceeds device extent"
        );
        return false;
    }

    if surface.pitch % caps.pitch_align != 0 {
        debug!(
            pitch = surface.pitch,
            align = caps.pitch_align,
            "pitch not aligned for device access"
        );
        return false;
    }

    match pool.dma_handle(surface.buffer) {
        Ok(Some(_)) => true,
        _ => {
            debug!(buffer = surface.buffer.raw(), "buffer not importable");
            false
        }
    }
}

/// Device eligibility for a copy between two surfaces.
pub(crate) fn copy_eligible(
    caps: &EngineCaps,
    pool: &BufferPool,
    src: &Surface,
    dst: &Surface,
    state: &RasterState,
) -> bool {
    if !caps.ops.contains(AccelOps::COPY) {
        return false;
    }
    if !is_eligible(caps, pool, Some(src), state) || !is_eligible(caps, pool, Some(dst), state) {
        return false;
    }

    // The channel performs no format conversion.
    match (src.format(), dst.format()) {
        (Ok(a), Ok(b)) if a == b => {}
        _ => {
            debug!("source/destination formats differ");
            return false;
        }
    }

    // The channel has no traversal-direction control, so it cannot be
    // trusted with self-copies over potentially overlapping ranges.
    if src.buffer == dst.buffer {
        debug!(buffer = src.buffer.raw(), "self-copy routed to software");
        return false;
    }

    true
}

/// Device eligibility for a solid fill.
pub(crate) fn solid_eligible(
    caps: &EngineCaps,
    pool: &BufferPool,
    dst: &Surface,
    state: &RasterState,
) -> bool {
    caps.ops.contains(AccelOps::FILL) && is_eligible(caps, pool, Some(dst), state)
}
