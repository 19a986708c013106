//! CPU fallback for operations outside the blit channel's envelope.
//!
//! This path is the semantic superset: it reproduces every raster function
//! and plane mask exactly, at every supported pixel width, where the channel
//! only handles plain copies over full masks. Traversal order is caller
//! controlled (`reverse`, `upsidedown`) so self-copies over overlapping
//! regions read every source pixel before it is overwritten.
//!
//! All access goes through the pool's CPU view; the engine is responsible
//! for flushing outstanding channel work and opening a CPU window first when
//! the destination is held for device access.

use kestrel_bo::BufferPool;

use crate::error::EngineError;
use crate::geom::{Point, Rect};
use crate::raster::RasterState;
use crate::surface::{row_span, Surface};

/// Copies `dst_rect.width` x `dst_rect.height` pixels from `src` starting at
/// `src_origin` into `dst` at `dst_rect`, applying the raster state per
/// pixel.
///
/// Each source row is staged before its destination row is written, so
/// horizontal overlap within a row is always safe; vertical overlap relies
/// on `upsidedown` selecting bottom-to-top traversal when the copy moves
/// downward within one buffer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn blit(
    pool: &mut BufferPool,
    src: &Surface,
    src_origin: Point,
    dst: &Surface,
    dst_rect: Rect,
    state: &RasterState,
    reverse: bool,
    upsidedown: bool,
) -> Result<(), EngineError> {
    if dst_rect.is_empty() {
        return Ok(());
    }

    let src_fmt = src.format()?;
    let dst_fmt = dst.format()?;
    let sb = src_fmt.bytes_per_pixel();
    let db = dst_fmt.bytes_per_pixel();

    let staged_len = (dst_rect.width as usize)
        .checked_mul(sb)
        .ok_or(EngineError::AddressOverflow)?;
    let mut staged = vec![0u8; staged_len];

    for i in 0..dst_rect.height {
        let row = if upsidedown {
            dst_rect.height - 1 - i
        } else {
            i
        };
        let src_y = src_origin
            .y
            .checked_add(row)
            .ok_or(EngineError::AddressOverflow)?;
        let dst_y = dst_rect
            .y
            .checked_add(row)
            .ok_or(EngineError::AddressOverflow)?;

        let src_bytes = pool.cpu_bytes(src.buffer)?;
        let span = row_span(
            src.pitch as usize,
            src_origin.x,
            src_y,
            dst_rect.width,
            sb,
            src_bytes.len(),
        )
        .ok_or(EngineError::AddressOverflow)?;
        staged.copy_from_slice(&src_bytes[span]);

        let dst_bytes = pool.cpu_bytes_mut(dst.buffer)?;
        let span = row_span(
            dst.pitch as usize,
            dst_rect.x,
            dst_y,
            dst_rect.width,
            db,
            dst_bytes.len(),
        )
        .ok_or(EngineError::AddressOverflow)?;
        let dst_row = &mut dst_bytes[span];

        for j in 0..dst_rect.width as usize {
            let col = if reverse {
                dst_rect.width as usize - 1 - j
            } else {
                j
            };
            let s = src_fmt.load_pixel(&staged[col * sb..]);
            let d = dst_fmt.load_pixel(&dst_row[col * db..]);
            let merged = state.merge(s, d);
            dst_fmt.store_pixel(&mut dst_row[col * db..], merged);
        }
    }

    Ok(())
}

/// Fills `rect` in `dst` with the state's foreground color, applying the
/// raster function and plane mask per pixel.
pub(crate) fn fill(
    pool: &mut BufferPool,
    dst: &Surface,
    rect: Rect,
    state: &RasterState,
) -> Result<(), EngineError> {
    if rect.is_empty() {
        return Ok(());
    }

    let dst_fmt = dst.format()?;
    let db = dst_fmt.bytes_per_pixel();

    for row in 0..rect.height {
        let dst_y = rect
            .y
            .checked_add(row)
            .ok_or(EngineError::AddressOverflow)?;
        let dst_bytes = pool.cpu_bytes_mut(dst.buffer)?;
        let span = row_span(
            dst.pitch as usize,
            rect.x,
            dst_y,
            rect.width,
            db,
            dst_bytes.len(),
        )
        .ok_or(EngineError::AddressOverflow)?;

        for px in dst_bytes[span].chunks_exact_mut(db) {
            let d = dst_fmt.load_pixel(px);
            dst_fmt.store_pixel(px, state.merge(state.fg, d));
        }
    }

    Ok(())
}
