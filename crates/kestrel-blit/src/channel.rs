//! Blit-channel boundary: submission and blocking completion.
//!
//! [`BlitChannel`] is the seam between the operation lifecycle and the
//! fixed-function engine. Submissions enqueue geometry; [`BlitChannel::flush`]
//! executes everything queued and blocks until the channel signals
//! completion. The engine guarantees a flush before any CPU access of a
//! destination and at the end of every operation, so implementations are free
//! to defer all work to flush time.
//!
//! [`ModelChannel`] is the in-process model of such an engine: it defers
//! every submission until flush (so coherency mistakes become visible in
//! tests rather than silently ordered away) and resolves [`DmaHandle`]s
//! through the pool's device view, which itself refuses buffers that are not
//! currently held for device access.

use kestrel_bo::{AccessError, BufferPool};
use thiserror::Error;
use tracing::warn;

use crate::geom::{Point, Rect};
use crate::surface::{row_span, ImageDescriptor};

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel refused to enqueue the submission.
    #[error("blit channel rejected submission: {0}")]
    Rejected(&'static str),

    /// Execution failed after submission; destination contents are
    /// undefined for the affected geometry.
    #[error("blit channel execution failed: {0}")]
    ExecFailed(&'static str),

    /// A descriptor's buffer handle could not be used for device access.
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// The hardware channel as the engine sees it.
pub trait BlitChannel {
    /// Enqueues a rectangular copy. Geometry has been validated against both
    /// descriptors by the caller.
    fn submit_copy(
        &mut self,
        src: &ImageDescriptor,
        dst: &ImageDescriptor,
        src_origin: Point,
        dst_rect: Rect,
    ) -> Result<(), ChannelError>;

    /// Enqueues a solid fill. `color` is a raw pixel value in the
    /// destination format.
    fn submit_fill(
        &mut self,
        dst: &ImageDescriptor,
        rect: Rect,
        color: u32,
    ) -> Result<(), ChannelError>;

    /// Executes all queued submissions and blocks until complete. After a
    /// successful flush the destination memory is consistent for the device
    /// view; the pool arbitration decides when the CPU may look.
    fn flush(&mut self, pool: &mut BufferPool) -> Result<(), ChannelError>;

    /// Number of queued, unexecuted submissions.
    fn pending(&self) -> usize;
}

#[derive(Clone, Debug)]
enum PendingOp {
    Copy {
        src: ImageDescriptor,
        dst: ImageDescriptor,
        src_origin: Point,
        dst_rect: Rect,
    },
    Fill {
        dst: ImageDescriptor,
        rect: Rect,
        color: u32,
    },
}

/// In-process model of the fixed-function 2D engine.
#[derive(Debug, Default)]
pub struct ModelChannel {
    queue: Vec<PendingOp>,
    executed: u64,
    fail_next_submit: bool,
}

impl ModelChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total submissions executed over the channel's lifetime.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Error injection: the next submission is rejected.
    pub fn fail_next_submit(&mut self) {
        self.fail_next_submit = true;
    }

    fn take_injected_failure(&mut self) -> Result<(), ChannelError> {
        if self.fail_next_submit {
            self.fail_next_submit = false;
            return Err(ChannelError::Rejected("injected failure"));
        }
        Ok(())
    }

    fn exec_copy(
        pool: &mut BufferPool,
        src: &ImageDescriptor,
        dst: &ImageDescriptor,
        src_origin: Point,
        dst_rect: Rect,
    ) -> Result<(), ChannelError> {
        let bpp = dst.format.bytes_per_pixel();
        if src.format.bytes_per_pixel() != bpp {
            return Err(ChannelError::ExecFailed("descriptor format mismatch"));
        }
        if src_origin.y.checked_add(dst_rect.height).is_none()
            || dst_rect.y.checked_add(dst_rect.height).is_none()
        {
            return Err(ChannelError::ExecFailed("copy extent overflow"));
        }

        // Stage the source region first; the device view of one buffer at a
        // time keeps the borrow simple and matches a read-then-write engine.
        let src_bytes = pool.resolve_dma(src.dma)?;
        let row_bytes = (dst_rect.width as usize)
            .checked_mul(bpp)
            .ok_or(ChannelError::ExecFailed("copy extent overflow"))?;
        let staged_len = row_bytes
            .checked_mul(dst_rect.height as usize)
            .ok_or(ChannelError::ExecFailed("copy extent overflow"))?;
        let mut staged = vec![0u8; staged_len];
        for row in 0..dst_rect.height {
            let span = row_span(
                src.pitch as usize,
                src_origin.x,
                src_origin.y + row,
                dst_rect.width,
                bpp,
                src_bytes.len(),
            )
            .ok_or(ChannelError::ExecFailed("source region out of bounds"))?;
            let dst_off = row as usize * row_bytes;
            staged[dst_off..dst_off + row_bytes].copy_from_slice(&src_bytes[span]);
        }

        let dst_bytes = pool.resolve_dma_mut(dst.dma)?;
        for row in 0..dst_rect.height {
            let span = row_span(
                dst.pitch as usize,
                dst_rect.x,
                dst_rect.y + row,
                dst_rect.width,
                bpp,
                dst_bytes.len(),
            )
            .ok_or(ChannelError::ExecFailed("destination region out of bounds"))?;
            let src_off = row as usize * row_bytes;
            dst_bytes[span].copy_from_slice(&staged[src_off..src_off + row_bytes]);
        }

        Ok(())
    }

    fn exec_fill(
        pool: &mut BufferPool,
        dst: &ImageDescriptor,
        rect: Rect,
        color: u32,
    ) -> Result<(), ChannelError> {
        let bpp = dst.format.bytes_per_pixel();
        if rect.y.checked_add(rect.height).is_none() {
            return Err(ChannelError::ExecFailed("fill extent overflow"));
        }
        let dst_bytes = pool.resolve_dma_mut(dst.dma)?;
        for row in 0..rect.height {
            let span = row_span(
                dst.pitch as usize,
                rect.x,
                rect.y + row,
                rect.width,
                bpp,
                dst_bytes.len(),
            )
            .ok_or(ChannelError::ExecFailed("fill region out of bounds"))?;
            for px in dst_bytes[span].chunks_exact_mut(bpp) {
                dst.format.store_pixel(px, color);
            }
        }
        Ok(())
    }
}

impl BlitChannel for ModelChannel {
    fn submit_copy(
        &mut self,
        src: &ImageDescriptor,
        dst: &ImageDescriptor,
        src_origin: Point,
        dst_rect: Rect,
    ) -> Result<(), ChannelError> {
        self.take_injected_failure()?;
        self.queue.push(PendingOp::Copy {
            src: *src,
            dst: *dst,
            src_origin,
            dst_rect,
        });
        Ok(())
    }

    fn submit_fill(
        &mut self,
        dst: &ImageDescriptor,
        rect: Rect,
        color: u32,
    ) -> Result<(), ChannelError> {
        self.take_injected_failure()?;
        self.queue.push(PendingOp::Fill {
            dst: *dst,
            rect,
            color,
        });
        Ok(())
    }

    fn flush(&mut self, pool: &mut BufferPool) -> Result<(), ChannelError> {
        for op in std::mem::take(&mut self.queue) {
            let result = match &op {
                PendingOp::Copy {
                    src,
                    dst,
                    src_origin,
                    dst_rect,
                } => Self::exec_copy(pool, src, dst, *src_origin, *dst_rect),
                PendingOp::Fill { dst, rect, color } => Self::exec_fill(pool, dst, *rect, *color),
            };
            if let Err(err) = result {
                warn!(%err, "blit channel submission failed");
                return Err(err);
            }
            self.executed += 1;
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}
