//! The accelerated-operation lifecycle.
//!
//! Callers drive each operation through the six-call contract:
//! [`BlitEngine::prepare_copy`] / [`BlitEngine::copy`] /
//! [`BlitEngine::done_copy`] and the solid-fill triple. Prepare decides the
//! route (channel or CPU fallback) and takes the access holds the route
//! needs; Execute submits or blits one rectangle at a time; Done flushes,
//! releases every hold, and consumes the context.
//!
//! The operation context is a caller-owned value, not engine state: at most
//! one may be live per engine, and `done_*` taking it by value makes the
//! bracket visible in the type system. The engine does not serialize callers
//! beyond that — a second Prepare touching the same buffers fails at
//! acquire.

use bitflags::bitflags;
use kestrel_bo::{AccessToken, BufferPool};
use tracing::{trace, warn};

use crate::channel::BlitChannel;
use crate::error::EngineError;
use crate::geom::{Point, Rect};
use crate::policy::{self, MIN_HW_EXTENT};
use crate::raster::RasterState;
use crate::soft;
use crate::surface::{ImageDescriptor, Surface};

bitflags! {
    /// Operation variants the engine accelerates.
    ///
    /// Chosen once at init time; a variant without its bit still prepares
    /// successfully and routes to the software fallback. There is no
    /// composite bit: multi-surface blends are declined by construction.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccelOps: u32 {
        const COPY = 1 << 0;
        const FILL = 1 << 1;
    }
}

/// Init-time capability and bounds declaration.
///
/// Consulted once when the engine is built (and by the support policy per
/// prepare); the hosting pipeline reads it to size surfaces, it is never
/// re-negotiated per operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineCaps {
    /// Maximum width and height the channel can address.
    pub max_extent: u32,
    /// Required row-stride alignment in bytes for channel access.
    pub pitch_align: u32,
    pub ops: AccelOps,
}

impl Default for EngineCaps {
    fn default() -> Self {
        Self {
            max_extent: 4096,
            pitch_align: 32,
            ops: AccelOps::COPY | AccelOps::FILL,
        }
    }
}

/// Which path executed, per operation kind. Purely observational.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OffloadStats {
    pub device_copies: u64,
    pub device_fills: u64,
    pub soft_copies: u64,
    pub soft_fills: u64,
    pub flushes: u64,
}

/// Submissions queued against one operation before an automatic flush.
///
/// Batching is an optimization, not a correctness requirement: the channel
/// is always flushed before any CPU access of the destination and at Done.
pub const SUBMIT_BATCH_CAP: u32 = 16;

#[derive(Debug)]
enum CopyRoute {
    Device {
        src_desc: ImageDescriptor,
        dst_desc: ImageDescriptor,
        src_token: AccessToken,
        dst_token: AccessToken,
        pending: u32,
    },
    Software,
}

/// In-flight state of one prepared copy operation.
#[derive(Debug)]
pub struct CopyOp {
    src: Surface,
    dst: Surface,
    state: RasterState,
    reverse: bool,
    upsidedown: bool,
    route: CopyRoute,
}

impl CopyOp {
    /// True if this operation dispatches to the blit channel.
    pub fn accelerated(&self) -> bool {
        matches!(self.route, CopyRoute::Device { .. })
    }
}

#[derive(Debug)]
enum SolidRoute {
    Device {
        dst_desc: ImageDescriptor,
        dst_token: AccessToken,
        pending: u32,
    },
    Software,
}

/// In-flight state of one prepared solid-fill operation.
#[derive(Debug)]
pub struct SolidOp {
    dst: Surface,
    state: RasterState,
    route: SolidRoute,
}

impl SolidOp {
    pub fn accelerated(&self) -> bool {
        matches!(self.route, SolidRoute::Device { .. })
    }
}

/// The offload engine: one blit channel plus the routing state machine.
#[derive(Debug)]
pub struct BlitEngine<C> {
    channel: C,
    caps: EngineCaps,
    stats: OffloadStats,
}

impl<C: BlitChannel> BlitEngine<C> {
    pub fn new(channel: C, caps: EngineCaps) -> Result<Self, EngineError> {
        if caps.max_extent == 0 {
            return Err(EngineError::InvalidCaps("max_extent must be nonzero"));
        }
        if caps.pitch_align == 0 || !caps.pitch_align.is_power_of_two() {
            return Err(EngineError::InvalidCaps(
                "pitch_align must be a nonzero power of two",
            ));
        }
        Ok(Self {
            channel,
            caps,
            stats: OffloadStats::default(),
        })
    }

    pub fn caps(&self) -> &EngineCaps {
        &self.caps
    }

    pub fn stats(&self) -> OffloadStats {
        self.stats
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Prepares a copy from `src` to `dst`.
    ///
    /// `xdir`/`ydir` give the traversal direction the caller requires when
    /// the regions may overlap (negative means right-to-left / bottom-to-top).
    /// On the device route both buffers are acquired; on any acquisition
    /// failure partial holds are unwound and nothing is left prepared.
    pub fn prepare_copy(
        &mut self,
        pool: &mut BufferPool,
        src: &Surface,
        dst: &Surface,
        xdir: i32,
        ydir: i32,
        state: RasterState,
    ) -> Result<CopyOp, EngineError> {
        self.validate_surface(pool, src)?;
        self.validate_surface(pool, dst)?;

        let route = if policy::copy_eligible(&self.caps, pool, src, dst, &state) {
            let src_desc = src.descriptor(pool, None)?;
            let dst_desc = dst.descriptor(pool, None)?;
            let src_token = pool.acquire_for_device(src.buffer)?;
            let dst_token = match pool.acquire_for_device(dst.buffer) {
                Ok(token) => token,
                Err(err) => {
                    // Unwind the source hold before reporting failure.
                    pool.release_to_cpu(src_token);
                    return Err(err.into());
                }
            };
            CopyRoute::Device {
                src_desc,
                dst_desc,
                src_token,
                dst_token,
                pending: 0,
            }
        } else {
            CopyRoute::Software
        };

        Ok(CopyOp {
            src: *src,
            dst: *dst,
            state,
            reverse: xdir < 0,
            upsidedown: ydir < 0,
            route,
        })
    }

    /// Executes one rectangle of a prepared copy.
    ///
    /// Device-routed operations still send sub-minimum rectangles to the
    /// software fallback; the channel is flushed and a CPU window opened
    /// around the detour so the views never alias.
    pub fn copy(
        &mut self,
        pool: &mut BufferPool,
        op: &mut CopyOp,
        src_origin: Point,
        dst_rect: Rect,
    ) -> Result<(), EngineError> {
        if dst_rect.is_empty() {
            return Ok(());
        }
        Self::check_rect(dst_rect, &op.dst)?;
        let src_rect = Rect::new(src_origin.x, src_origin.y, dst_rect.width, dst_rect.height);
        Self::check_rect(src_rect, &op.src)?;

        let (src, dst, state) = (op.src, op.dst, op.state);
        let (reverse, upsidedown) = (op.reverse, op.upsidedown);

        match &mut op.route {
            CopyRoute::Device {
                src_desc,
                dst_desc,
                src_token,
                dst_token,
                pending,
            } => {
                if dst_rect.width < MIN_HW_EXTENT || dst_rect.height < MIN_HW_EXTENT {
                    trace!(?dst_rect, "sub-minimum copy rectangle, software fallback");
                    self.channel.flush(pool)?;
                    self.stats.flushes += 1;
                    *pending = 0;

                    pool.sync_for_cpu(src_token);
                    pool.sync_for_cpu(dst_token);
                    let result = soft::blit(
                        pool, &src, src_origin, &dst, dst_rect, &state, reverse, upsidedown,
                    );
                    pool.sync_for_device(src_token);
                    pool.sync_for_device(dst_token);
                    result?;
                    self.stats.soft_copies += 1;
                } else {
                    self.channel
                        .submit_copy(src_desc, dst_desc, src_origin, dst_rect)?;
                    self.stats.device_copies += 1;
                    *pending += 1;
                    if *pending >= SUBMIT_BATCH_CAP {
                        self.channel.flush(pool)?;
                        self.stats.flushes += 1;
                        *pending = 0;
                    }
                }
            }
            CopyRoute::Software => {
                soft::blit(
                    pool, &src, src_origin, &dst, dst_rect, &state, reverse, upsidedown,
                )?;
                self.stats.soft_copies += 1;
            }
        }
        Ok(())
    }

    /// Completes a copy operation: flushes outstanding submissions and
    /// releases every hold taken by prepare. Safe with zero executes.
    ///
    /// Holds are released even when the flush fails; the destination
    /// contents are then undefined and the error is reported upward.
    pub fn done_copy(&mut self, pool: &mut BufferPool, op: CopyOp) -> Result<(), EngineError> {
        match op.route {
            CopyRoute::Device {
                src_token,
                dst_token,
                ..
            } => {
                let flushed = self.channel.flush(pool);
                self.stats.flushes += 1;
                pool.release_to_cpu(src_token);
                pool.release_to_cpu(dst_token);
                if let Err(err) = flushed {
                    warn!(%err, "channel flush failed completing a copy");
                    return Err(err.into());
                }
                Ok(())
            }
            CopyRoute::Software => Ok(()),
        }
    }

    /// Prepares a solid fill of `dst` with the state's foreground color.
    pub fn prepare_solid(
        &mut self,
        pool: &mut BufferPool,
        dst: &Surface,
        state: RasterState,
    ) -> Result<SolidOp, EngineError> {
        self.validate_surface(pool, dst)?;

        let route = if policy::solid_eligible(&self.caps, pool, dst, &state) {
            let dst_desc = dst.descriptor(pool, Some(state.fg))?;
            let dst_token = pool.acquire_for_device(dst.buffer)?;
            SolidRoute::Device {
                dst_desc,
                dst_token,
                pending: 0,
            }
        } else {
            SolidRoute::Software
        };

        Ok(SolidOp {
            dst: *dst,
            state,
            route,
        })
    }

    /// Executes one rectangle of a prepared fill.
    pub fn solid(
        &mut self,
        pool: &mut BufferPool,
        op: &mut SolidOp,
        rect: Rect,
    ) -> Result<(), EngineError> {
        if rect.is_empty() {
            return Ok(());
        }
        Self::check_rect(rect, &op.dst)?;

        let (dst, state) = (op.dst, op.state);

        match &mut op.route {
            SolidRoute::Device {
                dst_desc,
                dst_token,
                pending,
            } => {
                if rect.width < MIN_HW_EXTENT || rect.height < MIN_HW_EXTENT {
                    trace!(?rect, "sub-minimum fill rectangle, software fallback");
                    self.channel.flush(pool)?;
                    self.stats.flushes += 1;
                    *pending = 0;

                    pool.sync_for_cpu(dst_token);
                    let result = soft::fill(pool, &dst, rect, &state);
                    pool.sync_for_device(dst_token);
                    result?;
                    self.stats.soft_fills += 1;
                } else {
                    self.channel.submit_fill(dst_desc, rect, state.fg)?;
                    self.stats.device_fills += 1;
                    *pending += 1;
                    if *pending >= SUBMIT_BATCH_CAP {
                        self.channel.flush(pool)?;
                        self.stats.flushes += 1;
                        *pending = 0;
                    }
                }
            }
            SolidRoute::Software => {
                soft::fill(pool, &dst, rect, &state)?;
                self.stats.soft_fills += 1;
            }
        }
        Ok(())
    }

    /// Completes a fill operation. Same contract as [`Self::done_copy`].
    pub fn done_solid(&mut self, pool: &mut BufferPool, op: SolidOp) -> Result<(), EngineError> {
        match op.route {
            SolidRoute::Device { dst_token, .. } => {
                let flushed = self.channel.flush(pool);
                self.stats.flushes += 1;
                pool.release_to_cpu(dst_token);
                if let Err(err) = flushed {
                    warn!(%err, "channel flush failed completing a fill");
                    return Err(err.into());
                }
                Ok(())
            }
            SolidRoute::Software => Ok(()),
        }
    }

    fn check_rect(rect: Rect, surface: &Surface) -> Result<(), EngineError> {
        if rect.fits_within(surface.width, surface.height) {
            Ok(())
        } else {
            Err(EngineError::OutOfBounds {
                rect,
                width: surface.width,
                height: surface.height,
            })
        }
    }

    /// Consistency checks that hold for either route. Violations are
    /// configuration errors and abort before any memory is touched.
    fn validate_surface(&self, pool: &BufferPool, s: &Surface) -> Result<(), EngineError> {
        let format = s.format()?;
        let row = (s.width as usize)
            .checked_mul(format.bytes_per_pixel())
            .ok_or(EngineError::AddressOverflow)?;
        if (s.pitch as usize) < row {
            return Err(EngineError::PitchTooSmall {
                pitch: s.pitch,
                width: s.width,
                bits_per_pixel: s.bits_per_pixel,
            });
        }
        let need = (s.pitch as usize)
            .checked_mul(s.height as usize)
            .ok_or(EngineError::AddressOverflow)?;
        let have = pool.byte_len(s.buffer)?;
        if have < need {
            return Err(EngineError::BackingTooSmall { need, have });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, ModelChannel};
    use crate::raster::RasterOp;
    use kestrel_bo::{AccessError, BufferKind};

    fn engine() -> BlitEngine<ModelChannel> {
        BlitEngine::new(ModelChannel::new(), EngineCaps::default()).unwrap()
    }

    fn argb_surface(pool: &mut BufferPool, width: u32, height: u32) -> Surface {
        let pitch = (width * 4).next_multiple_of(32);
        let buffer = pool.create(pitch as usize * height as usize, BufferKind::Dma);
        Surface {
            width,
            height,
            depth: 32,
            bits_per_pixel: 32,
            pitch,
            buffer,
        }
    }

    #[test]
    fn new_rejects_degenerate_caps() {
        assert!(matches!(
            BlitEngine::new(
                ModelChannel::new(),
                EngineCaps {
                    max_extent: 0,
                    ..EngineCaps::default()
                }
            ),
            Err(EngineError::InvalidCaps(_))
        ));
        assert!(matches!(
            BlitEngine::new(
                ModelChannel::new(),
                EngineCaps {
                    pitch_align: 24,
                    ..EngineCaps::default()
                }
            ),
            Err(EngineError::InvalidCaps(_))
        ));
    }

    #[test]
    fn destination_acquire_failure_unwinds_the_source_hold() {
        let mut pool = BufferPool::new();
        let mut eng = engine();
        let src = argb_surface(&mut pool, 64, 64);
        let dst = argb_surface(&mut pool, 64, 64);

        // Hold the destination so prepare's second acquire fails.
        let blocker = pool.acquire_for_device(dst.buffer).unwrap();

        let err = eng
            .prepare_copy(&mut pool, &src, &dst, 1, 1, RasterState::copy())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Access(AccessError::AlreadyHeld { .. })
        ));

        // The source was acquired exactly once and released again before the
        // failure was reported.
        let stats = pool.sync_stats(src.buffer).unwrap();
        assert_eq!(stats.to_device, 1);
        assert_eq!(stats.to_cpu, 1);
        let token = pool.acquire_for_device(src.buffer).unwrap();
        pool.release_to_cpu(token);
        pool.release_to_cpu(blocker);
    }

    #[test]
    fn done_with_zero_executes_releases_holds() {
        let mut pool = BufferPool::new();
        let mut eng = engine();
        let src = argb_surface(&mut pool, 64, 64);
        let dst = argb_surface(&mut pool, 64, 64);

        let op = eng
            .prepare_copy(&mut pool, &src, &dst, 1, 1, RasterState::copy())
            .unwrap();
        assert!(op.accelerated());
        eng.done_copy(&mut pool, op).unwrap();

        assert!(pool.sync_stats(src.buffer).unwrap().balanced());
        assert!(pool.sync_stats(dst.buffer).unwrap().balanced());
        assert_eq!(eng.stats(), OffloadStats {
            flushes: 1,
            ..OffloadStats::default()
        });
    }

    #[test]
    fn out_of_bounds_geometry_aborts_before_any_write() {
        let mut pool = BufferPool::new();
        let mut eng = engine();
        let dst = argb_surface(&mut pool, 64, 64);

        let mut op = eng
            .prepare_solid(&mut pool, &dst, RasterState::fill(RasterOp::Copy, u32::MAX, 0xFF))
            .unwrap();
        let err = eng
            .solid(&mut pool, &mut op, Rect::new(32, 32, 40, 40))
            .unwrap_err();
        assert!(matches!(err, EngineError::OutOfBounds { .. }));
        assert_eq!(eng.channel().pending(), 0);
        eng.done_solid(&mut pool, op).unwrap();

        assert!(pool.cpu_bytes(dst.buffer).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn submissions_auto_flush_at_the_batch_cap() {
        let mut pool = BufferPool::new();
        let mut eng = engine();
        let dst = argb_surface(&mut pool, 256, 256);

        let mut op = eng
            .prepare_solid(&mut pool, &dst, RasterState::fill(RasterOp::Copy, u32::MAX, 0x1))
            .unwrap();
        assert!(op.accelerated());

        for _ in 0..SUBMIT_BATCH_CAP {
            eng.solid(&mut pool, &mut op, Rect::new(0, 0, 64, 64)).unwrap();
        }
        // The cap triggered an automatic exec.
        assert_eq!(eng.channel().pending(), 0);
        assert_eq!(eng.channel().executed(), u64::from(SUBMIT_BATCH_CAP));

        eng.solid(&mut pool, &mut op, Rect::new(0, 0, 64, 64)).unwrap();
        assert_eq!(eng.channel().pending(), 1);

        eng.done_solid(&mut pool, op).unwrap();
        assert_eq!(eng.channel().executed(), u64::from(SUBMIT_BATCH_CAP) + 1);
    }

    #[test]
    fn submit_failure_reports_but_done_still_releases() {
        let mut pool = BufferPool::new();
        let mut eng = engine();
        let src = argb_surface(&mut pool, 64, 64);
        let dst = argb_surface(&mut pool, 64, 64);

        let mut op = eng
            .prepare_copy(&mut pool, &src, &dst, 1, 1, RasterState::copy())
            .unwrap();
        assert!(op.accelerated());

        eng.channel_mut().fail_next_submit();
        let err = eng
            .copy(&mut pool, &mut op, Point::new(0, 0), Rect::new(0, 0, 64, 64))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Channel(ChannelError::Rejected(_))
        ));

        eng.done_copy(&mut pool, op).unwrap();
        assert!(pool.sync_stats(src.buffer).unwrap().balanced());
        assert!(pool.sync_stats(dst.buffer).unwrap().balanced());
    }

    #[test]
    fn software_route_takes_no_holds() {
        let mut pool = BufferPool::new();
        let mut eng = engine();
        let dst = argb_surface(&mut pool, 64, 64);

        // XOR is never device-eligible.
        let mut op = eng
            .prepare_solid(
                &mut pool,
                &dst,
                RasterState::fill(RasterOp::Xor, u32::MAX, 0xFFFF_FFFF),
            )
            .unwrap();
        assert!(!op.accelerated());

        eng.solid(&mut pool, &mut op, Rect::new(0, 0, 64, 64)).unwrap();
        eng.done_solid(&mut pool, op).unwrap();

        let stats = pool.sync_stats(dst.buffer).unwrap();
        assert_eq!(stats.to_device, 0);
        assert_eq!(stats.to_cpu, 0);
        assert_eq!(eng.stats().soft_fills, 1);
    }
}
