//! Backing-buffer objects for the Kestrel 2D offload engine.
//!
//! A [`BufferPool`] owns the byte storage behind every drawable surface and
//! arbitrates who may touch it at any given moment. Each buffer exposes two
//! views over the same memory:
//!
//! - the **CPU view** ([`BufferPool::cpu_bytes`] / [`BufferPool::cpu_bytes_mut`]),
//!   valid while the buffer is CPU-owned, and
//! - the **device view** ([`BufferPool::resolve_dma`] /
//!   [`BufferPool::resolve_dma_mut`]), addressed by [`DmaHandle`] and valid
//!   only while the buffer is held for device access.
//!
//! Which view is live is decided by the acquire/release discipline:
//! [`BufferPool::acquire_for_device`] hands out an [`AccessToken`] and flushes
//! CPU-side cache state so the engine sees consistent memory;
//! [`BufferPool::release_to_cpu`] mirrors it. While a token is held,
//! [`BufferPool::sync_for_cpu`] / [`BufferPool::sync_for_device`] open and
//! close a temporary CPU window without giving up the hold (used when a
//! device-routed operation runs a sub-rectangle on the CPU path).
//!
//! Cache maintenance is modelled by per-buffer [`SyncStats`] counters so the
//! pairing discipline is observable from tests.

use std::collections::HashMap;

use thiserror::Error;

/// Hardware-importable buffer name, distinct from any CPU mapping of the same
/// bytes. Only the blit channel dereferences these, via the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DmaHandle(u32);

impl DmaHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Pool key for a [`BufferPool`] buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(u32);

impl BufferId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Whether a buffer can be imported by the blit channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Carries a [`DmaHandle`]; eligible for device-path operations.
    Dma,
    /// CPU-only storage; software paths only.
    CpuOnly,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("unknown buffer id {id}")]
    UnknownBuffer { id: u32 },

    #[error("unknown dma handle {handle}")]
    UnknownDma { handle: u32 },

    #[error("buffer {id} is already held for device access")]
    AlreadyHeld { id: u32 },

    #[error("buffer {id} has no dma handle and cannot be imported")]
    NotImportable { id: u32 },

    #[error("buffer {id} is held for device access; the CPU view is invalid")]
    CpuViewInvalid { id: u32 },

    #[error("buffer {id} is not held for device access; the device view is invalid")]
    DeviceViewInvalid { id: u32 },
}

/// Cache-maintenance counters for one buffer.
///
/// `to_device` counts flushes that made CPU writes visible to the engine
/// (acquire, closing a CPU window); `to_cpu` counts invalidates that made
/// engine writes visible to the CPU (release, opening a CPU window). A
/// correctly bracketed operation leaves them equal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub to_device: u32,
    pub to_cpu: u32,
}

impl SyncStats {
    pub fn balanced(&self) -> bool {
        self.to_device == self.to_cpu
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AccessState {
    /// Idle; CPU view valid.
    Cpu,
    /// Held for device access; device view valid.
    Device,
    /// Held for device access, but a temporary CPU window is open.
    CpuWindow,
}

/// Proof of a device-access hold on one buffer.
///
/// Not copyable: every token handed out by [`BufferPool::acquire_for_device`]
/// must be given back to exactly one [`BufferPool::release_to_cpu`] call.
#[must_use = "access tokens must be released back to the pool"]
#[derive(Debug)]
pub struct AccessToken {
    id: BufferId,
}

impl AccessToken {
    pub fn buffer(&self) -> BufferId {
        self.id
    }
}

#[derive(Debug)]
struct BackingBuffer {
    bytes: Vec<u8>,
    dma: Option<DmaHandle>,
    state: AccessState,
    stats: SyncStats,
}

/// Allocator and access arbiter for surface backing storage.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: HashMap<u32, BackingBuffer>,
    by_dma: HashMap<u32, u32>,
    next_id: u32,
    next_dma: u32,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn create(&mut self, len: usize, kind: BufferKind) -> BufferId {
        self.next_id += 1;
        let id = self.next_id;

        let dma = match kind {
            BufferKind::Dma => {
                self.next_dma += 1;
                self.by_dma.insert(self.next_dma, id);
                Some(DmaHandle(self.next_dma))
            }
            BufferKind::CpuOnly => None,
        };

        self.buffers.insert(
            id,
            BackingBuffer {
                bytes: vec![0; len],
                dma,
                state: AccessState::Cpu,
                stats: SyncStats::default(),
            },
        );

        BufferId(id)
    }

    /// Frees a buffer. Refused while the buffer is held for device access.
    pub fn destroy(&mut self, id: BufferId) -> Result<(), AccessError> {
        let buf = self.get(id)?;
        if buf.state != AccessState::Cpu {
            return Err(AccessError::AlreadyHeld { id: id.0 });
        }
        let buf = self.buffers.remove(&id.0).expect("checked above");
        if let Some(dma) = buf.dma {
            self.by_dma.remove(&dma.0);
        }
        Ok(())
    }

    pub fn byte_len(&self, id: BufferId) -> Result<usize, AccessError> {
        Ok(self.get(id)?.bytes.len())
    }

    pub fn dma_handle(&self, id: BufferId) -> Result<Option<DmaHandle>, AccessError> {
        Ok(self.get(id)?.dma)
    }

    pub fn sync_stats(&self, id: BufferId) -> Result<SyncStats, AccessError> {
        Ok(self.get(id)?.stats)
    }

    /// CPU view of the buffer. Invalid while held for device access.
    pub fn cpu_bytes(&self, id: BufferId) -> Result<&[u8], AccessError> {
        let buf = self.get(id)?;
        if buf.state == AccessState::Device {
            return Err(AccessError::CpuViewInvalid { id: id.0 });
        }
        Ok(&buf.bytes)
    }

    pub fn cpu_bytes_mut(&mut self, id: BufferId) -> Result<&mut [u8], AccessError> {
        let buf = self.get_mut(id)?;
        if buf.state == AccessState::Device {
            return Err(AccessError::CpuViewInvalid { id: id.0 });
        }
        Ok(&mut buf.bytes)
    }

    /// Marks the buffer as under device access and flushes CPU-side caches.
    ///
    /// Fails if the buffer is already held by another acquirer, or if it has
    /// no [`DmaHandle`] for the engine to import.
    pub fn acquire_for_device(&mut self, id: BufferId) -> Result<AccessToken, AccessError> {
        let buf = self.get_mut(id)?;
        if buf.state != AccessState::Cpu {
            return Err(AccessError::AlreadyHeld { id: id.0 });
        }
        if buf.dma.is_none() {
            return Err(AccessError::NotImportable { id: id.0 });
        }
        buf.state = AccessState::Device;
        buf.stats.to_device += 1;
        Ok(AccessToken { id })
    }

    /// Ends a device-access hold and restores CPU accessibility.
    pub fn release_to_cpu(&mut self, token: AccessToken) {
        if let Some(buf) = self.buffers.get_mut(&token.id.0) {
            if buf.state == AccessState::Device {
                buf.stats.to_cpu += 1;
            }
            buf.state = AccessState::Cpu;
        }
    }

    /// Opens a temporary CPU window on a held buffer.
    ///
    /// The caller must have completed all outstanding device work on the
    /// buffer first (channel flush); the pool only tracks view validity.
    pub fn sync_for_cpu(&mut self, token: &AccessToken) {
        if let Some(buf) = self.buffers.get_mut(&token.id.0) {
            if buf.state == AccessState::Device {
                buf.state = AccessState::CpuWindow;
                buf.stats.to_cpu += 1;
            }
        }
    }

    /// Closes a CPU window, making the device view valid again.
    pub fn sync_for_device(&mut self, token: &AccessToken) {
        if let Some(buf) = self.buffers.get_mut(&token.id.0) {
            if buf.state == AccessState::CpuWindow {
                buf.state = AccessState::Device;
                buf.stats.to_device += 1;
            }
        }
    }

    /// Device view of a buffer, addressed by DMA handle.
    ///
    /// Only valid while the buffer is held for device access (and no CPU
    /// window is open), so an unpaired acquire surfaces here.
    pub fn resolve_dma(&self, dma: DmaHandle) -> Result<&[u8], AccessError> {
        let id = self.id_for_dma(dma)?;
        let buf = self.get(id)?;
        if buf.state != AccessState::Device {
            return Err(AccessError::DeviceViewInvalid { id: id.0 });
        }
        Ok(&buf.bytes)
    }

    pub fn resolve_dma_mut(&mut self, dma: DmaHandle) -> Result<&mut [u8], AccessError> {
        let id = self.id_for_dma(dma)?;
        let buf = self.get_mut(id)?;
        if buf.state != AccessState::Device {
            return Err(AccessError::DeviceViewInvalid { id: id.0 });
        }
        Ok(&mut buf.bytes)
    }

    fn id_for_dma(&self, dma: DmaHandle) -> Result<BufferId, AccessError> {
        self.by_dma
            .get(&dma.0)
            .copied()
            .map(BufferId)
            .ok_or(AccessError::UnknownDma { handle: dma.0 })
    }

    fn get(&self, id: BufferId) -> Result<&BackingBuffer, AccessError> {
        self.buffers
            .get(&id.0)
            .ok_or(AccessError::UnknownBuffer { id: id.0 })
    }

    fn get_mut(&mut self, id: BufferId) -> Result<&mut BackingBuffer, AccessError> {
        self.buffers
            .get_mut(&id.0)
            .ok_or(AccessError::UnknownBuffer { id: id.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_dma_handles_only_to_importable_buffers() {
        let mut pool = BufferPool::new();
        let a = pool.create(64, BufferKind::Dma);
        let b = pool.create(64, BufferKind::CpuOnly);

        assert!(pool.dma_handle(a).unwrap().is_some());
        assert_eq!(pool.dma_handle(b).unwrap(), None);
        assert_eq!(pool.byte_len(a).unwrap(), 64);
    }

    #[test]
    fn acquire_switches_the_valid_view() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::Dma);
        let dma = pool.dma_handle(id).unwrap().unwrap();

        // CPU view valid, device view not.
        pool.cpu_bytes_mut(id).unwrap()[0] = 0xAB;
        assert_eq!(
            pool.resolve_dma(dma),
            Err(AccessError::DeviceViewInvalid { id: id.raw() })
        );

        let token = pool.acquire_for_device(id).unwrap();
        assert_eq!(
            pool.cpu_bytes(id),
            Err(AccessError::CpuViewInvalid { id: id.raw() })
        );
        assert_eq!(pool.resolve_dma(dma).unwrap()[0], 0xAB);

        pool.release_to_cpu(token);
        assert_eq!(pool.cpu_bytes(id).unwrap()[0], 0xAB);
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::Dma);

        let token = pool.acquire_for_device(id).unwrap();
        assert_eq!(
            pool.acquire_for_device(id).unwrap_err(),
            AccessError::AlreadyHeld { id: id.raw() }
        );
        pool.release_to_cpu(token);

        // Released; a fresh acquire works again.
        let token = pool.acquire_for_device(id).unwrap();
        pool.release_to_cpu(token);
    }

    #[test]
    fn cpu_only_buffers_cannot_be_acquired() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::CpuOnly);
        assert_eq!(
            pool.acquire_for_device(id).unwrap_err(),
            AccessError::NotImportable { id: id.raw() }
        );
    }

    #[test]
    fn acquire_release_balances_sync_counters() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::Dma);

        let token = pool.acquire_for_device(id).unwrap();
        assert!(!pool.sync_stats(id).unwrap().balanced());
        pool.release_to_cpu(token);

        let stats = pool.sync_stats(id).unwrap();
        assert_eq!(stats, SyncStats { to_device: 1, to_cpu: 1 });
        assert!(stats.balanced());
    }

    #[test]
    fn cpu_window_keeps_the_hold_but_flips_the_view() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::Dma);
        let dma = pool.dma_handle(id).unwrap().unwrap();

        let token = pool.acquire_for_device(id).unwrap();
        pool.sync_for_cpu(&token);

        // CPU view valid inside the window, device view not, and the buffer
        // is still held against other acquirers.
        pool.cpu_bytes_mut(id).unwrap()[3] = 7;
        assert_eq!(
            pool.resolve_dma(dma),
            Err(AccessError::DeviceViewInvalid { id: id.raw() })
        );
        assert_eq!(
            pool.acquire_for_device(id).unwrap_err(),
            AccessError::AlreadyHeld { id: id.raw() }
        );

        pool.sync_for_device(&token);
        assert_eq!(pool.resolve_dma(dma).unwrap()[3], 7);

        pool.release_to_cpu(token);
        assert!(pool.sync_stats(id).unwrap().balanced());
    }

    #[test]
    fn window_syncs_are_idempotent() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::Dma);

        let token = pool.acquire_for_device(id).unwrap();
        pool.sync_for_cpu(&token);
        pool.sync_for_cpu(&token);
        pool.sync_for_device(&token);
        pool.sync_for_device(&token);
        pool.release_to_cpu(token);

        let stats = pool.sync_stats(id).unwrap();
        assert_eq!(stats, SyncStats { to_device: 2, to_cpu: 2 });
    }

    #[test]
    fn destroy_refused_while_held() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::Dma);

        let token = pool.acquire_for_device(id).unwrap();
        assert_eq!(
            pool.destroy(id).unwrap_err(),
            AccessError::AlreadyHeld { id: id.raw() }
        );
        pool.release_to_cpu(token);

        pool.destroy(id).unwrap();
        assert_eq!(
            pool.byte_len(id).unwrap_err(),
            AccessError::UnknownBuffer { id: id.raw() }
        );
    }

    #[test]
    fn destroy_unmaps_the_dma_handle() {
        let mut pool = BufferPool::new();
        let id = pool.create(16, BufferKind::Dma);
        let dma = pool.dma_handle(id).unwrap().unwrap();

        pool.destroy(id).unwrap();
        assert_eq!(
            pool.resolve_dma(dma).unwrap_err(),
            AccessError::UnknownDma { handle: dma.raw() }
        );
    }
}
