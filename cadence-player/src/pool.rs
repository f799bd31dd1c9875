//! Fixed-capacity pool of video frame slots
//!
//! Slots live in an arena and are addressed by `(pool_id, slot, generation)`.
//! A slot is handed out by [`FramePool::alloc`] with a reference count of
//! one; every [`FrameLease`] clone adds a reference and every drop removes
//! one. At zero the slot is free again. The next allocation bumps the slot's
//! generation, so handles from the previous tenant fail validation instead
//! of reading someone else's frame.
//!
//! Allocation only happens on the decoder's job thread. Release may happen
//! on any thread (the renderer can outlive the decoder's interest), which is
//! why the reference count is atomic. Claiming a slot and bumping its
//! generation happen under the slot's frame lock, and handle validation
//! runs under that same lock, so a handle that validates keeps referring to
//! the same tenant until the lock is released.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

/// Frame layout: YUV 4:2:0 with a full-size luma plane and two
/// quarter-size chroma planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub slice_height: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, stride: u32, slice_height: u32) -> Self {
        Self {
            width,
            height,
            stride,
            slice_height,
        }
    }

    /// Bytes needed to hold one frame
    pub fn byte_len(&self) -> usize {
        let luma = self.stride as usize * self.slice_height as usize;
        luma + luma / 2
    }
}

/// Opaque address of a pool slot as seen by one tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    pool_id: Uuid,
    slot: u32,
    generation: u32,
}

impl FrameHandle {
    pub fn pool_id(&self) -> Uuid {
        self.pool_id
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.pool_id, self.slot, self.generation)
    }
}

/// Pool occupancy counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub allocations: u64,
    pub saturations: u64,
}

struct SlotFrame {
    generation: u32,
    geometry: Option<FrameGeometry>,
    data: Vec<u8>,
}

struct Slot {
    refs: AtomicUsize,
    frame: Mutex<SlotFrame>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotFrame> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_free(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 0
    }

    fn try_claim(&self) -> bool {
        self.refs
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct PoolShared {
    id: Uuid,
    slots: Box<[Slot]>,
    allocations: AtomicU64,
    saturations: AtomicU64,
}

impl PoolShared {
    /// Lock the slot behind `handle` if `handle` names its current tenant
    fn lock_live(&self, handle: &FrameHandle) -> Result<MutexGuard<'_, SlotFrame>> {
        if handle.pool_id != self.id {
            return Err(Error::StaleHandle(format!("{} belongs to another pool", handle)));
        }
        let slot = self
            .slots
            .get(handle.slot as usize)
            .ok_or_else(|| Error::StaleHandle(format!("{} is out of range", handle)))?;
        let frame = slot.lock();
        if slot.is_free() || frame.generation != handle.generation {
            return Err(Error::StaleHandle(format!("{} was released", handle)));
        }
        Ok(frame)
    }
}

/// Bounded arena of reusable frame buffers
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    /// Create a pool with `capacity` slots. Slot memory is sized lazily on
    /// first use.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                refs: AtomicUsize::new(0),
                frame: Mutex::new(SlotFrame {
                    generation: 0,
                    geometry: None,
                    data: Vec::new(),
                }),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let id = Uuid::new_v4();
        debug!("Frame pool {} created with {} slots", id, capacity);
        Self {
            shared: Arc::new(PoolShared {
                id,
                slots,
                allocations: AtomicU64::new(0),
                saturations: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Check out a free slot shaped for `geometry`.
    ///
    /// A free slot that already has the geometry is preferred; otherwise
    /// any free slot is reconfigured. Returns `None` when every slot is
    /// referenced. That is back-pressure, not an error: retry after frames
    /// have been released.
    pub fn alloc(&self, geometry: FrameGeometry) -> Option<FrameLease> {
        let claimed = self
            .claim(geometry, true)
            .or_else(|| self.claim(geometry, false));

        let Some((index, generation)) = claimed else {
            self.shared.saturations.fetch_add(1, Ordering::Relaxed);
            trace!("Frame pool {} saturated", self.shared.id);
            return None;
        };
        self.shared.allocations.fetch_add(1, Ordering::Relaxed);

        Some(FrameLease {
            pool: Arc::clone(&self.shared),
            handle: FrameHandle {
                pool_id: self.shared.id,
                slot: index as u32,
                generation,
            },
            geometry,
        })
    }

    /// True while `handle` still refers to a live tenant of its slot
    pub fn is_live(&self, handle: &FrameHandle) -> bool {
        self.shared.lock_live(handle).is_ok()
    }

    /// Read the bytes behind `handle`. The generation is checked under the
    /// slot lock held for the whole read.
    pub fn read<R>(&self, handle: &FrameHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let frame = self.shared.lock_live(handle)?;
        Ok(f(&frame.data))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            in_use: self.shared.slots.iter().filter(|slot| !slot.is_free()).count(),
            allocations: self.shared.allocations.load(Ordering::Relaxed),
            saturations: self.shared.saturations.load(Ordering::Relaxed),
        }
    }

    /// Claim a free slot and start its next generation, returning the slot
    /// index and new generation. With `matching_only`, only slots already
    /// shaped for `geometry` are considered.
    fn claim(&self, geometry: FrameGeometry, matching_only: bool) -> Option<(usize, u32)> {
        for (index, slot) in self.shared.slots.iter().enumerate() {
            if !slot.is_free() {
                continue;
            }
            let mut frame = slot.lock();
            if matching_only && frame.geometry != Some(geometry) {
                continue;
            }
            if !slot.try_claim() {
                continue;
            }

            frame.generation = frame.generation.wrapping_add(1);
            if frame.geometry != Some(geometry) {
                trace!(
                    "Reconfiguring slot {} of pool {} to {}x{}",
                    index,
                    self.shared.id,
                    geometry.width,
                    geometry.height
                );
                frame.data.clear();
                frame.data.resize(geometry.byte_len(), 0);
                frame.geometry = Some(geometry);
            }
            return Some((index, frame.generation));
        }
        None
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A counted reference to a checked-out slot
pub struct FrameLease {
    pool: Arc<PoolShared>,
    handle: FrameHandle,
    geometry: FrameGeometry,
}

impl FrameLease {
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Copy `bytes` into the slot and zero whatever follows them
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut frame = self.pool.lock_live(&self.handle)?;
        if bytes.len() > frame.data.len() {
            return Err(Error::Decode(format!(
                "{} byte sample does not fit a {} byte {}x{} frame",
                bytes.len(),
                frame.data.len(),
                self.geometry.width,
                self.geometry.height
            )));
        }
        let (head, tail) = frame.data.split_at_mut(bytes.len());
        head.copy_from_slice(bytes);
        tail.fill(0);
        Ok(())
    }

    /// Borrow the slot bytes
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        // A lease keeps its slot referenced, so its own handle is always live.
        let slot = &self.pool.slots[self.handle.slot as usize];
        let frame = slot.lock();
        f(&frame.data)
    }
}

impl Clone for FrameLease {
    fn clone(&self) -> Self {
        let slot = &self.pool.slots[self.handle.slot as usize];
        slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            pool: Arc::clone(&self.pool),
            handle: self.handle,
            geometry: self.geometry,
        }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        let slot = &self.pool.slots[self.handle.slot as usize];
        if slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!("Frame slot {} released", self.handle);
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("handle", &self.handle)
            .field("geometry", &self.geometry)
            .finish()
    }
}
