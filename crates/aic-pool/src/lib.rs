//! Bounded statistics buffer pool for the AIC pipeline.
//!
//! The hardware statistics stage produces one statistics blob per frame and
//! the image-quality algorithms consume them, possibly on another thread.
//! [`StatsBufferPool`] holds a fixed number of slots that cycle through:
//!
//! ```text
//! EMPTY --acquire_for_fill--> FILLING --mark_filled--> FILLED --claim--> USING --release--> EMPTY
//! ```
//!
//! # Key Design
//!
//! - **Fixed capacity**: all slots exist from construction; the pool never
//!   grows. When no slot is EMPTY the oldest FILLED slot (by fill order) is
//!   recycled. USING slots are never touched, so a pool whose slots are all
//!   held fails with [`PoolError::Exhausted`] instead of waiting.
//! - **One live copy per frame**: at most one slot holds a given frame id in
//!   FILLED or USING state. Refilling a frame drops the previous FILLED copy.
//! - **Generation-checked handles**: a [`SlotHandle`] stops working once its
//!   slot has been recycled, so a consumer cannot release somebody else's
//!   statistics.
//! - **Single mutex**: producer and consumer serialize on one
//!   `parking_lot::Mutex`; critical sections only move handles and flags.
//!
//! # Example
//!
//! ```
//! use aic_pool::{StatsBufferPool, StatsPayload, StatsQuery};
//!
//! let pool = StatsBufferPool::new(3);
//!
//! // Producer
//! let slot = pool.acquire_for_fill().unwrap();
//! pool.mark_filled(slot, 7, StatsPayload::new(vec![0u8; 64])).unwrap();
//!
//! // Consumer
//! let info = pool.query_by_status(StatsQuery::Filled, Some(7)).unwrap();
//! pool.claim(info.handle).unwrap();
//! pool.release(info.handle).unwrap();
//! ```

pub mod error;
pub mod payload;

pub use error::{PoolError, PoolResult};
pub use payload::StatsPayload;

use parking_lot::Mutex;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Frame id value that never identifies a real frame.
pub const INVALID_FRAME_ID: u64 = u64::MAX;

/// Lifecycle state of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Free for a producer.
    Empty,
    /// Reserved by a producer between `acquire_for_fill` and `mark_filled`.
    Filling,
    /// Holds decoded-ready statistics for one frame.
    Filled,
    /// Held by a consumer; never overwritten.
    Using,
}

/// Status qualifier accepted by [`StatsBufferPool::query_by_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsQuery {
    /// A FILLED slot, matching the frame id when one is given.
    Filled,
    /// An EMPTY slot.
    Empty,
    /// A USING slot, matching the frame id when one is given.
    Using,
    /// The most recently filled slot (FILLED or USING), ignoring frame id.
    Latest,
}

/// Reference to a pool slot, valid until the slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: usize,
    generation: u64,
}

impl SlotHandle {
    /// Slot index inside the pool (for logs and metrics).
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation the handle was issued for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result of a slot query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub handle: SlotHandle,
    pub state: SlotState,
    /// Frame held by the slot (`None` for EMPTY/FILLING).
    pub frame_id: Option<u64>,
    /// Monotonic fill order; larger is newer.
    pub fill_sequence: u64,
}

/// Per-state slot counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub empty: usize,
    pub filling: usize,
    pub filled: usize,
    pub using: usize,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    generation: u64,
    frame_id: Option<u64>,
    payload: Option<StatsPayload>,
    fill_sequence: u64,
    filled_at: Option<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Empty,
            generation: 0,
            frame_id: None,
            payload: None,
            fill_sequence: 0,
            filled_at: None,
        }
    }

    /// Back to EMPTY. Bumps the generation so outstanding handles go stale.
    fn reset(&mut self) {
        self.state = SlotState::Empty;
        self.generation = self.generation.wrapping_add(1);
        self.frame_id = None;
        self.payload = None;
        self.filled_at = None;
    }

    fn holds_frame(&self, frame_id: u64) -> bool {
        matches!(self.state, SlotState::Filled | SlotState::Using) && self.frame_id == Some(frame_id)
    }

    fn info(&self, index: usize) -> SlotInfo {
        SlotInfo {
            handle: SlotHandle {
                index,
                generation: self.generation,
            },
            state: self.state,
            frame_id: self.frame_id,
            fill_sequence: self.fill_sequence,
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    slots: Vec<Slot>,
    next_sequence: u64,
}

impl PoolInner {
    fn slot(&self, handle: SlotHandle) -> PoolResult<&Slot> {
        match self.slots.get(handle.index) {
            Some(slot) if slot.generation == handle.generation => Ok(slot),
            _ => Err(PoolError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }

    fn slot_mut(&mut self, handle: SlotHandle) -> PoolResult<&mut Slot> {
        match self.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => Ok(slot),
            _ => Err(PoolError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }

    fn expect_state(slot: &Slot, index: usize, expected: SlotState) -> PoolResult<()> {
        if slot.state == expected {
            Ok(())
        } else {
            Err(PoolError::InvalidState {
                index,
                expected,
                actual: slot.state,
            })
        }
    }

    /// Oldest FILLED slot by fill order.
    fn oldest_filled(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Filled)
            .min_by_key(|(_, s)| s.fill_sequence)
            .map(|(i, _)| i)
    }
}

/// Fixed-capacity pool of statistics slots.
///
/// See the [crate docs](crate) for the slot lifecycle.
#[derive(Debug)]
pub struct StatsBufferPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl StatsBufferPool {
    /// Create a pool with `capacity` EMPTY slots.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "stats pool capacity must be greater than 0");

        let slots = (0..capacity).map(|_| Slot::new()).collect();
        debug!(capacity, "Creating statistics pool");

        Self {
            inner: Mutex::new(PoolInner {
                slots,
                next_sequence: 1,
            }),
            capacity,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a slot for a producer.
    ///
    /// Prefers an EMPTY slot; otherwise recycles the oldest FILLED slot.
    /// Fails with [`PoolError::Exhausted`] when every slot is USING or
    /// FILLING.
    pub fn acquire_for_fill(&self) -> PoolResult<SlotHandle> {
        let mut inner = self.inner.lock();

        let index = match inner
            .slots
            .iter()
            .position(|s| s.state == SlotState::Empty)
        {
            Some(index) => index,
            None => {
                let index = inner.oldest_filled().ok_or(PoolError::Exhausted {
                    capacity: self.capacity,
                })?;
                let slot = &mut inner.slots[index];
                warn!(
                    slot = index,
                    frame_id = slot.frame_id,
                    "Recycling unconsumed statistics slot"
                );
                slot.reset();
                index
            }
        };

        let slot = &mut inner.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Filling;
        trace!(slot = index, generation = slot.generation, "Slot reserved for fill");

        Ok(SlotHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Store statistics for `frame_id` in a reserved slot (FILLING → FILLED).
    ///
    /// Any other FILLED slot holding the same frame is reset to EMPTY first.
    /// If a consumer holds that frame (USING) the fill is refused and the
    /// reserved slot goes back to EMPTY.
    pub fn mark_filled(
        &self,
        handle: SlotHandle,
        frame_id: u64,
        payload: StatsPayload,
    ) -> PoolResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.slot(handle)?;
        PoolInner::expect_state(slot, handle.index, SlotState::Filling)?;

        if frame_id == INVALID_FRAME_ID {
            inner.slots[handle.index].reset();
            return Err(PoolError::InvalidFrameId(frame_id));
        }

        if inner
            .slots
            .iter()
            .any(|s| s.state == SlotState::Using && s.frame_id == Some(frame_id))
        {
            inner.slots[handle.index].reset();
            return Err(PoolError::FrameInUse { frame_id });
        }

        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if index != handle.index && slot.holds_frame(frame_id) {
                debug!(slot = index, frame_id, "Dropping superseded statistics");
                slot.reset();
            }
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let slot = &mut inner.slots[handle.index];
        slot.state = SlotState::Filled;
        slot.frame_id = Some(frame_id);
        slot.payload = Some(payload);
        slot.fill_sequence = sequence;
        slot.filled_at = Some(Instant::now());
        trace!(slot = handle.index, frame_id, sequence, "Statistics filled");
        Ok(())
    }

    /// Give a reserved slot back without filling it (FILLING → EMPTY).
    pub fn abandon(&self, handle: SlotHandle) -> PoolResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(handle)?;
        PoolInner::expect_state(slot, handle.index, SlotState::Filling)?;
        slot.reset();
        Ok(())
    }

    /// Find a slot by status. Returns `None` when nothing matches.
    ///
    /// - `Filled`: the slot for `frame_id`, or the oldest FILLED slot
    /// - `Latest`: the most recently filled slot, FILLED or USING
    /// - `Using`: the USING slot for `frame_id`, or any USING slot
    /// - `Empty`: any EMPTY slot
    #[must_use]
    pub fn query_by_status(&self, status: StatsQuery, frame_id: Option<u64>) -> Option<SlotInfo> {
        let inner = self.inner.lock();
        let mut candidates = inner.slots.iter().enumerate();

        let found = match status {
            StatsQuery::Empty => candidates.find(|(_, s)| s.state == SlotState::Empty),
            StatsQuery::Filled => candidates
                .filter(|(_, s)| s.state == SlotState::Filled)
                .filter(|(_, s)| frame_id.map_or(true, |f| s.frame_id == Some(f)))
                .min_by_key(|(_, s)| s.fill_sequence),
            StatsQuery::Using => candidates
                .filter(|(_, s)| s.state == SlotState::Using)
                .find(|(_, s)| frame_id.map_or(true, |f| s.frame_id == Some(f))),
            StatsQuery::Latest => candidates
                .filter(|(_, s)| matches!(s.state, SlotState::Filled | SlotState::Using))
                .max_by_key(|(_, s)| s.fill_sequence),
        };

        found.map(|(index, slot)| slot.info(index))
    }

    /// Find the FILLED or USING slot holding `frame_id`.
    #[must_use]
    pub fn find_frame(&self, frame_id: u64) -> Option<SlotInfo> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .find(|(_, s)| s.holds_frame(frame_id))
            .map(|(index, slot)| slot.info(index))
    }

    /// Hand a FILLED slot to a consumer (FILLED → USING).
    pub fn claim(&self, handle: SlotHandle) -> PoolResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(handle)?;
        PoolInner::expect_state(slot, handle.index, SlotState::Filled)?;
        slot.state = SlotState::Using;
        trace!(slot = handle.index, frame_id = slot.frame_id, "Statistics claimed");
        Ok(())
    }

    /// Return a consumed slot to the pool (USING → EMPTY).
    pub fn release(&self, handle: SlotHandle) -> PoolResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(handle)?;
        PoolInner::expect_state(slot, handle.index, SlotState::Using)?;
        trace!(slot = handle.index, frame_id = slot.frame_id, "Statistics released");
        slot.reset();
        Ok(())
    }

    /// Borrow the payload of a FILLED or USING slot under the pool lock.
    ///
    /// Keep `f` short: the producer is blocked while it runs.
    pub fn read<R>(&self, handle: SlotHandle, f: impl FnOnce(&StatsPayload) -> R) -> PoolResult<R> {
        let inner = self.inner.lock();
        let slot = inner.slot(handle)?;
        match (&slot.state, &slot.payload) {
            (SlotState::Filled | SlotState::Using, Some(payload)) => Ok(f(payload)),
            _ => Err(PoolError::InvalidState {
                index: handle.index,
                expected: SlotState::Filled,
                actual: slot.state,
            }),
        }
    }

    /// Clone the payload handle of a FILLED or USING slot (no byte copy).
    pub fn payload(&self, handle: SlotHandle) -> PoolResult<StatsPayload> {
        self.read(handle, StatsPayload::clone)
    }

    /// Age of the statistics in a FILLED or USING slot.
    #[must_use]
    pub fn filled_age(&self, handle: SlotHandle) -> Option<std::time::Duration> {
        let inner = self.inner.lock();
        inner
            .slot(handle)
            .ok()
            .and_then(|s| s.filled_at)
            .map(|t| t.elapsed())
    }

    /// Slot counts per state.
    #[must_use]
    pub fn counts(&self) -> PoolCounts {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .fold(PoolCounts::default(), |mut counts, slot| {
                match slot.state {
                    SlotState::Empty => counts.empty += 1,
                    SlotState::Filling => counts.filling += 1,
                    SlotState::Filled => counts.filled += 1,
                    SlotState::Using => counts.using += 1,
                }
                counts
            })
    }

    /// State of every slot, in slot order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| slot.info(index))
            .collect()
    }

    /// Reset every slot to EMPTY, invalidating all handles.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for slot in &mut inner.slots {
            slot.reset();
        }
        debug!(capacity = self.capacity, "Statistics pool cleared");
    }
}
