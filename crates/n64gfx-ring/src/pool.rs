use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Every claim starts and ends on this boundary.
pub const POOL_ALIGNMENT: usize = 4;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => usize::MAX / alignment * alignment,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The request can never be satisfied by this pool.
    #[error("allocation of {requested} bytes exceeds pool capacity {capacity}")]
    TooLarge { requested: usize, capacity: usize },

    #[error("timed out after {0:?} waiting for pool space")]
    Timeout(Duration),

    #[error("pointer does not name a live allocation")]
    InvalidPointer,

    #[error("write of {len} bytes overflows claim of {size} bytes")]
    Overflow { len: usize, size: usize },

    #[error("pool is closed")]
    Closed,
}

/// One claim within a [`RingBufferPool`].
///
/// Deliberately neither `Clone` nor `Copy`: a claim is owned by exactly one
/// thread at a time and is consumed by [`RingBufferPool::submit`] or
/// [`RingBufferPool::release`].
#[derive(Default)]
pub struct PoolBufferPointer {
    offset: usize,
    size: usize,
    rounded_size: usize,
    valid: bool,
    seq: u64,
}

impl PoolBufferPointer {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Logical size requested by the producer.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size actually reserved, rounded up to [`POOL_ALIGNMENT`].
    pub fn rounded_size(&self) -> usize {
        self.rounded_size
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Allocation sequence number, strictly increasing per pool.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Debug for PoolBufferPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBufferPointer")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("rounded_size", &self.rounded_size)
            .field("valid", &self.valid)
            .field("seq", &self.seq)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    /// Number of `allocate` calls that had to block for space.
    pub waits: u64,
    pub timeouts: u64,
    /// Largest number of bytes in use at once.
    pub high_water: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Allocated,
    Submitted,
    Consumed,
    Released,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    offset: usize,
    size: usize,
    rounded_size: usize,
    state: SlotState,
}

struct PoolState {
    data: Vec<u8>,
    /// Offset of the oldest in-use byte.
    start: usize,
    /// Offset of the next free byte.
    end: usize,
    /// Live data runs `[start, capacity) ++ [0, end)` rather than `[start, end)`.
    wrapped: bool,
    /// Live claims in allocation order.
    slots: VecDeque<Slot>,
    /// Index into `slots` of the next claim the consumer has not taken yet.
    consumer_cursor: usize,
    in_use: usize,
    next_seq: u64,
    closed: bool,
    stats: PoolStats,
}

impl PoolState {
    /// Offset a claim of `rounded` bytes would land at, if it fits right now.
    fn fit(&self, rounded: usize) -> Option<usize> {
        let capacity = self.data.len();
        if self.slots.is_empty() {
            return (rounded <= capacity).then_some(0);
        }
        if self.wrapped {
            let end = self.end.checked_add(rounded)?;
            return (end <= self.start).then_some(self.end);
        }
        match self.end.checked_add(rounded) {
            Some(end) if end <= capacity => Some(self.end),
            // Restart at 0 only when that does not run into the in-use region.
            _ if rounded <= self.start => Some(0),
            _ => None,
        }
    }

    fn slot_index(&self, seq: u64) -> Option<usize> {
        let front = self.slots.front()?.seq;
        let idx = usize::try_from(seq.checked_sub(front)?).ok()?;
        (idx < self.slots.len()).then_some(idx)
    }

    /// Drop the released prefix and advance `start` past it.
    fn reclaim(&mut self) -> bool {
        let mut advanced = false;
        while let Some(front) = self.slots.front() {
            if front.state != SlotState::Released {
                break;
            }
            self.in_use -= front.rounded_size;
            self.slots.pop_front();
            self.consumer_cursor = self.consumer_cursor.saturating_sub(1);
            advanced = true;
        }

        match self.slots.front() {
            None => {
                self.start = 0;
                self.end = 0;
                self.wrapped = false;
            }
            Some(front) => {
                if self.wrapped && front.offset < self.start {
                    self.wrapped = false;
                }
                self.start = front.offset;
            }
        }
        advanced
    }
}

/// A fixed-capacity circular byte arena with blocking allocation.
///
/// One mutex guards the cursors and bytes; one condition variable wakes the
/// producer on release and the consumer on submit.
pub struct RingBufferPool {
    state: Mutex<PoolState>,
    cond: Condvar,
    capacity: usize,
    alloc_timeout: Duration,
}

impl RingBufferPool {
    /// Create a pool of `capacity` bytes (rounded down to [`POOL_ALIGNMENT`]).
    ///
    /// `alloc_timeout` bounds how long [`RingBufferPool::allocate`] blocks.
    pub fn new(capacity: usize, alloc_timeout: Duration) -> Self {
        let capacity = capacity / POOL_ALIGNMENT * POOL_ALIGNMENT;
        Self {
            state: Mutex::new(PoolState {
                data: vec![0; capacity],
                start: 0,
                end: 0,
                wrapped: false,
                slots: VecDeque::new(),
                consumer_cursor: 0,
                in_use: 0,
                next_seq: 0,
                closed: false,
                stats: PoolStats::default(),
            }),
            cond: Condvar::new(),
            capacity,
            alloc_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fail early for claims this pool can never hold.
    pub fn check_request(&self, bytes: usize) -> Result<usize, PoolError> {
        let rounded = align_up(bytes.max(1), POOL_ALIGNMENT);
        if rounded > self.capacity {
            return Err(PoolError::TooLarge {
                requested: bytes,
                capacity: self.capacity,
            });
        }
        Ok(rounded)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panicking peer leaves the cursors consistent: every mutation
        // below completes before the guard is dropped.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `bytes` bytes, blocking until space is released or the
    /// configured timeout elapses.
    pub fn allocate(&self, bytes: usize) -> Result<PoolBufferPointer, PoolError> {
        self.allocate_with_timeout(bytes, self.alloc_timeout)
    }

    pub fn allocate_with_timeout(
        &self,
        bytes: usize,
        timeout: Duration,
    ) -> Result<PoolBufferPointer, PoolError> {
        let rounded = self.check_request(bytes)?;
        let deadline = Instant::now() + timeout;

        let mut state = self.lock();
        let mut waited = false;
        let offset = loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(offset) = state.fit(rounded) {
                break offset;
            }
            if !waited {
                waited = true;
                state.stats.waits += 1;
                tracing::trace!(
                    bytes = rounded,
                    in_use = state.in_use,
                    "ring buffer pool full; waiting for release"
                );
            }
            let now = Instant::now();
            if now >= deadline {
                state.stats.timeouts += 1;
                return Err(PoolError::Timeout(timeout));
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        };

        if state.slots.is_empty() {
            state.start = 0;
            state.wrapped = false;
        } else if offset == 0 && !state.wrapped {
            state.wrapped = true;
        }
        state.end = offset + rounded;

        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots.push_back(Slot {
            seq,
            offset,
            size: bytes,
            rounded_size: rounded,
            state: SlotState::Allocated,
        });
        state.in_use += rounded;
        state.stats.allocations += 1;
        state.stats.high_water = state.stats.high_water.max(state.in_use);

        Ok(PoolBufferPointer {
            offset,
            size: bytes,
            rounded_size: rounded,
            valid: true,
            seq,
        })
    }

    /// Copy `bytes` into the start of the claim.
    pub fn write(&self, ptr: &PoolBufferPointer, bytes: &[u8]) -> Result<(), PoolError> {
        if bytes.len() > ptr.size {
            return Err(PoolError::Overflow {
                len: bytes.len(),
                size: ptr.size,
            });
        }
        let mut state = self.lock();
        let idx = live_slot(&state, ptr)?;
        if state.slots[idx].state != SlotState::Allocated {
            return Err(PoolError::InvalidPointer);
        }
        let offset = ptr.offset;
        state.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Hand a filled claim to the consumer.
    pub fn submit(&self, ptr: PoolBufferPointer) -> Result<(), PoolError> {
        let mut state = self.lock();
        let idx = live_slot(&state, &ptr)?;
        let slot = &mut state.slots[idx];
        if slot.state != SlotState::Allocated {
            return Err(PoolError::InvalidPointer);
        }
        slot.state = SlotState::Submitted;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Fill and submit a claim. If the write fails the claim is released so
    /// the consumer never waits behind it.
    pub fn commit(&self, ptr: PoolBufferPointer, bytes: &[u8]) -> Result<(), PoolError> {
        if let Err(err) = self.write(&ptr, bytes) {
            // Only fails when `ptr` is no longer live, which is fine here.
            let _ = self.release(ptr);
            return Err(err);
        }
        self.submit(ptr)
    }

    /// Allocate, fill and submit `bytes` in one step.
    pub fn push(&self, bytes: &[u8]) -> Result<(), PoolError> {
        let ptr = self.allocate(bytes.len())?;
        self.commit(ptr, bytes)
    }

    /// Take the oldest submitted claim, blocking until one is available.
    ///
    /// Returns `None` once the pool is closed and every submitted claim has
    /// been handed out.
    pub fn next(&self) -> Option<PoolBufferPointer> {
        let mut state = self.lock();
        loop {
            if let Some(ptr) = take_submitted(&mut state) {
                return Some(ptr);
            }
            if state.closed {
                return None;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`RingBufferPool::next`] but never blocks.
    pub fn try_next(&self) -> Option<PoolBufferPointer> {
        take_submitted(&mut self.lock())
    }

    /// Copy the claim's logical bytes into `out`, replacing its contents.
    pub fn read_into(&self, ptr: &PoolBufferPointer, out: &mut Vec<u8>) -> Result<(), PoolError> {
        let state = self.lock();
        live_slot(&state, ptr)?;
        out.clear();
        out.extend_from_slice(&state.data[ptr.offset..ptr.offset + ptr.size]);
        Ok(())
    }

    pub fn read(&self, ptr: &PoolBufferPointer) -> Result<Vec<u8>, PoolError> {
        let mut out = Vec::with_capacity(ptr.size);
        self.read_into(ptr, &mut out)?;
        Ok(out)
    }

    /// Return a claim to the pool. Never blocks.
    ///
    /// Space only becomes reusable once every older claim has been released
    /// too, so `start` always names the oldest in-use byte.
    pub fn release(&self, ptr: PoolBufferPointer) -> Result<(), PoolError> {
        let mut state = self.lock();
        let idx = live_slot(&state, &ptr)?;
        state.slots[idx].state = SlotState::Released;
        if state.reclaim() {
            drop(state);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Bytes currently claimed, including alignment padding.
    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }

    /// Block until every claim has been released. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.slots.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        true
    }

    /// Wake every waiter; subsequent allocations fail with [`PoolError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl fmt::Debug for RingBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RingBufferPool")
            .field("capacity", &self.capacity)
            .field("start", &state.start)
            .field("end", &state.end)
            .field("wrapped", &state.wrapped)
            .field("live", &state.slots.len())
            .finish()
    }
}

fn live_slot(state: &PoolState, ptr: &PoolBufferPointer) -> Result<usize, PoolError> {
    if !ptr.valid {
        return Err(PoolError::InvalidPointer);
    }
    let idx = state.slot_index(ptr.seq).ok_or(PoolError::InvalidPointer)?;
    let slot = &state.slots[idx];
    if slot.offset != ptr.offset || slot.size != ptr.size || slot.state == SlotState::Released {
        return Err(PoolError::InvalidPointer);
    }
    Ok(idx)
}

fn take_submitted(state: &mut PoolState) -> Option<PoolBufferPointer> {
    // Skip claims the producer released without submitting.
    while let Some(slot) = state.slots.get(state.consumer_cursor) {
        if slot.state == SlotState::Released {
            state.consumer_cursor += 1;
            continue;
        }
        break;
    }
    let cursor = state.consumer_cursor;
    let slot = state.slots.get_mut(cursor)?;
    if slot.state != SlotState::Submitted {
        // FIFO: a later submitted claim never overtakes an earlier unsubmitted one.
        return None;
    }
    slot.state = SlotState::Consumed;
    let ptr = PoolBufferPointer {
        offset: slot.offset,
        size: slot.size,
        rounded_size: slot.rounded_size,
        valid: true,
        seq: slot.seq,
    };
    state.consumer_cursor += 1;
    Some(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NO_WAIT: Duration = Duration::from_millis(0);

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(usize::MAX, 4), usize::MAX / 4 * 4);
    }

    #[test]
    fn sizes_are_rounded_to_alignment() {
        let pool = RingBufferPool::new(64, NO_WAIT);
        let a = pool.allocate(5).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 5);
        assert_eq!(a.rounded_size(), 8);
        let b = pool.allocate(0).unwrap();
        assert_eq!(b.offset(), 8);
        assert_eq!(b.rounded_size(), 4);
        assert_eq!(pool.in_use(), 12);
    }

    #[test]
    fn too_large_is_rejected_without_blocking() {
        let pool = RingBufferPool::new(16, Duration::from_secs(60));
        assert_eq!(
            pool.allocate(17).unwrap_err(),
            PoolError::TooLarge {
                requested: 17,
                capacity: 16
            }
        );
    }

    #[test]
    fn full_pool_times_out() {
        let pool = RingBufferPool::new(16, Duration::from_millis(10));
        let _a = pool.allocate(16).unwrap();
        assert!(matches!(pool.allocate(4), Err(PoolError::Timeout(_))));
        assert_eq!(pool.stats().waits, 1);
        assert_eq!(pool.stats().timeouts, 1);
    }

    #[test]
    fn wraps_to_zero_only_past_in_use_region() {
        let pool = RingBufferPool::new(32, NO_WAIT);
        let a = pool.allocate(12).unwrap();
        let b = pool.allocate(12).unwrap();
        // 8 bytes left at the tail, nothing free at the head yet.
        assert!(pool.allocate(12).is_err());

        pool.release(a).unwrap();
        let c = pool.allocate(12).unwrap();
        assert_eq!(c.offset(), 0);

        // Wrapped: [12, 24) and [0, 12) are live; nothing fits between.
        assert!(pool.allocate(4).is_err());

        pool.release(b).unwrap();
        let d = pool.allocate(16).unwrap();
        assert_eq!(d.offset(), 12);
        pool.release(c).unwrap();
        pool.release(d).unwrap();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn out_of_order_release_does_not_free_older_space() {
        let pool = RingBufferPool::new(16, NO_WAIT);
        let a = pool.allocate(8).unwrap();
        let b = pool.allocate(8).unwrap();
        pool.release(b).unwrap();
        assert!(pool.allocate(4).is_err());
        pool.release(a).unwrap();
        assert_eq!(pool.allocate(16).unwrap().offset(), 0);
    }

    #[test]
    fn release_of_older_claim_leaves_newer_bytes_intact() {
        let pool = RingBufferPool::new(64, NO_WAIT);
        let a = pool.allocate(4).unwrap();
        pool.write(&a, b"AAAA").unwrap();
        let b = pool.allocate(6).unwrap();
        pool.write(&b, b"BBBBBB").unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.read(&b).unwrap(), b"BBBBBB".to_vec());
    }

    #[test]
    fn consumer_sees_submissions_in_allocation_order() {
        let pool = RingBufferPool::new(64, NO_WAIT);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(1).unwrap();
        pool.write(&b, &[2]).unwrap();
        pool.submit(b).unwrap();
        // `a` is still being filled; `b` must not overtake it.
        assert!(pool.try_next().is_none());
        pool.write(&a, &[1]).unwrap();
        pool.submit(a).unwrap();

        let first = pool.try_next().unwrap();
        assert_eq!(pool.read(&first).unwrap(), vec![1]);
        let second = pool.try_next().unwrap();
        assert_eq!(pool.read(&second).unwrap(), vec![2]);
        pool.release(first).unwrap();
        pool.release(second).unwrap();
        assert!(pool.try_next().is_none());
    }

    #[test]
    fn abandoned_claim_is_skipped_by_consumer() {
        let pool = RingBufferPool::new(64, NO_WAIT);
        let a = pool.allocate(4).unwrap();
        pool.push(&[9, 9]).unwrap();
        pool.release(a).unwrap();
        let next = pool.try_next().unwrap();
        assert_eq!(pool.read(&next).unwrap(), vec![9, 9]);
    }

    #[test]
    fn failed_commit_releases_its_claim() {
        let pool = RingBufferPool::new(64, NO_WAIT);
        let short = pool.allocate(2).unwrap();
        pool.push(&[7]).unwrap();
        let err = pool.commit(short, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, PoolError::Overflow { len: 3, size: 2 }), "{err}");

        // The later submission is not stuck behind the failed one.
        let next = pool.try_next().unwrap();
        assert_eq!(pool.read(&next).unwrap(), vec![7]);
        pool.release(next).unwrap();
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn stale_and_default_pointers_are_rejected() {
        let pool = RingBufferPool::new(64, NO_WAIT);
        assert_eq!(
            pool.release(PoolBufferPointer::default()).unwrap_err(),
            PoolError::InvalidPointer
        );
        let a = pool.allocate(4).unwrap();
        assert_eq!(
            pool.write(&a, &[0; 5]).unwrap_err(),
            PoolError::Overflow { len: 5, size: 4 }
        );
        let forged = PoolBufferPointer {
            offset: a.offset(),
            size: a.size(),
            rounded_size: a.rounded_size(),
            valid: true,
            seq: a.seq(),
        };
        pool.release(a).unwrap();
        assert_eq!(pool.release(forged).unwrap_err(), PoolError::InvalidPointer);
    }

    #[test]
    fn close_wakes_consumer_and_fails_producer() {
        let pool = RingBufferPool::new(16, Duration::from_secs(60));
        pool.close();
        assert!(pool.next().is_none());
        assert_eq!(pool.allocate(4).unwrap_err(), PoolError::Closed);
    }
}
