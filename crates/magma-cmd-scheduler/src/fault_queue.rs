//! # Fault Queue
//!
//! Bounded hand-off from the interrupt path to the fault worker.
//!
//! The interrupt side only decodes and pushes; it never blocks and never
//! waits for space. A full queue is reported back so the interrupt
//! collaborator can escalate.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use magma_core::{Error, Result};
use magma_hal::FaultRecord;
use spin::Mutex;

// =============================================================================
// Ring Buffer
// =============================================================================

/// Fixed-capacity ring of fault records
struct RingBuffer {
    /// Storage
    slots: Vec<Option<FaultRecord>>,
    /// Read position
    read_pos: usize,
    /// Write position
    write_pos: usize,
    /// Number of records
    count: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize(capacity, None);
        Self {
            slots,
            read_pos: 0,
            write_pos: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, record: FaultRecord) -> bool {
        if self.count >= self.capacity() {
            return false;
        }
        self.slots[self.write_pos] = Some(record);
        self.write_pos = (self.write_pos + 1) % self.capacity();
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<FaultRecord> {
        if self.count == 0 {
            return None;
        }
        let record = self.slots[self.read_pos].take();
        self.read_pos = (self.read_pos + 1) % self.capacity();
        self.count -= 1;
        record
    }
}

// =============================================================================
// Fault Queue
// =============================================================================

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Records accepted
    pub pushed: u64,
    /// Records handed to the worker
    pub popped: u64,
    /// Records dropped because the queue was full
    pub overflows: u64,
    /// Current length
    pub len: usize,
    /// Capacity
    pub capacity: usize,
}

/// Bounded multi-producer fault queue
pub struct FaultQueue {
    ring: Mutex<RingBuffer>,
    pushed: AtomicU64,
    popped: AtomicU64,
    overflows: AtomicU64,
}

impl FaultQueue {
    /// Create a queue holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingBuffer::new(capacity)),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    /// Enqueue a record without blocking
    pub fn push(&self, record: FaultRecord) -> Result<()> {
        if self.ring.lock().push(record) {
            self.pushed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            Err(Error::QueueFull)
        }
    }

    /// Dequeue the oldest record
    pub fn pop(&self) -> Option<FaultRecord> {
        let record = self.ring.lock().pop();
        if record.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Number of queued records
    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        let (len, capacity) = {
            let ring = self.ring.lock();
            (ring.count, ring.capacity())
        };
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            len,
            capacity,
        }
    }
}

impl core::fmt::Debug for FaultQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FaultQueue").field("stats", &self.stats()).finish()
    }
}

static_assertions::assert_impl_all!(FaultQueue: Send, Sync);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use magma_core::{ContextId, EngineId, GpuAddr};
    use magma_hal::FaultClass;

    use super::*;

    fn record(ctx: u64) -> FaultRecord {
        FaultRecord::new(EngineId(0), ContextId(ctx), GpuAddr::null(), FaultClass::Recoverable)
    }

    #[test]
    fn test_fifo_order_across_wrap() {
        let queue = FaultQueue::new(2);
        queue.push(record(1)).unwrap();
        queue.push(record(2)).unwrap();
        assert_eq!(queue.pop().unwrap().context, ContextId(1));
        queue.push(record(3)).unwrap();
        assert_eq!(queue.pop().unwrap().context, ContextId(2));
        assert_eq!(queue.pop().unwrap().context, ContextId(3));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_queue_counts_overflow() {
        let queue = FaultQueue::new(1);
        queue.push(record(1)).unwrap();
        assert_eq!(queue.push(record(2)), Err(Error::QueueFull));

        let stats = queue.stats();
        assert_eq!(stats.pushed, 1);
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.len, 1);
        assert_eq!(stats.capacity, 1);
    }
}
