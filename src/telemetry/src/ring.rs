//! Lock-free single-producer/single-consumer ring for the plugin tier.
//!
//! The real-time audio thread must not allocate, lock, or call into the
//! recorder. It writes fixed-size `AudioSpanRecord` values (precomputed
//! timestamps, interned name ids) into the ring; a telemetry worker drains
//! them and turns each into a completed span via
//! [`SpanRecorder::record_complete`](crate::recorder::SpanRecorder::record_complete).
//!
//! `push` and `pop` are wait-free. When the ring is full the record is
//! rejected and the producer side keeps running; audio work is never blocked
//! on telemetry.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::TraceContext;
use crate::recorder::SpanRecorder;
use crate::span::SpanStatus;

/// A span observation produced on the audio thread. `name_id` indexes a name
/// table registered with the dispatcher, so no strings cross the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpanRecord {
    pub name_id: u16,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub failed: bool,
}

struct RingShared<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot to read; owned by the consumer, observed by the producer.
    head: AtomicUsize,
    /// Next slot to write; owned by the producer, observed by the consumer.
    tail: AtomicUsize,
}

// Slots between head and tail are initialized and only touched by the side
// that owns the respective index, so the ring is safe to share across the
// two threads as long as T itself is Send.
unsafe impl<T: Send> Send for RingShared<T> {}
unsafe impl<T: Send> Sync for RingShared<T> {}

impl<T> Drop for RingShared<T> {
    fn drop(&mut self) {
        // Exclusive access here; undelivered records still need dropping.
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for index in head..tail {
            let slot = &self.slots[index & self.mask];
            unsafe { (*slot.get()).assume_init_drop() };
        }
    }
}

/// Producer half. Single owner; lives on the audio thread.
pub struct RingProducer<T> {
    shared: Arc<RingShared<T>>,
}

/// Consumer half. Single owner; lives on the telemetry worker.
pub struct RingConsumer<T> {
    shared: Arc<RingShared<T>>,
}

/// Create an SPSC ring holding up to `capacity` records. Capacity is rounded
/// up to the next power of two (minimum 2).
pub fn spsc_ring<T>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(RingShared {
        slots,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        RingProducer {
            shared: shared.clone(),
        },
        RingConsumer { shared },
    )
}

impl<T> RingProducer<T> {
    /// Append a record. Returns it back when the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let shared = &*self.shared;
        let tail = shared.tail.load(Ordering::Relaxed);
        let head = shared.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > shared.mask {
            return Err(value);
        }
        let slot = &shared.slots[tail & shared.mask];
        unsafe { (*slot.get()).write(value) };
        shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

impl<T> RingConsumer<T> {
    /// Take the oldest record, if any.
    pub fn pop(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &shared.slots[head & shared.mask];
        let value = unsafe { (*slot.get()).assume_init_read() };
        shared.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

/// Drains audio-thread observations into the recorder. Runs on the telemetry
/// worker, never on the audio thread.
pub struct AudioSpanDispatcher {
    consumer: RingConsumer<AudioSpanRecord>,
    names: Vec<&'static str>,
}

impl AudioSpanDispatcher {
    pub fn new(consumer: RingConsumer<AudioSpanRecord>, names: Vec<&'static str>) -> Self {
        Self { consumer, names }
    }

    /// Drain everything currently in the ring. Returns the number of spans
    /// recorded; records with an unknown name id are discarded.
    pub fn drain(&mut self, recorder: &SpanRecorder, ctx: &TraceContext) -> usize {
        let mut recorded = 0;
        while let Some(record) = self.consumer.pop() {
            let Some(name) = self.names.get(record.name_id as usize) else {
                continue;
            };
            let status = if record.failed {
                SpanStatus::Error
            } else {
                SpanStatus::Ok
            };
            recorder.record_complete(
                ctx,
                *name,
                None,
                record.start_time_ms,
                record.end_time_ms,
                status,
            );
            recorded += 1;
        }
        recorded
    }
}
