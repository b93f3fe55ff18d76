//! Per-thread recording arena.
//!
//! A fixed array of slots plus two monotonically increasing cursors:
//!
//! - `head`: next write index. Stored only by the owning thread.
//! - `tail`: oldest unconsumed index. Advanced by compare-exchange, both by
//!   drains and by the producer when it overwrites the oldest slot.
//!
//! Index `i` lives in slot `i % capacity` and doubles as the event's
//! sequence number. A drain copies `[tail, head)` and then tries to move
//! `tail` to `head`. If the producer claimed some of those slots in the
//! meantime the exchange fails, and the copied events below the new tail
//! (possibly torn) are discarded. The producer never waits on a drain.

use crate::profiler::config::OverflowPolicy;
use crate::profiler::events::{CounterValues, MAX_COUNTERS, ProbeEvent};
use crate::profiler::probe::ProbeId;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

const SLOT_WORDS: usize = 2 + MAX_COUNTERS;

#[repr(align(64))]
struct CacheAligned<T>(T);

#[derive(Default)]
struct Slot {
    // [probe_id, timestamp, counters..]
    words: [AtomicU64; SLOT_WORDS],
}

/// What happened to an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The oldest unflushed event was discarded to make room.
    Overwrote,
    /// Flush-on-full buffer with no free slot; nothing was written.
    Full,
}

pub struct RecordingBuffer {
    thread_id: u32,
    policy: OverflowPolicy,
    counter_len: usize,
    slots: Box<[Slot]>,
    head: CacheAligned<AtomicU64>,
    tail: CacheAligned<AtomicU64>,
    dropped: CacheAligned<AtomicU64>,
    inline_flushes: AtomicU64,
    /// Set by the producer around each append, so a session stop can wait
    /// out appends that raced with it.
    writing: CacheAligned<AtomicBool>,
}

impl RecordingBuffer {
    /// Allocate and prefault a buffer. The returned producer is the only
    /// handle that can append; the `Arc` is for consumers.
    pub fn new(
        thread_id: u32,
        capacity: usize,
        policy: OverflowPolicy,
        counter_len: usize,
    ) -> (BufferProducer, Arc<RecordingBuffer>) {
        Self::starting_at(thread_id, 0, capacity, policy, counter_len)
    }

    /// Like [`new`](Self::new), but the first event gets sequence
    /// `first_sequence`. Used when a thread id shows up again in a session.
    pub fn starting_at(
        thread_id: u32,
        first_sequence: u64,
        capacity: usize,
        policy: OverflowPolicy,
        counter_len: usize,
    ) -> (BufferProducer, Arc<RecordingBuffer>) {
        let capacity = capacity.max(1);
        let slots: Box<[Slot]> = (0..capacity).map(|_| Slot::default()).collect();
        let buffer = Arc::new(RecordingBuffer {
            thread_id,
            policy,
            counter_len: counter_len.min(MAX_COUNTERS),
            slots,
            head: CacheAligned(AtomicU64::new(first_sequence)),
            tail: CacheAligned(AtomicU64::new(first_sequence)),
            dropped: CacheAligned(AtomicU64::new(0)),
            inline_flushes: AtomicU64::new(0),
            writing: CacheAligned(AtomicBool::new(false)),
        });
        buffer.prefault();
        let producer = BufferProducer {
            buffer: buffer.clone(),
            _not_send: PhantomData,
        };
        (producer, buffer)
    }

    /// Touch every slot so page faults happen here instead of in `append`.
    fn prefault(&self) {
        for slot in self.slots.iter() {
            for word in &slot.words {
                word.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn counter_len(&self) -> usize {
        self.counter_len
    }

    /// Events currently held. May be stale by the time it returns.
    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence the next append will get: the total appended so far, plus
    /// the starting sequence.
    pub fn written(&self) -> u64 {
        self.head.0.load(Ordering::Acquire)
    }

    /// True while the producer is between `begin_write` and `end_write`.
    pub fn is_writing(&self) -> bool {
        self.writing.0.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.0.load(Ordering::Relaxed)
    }

    pub fn inline_flushes(&self) -> u64 {
        self.inline_flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_dropped(&self, n: u64) {
        self.dropped.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Move every available event into `out`, oldest first. Returns how many
    /// were appended. Safe to call from any thread, concurrently with the
    /// producer and with other drains.
    pub fn drain_into(&self, out: &mut Vec<ProbeEvent>) -> usize {
        let capacity = self.slots.len() as u64;
        let start = out.len();
        let mut tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        if head <= tail {
            return 0;
        }
        out.reserve((head - tail) as usize);
        for index in tail..head {
            let slot = &self.slots[(index % capacity) as usize];
            let probe_id = slot.words[0].load(Ordering::Relaxed) as u32;
            let timestamp = slot.words[1].load(Ordering::Relaxed);
            let counters: CounterValues = slot.words[2..2 + self.counter_len]
                .iter()
                .map(|w| w.load(Ordering::Relaxed))
                .collect();
            out.push(ProbeEvent {
                probe_id: ProbeId::from_u32(probe_id),
                thread_id: self.thread_id,
                sequence: index,
                timestamp,
                counters,
            });
        }
        // Pairs with the producer's release fence: if any slot read above saw
        // an overwrite, the tail claim that preceded it is visible below.
        fence(Ordering::Acquire);
        loop {
            match self.tail.0.compare_exchange(
                tail,
                head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return out.len() - start,
                Err(current) if current >= head => {
                    out.truncate(start);
                    return 0;
                }
                Err(current) => {
                    let lost = (current - tail) as usize;
                    out.drain(start..start + lost);
                    tail = current;
                }
            }
        }
    }

    pub fn drain(&self) -> Vec<ProbeEvent> {
        let mut out = Vec::new();
        self.drain_into(&mut out);
        out
    }
}

/// Append side of a [`RecordingBuffer`]. Owned by one thread, never shared.
pub struct BufferProducer {
    buffer: Arc<RecordingBuffer>,
    _not_send: PhantomData<*const ()>,
}

impl BufferProducer {
    pub fn buffer(&self) -> &Arc<RecordingBuffer> {
        &self.buffer
    }

    /// Record one event. `counters` beyond the buffer's counter width are ignored.
    #[inline]
    pub fn append(&mut self, probe_id: ProbeId, timestamp: u64, counters: &[u64]) -> AppendOutcome {
        let buf = &*self.buffer;
        let capacity = buf.slots.len() as u64;
        let head = buf.head.0.load(Ordering::Relaxed);
        let tail = buf.tail.0.load(Ordering::Acquire);
        let mut outcome = AppendOutcome::Appended;

        if head - tail >= capacity {
            match buf.policy {
                OverflowPolicy::FlushOnFull => return AppendOutcome::Full,
                OverflowPolicy::RingOverwrite => {
                    // A failed exchange means a drain advanced the tail, so
                    // the slot is already free.
                    if buf
                        .tail
                        .0
                        .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let dropped = buf.dropped.0.load(Ordering::Relaxed);
                        buf.dropped.0.store(dropped + 1, Ordering::Relaxed);
                        outcome = AppendOutcome::Overwrote;
                    }
                }
            }
        }

        fence(Ordering::Release);
        let slot = &buf.slots[(head % capacity) as usize];
        slot.words[0].store(probe_id.to_u32() as u64, Ordering::Relaxed);
        slot.words[1].store(timestamp, Ordering::Relaxed);
        for (word, value) in slot.words[2..2 + buf.counter_len].iter().zip(counters) {
            word.store(*value, Ordering::Relaxed);
        }
        buf.head.0.store(head + 1, Ordering::Release);
        outcome
    }

    /// Announce an append. Must be followed by a `SeqCst` check that
    /// recording is still on, which pairs with the stopper's store.
    #[inline]
    pub(crate) fn begin_write(&self) {
        self.buffer.writing.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn end_write(&self) {
        self.buffer.writing.0.store(false, Ordering::Release);
    }

    pub(crate) fn note_inline_flush(&self) {
        let n = self.buffer.inline_flushes.load(Ordering::Relaxed);
        self.buffer.inline_flushes.store(n + 1, Ordering::Relaxed);
    }
}
