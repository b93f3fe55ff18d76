use crate::profiler::buffer::RecordingBuffer;
use crate::profiler::events::ProbeEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Meeting point between producing threads and the trace writer.
///
/// Holds every live thread buffer registered for the current session, plus
/// batches that flush-on-full threads drained synchronously.
/// [`drain`](Self::drain) takes the inline batches before draining buffers,
/// under the same lock an inline flush holds, so each thread's events come
/// out in sequence order.
///
/// A buffer whose thread has exited is released once it is empty. Its
/// counts are kept, and its thread id remembers where the sequence stopped
/// in case the OS hands the id to a new thread.
pub struct CentralCollector {
    buffers: Mutex<Registered>,
    flushed: Mutex<Pending>,
    max_pending_events: usize,
}

#[derive(Default)]
struct Pending {
    batches: Vec<Vec<ProbeEvent>>,
    events: usize,
}

impl Pending {
    fn park(&mut self, buffer: &RecordingBuffer, batch: Vec<ProbeEvent>, max_pending_events: usize) {
        let n = batch.len();
        if n == 0 {
            return;
        }
        if self.events + n > max_pending_events {
            buffer.add_dropped(n as u64);
            return;
        }
        self.events += n;
        self.batches.push(batch);
    }
}

#[derive(Default)]
struct Registered {
    live: Vec<Arc<RecordingBuffer>>,
    retired_dropped: u64,
    retired_inline_flushes: u64,
    next_sequence: HashMap<u32, u64>,
}

impl Registered {
    fn retire(&mut self, buffer: &RecordingBuffer) {
        self.retired_dropped += buffer.dropped();
        self.retired_inline_flushes += buffer.inline_flushes();
        let next = self.next_sequence.entry(buffer.thread_id()).or_default();
        *next = (*next).max(buffer.written());
    }

    /// Release empty buffers nobody appends to anymore.
    fn prune(&mut self) {
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.live)
            .into_iter()
            .partition(|b| Arc::strong_count(b) == 1 && b.is_empty());
        self.live = live;
        for buffer in dead {
            self.retire(&buffer);
        }
    }
}

impl CentralCollector {
    pub fn new(max_pending_events: usize) -> Self {
        Self {
            buffers: Mutex::new(Registered::default()),
            flushed: Mutex::new(Pending::default()),
            max_pending_events,
        }
    }

    pub fn register(&self, buffer: Arc<RecordingBuffer>) {
        self.buffers.lock().unwrap().live.push(buffer);
    }

    /// Take over whatever earlier buffers of `thread_id` still hold and
    /// return the sequence a new buffer for that id must start at.
    ///
    /// Only call this for a thread that has no live buffer here.
    pub fn retire_thread(&self, thread_id: u32) -> u64 {
        let mut flushed = self.flushed.lock().unwrap();
        let mut registered = self.buffers.lock().unwrap();
        let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut registered.live)
            .into_iter()
            .partition(|b| b.thread_id() == thread_id);
        registered.live = live;
        for buffer in stale {
            let mut batch = Vec::new();
            buffer.drain_into(&mut batch);
            flushed.park(&buffer, batch, self.max_pending_events);
            registered.retire(&buffer);
        }
        registered.next_sequence.get(&thread_id).copied().unwrap_or(0)
    }

    /// Snapshot of the live buffers.
    pub fn buffers(&self) -> Vec<Arc<RecordingBuffer>> {
        self.buffers.lock().unwrap().live.clone()
    }

    /// Events dropped this session, including by released buffers.
    pub fn dropped(&self) -> u64 {
        let registered = self.buffers.lock().unwrap();
        registered.retired_dropped + registered.live.iter().map(|b| b.dropped()).sum::<u64>()
    }

    pub fn inline_flushes(&self) -> u64 {
        let registered = self.buffers.lock().unwrap();
        registered.retired_inline_flushes
            + registered.live.iter().map(|b| b.inline_flushes()).sum::<u64>()
    }

    /// Forget all buffers, counts and pending batches, at a session boundary.
    pub fn reset(&self) {
        let mut flushed = self.flushed.lock().unwrap();
        *flushed = Pending::default();
        *self.buffers.lock().unwrap() = Registered::default();
    }

    /// Throw away everything still held and return how many events that was.
    pub fn discard(&self) -> u64 {
        let mut flushed = self.flushed.lock().unwrap();
        let mut n = flushed.events as u64;
        *flushed = Pending::default();
        let mut scratch = Vec::new();
        for buffer in self.buffers.lock().unwrap().live.iter() {
            n += buffer.drain_into(&mut scratch) as u64;
            scratch.clear();
        }
        n
    }

    /// Drain `buffer` on the calling thread and park the events until the
    /// writer's next pass. Past `max_pending_events` the events are counted
    /// as dropped instead.
    pub fn flush_inline(&self, buffer: &RecordingBuffer) {
        let mut flushed = self.flushed.lock().unwrap();
        let mut batch = Vec::with_capacity(buffer.len());
        buffer.drain_into(&mut batch);
        flushed.park(buffer, batch, self.max_pending_events);
    }

    /// Everything recorded so far: inline batches first, then one batch per
    /// non-empty thread buffer.
    pub fn drain(&self) -> Vec<Vec<ProbeEvent>> {
        let mut flushed = self.flushed.lock().unwrap();
        let mut batches = std::mem::take(&mut flushed.batches);
        flushed.events = 0;
        let mut registered = self.buffers.lock().unwrap();
        for buffer in registered.live.iter() {
            let mut batch = Vec::new();
            if buffer.drain_into(&mut batch) > 0 {
                batches.push(batch);
            }
        }
        registered.prune();
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::config::OverflowPolicy;
    use crate::profiler::probe::ProbeId;

    #[test]
    fn test_drain_empty() {
        let collector = CentralCollector::new(16);
        assert!(collector.drain().is_empty());
    }

    #[test]
    fn test_inline_batches_precede_buffer_contents() {
        let collector = CentralCollector::new(16);
        let (mut producer, buffer) = RecordingBuffer::new(3, 2, OverflowPolicy::FlushOnFull, 0);
        collector.register(buffer.clone());

        producer.append(ProbeId::from_u32(0), 1, &[]);
        producer.append(ProbeId::from_u32(0), 2, &[]);
        collector.flush_inline(&buffer);
        producer.append(ProbeId::from_u32(0), 3, &[]);

        let batches = collector.drain();
        let sequences: Vec<u64> = batches.iter().flatten().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(collector.drain().is_empty());
    }

    #[test]
    fn test_pending_limit_counts_drops() {
        let collector = CentralCollector::new(2);
        let (mut producer, buffer) = RecordingBuffer::new(3, 2, OverflowPolicy::FlushOnFull, 0);
        collector.register(buffer.clone());

        for round in 0..2 {
            producer.append(ProbeId::from_u32(0), round, &[]);
            producer.append(ProbeId::from_u32(0), round, &[]);
            collector.flush_inline(&buffer);
        }
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(collector.drain().iter().flatten().count(), 2);
    }

    #[test]
    fn test_reset_forgets_buffers() {
        let collector = CentralCollector::new(16);
        let (mut producer, buffer) = RecordingBuffer::new(3, 4, OverflowPolicy::RingOverwrite, 0);
        collector.register(buffer);
        producer.append(ProbeId::from_u32(0), 1, &[]);
        collector.reset();
        assert!(collector.buffers().is_empty());
        assert!(collector.drain().is_empty());
    }

    #[test]
    fn test_exited_threads_release_their_buffers() {
        let collector = CentralCollector::new(16);
        for tid in 0..8 {
            let (mut producer, buffer) = RecordingBuffer::new(tid, 4, OverflowPolicy::RingOverwrite, 0);
            collector.register(buffer);
            for i in 0..6 {
                producer.append(ProbeId::from_u32(0), i, &[]);
            }
            drop(producer);
            assert_eq!(collector.drain().iter().flatten().count(), 4);
            assert!(collector.buffers().is_empty());
        }
        assert_eq!(collector.dropped(), 16);
    }

    #[test]
    fn test_live_buffers_are_kept_when_empty() {
        let collector = CentralCollector::new(16);
        let (_producer, buffer) = RecordingBuffer::new(1, 4, OverflowPolicy::RingOverwrite, 0);
        collector.register(buffer);
        collector.drain();
        assert_eq!(collector.buffers().len(), 1);
    }

    #[test]
    fn test_reused_thread_id_continues_the_sequence() {
        let collector = CentralCollector::new(16);
        let (mut old, buffer) = RecordingBuffer::new(9, 8, OverflowPolicy::FlushOnFull, 0);
        collector.register(buffer);
        for i in 0..3 {
            old.append(ProbeId::from_u32(0), i, &[]);
        }
        drop(old);

        let first = collector.retire_thread(9);
        assert_eq!(first, 3);
        let (mut new, buffer) = RecordingBuffer::starting_at(9, first, 2, OverflowPolicy::FlushOnFull, 0);
        collector.register(buffer.clone());
        new.append(ProbeId::from_u32(0), 3, &[]);
        new.append(ProbeId::from_u32(0), 4, &[]);
        collector.flush_inline(&buffer);
        new.append(ProbeId::from_u32(0), 5, &[]);

        let sequences: Vec<u64> = collector.drain().iter().flatten().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..6).collect::<Vec<_>>());
        assert_eq!(collector.buffers().len(), 1);
    }

    #[test]
    fn test_discard_counts_what_was_left() {
        let collector = CentralCollector::new(16);
        let (mut producer, buffer) = RecordingBuffer::new(3, 2, OverflowPolicy::FlushOnFull, 0);
        collector.register(buffer.clone());
        producer.append(ProbeId::from_u32(0), 1, &[]);
        producer.append(ProbeId::from_u32(0), 2, &[]);
        collector.flush_inline(&buffer);
        producer.append(ProbeId::from_u32(0), 3, &[]);
        assert_eq!(collector.discard(), 3);
        assert!(collector.drain().is_empty());
    }
}
