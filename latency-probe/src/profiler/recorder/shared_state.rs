use super::SessionId;
use crate::profiler::buffer::{AppendOutcome, BufferProducer, RecordingBuffer};
use crate::profiler::clock;
use crate::profiler::collector::CentralCollector;
use crate::profiler::config::OverflowPolicy;
use crate::profiler::counters::{CounterKind, ThreadCounters};
use crate::profiler::error::HardwareError;
use crate::profiler::events::current_tid;
use crate::profiler::probe::{ProbeId, ProbeRegistry};
use arc_swap::ArcSwapOption;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

thread_local! {
    /// This thread's buffer in each profiler it records into, for the
    /// session it last recorded in.
    static LOCAL: RefCell<SmallVec<[LocalRecorder; 2]>> = RefCell::new(SmallVec::new());
}

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Keys are unique across every profiler in the process, so a thread-local
/// recorder can never be mistaken for one belonging to a newer session.
static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_key() -> u64 {
    NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed)
}

/// What a thread needs to know to join the current session.
pub(crate) struct SessionInfo {
    pub(crate) id: SessionId,
    pub(crate) key: u64,
    /// Counters actually recorded; empty when the session is degraded.
    pub(crate) counters: Vec<CounterKind>,
}

struct LocalRecorder {
    state_id: u64,
    session_key: u64,
    producer: BufferProducer,
    counters: ThreadCounters,
}

impl LocalRecorder {
    #[inline]
    fn record(&mut self, shared: &SharedState, probe_id: ProbeId, timestamp: u64) {
        self.producer.begin_write();
        // Rechecked after announcing the write: a stop either sees the
        // announcement and waits, or this sees the stop and backs off.
        if shared.recording.load(Ordering::SeqCst)
            && shared.session_key.load(Ordering::SeqCst) == self.session_key
        {
            let counters = self.counters.read();
            if self.producer.append(probe_id, timestamp, counters) == AppendOutcome::Full {
                shared.collector.flush_inline(self.producer.buffer());
                self.producer.note_inline_flush();
                self.producer.append(probe_id, timestamp, counters);
            }
        }
        self.producer.end_write();
    }

    /// False once the collector has let go of the buffer: its session is
    /// over, or its profiler is gone.
    fn is_registered(&self) -> bool {
        Arc::strong_count(self.producer.buffer()) > 1
    }
}

/// Recording and writer health, surfaced through `status()`.
#[derive(Default)]
pub(crate) struct Health {
    degraded: AtomicBool,
    degraded_reason: Mutex<Option<String>>,
    write_errors: AtomicU64,
    last_write_error: Mutex<Option<String>>,
    writer_failed: AtomicBool,
    events_written: AtomicU64,
}

impl Health {
    pub(crate) fn reset(&self) {
        self.degraded.store(false, Ordering::Relaxed);
        *self.degraded_reason.lock().unwrap() = None;
        self.write_errors.store(0, Ordering::Relaxed);
        *self.last_write_error.lock().unwrap() = None;
        self.writer_failed.store(false, Ordering::Relaxed);
        self.events_written.store(0, Ordering::Relaxed);
    }

    pub(crate) fn degrade(&self, error: &HardwareError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(%error, "hardware counters unavailable, recording timestamps only");
            *self.degraded_reason.lock().unwrap() = Some(error.to_string());
        }
    }

    pub(crate) fn write_failed(&self, error: &io::Error) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
        *self.last_write_error.lock().unwrap() = Some(error.to_string());
        if !self.writer_failed.swap(true, Ordering::AcqRel) {
            tracing::warn!(%error, "trace write failed, holding events in memory");
        }
    }

    pub(crate) fn write_succeeded(&self) {
        if self.writer_failed.swap(false, Ordering::AcqRel) {
            tracing::info!(
                write_errors = self.write_errors(),
                "trace writer recovered"
            );
        }
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.events_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn degraded_reason(&self) -> Option<String> {
        self.degraded_reason.lock().unwrap().clone()
    }

    pub(crate) fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn last_write_error(&self) -> Option<String> {
        self.last_write_error.lock().unwrap().clone()
    }

    pub(crate) fn writer_failed(&self) -> bool {
        self.writer_failed.load(Ordering::Acquire)
    }

    pub(crate) fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }
}

/// Shared state accessed lock-free by probes on the hot path.
pub(crate) struct SharedState {
    /// Tells this profiler's thread-local recorders apart from other profilers'.
    id: u64,
    pub(crate) registry: ProbeRegistry,
    pub(crate) recording: AtomicBool,
    /// Key of the active session, 0 when none.
    pub(crate) session_key: AtomicU64,
    pub(crate) session: ArcSwapOption<SessionInfo>,
    pub(crate) collector: CentralCollector,
    pub(crate) health: Health,
    buffer_capacity: usize,
    overflow_policy: OverflowPolicy,
}

impl SharedState {
    pub(crate) fn new(
        registry: ProbeRegistry,
        buffer_capacity: usize,
        overflow_policy: OverflowPolicy,
        max_pending_events: usize,
    ) -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            recording: AtomicBool::new(false),
            session_key: AtomicU64::new(0),
            session: ArcSwapOption::empty(),
            collector: CentralCollector::new(max_pending_events),
            health: Health::default(),
            buffer_capacity,
            overflow_policy,
        }
    }

    pub(crate) fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub(crate) fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    #[inline]
    pub(crate) fn record(&self, probe_id: ProbeId) {
        // Acquire so the key below is at least as new as the session that
        // turned recording on.
        if !self.recording.load(Ordering::Acquire) {
            return;
        }
        let timestamp = clock::now();
        let key = self.session_key.load(Ordering::Acquire);
        // Fails only while the thread is being torn down.
        let _ = LOCAL.try_with(|cell| {
            let Ok(mut locals) = cell.try_borrow_mut() else {
                return;
            };
            let found = locals.iter().position(|l| l.state_id == self.id);
            let index = match found {
                Some(i) if locals[i].session_key == key => i,
                found => {
                    let Some(local) = self.register_thread() else {
                        return;
                    };
                    if let Some(i) = found {
                        locals.swap_remove(i);
                    }
                    locals.retain(|l| l.is_registered());
                    locals.push(local);
                    locals.len() - 1
                }
            };
            locals[index].record(self, probe_id, timestamp);
        });
    }

    /// Wait until no thread is inside an append that started before
    /// `recording` was cleared.
    pub(crate) fn wait_for_writers(&self) {
        for buffer in self.collector.buffers() {
            while buffer.is_writing() {
                std::thread::yield_now();
            }
        }
    }

    /// First event of this thread in the current session: allocate its
    /// buffer and open its counters.
    #[cold]
    #[inline(never)]
    fn register_thread(&self) -> Option<LocalRecorder> {
        let session = self.session.load_full()?;
        let (counters, error) = ThreadCounters::open(&session.counters);
        if let Some(error) = error {
            self.health.degrade(&error);
        }
        let thread_id = current_tid();
        let first_sequence = self.collector.retire_thread(thread_id);
        let (producer, buffer) = RecordingBuffer::starting_at(
            thread_id,
            first_sequence,
            self.buffer_capacity,
            self.overflow_policy,
            session.counters.len(),
        );
        self.collector.register(buffer);
        tracing::debug!(thread_id, session = %session.id, "registered recording buffer");
        Some(LocalRecorder {
            state_id: self.id,
            session_key: session.key,
            producer,
            counters,
        })
    }
}
