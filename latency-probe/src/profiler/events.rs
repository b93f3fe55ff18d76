use crate::profiler::probe::ProbeId;
use serde::Serialize;
use smallvec::SmallVec;

/// Most hardware counters snapshotted per event. Also the inline capacity of
/// [`CounterValues`], so decoding never allocates for counter sets.
pub const MAX_COUNTERS: usize = 4;

/// Counter snapshot carried by one event, in trace-header schema order.
pub type CounterValues = SmallVec<[u64; MAX_COUNTERS]>;

/// One recorded probe activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeEvent {
    pub probe_id: ProbeId,
    /// OS thread id of the thread that fired the probe.
    pub thread_id: u32,
    /// Position in the thread's recording stream. Strictly increasing per
    /// thread within a session; gaps mean events were dropped.
    pub sequence: u64,
    /// Raw ticks, see [`Calibration`](crate::profiler::clock::Calibration).
    pub timestamp: u64,
    pub counters: CounterValues,
}

impl ProbeEvent {
    pub fn new(probe_id: ProbeId, thread_id: u32, sequence: u64, timestamp: u64) -> Self {
        ProbeEvent {
            probe_id,
            thread_id,
            sequence,
            timestamp,
            counters: CounterValues::new(),
        }
    }

    pub fn with_counters(mut self, counters: &[u64]) -> Self {
        self.counters = CounterValues::from_slice(counters);
        self
    }
}

/// Get the OS thread ID (tid) of the calling thread via `gettid()`.
pub fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}
