//! Hardware counter glue between the profiler and `pmu-counters`.

use crate::profiler::error::HardwareError;
use crate::profiler::events::MAX_COUNTERS;
pub use pmu_counters::CounterKind;
use pmu_counters::CounterGroup;

/// Check that `kinds` can be opened on this machine. Called once per session
/// on the controlling thread; a failure puts the session in timestamp-only
/// mode.
pub(crate) fn check(kinds: &[CounterKind]) -> Result<(), HardwareError> {
    if kinds.len() > MAX_COUNTERS {
        return Err(HardwareError::TooMany {
            requested: kinds.len(),
            max: MAX_COUNTERS,
        });
    }
    if kinds.is_empty() {
        return Ok(());
    }
    pmu_counters::check_available(kinds).map_err(HardwareError::Unavailable)
}

/// Counters for the calling thread. Opened lazily when a thread records its
/// first event in a session.
pub(crate) struct ThreadCounters {
    group: Option<CounterGroup>,
    values: [u64; MAX_COUNTERS],
    len: usize,
}

impl ThreadCounters {
    pub(crate) fn disabled() -> Self {
        ThreadCounters {
            group: None,
            values: [0; MAX_COUNTERS],
            len: 0,
        }
    }

    /// Open `kinds` for this thread. On failure the thread records zeros in
    /// the counter columns so record stride stays fixed.
    pub(crate) fn open(kinds: &[CounterKind]) -> (Self, Option<HardwareError>) {
        let len = kinds.len().min(MAX_COUNTERS);
        if len == 0 {
            return (Self::disabled(), None);
        }
        match CounterGroup::open_for_current_thread(&kinds[..len]) {
            Ok(group) => (
                ThreadCounters {
                    group: Some(group),
                    values: [0; MAX_COUNTERS],
                    len,
                },
                None,
            ),
            Err(e) => (
                ThreadCounters {
                    group: None,
                    values: [0; MAX_COUNTERS],
                    len,
                },
                Some(HardwareError::Unavailable(e)),
            ),
        }
    }

    /// Snapshot the counters. Empty slice in timestamp-only mode.
    #[inline]
    pub(crate) fn read(&mut self) -> &[u64] {
        if let Some(group) = &self.group {
            group.read_into(&mut self.values[..self.len]);
        }
        &self.values[..self.len]
    }
}
