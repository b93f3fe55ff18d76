//! # pmu-counters
//!
//! Minimal crate for a thread to count its own hardware events (retired
//! instructions, cache misses, branch misses, cycles) using Linux
//! `perf_event_open()` in counting mode.
//!
//! Each counter's metadata page is mapped into the process so reads can use
//! `rdpmc` directly from user space, without a syscall. When the kernel does not
//! grant user-space access (`cap_user_rdpmc` clear, or a non-x86 target) reads
//! fall back to `read(2)` on the event fd.
//!
//! Counters are bound to the thread that opened them. A [`CounterGroup`] is
//! neither `Send` nor `Sync`; open it on the thread you want to measure and
//! read it from that thread only.
//!
//! ## Quick start
//!
//! ```no_run
//! use pmu_counters::{CounterGroup, CounterKind};
//!
//! let group = CounterGroup::open_for_current_thread(&[
//!     CounterKind::Instructions,
//!     CounterKind::CacheMisses,
//! ])
//! .expect("hardware counters unavailable");
//!
//! let mut before = [0u64; 2];
//! let mut after = [0u64; 2];
//! group.read_into(&mut before);
//! // ... do work ...
//! group.read_into(&mut after);
//! println!("instructions: {}", after[0] - before[0]);
//! ```

mod counter;
pub mod sys;

pub use counter::{CounterGroup, CounterKind, check_available};
