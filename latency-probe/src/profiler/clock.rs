//! Timestamp source: raw cycle-counter reads and the calibration that turns
//! ticks into nanoseconds.
//!
//! On x86_64 the tick source is the TSC (`rdtsc`), on aarch64 the virtual
//! counter `cntvct_el0`. Other targets fall back to `CLOCK_MONOTONIC_RAW` in
//! nanoseconds, which calibrates to roughly 1e9 ticks per second.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Read the tick counter. No allocation, no locks, no syscall on x86_64 and
/// aarch64.
#[inline(always)]
pub fn now() -> u64 {
    ticks()
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn ticks() -> u64 {
    #[allow(unused_unsafe)]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn ticks() -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall-clock nanoseconds since the Unix epoch, for anchoring a session.
pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Mapping from ticks to wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    cycles_per_second: f64,
}

impl Calibration {
    /// Used when measurement produces nonsense (a stuck or virtualized counter).
    const FALLBACK_HZ: f64 = 1e9;

    /// A calibration with a known tick frequency. Returns `None` unless
    /// `cycles_per_second` is finite and positive.
    pub fn from_cycles_per_second(cycles_per_second: f64) -> Option<Self> {
        (cycles_per_second.is_finite() && cycles_per_second > 0.0)
            .then_some(Calibration { cycles_per_second })
    }

    /// Correlate the tick counter against the monotonic system clock over
    /// `window`.
    ///
    /// Each endpoint brackets one `Instant::now()` between two tick reads and
    /// takes their midpoint, which keeps the error near one clock read.
    pub fn measure(window: Duration) -> Self {
        let (start_instant, start_ticks) = paired_sample();
        let deadline = start_instant + window;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1).min(window));
        }
        let (end_instant, end_ticks) = paired_sample();

        let elapsed = end_instant.duration_since(start_instant).as_secs_f64();
        let ticks = end_ticks.saturating_sub(start_ticks) as f64;
        match Self::from_cycles_per_second(ticks / elapsed) {
            Some(calibration) => {
                tracing::debug!(
                    cycles_per_second = calibration.cycles_per_second,
                    window_ms = window.as_millis() as u64,
                    "calibrated tick counter"
                );
                calibration
            }
            None => {
                tracing::warn!(
                    ticks,
                    elapsed,
                    "tick counter calibration failed, assuming 1 GHz"
                );
                Calibration {
                    cycles_per_second: Self::FALLBACK_HZ,
                }
            }
        }
    }

    pub fn cycles_per_second(&self) -> f64 {
        self.cycles_per_second
    }

    /// Convert a tick delta to nanoseconds, rounded to the nearest nanosecond.
    pub fn ticks_to_nanos(&self, ticks: u64) -> u64 {
        (ticks as f64 * 1e9 / self.cycles_per_second).round() as u64
    }

    pub fn nanos_to_ticks(&self, nanos: u64) -> u64 {
        (nanos as f64 * self.cycles_per_second / 1e9).round() as u64
    }

    /// Convert an absolute timestamp to Unix nanoseconds, given a session
    /// anchor taken at `anchor_ticks` / `anchor_unix_nanos`.
    pub fn to_unix_nanos(&self, timestamp: u64, anchor_ticks: u64, anchor_unix_nanos: u64) -> i128 {
        let delta = timestamp as i128 - anchor_ticks as i128;
        let delta_nanos = (delta as f64 * 1e9 / self.cycles_per_second).round() as i128;
        anchor_unix_nanos as i128 + delta_nanos
    }
}

fn paired_sample() -> (Instant, u64) {
    let before = now();
    let instant = Instant::now();
    let after = now();
    (instant, before + (after.wrapping_sub(before)) / 2)
}
