//! Per-thread counting events and their user-space reads.

use std::io;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{Ordering, compiler_fence};

use perf_event_open_sys::bindings::{
    PERF_COUNT_HW_BRANCH_INSTRUCTIONS, PERF_COUNT_HW_BRANCH_MISSES, PERF_COUNT_HW_CACHE_MISSES,
    PERF_COUNT_HW_CACHE_REFERENCES, PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_HW_INSTRUCTIONS,
    PERF_FLAG_FD_CLOEXEC, PERF_TYPE_HARDWARE, perf_event_attr,
};

use crate::sys::{self, PAGE_SIZE, PerfEventMmapPage};

/// A hardware event that can be counted per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CounterKind {
    /// Retired instructions.
    Instructions,
    /// Core cycles. Affected by frequency scaling, unlike the TSC.
    CpuCycles,
    /// Last-level cache references.
    CacheReferences,
    /// Last-level cache misses.
    CacheMisses,
    /// Retired branch instructions.
    BranchInstructions,
    /// Mispredicted branches.
    BranchMisses,
}

impl CounterKind {
    pub const ALL: [CounterKind; 6] = [
        CounterKind::Instructions,
        CounterKind::CpuCycles,
        CounterKind::CacheReferences,
        CounterKind::CacheMisses,
        CounterKind::BranchInstructions,
        CounterKind::BranchMisses,
    ];

    /// Stable name, used in trace headers.
    pub fn name(self) -> &'static str {
        match self {
            CounterKind::Instructions => "instructions",
            CounterKind::CpuCycles => "cpu_cycles",
            CounterKind::CacheReferences => "cache_references",
            CounterKind::CacheMisses => "cache_misses",
            CounterKind::BranchInstructions => "branch_instructions",
            CounterKind::BranchMisses => "branch_misses",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    fn config(self) -> u64 {
        (match self {
            CounterKind::Instructions => PERF_COUNT_HW_INSTRUCTIONS,
            CounterKind::CpuCycles => PERF_COUNT_HW_CPU_CYCLES,
            CounterKind::CacheReferences => PERF_COUNT_HW_CACHE_REFERENCES,
            CounterKind::CacheMisses => PERF_COUNT_HW_CACHE_MISSES,
            CounterKind::BranchInstructions => PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            CounterKind::BranchMisses => PERF_COUNT_HW_BRANCH_MISSES,
        }) as u64
    }
}

struct Counter {
    fd: i32,
    /// Metadata page, or null when the mapping failed and reads go through `read(2)`.
    page: *mut PerfEventMmapPage,
}

impl Counter {
    fn open(kind: CounterKind) -> io::Result<Self> {
        let mut attr = perf_event_attr::default();
        attr.size = std::mem::size_of::<perf_event_attr>() as u32;
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.config = kind.config();
        attr.set_disabled(1);
        attr.set_exclude_kernel(1);
        attr.set_exclude_hv(1);

        // pid=0, cpu=-1: follow the calling thread on whichever CPU it runs.
        let fd = unsafe {
            perf_event_open_sys::perf_event_open(
                &mut attr,
                0,
                -1,
                -1,
                PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::PermissionDenied {
                let level = sys::perf_event_paranoid()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!(
                        "perf_event_open denied for {} ({err}); user-space counting needs \
                         /proc/sys/kernel/perf_event_paranoid <= 2 (current: {level})",
                        kind.name()
                    ),
                ));
            }
            return Err(io::Error::new(
                err.kind(),
                format!("perf_event_open failed for {}: {err}", kind.name()),
            ));
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let page = if base == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            base as *mut PerfEventMmapPage
        };

        if unsafe { perf_event_open_sys::ioctls::ENABLE(fd, 0) } < 0 {
            let err = io::Error::last_os_error();
            if !page.is_null() {
                unsafe { libc::munmap(page as *mut libc::c_void, PAGE_SIZE) };
            }
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Counter { fd, page })
    }

    #[inline]
    fn read(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        if let Some(value) = self.read_user() {
            return value;
        }
        self.read_syscall()
    }

    /// Seqlock read of the metadata page plus `rdpmc`.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    fn read_user(&self) -> Option<u64> {
        if self.page.is_null() {
            return None;
        }
        let page = self.page;
        loop {
            let seq = unsafe { ptr::read_volatile(&raw const (*page).lock) };
            compiler_fence(Ordering::SeqCst);

            let capabilities = unsafe { ptr::read_volatile(&raw const (*page).capabilities) };
            let index = unsafe { ptr::read_volatile(&raw const (*page).index) };
            if capabilities & sys::CAP_USER_RDPMC == 0 || index == 0 {
                return None;
            }
            let offset = unsafe { ptr::read_volatile(&raw const (*page).offset) };
            let width = unsafe { ptr::read_volatile(&raw const (*page).pmc_width) };
            let pmc = sys::sign_extend(unsafe { sys::rdpmc(index - 1) }, width);

            compiler_fence(Ordering::SeqCst);
            if unsafe { ptr::read_volatile(&raw const (*page).lock) } == seq {
                return Some(offset.wrapping_add(pmc) as u64);
            }
        }
    }

    fn read_syscall(&self) -> u64 {
        let mut value = 0u64;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n == std::mem::size_of::<u64>() as isize {
            value
        } else {
            0
        }
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        unsafe { perf_event_open_sys::ioctls::DISABLE(self.fd, 0) };
        if !self.page.is_null() {
            unsafe { libc::munmap(self.page as *mut libc::c_void, PAGE_SIZE) };
        }
        unsafe { libc::close(self.fd) };
    }
}

/// A set of counters attached to the thread that opened them.
pub struct CounterGroup {
    kinds: Vec<CounterKind>,
    counters: Vec<Counter>,
    // Counter reads are only meaningful on the owning thread.
    _thread_bound: PhantomData<*const ()>,
}

impl CounterGroup {
    /// Open one counting event per `kind` for the calling thread.
    ///
    /// Fails as a whole if any single counter cannot be opened; counters
    /// already opened are closed again.
    pub fn open_for_current_thread(kinds: &[CounterKind]) -> io::Result<Self> {
        let counters = kinds
            .iter()
            .map(|&kind| Counter::open(kind))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(CounterGroup {
            kinds: kinds.to_vec(),
            counters,
            _thread_bound: PhantomData,
        })
    }

    pub fn kinds(&self) -> &[CounterKind] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// True if every counter can be read with `rdpmc` instead of a syscall.
    pub fn user_readable(&self) -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            self.counters.iter().all(|c| c.read_user().is_some())
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    /// Write the current value of each counter into `out`, in the order the
    /// kinds were given. Extra slots in `out` are left untouched.
    #[inline]
    pub fn read_into(&self, out: &mut [u64]) {
        for (slot, counter) in out.iter_mut().zip(&self.counters) {
            *slot = counter.read();
        }
    }
}

/// Check that `kinds` can be counted on this machine by opening and
/// immediately closing them on the calling thread.
pub fn check_available(kinds: &[CounterKind]) -> io::Result<()> {
    CounterGroup::open_for_current_thread(kinds).map(drop)
}
