//! Raw perf_event metadata page layout and the user-space counter read.

use std::io;

/// `cap_user_rdpmc` in `perf_event_mmap_page::capabilities`.
///
/// Bits 0 and 1 are the deprecated `cap_bit0` / `cap_bit0_is_deprecated`
/// pair; the usable capability bits start at 2.
pub const CAP_USER_RDPMC: u64 = 1 << 2;
pub const CAP_USER_TIME: u64 = 1 << 3;

pub const PAGE_SIZE: usize = 4096;

// --- perf_event_mmap_page (counter metadata) ---

#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub _reserved: [u8; 948], // pad to offset 0x400 = 1024
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Read hardware performance counter `counter` (the page's `index - 1`).
///
/// # Safety
///
/// Faults unless the kernel has enabled user-space `rdpmc` for this task,
/// which it advertises through [`CAP_USER_RDPMC`].
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn rdpmc(counter: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        std::arch::asm!(
            "rdpmc",
            in("ecx") counter,
            out("eax") lo,
            out("edx") hi,
            options(nostack, nomem, preserves_flags),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Sign-extend a raw `width`-bit PMC value to 64 bits.
#[inline(always)]
pub fn sign_extend(raw: u64, width: u16) -> i64 {
    if width == 0 || width >= 64 {
        return raw as i64;
    }
    let shift = 64 - width as u32;
    ((raw << shift) as i64) >> shift
}

/// Current value of `/proc/sys/kernel/perf_event_paranoid`, if readable.
pub fn perf_event_paranoid() -> io::Result<i32> {
    let contents = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")?;
    contents
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad paranoid level: {e}")))
}
