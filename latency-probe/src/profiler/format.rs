//! Binary trace format (v1).
//!
//! ## File layout
//! ```text
//! Header:
//!   MAGIC (8 bytes) + VERSION (u32 LE)                                     = 12 bytes
//!   cycles_per_second (f64 LE)                                             =  8 bytes
//!   session_start_ticks (u64) + session_start_unix_nanos (u64)             = 16 bytes
//!   probe_count (u32)
//!     per probe: id(u32) + name + location + category
//!   counter_count (u8)
//!     per counter: name
//!   string = len(u16) + utf8 bytes(N)
//!
//! Body (fixed stride = 24 + 8 * counter_count):
//!   probe_id(u32) + thread_id(u32) + sequence(u64) + timestamp(u64) + counters(counter_count * u64)
//! ```
//!
//! All integers are little-endian. Timestamps are raw ticks; divide deltas by
//! `cycles_per_second` for seconds. Because records have a fixed stride,
//! record `i` starts at `header_len + i * stride`, and a trailing partial
//! record (process killed mid-write) is detectable by length alone.

use crate::profiler::clock::Calibration;
use crate::profiler::error::FormatError;
use crate::profiler::events::{CounterValues, MAX_COUNTERS, ProbeEvent};
use crate::profiler::probe::{ProbeId, ProbeInfo};
use serde::Serialize;
use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"PROBETRC";
pub const VERSION: u32 = 1;
/// Bytes of a record without counters.
pub const RECORD_BASE_SIZE: usize = 24;

/// Everything needed to interpret a trace body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceHeader {
    pub calibration: Calibration,
    pub session_start_ticks: u64,
    pub session_start_unix_nanos: u64,
    pub probes: Vec<ProbeInfo>,
    /// Names of the counters carried by each record, in record order.
    pub counters: Vec<String>,
}

impl TraceHeader {
    pub fn record_size(&self) -> usize {
        record_size(self.counters.len())
    }

    /// Exact number of bytes [`write_header`] produces for this header.
    pub fn encoded_len(&self) -> usize {
        let probes: usize = self
            .probes
            .iter()
            .map(|p| 4 + string_size(&p.name) + string_size(&p.location) + string_size(&p.category))
            .sum();
        let counters: usize = self.counters.iter().map(|c| string_size(c)).sum();
        MAGIC.len() + 4 + 8 + 8 + 8 + 4 + probes + 1 + counters
    }

    /// Linear scan; build an index if calling this per record.
    pub fn probe(&self, id: ProbeId) -> Option<&ProbeInfo> {
        self.probes.iter().find(|p| p.id == id)
    }

    pub fn probe_name(&self, id: ProbeId) -> Option<&str> {
        self.probe(id).map(|p| p.name.as_str())
    }

    pub fn lookup(&self, name: &str) -> Option<ProbeId> {
        self.probes.iter().find(|p| p.name == name).map(|p| p.id)
    }
}

pub fn record_size(counter_len: usize) -> usize {
    RECORD_BASE_SIZE + 8 * counter_len
}

fn string_size(s: &str) -> usize {
    2 + s.len().min(u16::MAX as usize)
}

fn write_string(w: &mut impl Write, s: &str) -> io::Result<()> {
    let len = s.len().min(u16::MAX as usize);
    w.write_all(&(len as u16).to_le_bytes())?;
    w.write_all(&s.as_bytes()[..len])
}

pub fn write_header(w: &mut impl Write, header: &TraceHeader) -> io::Result<()> {
    if header.counters.len() > MAX_COUNTERS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} counters exceed the record limit of {MAX_COUNTERS}", header.counters.len()),
        ));
    }
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&header.calibration.cycles_per_second().to_le_bytes())?;
    w.write_all(&header.session_start_ticks.to_le_bytes())?;
    w.write_all(&header.session_start_unix_nanos.to_le_bytes())?;
    w.write_all(&(header.probes.len() as u32).to_le_bytes())?;
    for probe in &header.probes {
        w.write_all(&probe.id.to_u32().to_le_bytes())?;
        write_string(w, &probe.name)?;
        write_string(w, &probe.location)?;
        write_string(w, &probe.category)?;
    }
    w.write_all(&[header.counters.len() as u8])?;
    for counter in &header.counters {
        write_string(w, counter)?;
    }
    Ok(())
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N], FormatError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(FormatError::from_header_io)?;
    Ok(buf)
}

fn read_string(r: &mut impl Read) -> Result<String, FormatError> {
    let len = u16::from_le_bytes(read_array(r)?) as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).map_err(FormatError::from_header_io)?;
    String::from_utf8(bytes).map_err(|_| FormatError::InvalidUtf8)
}

/// Read and validate a header.
pub fn read_header(r: &mut impl Read) -> Result<TraceHeader, FormatError> {
    let magic: [u8; 8] = read_array(r)?;
    if &magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = u32::from_le_bytes(read_array(r)?);
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: version,
            expected: VERSION,
        });
    }
    let cycles_per_second = f64::from_le_bytes(read_array(r)?);
    let calibration = Calibration::from_cycles_per_second(cycles_per_second)
        .ok_or(FormatError::InvalidCalibration(cycles_per_second))?;
    let session_start_ticks = u64::from_le_bytes(read_array(r)?);
    let session_start_unix_nanos = u64::from_le_bytes(read_array(r)?);

    let probe_count = u32::from_le_bytes(read_array(r)?) as usize;
    // Cap the preallocation: a corrupt count must not turn into a huge allocation.
    let mut probes = Vec::with_capacity(probe_count.min(4096));
    for _ in 0..probe_count {
        let id = ProbeId::from_u32(u32::from_le_bytes(read_array(r)?));
        let name = read_string(r)?;
        let location = read_string(r)?;
        let category = read_string(r)?;
        probes.push(ProbeInfo {
            id,
            name,
            location,
            category,
        });
    }

    let [counter_count] = read_array::<1>(r)?;
    let counter_count = counter_count as usize;
    if counter_count > MAX_COUNTERS {
        return Err(FormatError::TooManyCounters(counter_count));
    }
    let counters = (0..counter_count)
        .map(|_| read_string(r))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TraceHeader {
        calibration,
        session_start_ticks,
        session_start_unix_nanos,
        probes,
        counters,
    })
}

/// Write one record. Counter values are padded with zeros or cut to
/// `counter_len` so the stride always matches the header.
pub fn write_record(w: &mut impl Write, event: &ProbeEvent, counter_len: usize) -> io::Result<()> {
    let mut buf = [0u8; RECORD_BASE_SIZE + 8 * MAX_COUNTERS];
    buf[0..4].copy_from_slice(&event.probe_id.to_u32().to_le_bytes());
    buf[4..8].copy_from_slice(&event.thread_id.to_le_bytes());
    buf[8..16].copy_from_slice(&event.sequence.to_le_bytes());
    buf[16..24].copy_from_slice(&event.timestamp.to_le_bytes());
    for (i, value) in event.counters.iter().take(counter_len).enumerate() {
        let at = RECORD_BASE_SIZE + 8 * i;
        buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
    w.write_all(&buf[..record_size(counter_len)])
}

/// Result of reading one record.
#[derive(Debug, PartialEq)]
pub enum RecordRead {
    Record(ProbeEvent),
    /// Clean end of file.
    End,
    /// End of file inside a record; carries the number of bytes present.
    Truncated(usize),
}

/// Read one record of the given counter width.
pub fn read_record(r: &mut impl Read, counter_len: usize) -> io::Result<RecordRead> {
    let size = record_size(counter_len);
    let mut buf = [0u8; RECORD_BASE_SIZE + 8 * MAX_COUNTERS];
    let mut filled = 0;
    while filled < size {
        match r.read(&mut buf[filled..size]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        return Ok(RecordRead::End);
    }
    if filled < size {
        return Ok(RecordRead::Truncated(filled));
    }
    Ok(RecordRead::Record(decode_record(&buf[..size], counter_len)))
}

fn decode_record(buf: &[u8], counter_len: usize) -> ProbeEvent {
    let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[at..at + 8]);
        u64::from_le_bytes(bytes)
    };
    let counters: CounterValues = (0..counter_len)
        .map(|i| u64_at(RECORD_BASE_SIZE + 8 * i))
        .collect();
    ProbeEvent {
        probe_id: ProbeId::from_u32(u32_at(0)),
        thread_id: u32_at(4),
        sequence: u64_at(8),
        timestamp: u64_at(16),
        counters,
    }
}
