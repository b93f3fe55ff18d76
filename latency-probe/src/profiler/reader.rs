//! Trace decoding.
//!
//! [`TraceReader`] validates the header, then replays records in file order.
//! A trailing partial record is dropped silently; a record naming a probe
//! that the header does not declare is corruption and stops decoding, with
//! everything before it handed back in [`DecodeFailure::partial`].

use crate::profiler::error::{DecodeFailure, FormatError};
use crate::profiler::events::ProbeEvent;
use crate::profiler::format::{self, RecordRead, TraceHeader};
use crate::profiler::probe::ProbeId;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

pub struct TraceReader<R = BufReader<File>> {
    reader: R,
    header: TraceHeader,
    header_len: u64,
    known_probes: HashSet<ProbeId>,
    /// Index of the next record `read_event` returns.
    next_index: u64,
    truncated_tail: Option<usize>,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> TraceReader<R> {
    /// Read and validate the header.
    pub fn new(mut reader: R) -> Result<Self, FormatError> {
        let header = format::read_header(&mut reader)?;
        let known_probes = header.probes.iter().map(|p| p.id).collect();
        Ok(Self {
            reader,
            header_len: header.encoded_len() as u64,
            header,
            known_probes,
            next_index: 0,
            truncated_tail: None,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Bytes of the partial record dropped at end of file, if there was one.
    pub fn truncated_tail(&self) -> Option<usize> {
        self.truncated_tail
    }

    /// Next record in file order, or `None` at end of file.
    pub fn read_event(&mut self) -> Result<Option<ProbeEvent>, FormatError> {
        match format::read_record(&mut self.reader, self.header.counters.len())? {
            RecordRead::End => Ok(None),
            RecordRead::Truncated(bytes) => {
                self.truncated_tail = Some(bytes);
                Ok(None)
            }
            RecordRead::Record(event) => {
                let index = self.next_index;
                self.next_index += 1;
                if !self.known_probes.contains(&event.probe_id) {
                    return Err(FormatError::UnknownProbe {
                        index,
                        probe_id: event.probe_id,
                    });
                }
                Ok(Some(event))
            }
        }
    }

    /// Every remaining record.
    pub fn read_all(&mut self) -> Result<Vec<ProbeEvent>, DecodeFailure> {
        let mut events = Vec::new();
        loop {
            match self.read_event() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => return Ok(events),
                Err(error) => {
                    return Err(DecodeFailure {
                        partial: events,
                        error,
                    });
                }
            }
        }
    }
}

impl<R: Read + Seek> TraceReader<R> {
    /// Number of complete records in the trace.
    pub fn record_count(&mut self) -> Result<u64, FormatError> {
        let position = self.reader.stream_position()?;
        let end = self.reader.seek(SeekFrom::End(0))?;
        self.reader.seek(SeekFrom::Start(position))?;
        Ok(end.saturating_sub(self.header_len) / self.header.record_size() as u64)
    }

    /// Random access to record `index`. Leaves the reader positioned after
    /// that record, so `read_event` continues from `index + 1`.
    pub fn record_at(&mut self, index: u64) -> Result<Option<ProbeEvent>, FormatError> {
        let Some(offset) = index
            .checked_mul(self.header.record_size() as u64)
            .and_then(|o| o.checked_add(self.header_len))
        else {
            return Ok(None);
        };
        self.reader.seek(SeekFrom::Start(offset))?;
        self.next_index = index;
        self.read_event()
    }
}

/// A fully decoded trace.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedTrace {
    pub header: TraceHeader,
    pub events: Vec<ProbeEvent>,
    /// Bytes of a partial trailing record that were dropped, if any.
    pub truncated_tail: Option<usize>,
}

impl DecodedTrace {
    /// Events grouped per thread, each group in file (= sequence) order.
    pub fn by_thread(&self) -> BTreeMap<u32, Vec<ProbeEvent>> {
        split_by_thread(&self.events)
    }
}

pub fn decode<R: Read>(reader: R) -> Result<DecodedTrace, DecodeFailure> {
    let mut reader = TraceReader::new(reader)?;
    let events = reader.read_all()?;
    Ok(DecodedTrace {
        header: reader.header,
        events,
        truncated_tail: reader.truncated_tail,
    })
}

pub fn decode_file(path: impl AsRef<Path>) -> Result<DecodedTrace, DecodeFailure> {
    let file = File::open(path).map_err(FormatError::Io)?;
    decode(BufReader::new(file))
}

/// Order events from many threads by timestamp. Ties break on thread id and
/// then sequence, so each thread's own order is kept.
pub fn interleave_by_time(events: &mut [ProbeEvent]) {
    events.sort_by_key(|e| (e.timestamp, e.thread_id, e.sequence));
}

pub fn split_by_thread(events: &[ProbeEvent]) -> BTreeMap<u32, Vec<ProbeEvent>> {
    let mut threads: BTreeMap<u32, Vec<ProbeEvent>> = BTreeMap::new();
    for event in events {
        threads.entry(event.thread_id).or_default().push(event.clone());
    }
    threads
}
