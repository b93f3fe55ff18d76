use crate::profiler::events::ProbeEvent;
use crate::profiler::format::{self, TraceHeader};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for one session's trace.
///
/// The recorder calls [`write_header`](Self::write_header) exactly once,
/// before any event.
pub trait TraceWriter: Send {
    fn write_header(&mut self, header: &TraceHeader) -> io::Result<()>;
    fn write_event(&mut self, event: &ProbeEvent) -> io::Result<()>;
    fn write_batch(&mut self, events: &[ProbeEvent]) -> io::Result<()> {
        for event in events {
            self.write_event(event)?;
        }
        Ok(())
    }
    fn flush(&mut self) -> io::Result<()>;
    /// Returns true if the writer rotated to a new file since the last call to this method.
    fn take_rotated(&mut self) -> bool {
        false
    }
}

fn header_missing() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "trace header must be written before events",
    )
}

pub struct SimpleBinaryWriter {
    writer: BufWriter<File>,
    counter_len: Option<usize>,
}

impl SimpleBinaryWriter {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            counter_len: None,
        })
    }
}

impl TraceWriter for SimpleBinaryWriter {
    fn write_header(&mut self, header: &TraceHeader) -> io::Result<()> {
        format::write_header(&mut self.writer, header)?;
        self.counter_len = Some(header.counters.len());
        Ok(())
    }

    fn write_event(&mut self, event: &ProbeEvent) -> io::Result<()> {
        let counter_len = self.counter_len.ok_or_else(header_missing)?;
        format::write_record(&mut self.writer, event, counter_len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// A writer that discards all events. Useful for benchmarking probe
/// overhead without I/O costs.
pub struct NullWriter;

impl TraceWriter for NullWriter {
    fn write_header(&mut self, _header: &TraceHeader) -> io::Result<()> {
        Ok(())
    }
    fn write_event(&mut self, _event: &ProbeEvent) -> io::Result<()> {
        Ok(())
    }
    fn write_batch(&mut self, _events: &[ProbeEvent]) -> io::Result<()> {
        Ok(())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A writer that rotates trace files to bound disk usage.
///
/// - `max_file_size`: rotate to a new file when the current file would exceed this size
/// - `max_total_size`: delete oldest files when total size across all files exceeds this
///
/// Files are named `{base_path}.0.bin`, `{base_path}.1.bin`, etc.
/// Each file is a self-contained trace with its own copy of the header.
pub struct RotatingWriter {
    base_path: PathBuf,
    max_file_size: u64,
    max_total_size: u64,
    header: Option<TraceHeader>,
    /// Tracks (path, size) of files oldest-first.
    files: VecDeque<(PathBuf, u64)>,
    total_size: u64,
    current_writer: Option<BufWriter<File>>,
    current_size: u64,
    next_index: u32,
    /// Set when we've hit the total size cap; silently drops further events.
    stopped: bool,
    /// Set to true when a rotation occurs; cleared by `take_rotated`.
    rotated: bool,
}

impl RotatingWriter {
    pub fn new(
        base_path: impl Into<PathBuf>,
        max_file_size: u64,
        max_total_size: u64,
    ) -> io::Result<Self> {
        let base_path = base_path.into();
        if let Some(parent) = base_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            base_path,
            max_file_size,
            max_total_size,
            header: None,
            files: VecDeque::new(),
            total_size: 0,
            current_writer: None,
            current_size: 0,
            next_index: 0,
            stopped: false,
            rotated: false,
        })
    }

    pub fn file_path(base: &Path, index: u32) -> PathBuf {
        let stem = base.file_name().unwrap_or_default().to_string_lossy();
        let parent = base.parent().unwrap_or(Path::new("."));
        parent.join(format!("{}.{}.bin", stem, index))
    }

    /// Paths of the files still on disk, oldest first.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|(path, _)| path.as_path())
    }

    fn open_next(&mut self) -> io::Result<()> {
        let header = self.header.as_ref().ok_or_else(header_missing)?;
        if let Some(mut writer) = self.current_writer.take() {
            writer.flush()?;
        }
        if let Some(last) = self.files.back_mut() {
            last.1 = self.current_size;
        }

        let new_path = Self::file_path(&self.base_path, self.next_index);
        let mut writer = BufWriter::new(File::create(&new_path)?);
        format::write_header(&mut writer, header)?;
        let header_size = header.encoded_len() as u64;
        if self.next_index > 0 {
            self.rotated = true;
            tracing::debug!(path = %new_path.display(), "rotated trace file");
        }
        self.next_index += 1;
        self.current_writer = Some(writer);
        self.current_size = header_size;
        self.total_size += header_size;
        self.files.push_back((new_path, header_size));

        self.evict_oldest();
        Ok(())
    }

    fn evict_oldest(&mut self) {
        // Always keep at least the current file.
        while self.total_size > self.max_total_size && self.files.len() > 1 {
            if let Some((path, size)) = self.files.pop_front() {
                self.total_size -= size;
                let _ = fs::remove_file(&path);
                tracing::debug!(path = %path.display(), "evicted trace file");
            }
        }
        // If even the current file alone exceeds total budget, stop writing.
        if self.total_size > self.max_total_size {
            self.stop();
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            tracing::warn!(
                max_total_size = self.max_total_size,
                "trace size budget exhausted, dropping further events"
            );
        }
        self.stopped = true;
    }

    fn write_event_inner(&mut self, event: &ProbeEvent) -> io::Result<()> {
        if self.stopped {
            return Ok(());
        }
        let counter_len = self
            .header
            .as_ref()
            .ok_or_else(header_missing)?
            .counters
            .len();
        let event_size = format::record_size(counter_len) as u64;
        if self.current_size + event_size > self.max_file_size {
            self.open_next()?;
            if self.stopped {
                return Ok(());
            }
        }
        let writer = self.current_writer.as_mut().ok_or_else(header_missing)?;
        format::write_record(writer, event, counter_len)?;
        self.current_size += event_size;
        self.total_size += event_size;
        // Update tracked size for current file.
        if let Some(last) = self.files.back_mut() {
            last.1 = self.current_size;
        }
        // Check if we've exceeded budget even without rotation
        if self.total_size > self.max_total_size {
            writer.flush()?;
            self.stop();
        }
        Ok(())
    }
}

impl TraceWriter for RotatingWriter {
    fn write_header(&mut self, header: &TraceHeader) -> io::Result<()> {
        self.header = Some(header.clone());
        self.open_next()
    }

    fn write_event(&mut self, event: &ProbeEvent) -> io::Result<()> {
        self.write_event_inner(event)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(writer) = self.current_writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn take_rotated(&mut self) -> bool {
        std::mem::replace(&mut self.rotated, false)
    }
}
