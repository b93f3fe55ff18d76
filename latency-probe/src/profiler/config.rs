use crate::profiler::recorder::SessionId;
use crate::profiler::writer::{NullWriter, RotatingWriter, SimpleBinaryWriter, TraceWriter};
use pmu_counters::CounterKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a thread's recording buffer does when every slot holds an unflushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Overwrite the oldest unflushed event and count it as dropped.
    #[default]
    RingOverwrite,
    /// Drain the buffer synchronously on the producing thread, then append.
    FlushOnFull,
}

/// Where session traces go.
///
/// Each session gets its own trace. The session number is appended to the
/// file stem, so `traces/orders.bin` becomes `traces/orders-1.bin`,
/// `traces/orders-2.bin` and so on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceOutput {
    /// A single file per session.
    File { path: PathBuf },
    /// Size-bounded rotating files per session, see [`RotatingWriter`].
    Rotating {
        path: PathBuf,
        max_file_size: u64,
        max_total_size: u64,
    },
    /// Discard events. Sessions still run and count what they would have written.
    #[default]
    Discard,
}

impl TraceOutput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        TraceOutput::File { path: path.into() }
    }

    pub fn rotating(path: impl Into<PathBuf>, max_file_size: u64, max_total_size: u64) -> Self {
        TraceOutput::Rotating {
            path: path.into(),
            max_file_size,
            max_total_size,
        }
    }

    /// Path of the trace written for `session`. For rotating output this is
    /// the base path; the files themselves are `{base}.{n}.bin`.
    pub fn session_path(&self, session: SessionId) -> Option<PathBuf> {
        match self {
            TraceOutput::File { path } => Some(with_session_suffix(path, session, "bin")),
            TraceOutput::Rotating { path, .. } => Some(rotation_base(path, session)),
            TraceOutput::Discard => None,
        }
    }

    pub(crate) fn open(&self, session: SessionId) -> std::io::Result<Box<dyn TraceWriter>> {
        Ok(match self {
            TraceOutput::File { path } => Box::new(SimpleBinaryWriter::new(with_session_suffix(
                path, session, "bin",
            ))?),
            TraceOutput::Rotating {
                path,
                max_file_size,
                max_total_size,
            } => Box::new(RotatingWriter::new(
                rotation_base(path, session),
                *max_file_size,
                *max_total_size,
            )?),
            TraceOutput::Discard => Box::new(NullWriter),
        })
    }
}

/// `traces/orders.bin` -> `traces/orders-3.bin`.
fn with_session_suffix(path: &Path, session: SessionId, default_ext: &str) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| default_ext.to_string());
    sibling(path, format!("{stem}-{session}.{ext}"))
}

/// `traces/orders.bin` -> `traces/orders-3`; the rotating writer appends `.{n}.bin`.
fn rotation_base(path: &Path, session: SessionId) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    sibling(path, format!("{stem}-{session}"))
}

fn sibling(path: &Path, name: String) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Profiler settings. Serializable so hosts can embed it in their own
/// configuration files; [`Profiler::builder`](crate::profiler::Profiler::builder)
/// offers the same knobs fluently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Events each thread can hold before the overflow policy applies.
    pub buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// How often the background thread drains buffers into the trace.
    pub flush_interval: Duration,
    /// How long to correlate the cycle counter against the system clock at startup.
    pub calibration_window: Duration,
    /// Hardware counters snapshotted with every event. Empty for timestamp-only recording.
    pub counters: Vec<CounterKind>,
    pub output: TraceOutput,
    /// Upper bound on events parked in the collector by flush-on-full
    /// threads while the writer cannot keep up. Past it, inline flushes
    /// count their events as dropped.
    pub max_pending_events: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            buffer_capacity: 8192,
            overflow_policy: OverflowPolicy::RingOverwrite,
            flush_interval: Duration::from_millis(250),
            calibration_window: Duration::from_millis(20),
            counters: Vec::new(),
            output: TraceOutput::Discard,
            max_pending_events: 1 << 20,
        }
    }
}
