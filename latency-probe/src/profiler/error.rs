//! Error types for the offline and control paths.
//!
//! The recording path never returns errors: buffer overflow and write
//! failures are counted and surfaced through
//! [`ControlHandle::status`](crate::profiler::control::ControlHandle::status).

use crate::profiler::events::ProbeEvent;
use crate::profiler::probe::ProbeId;
use std::io;
use thiserror::Error;

/// A trace file could not be decoded.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("bad trace magic {0:?}")]
    BadMagic([u8; 8]),
    #[error("unsupported trace schema version {found} (this build reads {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("trace header is truncated")]
    TruncatedHeader,
    #[error("trace header declares an invalid calibration of {0} cycles/s")]
    InvalidCalibration(f64),
    #[error("trace header declares {0} counters, more than a record can carry")]
    TooManyCounters(usize),
    #[error("string in trace header is not valid UTF-8")]
    InvalidUtf8,
    #[error("record {index} references probe {probe_id}, which is missing from the probe map")]
    UnknownProbe { index: u64, probe_id: ProbeId },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FormatError {
    /// Map an I/O error hit while reading the header, where an early EOF
    /// means the header itself is incomplete.
    pub(crate) fn from_header_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::TruncatedHeader
        } else {
            FormatError::Io(err)
        }
    }
}

/// Decoding stopped at a corrupt record. Everything decoded before the error
/// is kept in `partial`.
#[derive(Error, Debug)]
#[error("trace decode stopped after {} events: {error}", .partial.len())]
pub struct DecodeFailure {
    pub partial: Vec<ProbeEvent>,
    #[source]
    pub error: FormatError,
}

impl From<FormatError> for DecodeFailure {
    fn from(error: FormatError) -> Self {
        DecodeFailure {
            partial: Vec::new(),
            error,
        }
    }
}

/// Probe registration was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("probe name {0:?} is registered twice")]
    DuplicateName(String),
    #[error("probe name is empty")]
    EmptyName,
    #[error("probe {field} is {len} bytes, longer than the trace format allows")]
    StringTooLong { field: &'static str, len: usize },
    #[error("too many probes registered")]
    TooManyProbes,
}

/// A control operation could not be carried out.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("unknown probe id {0}")]
    UnknownProbe(ProbeId),
    #[error("unknown probe name {0:?}")]
    UnknownProbeName(String),
    #[error("a profiling session is already active")]
    SessionActive,
    #[error("no profiling session is active")]
    NoActiveSession,
    #[error("failed to open trace output: {0}")]
    Output(#[source] io::Error),
    #[error("failed to write trace: {0}")]
    Write(#[source] io::Error),
}

/// Hardware counters could not be used. Never fatal: the profiler records
/// timestamps only and reports the reason through its status.
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("performance counters unavailable: {0}")]
    Unavailable(#[source] io::Error),
    #[error("{requested} counters requested, at most {max} are recorded per event")]
    TooMany { requested: usize, max: usize },
}
