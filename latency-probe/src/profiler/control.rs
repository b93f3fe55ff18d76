//! Runtime control of a [`Profiler`](crate::profiler::Profiler).
//!
//! [`ControlHandle`] is the in-process API. [`ControlRequest`] and
//! [`ControlResponse`] are the same operations as plain serde values, for
//! whatever transport an attach tool uses to reach the process.

use crate::profiler::error::ControlError;
use crate::profiler::probe::ProbeId;
use crate::profiler::recorder::{Recorder, SessionId, SessionSummary, SharedState};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Cloneable handle for toggling probes and driving sessions from any thread.
#[derive(Clone)]
pub struct ControlHandle {
    pub(crate) shared: Arc<SharedState>,
    pub(crate) recorder: Arc<Mutex<Recorder>>,
}

impl ControlHandle {
    /// Enable probe `id`. Enabling an enabled probe is a no-op.
    pub fn enable_probe(&self, id: ProbeId) -> Result<(), ControlError> {
        self.set_probe(id, true)
    }

    pub fn disable_probe(&self, id: ProbeId) -> Result<(), ControlError> {
        self.set_probe(id, false)
    }

    pub fn enable_probe_by_name(&self, name: &str) -> Result<ProbeId, ControlError> {
        let id = self.resolve(name)?;
        self.set_probe(id, true)?;
        Ok(id)
    }

    pub fn disable_probe_by_name(&self, name: &str) -> Result<ProbeId, ControlError> {
        let id = self.resolve(name)?;
        self.set_probe(id, false)?;
        Ok(id)
    }

    pub fn enable_all(&self) {
        self.shared.registry.set_all_enabled(true);
    }

    pub fn disable_all(&self) {
        self.shared.registry.set_all_enabled(false);
    }

    /// Enable every probe tagged `category`; returns how many there are.
    pub fn enable_category(&self, category: &str) -> usize {
        self.shared.registry.set_category_enabled(category, true)
    }

    pub fn disable_category(&self, category: &str) -> usize {
        self.shared.registry.set_category_enabled(category, false)
    }

    fn resolve(&self, name: &str) -> Result<ProbeId, ControlError> {
        self.shared
            .registry
            .lookup(name)
            .ok_or_else(|| ControlError::UnknownProbeName(name.to_string()))
    }

    fn set_probe(&self, id: ProbeId, enabled: bool) -> Result<(), ControlError> {
        if !self.shared.registry.set_enabled(id, enabled) {
            return Err(ControlError::UnknownProbe(id));
        }
        tracing::debug!(probe = %id, enabled, "probe toggled");
        Ok(())
    }

    /// Open the trace output, write its header and start recording.
    pub fn start_session(&self) -> Result<SessionId, ControlError> {
        self.recorder.lock().unwrap().start_session()
    }

    /// Stop recording, drain every buffer into the trace and close it.
    pub fn stop_session(&self) -> Result<SessionSummary, ControlError> {
        self.recorder.lock().unwrap().stop_session()
    }

    /// Drain every thread buffer into the trace and flush the writer.
    /// Blocks until the write completes. Does nothing outside a session.
    pub fn flush_all(&self) -> Result<(), ControlError> {
        self.recorder
            .lock()
            .unwrap()
            .flush()
            .map_err(ControlError::Write)
    }

    pub fn status(&self) -> Status {
        let session = self.recorder.lock().unwrap().active_session();
        let shared = &self.shared;
        let health = &shared.health;
        let threads: Vec<ThreadStatus> = shared
            .collector
            .buffers()
            .iter()
            .map(|b| ThreadStatus {
                thread_id: b.thread_id(),
                buffered: b.len() as u64,
                written: b.written(),
                dropped: b.dropped(),
                inline_flushes: b.inline_flushes(),
            })
            .collect();
        Status {
            session,
            recording: shared.recording.load(std::sync::atomic::Ordering::Acquire),
            degraded: health.is_degraded(),
            degraded_reason: health.degraded_reason(),
            dropped: shared.collector.dropped(),
            inline_flushes: shared.collector.inline_flushes(),
            write_errors: health.write_errors(),
            last_write_error: health.last_write_error(),
            writer_failed: health.writer_failed(),
            events_written: health.events_written(),
            threads,
        }
    }
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("probes", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

/// Snapshot of the profiler's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub session: Option<SessionId>,
    pub recording: bool,
    /// Hardware counters could not be opened; events carry zeros or no counters.
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    /// Events lost to ring overwrite or the pending limit, all threads.
    pub dropped: u64,
    pub inline_flushes: u64,
    pub write_errors: u64,
    pub last_write_error: Option<String>,
    /// The last write attempt failed and events are being held in memory.
    pub writer_failed: bool,
    pub events_written: u64,
    /// Buffers still registered. Those of exited threads go once drained.
    pub threads: Vec<ThreadStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadStatus {
    pub thread_id: u32,
    /// Events waiting in the buffer for the next flush.
    pub buffered: u64,
    /// Events this thread id appended this session, including those later
    /// dropped. Also the sequence of its next event.
    pub written: u64,
    pub dropped: u64,
    pub inline_flushes: u64,
}

/// A control operation in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    EnableProbe { id: ProbeId },
    DisableProbe { id: ProbeId },
    EnableProbeByName { name: String },
    DisableProbeByName { name: String },
    EnableCategory { category: String },
    DisableCategory { category: String },
    StartSession,
    StopSession,
    FlushAll,
    Status,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    #[default]
    NotReady,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub errors: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

impl ControlResponse {
    fn success(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => ControlResponse {
                status: ResponseStatus::Success,
                errors: String::new(),
                value,
            },
            Err(e) => Self::failed(e),
        }
    }

    fn failed(error: impl std::fmt::Display) -> Self {
        ControlResponse {
            status: ResponseStatus::Failed,
            errors: error.to_string(),
            value: serde_json::Value::Null,
        }
    }

    /// `NotReady` for requests that need a session when there is none.
    fn from_result<T: Serialize>(result: Result<T, ControlError>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(e @ ControlError::NoActiveSession) => ControlResponse {
                status: ResponseStatus::NotReady,
                errors: e.to_string(),
                value: serde_json::Value::Null,
            },
            Err(e) => Self::failed(e),
        }
    }
}

impl ControlRequest {
    pub fn execute(&self, handle: &ControlHandle) -> ControlResponse {
        match self {
            ControlRequest::EnableProbe { id } => ControlResponse::from_result(handle.enable_probe(*id)),
            ControlRequest::DisableProbe { id } => ControlResponse::from_result(handle.disable_probe(*id)),
            ControlRequest::EnableProbeByName { name } => {
                ControlResponse::from_result(handle.enable_probe_by_name(name))
            }
            ControlRequest::DisableProbeByName { name } => {
                ControlResponse::from_result(handle.disable_probe_by_name(name))
            }
            ControlRequest::EnableCategory { category } => {
                ControlResponse::success(handle.enable_category(category))
            }
            ControlRequest::DisableCategory { category } => {
                ControlResponse::success(handle.disable_category(category))
            }
            ControlRequest::StartSession => ControlResponse::from_result(handle.start_session()),
            ControlRequest::StopSession => ControlResponse::from_result(handle.stop_session()),
            ControlRequest::FlushAll => ControlResponse::from_result(handle.flush_all()),
            ControlRequest::Status => ControlResponse::success(handle.status()),
        }
    }
}
