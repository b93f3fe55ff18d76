use latency_probe::profiler::{ProbeEvent, TraceHeader, TraceWriter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Returns true when running in CI (GitHub Actions sets CI=true).
#[allow(dead_code)]
pub fn is_ci() -> bool {
    std::env::var("CI").is_ok()
}

/// A [`TraceWriter`] that accumulates all events into a shared `Vec`.
///
/// ```rust,ignore
/// let (writer, events) = CapturingWriter::new();
/// // ... build the profiler with a factory returning writer.clone() ...
/// let captured = events.lock().unwrap();
/// ```
#[derive(Clone)]
pub struct CapturingWriter {
    events: Arc<Mutex<Vec<ProbeEvent>>>,
    headers: Arc<Mutex<Vec<TraceHeader>>>,
    failing: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl CapturingWriter {
    /// Create a new writer and return a handle to the shared event buffer.
    pub fn new() -> (Self, Arc<Mutex<Vec<ProbeEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let writer = CapturingWriter {
            events: events.clone(),
            headers: Arc::default(),
            failing: Arc::default(),
        };
        (writer, events)
    }

    pub fn headers(&self) -> Vec<TraceHeader> {
        self.headers.lock().unwrap().clone()
    }

    /// While set, every event write fails as if the disk were full.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn boxed(&self) -> Box<dyn TraceWriter> {
        Box::new(self.clone())
    }
}

impl TraceWriter for CapturingWriter {
    fn write_header(&mut self, header: &TraceHeader) -> io::Result<()> {
        self.headers.lock().unwrap().push(header.clone());
        Ok(())
    }

    fn write_event(&mut self, event: &ProbeEvent) -> io::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
