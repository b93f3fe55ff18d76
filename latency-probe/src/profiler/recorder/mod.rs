mod event_writer;
mod shared_state;

pub(crate) use shared_state::SharedState;

use event_writer::EventWriter;
use shared_state::SessionInfo;

use crate::profiler::clock::{self, Calibration};
use crate::profiler::config::{OverflowPolicy, ProfilerConfig, TraceOutput};
use crate::profiler::control::ControlHandle;
use crate::profiler::counters::{self, CounterKind};
use crate::profiler::error::ControlError;
use crate::profiler::format::TraceHeader;
use crate::profiler::probe::{Probe, ProbeId, ProbeRegistry};
use crate::profiler::writer::TraceWriter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Numbers the sessions of one profiler, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u32);

impl SessionId {
    pub const fn from_u32(id: u32) -> Self {
        SessionId(id)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Creates the trace writer for each session, for outputs that
/// [`TraceOutput`] cannot describe.
pub trait WriterFactory: Send {
    fn create(&mut self, session: SessionId) -> io::Result<Box<dyn TraceWriter>>;
}

impl<F> WriterFactory for F
where
    F: FnMut(SessionId) -> io::Result<Box<dyn TraceWriter>> + Send,
{
    fn create(&mut self, session: SessionId) -> io::Result<Box<dyn TraceWriter>> {
        self(session)
    }
}

enum Output {
    Configured(TraceOutput),
    Custom(Box<dyn WriterFactory>),
}

impl Output {
    fn open(&mut self, session: SessionId) -> io::Result<(Box<dyn TraceWriter>, Option<PathBuf>)> {
        match self {
            Output::Configured(output) => Ok((output.open(session)?, output.session_path(session))),
            Output::Custom(factory) => Ok((factory.create(session)?, None)),
        }
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: SessionId,
    pub events_written: u64,
    pub dropped: u64,
    pub inline_flushes: u64,
    pub write_errors: u64,
    /// Events still held when the session stopped because the writer kept failing.
    pub unwritten: u64,
    pub degraded: bool,
    pub output: Option<PathBuf>,
    pub duration: Duration,
}

struct ActiveSession {
    id: SessionId,
    event_writer: EventWriter,
    output: Option<PathBuf>,
    started: Instant,
}

pub(crate) struct Recorder {
    shared: Arc<SharedState>,
    calibration: Calibration,
    counters: Vec<CounterKind>,
    output: Output,
    sessions_started: u32,
    active: Option<ActiveSession>,
}

impl Recorder {
    pub(crate) fn active_session(&self) -> Option<SessionId> {
        self.active.as_ref().map(|a| a.id)
    }

    pub(crate) fn start_session(&mut self) -> Result<SessionId, ControlError> {
        if self.active.is_some() {
            return Err(ControlError::SessionActive);
        }
        self.sessions_started += 1;
        let id = SessionId(self.sessions_started);
        let shared = &self.shared;
        shared.health.reset();

        let counters = match counters::check(&self.counters) {
            Ok(()) => self.counters.clone(),
            Err(e) => {
                shared.health.degrade(&e);
                Vec::new()
            }
        };
        let header = TraceHeader {
            calibration: self.calibration,
            session_start_ticks: clock::now(),
            session_start_unix_nanos: clock::unix_nanos_now(),
            probes: shared.registry.probes().to_vec(),
            counters: counters.iter().map(|k| k.name().to_string()).collect(),
        };
        let (writer, output) = self.output.open(id).map_err(ControlError::Output)?;
        let event_writer = EventWriter::start(writer, &header).map_err(ControlError::Output)?;

        shared.collector.reset();
        let key = shared_state::next_session_key();
        shared.session.store(Some(Arc::new(SessionInfo { id, key, counters })));
        shared.session_key.store(key, Ordering::Release);
        shared.recording.store(true, Ordering::Release);

        tracing::info!(
            session = %id,
            output = ?output,
            degraded = shared.health.is_degraded(),
            "profiling session started"
        );
        self.active = Some(ActiveSession {
            id,
            event_writer,
            output,
            started: Instant::now(),
        });
        Ok(id)
    }

    pub(crate) fn stop_session(&mut self) -> Result<SessionSummary, ControlError> {
        let Some(mut active) = self.active.take() else {
            return Err(ControlError::NoActiveSession);
        };
        let shared = &self.shared;
        shared.recording.store(false, Ordering::SeqCst);
        shared.wait_for_writers();
        if let Err(error) = flush_session(shared, &mut active) {
            tracing::warn!(%error, session = %active.id, "final flush failed");
        }
        // Left behind only when the writer failed.
        let stranded = shared.collector.discard();
        shared.session_key.store(0, Ordering::Release);
        shared.session.store(None);

        let summary = SessionSummary {
            session: active.id,
            events_written: shared.health.events_written(),
            dropped: shared.collector.dropped(),
            inline_flushes: shared.collector.inline_flushes(),
            write_errors: shared.health.write_errors(),
            unwritten: active.event_writer.backlog_len() + stranded,
            degraded: shared.health.is_degraded(),
            output: active.output,
            duration: active.started.elapsed(),
        };
        tracing::info!(
            session = %summary.session,
            events_written = summary.events_written,
            dropped = summary.dropped,
            write_errors = summary.write_errors,
            "profiling session stopped"
        );
        Ok(summary)
    }

    /// Move everything recorded so far into the trace.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self.active.as_mut() {
            Some(active) => flush_session(&self.shared, active),
            None => Ok(()),
        }
    }
}

fn flush_session(shared: &SharedState, active: &mut ActiveSession) -> io::Result<()> {
    let health = &shared.health;
    // While the writer is failing, leave events in the thread buffers so
    // the overflow policy, not this thread, decides what gets lost.
    if active.event_writer.has_backlog() {
        active.event_writer.write_backlog(health)?;
    }
    let batches = shared.collector.drain();
    active.event_writer.write(batches, health)?;
    active.event_writer.flush(health)
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.active.is_some() {
            let _ = self.stop_session();
        }
    }
}

/// An instrumented process's profiler: owns the probe registry, the
/// background flush thread and the session state.
///
/// Dropping it stops any active session and writes out what was recorded.
pub struct Profiler {
    handle: ControlHandle,
    calibration: Calibration,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Profiler {
    pub fn builder() -> ProfilerBuilder {
        ProfilerBuilder {
            config: ProfilerConfig::default(),
            calibration: None,
            writer_factory: None,
        }
    }

    /// Handle for firing probe `id`, if it is registered.
    pub fn probe(&self, id: ProbeId) -> Option<Probe> {
        let shared = &self.handle.shared;
        shared.registry.info(id)?;
        Some(Probe::new(id, shared.clone()))
    }

    pub fn probe_by_name(&self, name: &str) -> Option<Probe> {
        let id = self.handle.shared.registry.lookup(name)?;
        self.probe(id)
    }

    pub fn registry(&self) -> &ProbeRegistry {
        &self.handle.shared.registry
    }

    /// Get a cheap, cloneable handle for controlling the profiler from other
    /// threads.
    pub fn control(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        let mut recorder = self.handle.recorder.lock().unwrap();
        if recorder.active.is_some() {
            let _ = recorder.stop_session();
        }
    }
}

pub struct ProfilerBuilder {
    config: ProfilerConfig,
    calibration: Option<Calibration>,
    writer_factory: Option<Box<dyn WriterFactory>>,
}

impl ProfilerBuilder {
    /// Replace every setting at once, e.g. with one loaded from a file.
    pub fn with_config(mut self, config: ProfilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_buffer_capacity(mut self, events: usize) -> Self {
        self.config.buffer_capacity = events;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow_policy = policy;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn with_calibration_window(mut self, window: Duration) -> Self {
        self.config.calibration_window = window;
        self
    }

    /// Snapshot these hardware counters with every event. Sessions fall back
    /// to timestamps only if the counters cannot be opened.
    pub fn with_counters(mut self, counters: impl IntoIterator<Item = CounterKind>) -> Self {
        self.config.counters = counters.into_iter().collect();
        self
    }

    pub fn with_output(mut self, output: TraceOutput) -> Self {
        self.config.output = output;
        self.writer_factory = None;
        self
    }

    /// Build each session's writer with `factory` instead of a [`TraceOutput`].
    pub fn with_writer_factory<F>(self, factory: F) -> Self
    where
        F: FnMut(SessionId) -> io::Result<Box<dyn TraceWriter>> + Send + 'static,
    {
        self.with_factory(factory)
    }

    pub fn with_factory(mut self, factory: impl WriterFactory + 'static) -> Self {
        self.writer_factory = Some(Box::new(factory));
        self
    }

    pub fn with_max_pending_events(mut self, events: usize) -> Self {
        self.config.max_pending_events = events;
        self
    }

    /// Skip measuring the tick frequency and use this one.
    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// Calibrate the clock, start the flush thread and return the profiler.
    /// No session is active yet.
    pub fn build(self, registry: ProbeRegistry) -> io::Result<Profiler> {
        let config = self.config;
        let calibration = self
            .calibration
            .unwrap_or_else(|| Calibration::measure(config.calibration_window));
        tracing::info!(
            cycles_per_second = calibration.cycles_per_second(),
            probes = registry.len(),
            buffer_capacity = config.buffer_capacity,
            overflow_policy = ?config.overflow_policy,
            "profiler initialized"
        );

        let shared = Arc::new(SharedState::new(
            registry,
            config.buffer_capacity,
            config.overflow_policy,
            config.max_pending_events,
        ));
        let output = match self.writer_factory {
            Some(factory) => Output::Custom(factory),
            None => Output::Configured(config.output),
        };
        let recorder = Arc::new(Mutex::new(Recorder {
            shared: shared.clone(),
            calibration,
            counters: config.counters,
            output,
            sessions_started: 0,
            active: None,
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let flush_interval = config.flush_interval;
        let thread = {
            let rec = recorder.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("probe-flush".into())
                .spawn(move || {
                    let poll = poll_interval(flush_interval);
                    let mut last_flush = Instant::now();
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(poll);
                        let now = Instant::now();
                        if now.duration_since(last_flush) >= flush_interval {
                            last_flush = now;
                            // Failures are counted in the health state.
                            let _ = rec.lock().unwrap().flush();
                        }
                    }
                })?
        };

        Ok(Profiler {
            handle: ControlHandle { shared, recorder },
            calibration,
            stop,
            thread: Some(thread),
        })
    }
}

/// How often the flush thread wakes up to check whether a flush is due.
fn poll_interval(flush_interval: Duration) -> Duration {
    flush_interval.clamp(Duration::from_millis(1), Duration::from_millis(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::events::ProbeEvent;
    use std::sync::Mutex as StdMutex;

    /// Writer that records everything and can be told to fail.
    #[derive(Clone, Default)]
    struct TestWriter {
        events: Arc<StdMutex<Vec<ProbeEvent>>>,
        headers: Arc<StdMutex<Vec<TraceHeader>>>,
        failing: Arc<AtomicBool>,
    }

    impl TraceWriter for TestWriter {
        fn write_header(&mut self, header: &TraceHeader) -> io::Result<()> {
            self.headers.lock().unwrap().push(header.clone());
            Ok(())
        }
        fn write_event(&mut self, event: &ProbeEvent) -> io::Result<()> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(io::Error::other("disk full"));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn profiler(policy: OverflowPolicy, capacity: usize) -> (Profiler, TestWriter, ProbeId) {
        let mut builder = ProbeRegistry::builder();
        let id = builder.register("p");
        let registry = builder.build().unwrap();
        let writer = TestWriter::default();
        let factory_writer = writer.clone();
        let profiler = Profiler::builder()
            .with_buffer_capacity(capacity)
            .with_overflow_policy(policy)
            // Keep the background thread out of the way; tests flush explicitly.
            .with_flush_interval(Duration::from_secs(3600))
            .with_calibration(Calibration::from_cycles_per_second(1e9).unwrap())
            .with_writer_factory(move |_| Ok(Box::new(factory_writer.clone())))
            .build(registry)
            .unwrap();
        (profiler, writer, id)
    }

    #[test]
    fn ring_overwrite_counts_one_drop_for_one_extra_event() {
        const C: usize = 16;
        let (profiler, writer, id) = profiler(OverflowPolicy::RingOverwrite, C);
        let control = profiler.control();
        control.start_session().unwrap();
        let probe = profiler.probe(id).unwrap();
        for _ in 0..=C {
            probe.fire();
        }
        let status = control.status();
        assert_eq!(status.dropped, 1);
        assert_eq!(status.inline_flushes, 0);

        let summary = control.stop_session().unwrap();
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.events_written, C as u64);
        assert_eq!(writer.events.lock().unwrap().len(), C);
    }

    #[test]
    fn flush_on_full_flushes_once_and_drops_nothing() {
        const C: usize = 16;
        let (profiler, writer, id) = profiler(OverflowPolicy::FlushOnFull, C);
        let control = profiler.control();
        control.start_session().unwrap();
        let probe = profiler.probe(id).unwrap();
        for _ in 0..=C {
            probe.fire();
        }
        let status = control.status();
        assert_eq!(status.inline_flushes, 1);
        assert_eq!(status.dropped, 0);

        control.stop_session().unwrap();
        let events = writer.events.lock().unwrap();
        assert_eq!(events.len(), C + 1);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..=C as u64).collect::<Vec<_>>());
    }

    #[test]
    fn disabled_probe_never_appends() {
        let (profiler, writer, id) = profiler(OverflowPolicy::RingOverwrite, 64);
        let control = profiler.control();
        control.start_session().unwrap();
        let probe = profiler.probe(id).unwrap();

        probe.fire();
        control.flush_all().unwrap();
        let buffered_before: u64 = status_buffered(&control);

        control.disable_probe(id).unwrap();
        control.disable_probe(id).unwrap();
        assert!(!probe.is_enabled());
        for _ in 0..1000 {
            probe.fire();
        }
        assert_eq!(status_buffered(&control), buffered_before);
        control.stop_session().unwrap();
        assert_eq!(writer.events.lock().unwrap().len(), 1);
    }

    fn status_buffered(control: &ControlHandle) -> u64 {
        control.status().threads.iter().map(|t| t.buffered).sum()
    }

    #[test]
    fn probes_outside_a_session_record_nothing() {
        let (profiler, writer, id) = profiler(OverflowPolicy::RingOverwrite, 64);
        let probe = profiler.probe(id).unwrap();
        probe.fire();
        let control = profiler.control();
        control.start_session().unwrap();
        control.stop_session().unwrap();
        probe.fire();
        assert!(writer.events.lock().unwrap().is_empty());
    }

    #[test]
    fn session_lifecycle_errors() {
        let (profiler, writer, _) = profiler(OverflowPolicy::RingOverwrite, 64);
        let control = profiler.control();
        assert!(matches!(
            control.stop_session(),
            Err(ControlError::NoActiveSession)
        ));
        assert_eq!(control.start_session().unwrap(), SessionId::from_u32(1));
        assert!(matches!(
            control.start_session(),
            Err(ControlError::SessionActive)
        ));
        control.stop_session().unwrap();
        assert_eq!(control.start_session().unwrap(), SessionId::from_u32(2));
        assert_eq!(writer.headers.lock().unwrap().len(), 2);
    }

    #[test]
    fn write_failure_holds_events_until_recovery() {
        let (profiler, writer, id) = profiler(OverflowPolicy::RingOverwrite, 64);
        let control = profiler.control();
        control.start_session().unwrap();
        let probe = profiler.probe(id).unwrap();

        writer.failing.store(true, Ordering::Relaxed);
        for _ in 0..10 {
            probe.fire();
        }
        assert!(control.flush_all().is_err());
        let status = control.status();
        assert_eq!(status.write_errors, 1);
        assert!(status.writer_failed);
        assert_eq!(status.last_write_error.as_deref(), Some("disk full"));

        // Recording continues while the writer is down.
        for _ in 0..5 {
            probe.fire();
        }
        writer.failing.store(false, Ordering::Relaxed);
        control.flush_all().unwrap();
        let status = control.status();
        assert!(!status.writer_failed);
        assert_eq!(status.events_written, 15);

        let events = writer.events.lock().unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..15).collect::<Vec<_>>());
    }

    #[test]
    fn each_thread_gets_its_own_ordered_stream() {
        let (profiler, writer, id) = profiler(OverflowPolicy::RingOverwrite, 1024);
        let control = profiler.control();
        control.start_session().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let probe = profiler.probe(id).unwrap();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        probe.fire();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let summary = control.stop_session().unwrap();
        assert_eq!(summary.events_written, 2000);

        let events = writer.events.lock().unwrap();
        let threads = crate::profiler::reader::split_by_thread(&events);
        assert_eq!(threads.len(), 4);
        for stream in threads.values() {
            let sequences: Vec<u64> = stream.iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, (0..500).collect::<Vec<_>>());
            for pair in stream.windows(2) {
                assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }
    }

    fn sequences(writer: &TestWriter) -> Vec<u64> {
        writer.events.lock().unwrap().iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn one_thread_keeps_one_stream_per_profiler() {
        let (first, first_writer, a) = profiler(OverflowPolicy::RingOverwrite, 64);
        let (second, second_writer, b) = profiler(OverflowPolicy::RingOverwrite, 64);
        first.control().start_session().unwrap();
        second.control().start_session().unwrap();
        let (a, b) = (first.probe(a).unwrap(), second.probe(b).unwrap());

        for _ in 0..5 {
            a.fire();
            b.fire();
        }
        assert_eq!(first.control().status().threads.len(), 1);
        assert_eq!(second.control().status().threads.len(), 1);

        first.control().stop_session().unwrap();
        second.control().stop_session().unwrap();
        assert_eq!(sequences(&first_writer), (0..5).collect::<Vec<_>>());
        assert_eq!(sequences(&second_writer), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn stop_while_recording_writes_every_accepted_event() {
        for _ in 0..50 {
            let (profiler, writer, id) = profiler(OverflowPolicy::FlushOnFull, 1024);
            let control = profiler.control();
            control.start_session().unwrap();
            let probe = profiler.probe(id).unwrap();
            let started = Arc::new(AtomicBool::new(false));
            let done = Arc::new(AtomicBool::new(false));
            let worker = {
                let (started, done) = (started.clone(), done.clone());
                std::thread::spawn(move || {
                    for i in 0..200_000 {
                        probe.fire();
                        if i == 0 {
                            started.store(true, Ordering::Release);
                        }
                        if done.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                })
            };
            while !started.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }

            let summary = control.stop_session().unwrap();
            assert_eq!(status_buffered(&control), 0);
            done.store(true, Ordering::Relaxed);
            worker.join().unwrap();

            assert_eq!(status_buffered(&control), 0);
            assert_eq!(summary.dropped, 0);
            assert_eq!(summary.unwritten, 0);
            let written = sequences(&writer);
            assert_eq!(written.len() as u64, summary.events_written);
            assert_eq!(written, (0..summary.events_written).collect::<Vec<_>>());
        }
    }

    #[test]
    fn exited_threads_do_not_accumulate_buffers() {
        let (profiler, writer, id) = profiler(OverflowPolicy::RingOverwrite, 64);
        let control = profiler.control();
        control.start_session().unwrap();

        for _ in 0..32 {
            let probe = profiler.probe(id).unwrap();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    probe.fire();
                }
            })
            .join()
            .unwrap();
            control.flush_all().unwrap();
            assert!(control.status().threads.is_empty());
        }

        let summary = control.stop_session().unwrap();
        assert_eq!(summary.events_written, 320);
        assert_eq!(summary.dropped, 0);
        // A reused thread id picks up where the earlier thread stopped.
        let events = writer.events.lock().unwrap();
        for stream in crate::profiler::reader::split_by_thread(&events).values() {
            let first = stream[0].sequence;
            let sequences: Vec<u64> = stream.iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, (first..first + stream.len() as u64).collect::<Vec<_>>());
            assert_eq!(first, 0);
        }
    }

    #[test]
    fn flush_thread_polls_at_least_every_millisecond() {
        assert_eq!(poll_interval(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(poll_interval(Duration::from_millis(3)), Duration::from_millis(3));
        assert_eq!(poll_interval(Duration::from_secs(3600)), Duration::from_millis(5));
    }

    #[test]
    fn zero_flush_interval_still_flushes() {
        let mut builder = ProbeRegistry::builder();
        let id = builder.register("p");
        let writer = TestWriter::default();
        let factory_writer = writer.clone();
        let profiler = Profiler::builder()
            .with_flush_interval(Duration::ZERO)
            .with_calibration(Calibration::from_cycles_per_second(1e9).unwrap())
            .with_writer_factory(move |_| Ok(Box::new(factory_writer.clone())))
            .build(builder.build().unwrap())
            .unwrap();
        profiler.control().start_session().unwrap();
        profiler.probe(id).unwrap().fire();
        let deadline = Instant::now() + Duration::from_secs(5);
        while writer.events.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sequences(&writer), vec![0]);
    }
}
