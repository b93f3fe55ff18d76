mod common;

use common::CapturingWriter;
use latency_probe::profiler::{
    Calibration, ControlRequest, CounterKind, OverflowPolicy, Profiler, ProbeId, ProbeRegistry,
    ResponseStatus, RotatingWriter, TraceOutput, TraceReader,
};
use std::time::Duration;

fn registry(names: &[&str]) -> (ProbeRegistry, Vec<ProbeId>) {
    let mut builder = ProbeRegistry::builder();
    let ids = names.iter().map(|n| builder.register(*n)).collect();
    (builder.build().unwrap(), ids)
}

fn calibration() -> Calibration {
    Calibration::from_cycles_per_second(1e9).unwrap()
}

#[test]
fn each_session_writes_its_own_trace() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, ids) = registry(&["tick"]);
    let profiler = Profiler::builder()
        .with_output(TraceOutput::file(dir.path().join("run.bin")))
        .with_calibration(calibration())
        .build(registry)
        .unwrap();
    let control = profiler.control();
    let tick = profiler.probe(ids[0]).unwrap();

    for fires in [3, 5] {
        control.start_session().unwrap();
        for _ in 0..fires {
            tick.fire();
        }
        let summary = control.stop_session().unwrap();
        assert_eq!(summary.events_written, fires);
        let mut reader = TraceReader::open(summary.output.unwrap()).unwrap();
        assert_eq!(reader.header().probe_name(ids[0]), Some("tick"));
        let events = reader.read_all().unwrap();
        // Sequences restart with each session's fresh buffer.
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..fires).collect::<Vec<_>>());
    }
    assert!(dir.path().join("run-1.bin").exists());
    assert!(dir.path().join("run-2.bin").exists());
}

#[test]
fn rotating_output_keeps_every_file_self_contained() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, ids) = registry(&["a", "b"]);
    let profiler = Profiler::builder()
        .with_output(TraceOutput::rotating(dir.path().join("rot"), 2048, 1 << 20))
        .with_calibration(calibration())
        .build(registry)
        .unwrap();
    let control = profiler.control();
    let (a, b) = (profiler.probe(ids[0]).unwrap(), profiler.probe(ids[1]).unwrap());

    control.start_session().unwrap();
    for _ in 0..200 {
        a.fire();
        b.fire();
    }
    let summary = control.stop_session().unwrap();
    let base = summary.output.unwrap();
    assert_eq!(base, dir.path().join("rot-1"));

    let mut total = 0;
    let mut index = 0;
    loop {
        let path = RotatingWriter::file_path(&base, index);
        if !path.exists() {
            break;
        }
        let mut reader = TraceReader::open(&path).unwrap();
        assert_eq!(reader.header().probes.len(), 2);
        total += reader.read_all().unwrap().len();
        index += 1;
    }
    assert!(index > 1, "expected rotation, got {index} file(s)");
    assert_eq!(total, 400);
}

#[test]
fn write_failures_are_reported_and_recovered() {
    let (registry, ids) = registry(&["p"]);
    let (writer, events) = CapturingWriter::new();
    let factory_writer = writer.clone();
    let profiler = Profiler::builder()
        .with_writer_factory(move |_| Ok(factory_writer.boxed()))
        .with_flush_interval(Duration::from_secs(3600))
        .with_calibration(calibration())
        .build(registry)
        .unwrap();
    let control = profiler.control();
    let probe = profiler.probe(ids[0]).unwrap();
    control.start_session().unwrap();

    writer.set_failing(true);
    probe.fire();
    probe.fire();
    assert!(control.flush_all().is_err());
    assert!(control.flush_all().is_err());
    let status = control.status();
    assert_eq!(status.write_errors, 2);
    assert!(status.writer_failed);
    assert!(status.recording);

    writer.set_failing(false);
    probe.fire();
    let summary = control.stop_session().unwrap();
    assert_eq!(summary.write_errors, 2);
    assert_eq!(summary.unwritten, 0);
    assert_eq!(events.lock().unwrap().len(), 3);
}

#[test]
fn session_stop_with_a_dead_writer_reports_unwritten_events() {
    let (registry, ids) = registry(&["p"]);
    let (writer, events) = CapturingWriter::new();
    let factory_writer = writer.clone();
    let profiler = Profiler::builder()
        .with_writer_factory(move |_| Ok(factory_writer.boxed()))
        .with_flush_interval(Duration::from_secs(3600))
        .with_calibration(calibration())
        .build(registry)
        .unwrap();
    let control = profiler.control();
    let probe = profiler.probe(ids[0]).unwrap();
    control.start_session().unwrap();
    writer.set_failing(true);
    for _ in 0..7 {
        probe.fire();
    }
    let summary = control.stop_session().unwrap();
    assert_eq!(summary.unwritten, 7);
    assert_eq!(summary.events_written, 0);
    assert!(summary.write_errors >= 1);
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn ring_overflow_drops_oldest_and_flush_on_full_drops_nothing() {
    const CAPACITY: usize = 32;
    for (policy, dropped, inline_flushes, written) in [
        (OverflowPolicy::RingOverwrite, 1, 0, CAPACITY),
        (OverflowPolicy::FlushOnFull, 0, 1, CAPACITY + 1),
    ] {
        let (registry, ids) = registry(&["p"]);
        let (writer, events) = CapturingWriter::new();
        let profiler = Profiler::builder()
            .with_buffer_capacity(CAPACITY)
            .with_overflow_policy(policy)
            .with_writer_factory(move |_| Ok(writer.boxed()))
            .with_flush_interval(Duration::from_secs(3600))
            .with_calibration(calibration())
            .build(registry)
            .unwrap();
        let control = profiler.control();
        let probe = profiler.probe(ids[0]).unwrap();
        control.start_session().unwrap();
        for _ in 0..=CAPACITY {
            probe.fire();
        }
        let summary = control.stop_session().unwrap();
        assert_eq!(summary.dropped, dropped, "{policy:?}");
        assert_eq!(summary.inline_flushes, inline_flushes, "{policy:?}");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), written, "{policy:?}");
        // Ring overwrite loses sequence 0; the survivors stay in order.
        let first = (CAPACITY + 1 - written) as u64;
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (first..=CAPACITY as u64).collect::<Vec<_>>());
    }
}

#[test]
fn counters_either_record_or_degrade() {
    let (registry, ids) = registry(&["p"]);
    let (writer, events) = CapturingWriter::new();
    let factory_writer = writer.clone();
    let profiler = Profiler::builder()
        .with_counters([CounterKind::Instructions, CounterKind::CpuCycles])
        .with_writer_factory(move |_| Ok(factory_writer.boxed()))
        .with_calibration(calibration())
        .build(registry)
        .unwrap();
    let control = profiler.control();
    let probe = profiler.probe(ids[0]).unwrap();
    control.start_session().unwrap();
    probe.fire();
    let mut x = 0u64;
    for i in 0..10_000 {
        x = x.wrapping_mul(31).wrapping_add(i);
    }
    std::hint::black_box(x);
    probe.fire();
    let status = control.status();
    control.stop_session().unwrap();

    let header = &writer.headers()[0];
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    if status.degraded {
        assert!(status.degraded_reason.is_some());
        // Either no counter columns at all, or zero-filled ones.
        assert!(events.iter().all(|e| e.counters.iter().all(|&c| c == 0)));
    } else {
        assert_eq!(header.counters, vec!["instructions", "cpu_cycles"]);
        assert_eq!(events[0].counters.len(), 2);
        assert!(events[1].counters[0] > events[0].counters[0]);
    }
}

#[test]
fn control_requests_drive_a_session() {
    let (registry, ids) = registry(&["p", "q"]);
    let (writer, events) = CapturingWriter::new();
    let profiler = Profiler::builder()
        .with_writer_factory(move |_| Ok(writer.boxed()))
        .with_calibration(calibration())
        .build(registry)
        .unwrap();
    let control = profiler.control();
    let (p, q) = (profiler.probe(ids[0]).unwrap(), profiler.probe(ids[1]).unwrap());

    let run = |json: &str| {
        let request: ControlRequest = serde_json::from_str(json).unwrap();
        request.execute(&control)
    };
    assert_eq!(run(r#"{"command":"start_session"}"#).status, ResponseStatus::Success);
    assert_eq!(
        run(r#"{"command":"disable_probe_by_name","name":"q"}"#).status,
        ResponseStatus::Success
    );
    p.fire();
    q.fire();
    assert_eq!(run(r#"{"command":"flush_all"}"#).status, ResponseStatus::Success);
    let status = run(r#"{"command":"status"}"#);
    assert_eq!(status.value["events_written"], 1);

    assert_eq!(
        run(r#"{"command":"enable_probe","id":1}"#).status,
        ResponseStatus::Success
    );
    q.fire();
    assert_eq!(
        run(r#"{"command":"enable_probe","id":9}"#).status,
        ResponseStatus::Failed
    );
    let stopped = run(r#"{"command":"stop_session"}"#);
    assert_eq!(stopped.value["events_written"], 2);

    let probes: Vec<ProbeId> = events.lock().unwrap().iter().map(|e| e.probe_id).collect();
    assert_eq!(probes, ids);
}
