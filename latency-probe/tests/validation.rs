use assert2::check;
use latency_probe::profiler::{DecodedTrace, ProbeEvent, Report, SessionSummary};
use std::collections::BTreeMap;

/// What the workload did, for checking a decoded trace against it.
pub struct Workload {
    pub threads: usize,
    pub transactions_per_thread: usize,
    /// Probes fired per transaction, in order.
    pub probes: Vec<&'static str>,
}

impl Workload {
    pub fn events_per_thread(&self) -> usize {
        self.transactions_per_thread * self.probes.len()
    }
}

/// Validate that a decoded trace contains exactly what the workload recorded:
/// every thread's stream complete, gapless and in order.
#[allow(dead_code)]
pub fn validate_trace_matches_workload(
    trace: &DecodedTrace,
    summary: &SessionSummary,
    workload: &Workload,
) {
    let threads: BTreeMap<u32, Vec<ProbeEvent>> = trace.by_thread();

    eprintln!("=== Session ===");
    eprintln!(
        "  events_written={} dropped={} inline_flushes={} write_errors={}",
        summary.events_written, summary.dropped, summary.inline_flushes, summary.write_errors
    );
    eprintln!("=== Trace ===");
    for (tid, events) in &threads {
        eprintln!("  thread {tid}: {} events", events.len());
    }

    check!(summary.dropped == 0);
    check!(summary.write_errors == 0);
    check!(summary.unwritten == 0);
    check!(trace.truncated_tail.is_none());
    check!(trace.events.len() as u64 == summary.events_written);
    check!(threads.len() == workload.threads);

    let names: Vec<&str> = workload.probes.clone();
    for (tid, events) in &threads {
        check!(events.len() == workload.events_per_thread(), "thread {tid}");
        for (i, event) in events.iter().enumerate() {
            check!(event.sequence == i as u64, "thread {tid} event {i}");
            let name = trace.header.probe_name(event.probe_id);
            check!(name == Some(names[i % names.len()]), "thread {tid} event {i}");
        }
        for pair in events.windows(2) {
            check!(pair[0].timestamp <= pair[1].timestamp, "thread {tid}");
        }
    }
}

/// Validate that the latency report covers every consecutive probe pair of
/// the workload with one sample per transaction.
#[allow(dead_code)]
pub fn validate_report_matches_workload(report: &Report, trace: &DecodedTrace, workload: &Workload) {
    let expected = (workload.threads * workload.transactions_per_thread) as u64;
    check!(report.counts.ingested == expected);
    check!(report.counts.incomplete == 0);
    check!(report.counts.anomalies == 0);

    let id = |name: &str| trace.header.lookup(name).unwrap();
    for pair in workload.probes.windows(2) {
        let stat = report.latency(id(pair[0]), id(pair[1]));
        check!(stat.map(|s| s.count()) == Some(expected), "{} -> {}", pair[0], pair[1]);
    }
    let first = workload.probes[0];
    let last = workload.probes[workload.probes.len() - 1];
    let total = report.latency(id(first), id(last)).unwrap();
    check!(total.count() == expected);
    for pair in workload.probes.windows(2) {
        let step = report.latency(id(pair[0]), id(pair[1])).unwrap();
        check!(step.max() <= total.max());
    }
}
