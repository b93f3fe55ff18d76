//! Rendering of latency reports for terminals and tools.

use crate::profiler::format::TraceHeader;
use crate::profiler::probe::ProbeId;
use crate::profiler::reader::DecodedTrace;
use crate::profiler::stats::{
    Aggregator, IngestCounts, LatencyStat, LatencySummary, PairEntry, ProbePair, Report,
};
use crate::profiler::transaction::{self, Reconstruction, ReentryPolicy, TransactionType};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Transactions and latency statistics of one decoded trace.
#[derive(Debug)]
pub struct Analysis {
    pub reconstruction: Reconstruction,
    pub report: Report,
}

/// Reconstruct `types` from `trace` and aggregate every complete instance.
pub fn analyze(trace: &DecodedTrace, types: Vec<TransactionType>, policy: ReentryPolicy) -> Analysis {
    let reconstruction = transaction::reconstruct(types, policy, &trace.events);
    let mut aggregator = Aggregator::new(trace.header.calibration);
    aggregator.ingest_all(&reconstruction.instances);
    Analysis {
        reconstruction,
        report: aggregator.report(),
    }
}

fn probe_name(header: &TraceHeader, id: ProbeId) -> Cow<'_, str> {
    match header.probe_name(id) {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("#{id}")),
    }
}

/// Print `report` as a table, naming probes from the trace header.
pub fn print_report(report: &Report, header: &TraceHeader) {
    let stdout = io::stdout();
    let _ = write_report(&mut stdout.lock(), report, header);
}

pub fn write_report(w: &mut impl Write, report: &Report, header: &TraceHeader) -> io::Result<()> {
    let counts = report.counts;
    writeln!(
        w,
        "transactions: {} complete, {} incomplete, {} clock anomalies",
        counts.ingested, counts.incomplete, counts.anomalies
    )?;
    write_section(w, "waypoints", &report.pairs, header)?;
    write_section(w, "end to end", &report.end_to_end, header)
}

fn write_section(
    w: &mut impl Write,
    title: &str,
    stats: &BTreeMap<ProbePair, LatencyStat>,
    header: &TraceHeader,
) -> io::Result<()> {
    if stats.is_empty() {
        return Ok(());
    }
    writeln!(w)?;
    writeln!(w, "{title}")?;
    writeln!(
        w,
        "  {:<40} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "from -> to", "count", "min", "mean", "p50", "p99", "p99.9", "max"
    )?;
    for (pair, stat) in stats {
        let s = stat.summary();
        let label = format!(
            "{} -> {}",
            probe_name(header, pair.from),
            probe_name(header, pair.to)
        );
        writeln!(
            w,
            "  {:<40} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            label,
            s.count,
            fmt_nanos(s.min),
            fmt_nanos(s.mean as u64),
            fmt_nanos(s.p50),
            fmt_nanos(s.p99),
            fmt_nanos(s.p999),
            fmt_nanos(s.max),
        )?;
    }
    Ok(())
}

fn fmt_nanos(nanos: u64) -> String {
    match nanos {
        0..1_000 => format!("{nanos}ns"),
        1_000..1_000_000 => format!("{:.2}us", nanos as f64 / 1e3),
        1_000_000..1_000_000_000 => format!("{:.2}ms", nanos as f64 / 1e6),
        _ => format!("{:.2}s", nanos as f64 / 1e9),
    }
}

#[derive(Serialize)]
struct NamedEntry<'a> {
    from: Cow<'a, str>,
    to: Cow<'a, str>,
    #[serde(flatten)]
    latency: LatencySummary,
}

#[derive(Serialize)]
struct NamedReport<'a> {
    pairs: Vec<NamedEntry<'a>>,
    end_to_end: Vec<NamedEntry<'a>>,
    counts: IngestCounts,
}

fn named(rows: Vec<PairEntry>, header: &TraceHeader) -> Vec<NamedEntry<'_>> {
    rows.into_iter()
        .map(|row| NamedEntry {
            from: probe_name(header, row.from),
            to: probe_name(header, row.to),
            latency: row.latency,
        })
        .collect()
}

/// Like [`Report::to_json`], with probes named from the trace header.
pub fn to_named_json(report: &Report, header: &TraceHeader) -> serde_json::Result<String> {
    let entries = report.entries();
    serde_json::to_string_pretty(&NamedReport {
        pairs: named(entries.pairs, header),
        end_to_end: named(entries.end_to_end, header),
        counts: entries.counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::clock::Calibration;
    use crate::profiler::events::ProbeEvent;
    use crate::profiler::probe::ProbeInfo;

    fn trace() -> DecodedTrace {
        let names = ["recv", "parse", "send"];
        let header = TraceHeader {
            calibration: Calibration::from_cycles_per_second(1e9).unwrap(),
            session_start_ticks: 0,
            session_start_unix_nanos: 0,
            probes: names
                .iter()
                .enumerate()
                .map(|(i, name)| ProbeInfo {
                    id: ProbeId::from_u32(i as u32),
                    name: name.to_string(),
                    location: String::new(),
                    category: "default".into(),
                })
                .collect(),
            counters: Vec::new(),
        };
        let mut events = Vec::new();
        for (n, base) in [0u64, 1000].into_iter().enumerate() {
            for (i, offset) in [0u64, 400, 1500].into_iter().enumerate() {
                events.push(ProbeEvent::new(
                    ProbeId::from_u32(i as u32),
                    1,
                    (n * 3 + i) as u64,
                    base * 10 + offset,
                ));
            }
        }
        DecodedTrace {
            header,
            events,
            truncated_tail: None,
        }
    }

    fn types() -> Vec<TransactionType> {
        vec![TransactionType::new(
            "request",
            ProbeId::from_u32(0),
            ProbeId::from_u32(2),
        )]
    }

    #[test]
    fn analyze_builds_pair_and_end_to_end_stats() {
        let analysis = analyze(&trace(), types(), ReentryPolicy::default());
        assert_eq!(analysis.reconstruction.complete().count(), 2);
        let report = &analysis.report;
        let parse = report
            .latency(ProbeId::from_u32(0), ProbeId::from_u32(1))
            .unwrap();
        assert_eq!(parse.count(), 2);
        assert_eq!(parse.min(), Some(400));
        let total = report
            .latency(ProbeId::from_u32(0), ProbeId::from_u32(2))
            .unwrap();
        assert_eq!(total.max(), Some(1500));
    }

    #[test]
    fn table_names_probes() {
        let trace = trace();
        let analysis = analyze(&trace, types(), ReentryPolicy::default());
        let mut out = Vec::new();
        write_report(&mut out, &analysis.report, &trace.header).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("transactions: 2 complete, 0 incomplete, 0 clock anomalies"));
        assert!(text.contains("recv -> parse"));
        assert!(text.contains("parse -> send"));
        assert!(text.contains("1.10us"));
        assert!(text.contains("end to end"));
    }

    #[test]
    fn named_json_uses_probe_names() {
        let trace = trace();
        let analysis = analyze(&trace, types(), ReentryPolicy::default());
        let json = to_named_json(&analysis.report, &trace.header).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["pairs"][0]["from"], "recv");
        assert_eq!(value["pairs"][0]["to"], "parse");
        assert_eq!(value["pairs"][0]["p50"], 400);
        assert_eq!(value["end_to_end"][0]["to"], "send");
        assert_eq!(value["counts"]["ingested"], 2);
    }

    #[test]
    fn nanos_pick_a_readable_unit() {
        assert_eq!(fmt_nanos(999), "999ns");
        assert_eq!(fmt_nanos(1_500), "1.50us");
        assert_eq!(fmt_nanos(2_000_000), "2.00ms");
        assert_eq!(fmt_nanos(3_000_000_000), "3.00s");
    }
}
