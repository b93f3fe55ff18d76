//! Decode a trace and print transaction latency statistics.
//!
//! Usage:
//!   cargo run --example analyze_trace -- <trace_file> [<begin_probe> <end_probe>] [--json]
//!
//! Without a probe pair, lists the probe map and how often each probe fired.

use latency_probe::profiler::{
    ReentryPolicy, TransactionType, analyze, decode_file, print_report, report::to_named_json,
};
use std::collections::BTreeMap;
use std::env;

fn main() {
    let mut args: Vec<String> = env::args().collect();
    let json = args.iter().any(|a| a == "--json");
    args.retain(|a| a != "--json");
    if args.len() != 2 && args.len() != 4 {
        eprintln!(
            "Usage: {} <trace_file> [<begin_probe> <end_probe>] [--json]",
            args[0]
        );
        std::process::exit(1);
    }

    let trace = match decode_file(&args[1]) {
        Ok(trace) => trace,
        Err(failure) => {
            eprintln!("{failure}");
            std::process::exit(1);
        }
    };
    let header = &trace.header;
    println!(
        "{} events from {} threads, {} probes, counters: {:?}",
        trace.events.len(),
        trace.by_thread().len(),
        header.probes.len(),
        header.counters
    );
    if let Some(bytes) = trace.truncated_tail {
        println!("dropped a truncated final record ({bytes} bytes)");
    }

    if args.len() == 2 {
        let mut fired: BTreeMap<_, u64> = BTreeMap::new();
        for event in &trace.events {
            *fired.entry(event.probe_id).or_default() += 1;
        }
        for probe in &header.probes {
            println!(
                "  {:>4} {:<32} {:<12} {:>10}  {}",
                probe.id,
                probe.name,
                probe.category,
                fired.get(&probe.id).copied().unwrap_or(0),
                probe.location
            );
        }
        return;
    }

    let Some(transaction) = TransactionType::by_name(header, "transaction", &args[2], &args[3]) else {
        eprintln!("probe {:?} or {:?} is not in the trace", args[2], args[3]);
        std::process::exit(1);
    };
    let analysis = analyze(&trace, vec![transaction], ReentryPolicy::default());
    let diagnostics = &analysis.reconstruction.diagnostics;
    if !diagnostics.is_empty() {
        println!("{} tracker diagnostics", diagnostics.len());
    }

    if json {
        match to_named_json(&analysis.report, header) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to serialize report: {e}"),
        }
    } else {
        print_report(&analysis.report, header);
    }
}
