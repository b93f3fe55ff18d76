//! Synthetic order pipeline instrumented with probes.
//!
//! Four worker threads each take orders through receive, validate, match and
//! acknowledge. Matching occasionally takes a slow path so the latency report
//! has a tail to show.
//!
//! Usage:
//!   cargo run --example order_pipeline
//!
//! Then analyze the trace:
//!   cargo run --example analyze_trace -- /tmp/order_pipeline/orders-1.bin order.received order.acked

use latency_probe::profiler::{
    OverflowPolicy, Profiler, ProbeRegistry, TraceOutput,
};
use std::time::{Duration, Instant};

fn spin(d: Duration) {
    let start = Instant::now();
    while start.elapsed() < d {
        std::hint::spin_loop();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut registry = ProbeRegistry::builder();
    let received = registry.register_in("order.received", "orders");
    let validated = registry.register_in("order.validated", "orders");
    let matched = registry.register_in("order.matched", "orders");
    let acked = registry.register_in("order.acked", "orders");
    let heartbeat = registry.register_in("heartbeat", "housekeeping");

    let profiler = Profiler::builder()
        .with_output(TraceOutput::file("/tmp/order_pipeline/orders.bin"))
        .with_overflow_policy(OverflowPolicy::FlushOnFull)
        .with_flush_interval(Duration::from_millis(50))
        .build(registry.build()?)?;
    let control = profiler.control();

    // Housekeeping probes are noise for this run.
    control.disable_category("housekeeping");
    control.start_session()?;

    std::thread::scope(|s| {
        for worker in 0..4u64 {
            let probes = [received, validated, matched, acked, heartbeat]
                .map(|id| profiler.probe(id).expect("registered above"));
            s.spawn(move || {
                let [received, validated, matched, acked, heartbeat] = probes;
                for order in 0..5_000u64 {
                    received.fire();
                    spin(Duration::from_nanos(200));
                    validated.fire();
                    let slow = (order + worker) % 97 == 0;
                    spin(Duration::from_nanos(if slow { 20_000 } else { 500 }));
                    matched.fire();
                    spin(Duration::from_nanos(100));
                    acked.fire();
                    if order % 1000 == 0 {
                        heartbeat.fire();
                    }
                }
            });
        }
    });

    let summary = control.stop_session()?;
    println!(
        "session {}: {} events written, {} dropped, {} inline flushes in {:.2?}",
        summary.session,
        summary.events_written,
        summary.dropped,
        summary.inline_flushes,
        summary.duration
    );
    if let Some(path) = summary.output {
        println!("trace: {}", path.display());
    }
    Ok(())
}
