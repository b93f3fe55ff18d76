//! Latency aggregation over reconstructed transactions.
//!
//! Every consecutive pair of events in a complete instance contributes one
//! sample to the stat for that ordered probe pair, and the whole instance
//! contributes one end-to-end sample keyed by its first and last probe.
//! Samples are nanoseconds, converted with the trace's calibration.

use crate::profiler::clock::Calibration;
use crate::profiler::probe::ProbeId;
use crate::profiler::transaction::TransactionInstance;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of power-of-two buckets: one for zero plus one per bit.
const LOG2_BUCKETS: usize = 65;

/// Running latency distribution for one probe pair.
#[derive(Clone)]
pub struct LatencyStat {
    count: u64,
    min: u64,
    max: u64,
    sum: u128,
    sum_sq: u128,
    /// Bucket `i > 0` counts samples in `[2^(i-1), 2^i)`; bucket 0 counts zeros.
    log2: [u64; LOG2_BUCKETS],
    histogram: Histogram<u64>,
}

impl Default for LatencyStat {
    fn default() -> Self {
        LatencyStat {
            count: 0,
            min: u64::MAX,
            max: 0,
            sum: 0,
            sum_sq: 0,
            log2: [0; LOG2_BUCKETS],
            histogram: Histogram::new(3).expect("3 significant figures is a valid precision"),
        }
    }
}

impl LatencyStat {
    pub fn record(&mut self, nanos: u64) {
        self.count += 1;
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos as u128;
        self.sum_sq += (nanos as u128) * (nanos as u128);
        self.log2[(u64::BITS - nanos.leading_zeros()) as usize] += 1;
        self.histogram.saturating_record(nanos);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn sum(&self) -> u128 {
        self.sum
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self.sum_sq as f64 / self.count as f64 - mean * mean;
        Some(variance.max(0.0).sqrt())
    }

    /// Value at `percentile` (0 to 100), accurate to three significant figures.
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        (self.count > 0).then(|| {
            self.histogram
                .value_at_quantile(percentile / 100.0)
                .clamp(self.min, self.max)
        })
    }

    /// Non-empty power-of-two buckets as `(exclusive upper bound, count)`.
    /// The zero bucket has upper bound 1.
    pub fn log2_buckets(&self) -> Vec<(u128, u64)> {
        self.log2
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .map(|(i, n)| (1u128 << i, *n))
            .collect()
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count,
            min: self.min().unwrap_or(0),
            max: self.max().unwrap_or(0),
            mean: self.mean().unwrap_or(0.0),
            stddev: self.stddev().unwrap_or(0.0),
            p50: self.percentile(50.0).unwrap_or(0),
            p90: self.percentile(90.0).unwrap_or(0),
            p99: self.percentile(99.0).unwrap_or(0),
            p999: self.percentile(99.9).unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for LatencyStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyStat")
            .field("count", &self.count)
            .field("min", &self.min())
            .field("max", &self.max())
            .field("mean", &self.mean())
            .finish_non_exhaustive()
    }
}

/// Plain numbers from a [`LatencyStat`], all in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
}

/// An ordered probe pair: latency is measured from `from` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProbePair {
    pub from: ProbeId,
    pub to: ProbeId,
}

impl ProbePair {
    pub const fn new(from: ProbeId, to: ProbeId) -> Self {
        ProbePair { from, to }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounts {
    /// Complete instances whose samples were recorded.
    pub ingested: u64,
    /// Abandoned or truncated instances, skipped.
    pub incomplete: u64,
    /// Consecutive pairs whose timestamp went backwards.
    pub anomalies: u64,
}

pub struct Aggregator {
    calibration: Calibration,
    pairs: BTreeMap<ProbePair, LatencyStat>,
    end_to_end: BTreeMap<ProbePair, LatencyStat>,
    counts: IngestCounts,
}

impl Aggregator {
    pub fn new(calibration: Calibration) -> Self {
        Aggregator {
            calibration,
            pairs: BTreeMap::new(),
            end_to_end: BTreeMap::new(),
            counts: IngestCounts::default(),
        }
    }

    pub fn ingest(&mut self, instance: &TransactionInstance) {
        if !instance.is_complete() {
            self.counts.incomplete += 1;
            return;
        }
        self.counts.ingested += 1;
        let mut anomalous = false;
        for pair in instance.events.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            match to.timestamp.checked_sub(from.timestamp) {
                Some(ticks) => self
                    .pairs
                    .entry(ProbePair::new(from.probe_id, to.probe_id))
                    .or_default()
                    .record(self.calibration.ticks_to_nanos(ticks)),
                None => {
                    self.counts.anomalies += 1;
                    anomalous = true;
                }
            }
        }
        if anomalous {
            return;
        }
        if let (Some(first), Some(last)) = (instance.events.first(), instance.events.last())
            && instance.events.len() > 1
        {
            let ticks = last.timestamp - first.timestamp;
            self.end_to_end
                .entry(ProbePair::new(first.probe_id, last.probe_id))
                .or_default()
                .record(self.calibration.ticks_to_nanos(ticks));
        }
    }

    pub fn ingest_all<'a>(&mut self, instances: impl IntoIterator<Item = &'a TransactionInstance>) {
        for instance in instances {
            self.ingest(instance);
        }
    }

    pub fn counts(&self) -> IngestCounts {
        self.counts
    }

    /// Snapshot of everything ingested so far. Later ingests do not touch it.
    pub fn report(&self) -> Report {
        Report {
            pairs: self.pairs.clone(),
            end_to_end: self.end_to_end.clone(),
            counts: self.counts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    /// Consecutive waypoint pairs.
    pub pairs: BTreeMap<ProbePair, LatencyStat>,
    /// First to last event of each transaction.
    pub end_to_end: BTreeMap<ProbePair, LatencyStat>,
    pub counts: IngestCounts,
}

impl Report {
    /// Stat for `from -> to`, looking at consecutive pairs first.
    pub fn latency(&self, from: ProbeId, to: ProbeId) -> Option<&LatencyStat> {
        let key = ProbePair::new(from, to);
        self.pairs.get(&key).or_else(|| self.end_to_end.get(&key))
    }

    /// Machine-readable form of the report, probes named by id.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries())
    }

    pub(crate) fn entries(&self) -> ReportEntries {
        let rows = |map: &BTreeMap<ProbePair, LatencyStat>| {
            map.iter()
                .map(|(pair, stat)| PairEntry {
                    from: pair.from,
                    to: pair.to,
                    latency: stat.summary(),
                })
                .collect()
        };
        ReportEntries {
            pairs: rows(&self.pairs),
            end_to_end: rows(&self.end_to_end),
            counts: self.counts,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ReportEntries {
    pub(crate) pairs: Vec<PairEntry>,
    pub(crate) end_to_end: Vec<PairEntry>,
    pub(crate) counts: IngestCounts,
}

#[derive(Debug, Serialize)]
pub(crate) struct PairEntry {
    pub(crate) from: ProbeId,
    pub(crate) to: ProbeId,
    pub(crate) latency: LatencySummary,
}
