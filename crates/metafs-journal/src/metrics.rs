//! Journal metrics
//!
//! Counters and gauges updated at the points the journal mutates its
//! state, with a coherent snapshot type and a Prometheus text exporter.
//!
//! # Prometheus Metrics
//!
//! - `metafs_journal_events_added_total` - Events submitted or replayed
//! - `metafs_journal_events_trimmed_total` - Events expired with their segment
//! - `metafs_journal_events_live` - Live events across all segments
//! - `metafs_journal_segments_added_total` - Segments cut
//! - `metafs_journal_segments_trimmed_total` - Segments expired
//! - `metafs_journal_segments_trimming` - Segments with an expiry barrier in flight
//! - `metafs_journal_segments_live` - Live segments
//! - `metafs_journal_expire_pos` / `_write_pos` / `_read_pos` - Stream offsets
//! - `metafs_journal_append_latency_seconds` - Running-average submit-to-durable latency

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Journal counters and gauges
#[derive(Debug, Default)]
pub struct JournalMetrics {
    events_added: AtomicU64,
    events_trimmed: AtomicU64,
    events_live: AtomicU64,
    segments_added: AtomicU64,
    segments_trimmed: AtomicU64,
    segments_trimming: AtomicU64,
    segments_live: AtomicU64,
    expire_pos: AtomicU64,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    append_latency_us_sum: AtomicU64,
    append_latency_samples: AtomicU64,
}

impl JournalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn event_added(&self) {
        self.events_added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn events_trimmed(&self, count: u64) {
        self.events_trimmed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn set_events_live(&self, count: u64) {
        self.events_live.store(count, Ordering::Relaxed);
    }

    pub(crate) fn segment_added(&self) {
        self.segments_added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn segment_trimmed(&self) {
        self.segments_trimmed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_segments_trimming(&self, count: u64) {
        self.segments_trimming.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_segments_live(&self, count: u64) {
        self.segments_live.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_expire_pos(&self, pos: u64) {
        self.expire_pos.store(pos, Ordering::Relaxed);
    }

    pub(crate) fn set_write_pos(&self, pos: u64) {
        self.write_pos.store(pos, Ordering::Relaxed);
    }

    pub(crate) fn set_read_pos(&self, pos: u64) {
        self.read_pos.store(pos, Ordering::Relaxed);
    }

    pub(crate) fn observe_append_latency(&self, latency: Duration) {
        self.append_latency_us_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.append_latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.append_latency_samples.load(Ordering::Relaxed);
        let sum_us = self.append_latency_us_sum.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_added: self.events_added.load(Ordering::Relaxed),
            events_trimmed: self.events_trimmed.load(Ordering::Relaxed),
            events_live: self.events_live.load(Ordering::Relaxed),
            segments_added: self.segments_added.load(Ordering::Relaxed),
            segments_trimmed: self.segments_trimmed.load(Ordering::Relaxed),
            segments_trimming: self.segments_trimming.load(Ordering::Relaxed),
            segments_live: self.segments_live.load(Ordering::Relaxed),
            expire_pos: self.expire_pos.load(Ordering::Relaxed),
            write_pos: self.write_pos.load(Ordering::Relaxed),
            read_pos: self.read_pos.load(Ordering::Relaxed),
            append_latency_avg: if samples == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(sum_us / samples)
            },
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self, prefix: &str) -> String {
        let snap = self.snapshot();
        let mut out = String::with_capacity(2048);

        let counters = [
            ("events_added_total", "Events submitted or replayed", snap.events_added),
            ("events_trimmed_total", "Events expired with their segment", snap.events_trimmed),
            ("segments_added_total", "Segments cut", snap.segments_added),
            ("segments_trimmed_total", "Segments expired", snap.segments_trimmed),
        ];
        for (name, help, value) in counters {
            write_metric(&mut out, prefix, name, help, "counter", value as f64);
        }

        let gauges = [
            ("events_live", "Live events across all segments", snap.events_live),
            ("segments_live", "Live segments", snap.segments_live),
            ("segments_trimming", "Segments with an expiry barrier in flight", snap.segments_trimming),
            ("expire_pos", "Oldest byte still required", snap.expire_pos),
            ("write_pos", "Append position", snap.write_pos),
            ("read_pos", "Replay position", snap.read_pos),
        ];
        for (name, help, value) in gauges {
            write_metric(&mut out, prefix, name, help, "gauge", value as f64);
        }

        write_metric(
            &mut out,
            prefix,
            "append_latency_seconds",
            "Running-average submit-to-durable latency",
            "gauge",
            snap.append_latency_avg.as_secs_f64(),
        );

        out
    }
}

fn write_metric(out: &mut String, prefix: &str, name: &str, help: &str, kind: &str, value: f64) {
    let _ = writeln!(out, "# HELP {prefix}_{name} {help}");
    let _ = writeln!(out, "# TYPE {prefix}_{name} {kind}");
    let _ = writeln!(out, "{prefix}_{name} {value}");
}

/// Metrics values at a point in time
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_added: u64,
    pub events_trimmed: u64,
    pub events_live: u64,
    pub segments_added: u64,
    pub segments_trimmed: u64,
    pub segments_trimming: u64,
    pub segments_live: u64,
    pub expire_pos: u64,
    pub write_pos: u64,
    pub read_pos: u64,
    pub append_latency_avg: Duration,
}
