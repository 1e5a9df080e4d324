//! Counters reported and reset by the reporting timer
//!
//! Every counter here also feeds the matching Prometheus total, so callers
//! record once.

use crate::message::Classification;
use crate::metrics::Metrics;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters since the last report
#[derive(Debug)]
pub struct Stats {
    metrics: Arc<Metrics>,
    received: AtomicU64,
    in_window: AtomicU64,
    out_of_window: AtomicU64,
    malformed: AtomicU64,
    sinks: RwLock<Vec<Arc<SinkCounters>>>,
}

/// Counters owned by one sink
#[derive(Debug)]
pub struct SinkCounters {
    name: &'static str,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    metrics: Arc<Metrics>,
}

/// Values taken by one report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub in_window: u64,
    pub out_of_window: u64,
    pub malformed: u64,
    pub sinks: Vec<SinkSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSnapshot {
    pub name: &'static str,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl Stats {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            received: AtomicU64::new(0),
            in_window: AtomicU64::new(0),
            out_of_window: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_received();
    }

    pub fn record_classified(&self, classification: Classification) {
        let counter = match classification {
            Classification::InWindow => &self.in_window,
            Classification::OutOfWindow => &self.out_of_window,
            Classification::Malformed => &self.malformed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_classified(classification);
    }

    /// Counters for the named sink, created on first use
    pub fn sink(&self, name: &'static str) -> Arc<SinkCounters> {
        if let Some(existing) = self.sinks.read().iter().find(|s| s.name == name) {
            return Arc::clone(existing);
        }

        let mut sinks = self.sinks.write();
        if let Some(existing) = sinks.iter().find(|s| s.name == name) {
            return Arc::clone(existing);
        }
        let counters = Arc::new(SinkCounters {
            name,
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            metrics: Arc::clone(&self.metrics),
        });
        sinks.push(Arc::clone(&counters));
        counters
    }

    /// Current values without resetting them
    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|c| c.load(Ordering::Relaxed))
    }

    /// Current values, resetting every counter to zero
    pub fn take(&self) -> StatsSnapshot {
        self.collect(|c| c.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        StatsSnapshot {
            received: read(&self.received),
            in_window: read(&self.in_window),
            out_of_window: read(&self.out_of_window),
            malformed: read(&self.malformed),
            sinks: self
                .sinks
                .read()
                .iter()
                .map(|s| SinkSnapshot {
                    name: s.name,
                    written: read(&s.written),
                    failed: read(&s.failed),
                    dropped: read(&s.dropped),
                })
                .collect(),
        }
    }
}

impl SinkCounters {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn record_written(&self, count: u64) {
        self.written.fetch_add(count, Ordering::Relaxed);
        self.metrics.record_written(self.name, count);
    }

    pub fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
        self.metrics.record_failed(self.name, count);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
        self.metrics.record_dropped(self.name, count);
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
