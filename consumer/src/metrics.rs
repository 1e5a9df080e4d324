//! Prometheus metrics for the consumer
//!
//! These are monotonically increasing totals for the lifetime of the process.
//! The windowed counters that reset on every report live in [`crate::stats`].
//!
//! Metrics are registered in a private [`Registry`] owned by the instance, so
//! independent consumers (and tests) never collide on metric names.

use crate::error::{ConsumerError, Result};
use crate::message::Classification;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// All consumer metrics
pub struct Metrics {
    registry: Registry,

    /// Frames received from the broker
    pub messages_received: IntCounter,

    /// Messages by classification
    pub messages_classified: IntCounterVec,

    /// Records persisted (by sink)
    pub records_written: IntCounterVec,

    /// Records that failed to persist (by sink)
    pub records_failed: IntCounterVec,

    /// Deliveries dropped because a sink queue was full (by sink)
    pub records_dropped: IntCounterVec,

    /// Broker reconnects (by reason)
    pub reconnects: IntCounterVec,

    /// 1 while a broker session is established
    pub broker_connected: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help)
        .map_err(|e| ConsumerError::Metrics(format!("{name}: {e}")))?;
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| ConsumerError::Metrics(format!("{name}: {e}")))?;
    Ok(c)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help), &[label])
        .map_err(|e| ConsumerError::Metrics(format!("{name}: {e}")))?;
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| ConsumerError::Metrics(format!("{name}: {e}")))?;
    Ok(c)
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("argo_consumer".to_string()), None)
            .map_err(|e| ConsumerError::Metrics(format!("registry: {e}")))?;

        let broker_connected = IntGauge::new(
            "broker_connected",
            "Broker session status (1 = connected, 0 = disconnected)",
        )
        .map_err(|e| ConsumerError::Metrics(format!("broker_connected: {e}")))?;
        registry
            .register(Box::new(broker_connected.clone()))
            .map_err(|e| ConsumerError::Metrics(format!("broker_connected: {e}")))?;

        Ok(Self {
            messages_received: counter(
                &registry,
                "messages_received_total",
                "Total messages received from brokers",
            )?,
            messages_classified: counter_vec(
                &registry,
                "messages_classified_total",
                "Total messages by validation outcome",
                "classification",
            )?,
            records_written: counter_vec(
                &registry,
                "records_written_total",
                "Total records persisted by a sink",
                "sink",
            )?,
            records_failed: counter_vec(
                &registry,
                "records_failed_total",
                "Total records a sink failed to persist",
                "sink",
            )?,
            records_dropped: counter_vec(
                &registry,
                "records_dropped_total",
                "Total deliveries dropped on a full sink queue",
                "sink",
            )?,
            reconnects: counter_vec(
                &registry,
                "broker_reconnects_total",
                "Total broker reconnects",
                "reason",
            )?,
            broker_connected,
            registry,
        })
    }

    pub fn record_received(&self) {
        self.messages_received.inc();
    }

    pub fn record_classified(&self, classification: Classification) {
        self.messages_classified
            .with_label_values(&[classification.as_str()])
            .inc();
    }

    pub fn record_written(&self, sink: &str, count: u64) {
        self.records_written.with_label_values(&[sink]).inc_by(count);
    }

    pub fn record_failed(&self, sink: &str, count: u64) {
        self.records_failed.with_label_values(&[sink]).inc_by(count);
    }

    pub fn record_dropped(&self, sink: &str, count: u64) {
        self.records_dropped.with_label_values(&[sink]).inc_by(count);
    }

    pub fn record_reconnect(&self, reason: &str) {
        self.reconnects.with_label_values(&[reason]).inc();
    }

    pub fn set_connected(&self, connected: bool) {
        self.broker_connected.set(i64::from(connected));
    }

    /// Encode all metrics in the Prometheus text format
    pub fn gather(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
