//! Message pipeline
//!
//! Turns one inbound frame into zero or more deliveries and routes them to
//! the sinks that take them.
//!
//! ```text
//! frame ──► parse ──► classify ──► normalize ──► route ──► SinkHandle::enqueue
//! ```
//!
//! Routing:
//! - in-window records go to every sink
//! - out-of-window records go to every sink only with `LogMsgOutAllowedTime`
//! - malformed messages go only to sinks accepting them (the file sink's error
//!   file) and only with `LogWrongFormat`
//!
//! Nothing here fails past this stage; bad input degrades to `Malformed`.

pub mod normalize;
pub mod window;

use crate::config::{Config, RetentionConfig};
use crate::context::Context;
use crate::message::{Classification, DATE_FORMAT, Delivery, RawMessage};
use crate::sink::SinkHandle;
use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

pub use normalize::normalize;
pub use window::classify;

/// Classify a raw message and build its deliveries
///
/// A valid message yields one delivery per service; a malformed one yields
/// the raw message itself, keyed by the reception date `today`.
pub fn prepare(
    raw: RawMessage,
    retention: &RetentionConfig,
    today: NaiveDate,
) -> (Classification, Vec<Delivery>) {
    let classification = classify(&raw, retention, today);

    if classification != Classification::Malformed {
        let records = normalize(&raw);
        if !records.is_empty() {
            let deliveries = records
                .into_iter()
                .map(|record| Delivery::Record {
                    record,
                    classification,
                })
                .collect();
            return (classification, deliveries);
        }
        warn!(
            message_id = raw.message_id(),
            service_type = raw.get("serviceType").unwrap_or_default(),
            "Message serviceType names no service"
        );
    }

    let received = today.format(DATE_FORMAT).to_string();
    (
        Classification::Malformed,
        vec![Delivery::Malformed { raw, received }],
    )
}

/// Routes inbound frames to sinks
#[derive(Debug, Clone)]
pub struct MessagePipeline {
    ctx: Context,
    sinks: Vec<SinkHandle>,
}

impl MessagePipeline {
    pub fn new(ctx: Context, sinks: Vec<SinkHandle>) -> Self {
        Self { ctx, sinks }
    }

    pub fn sinks(&self) -> &[SinkHandle] {
        &self.sinks
    }

    /// Handle one frame against the current UTC date
    pub fn process<I>(&self, headers: I, body: &[u8]) -> Classification
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.process_at(headers, body, Utc::now().date_naive())
    }

    /// Handle one frame against the given UTC date
    pub fn process_at<I>(&self, headers: I, body: &[u8], today: NaiveDate) -> Classification
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let stats = self.ctx.stats();
        stats.record_received();

        let config = self.ctx.config();
        let raw = RawMessage::parse(headers, body);
        let message_id = raw.message_id().to_string();
        let (classification, deliveries) = prepare(raw, &config.retention, today);
        stats.record_classified(classification);

        if !routed(classification, &config) {
            debug!(
                message_id,
                classification = classification.as_str(),
                "Message not persisted"
            );
            return classification;
        }

        for delivery in deliveries {
            for sink in self.sinks.iter().filter(|s| s.accepts(classification)) {
                sink.enqueue(delivery.clone());
            }
        }
        classification
    }
}

fn routed(classification: Classification, config: &Config) -> bool {
    match classification {
        Classification::InWindow => true,
        Classification::OutOfWindow => config.retention.log_out_allowed_time,
        Classification::Malformed => config.general.log_wrong_format,
    }
}
