//! Batching sinks
//!
//! Sinks persist [`Delivery`] batches to a destination. Each sink gets its own
//! bounded channel and a single worker task that batches deliveries and calls
//! [`BatchSink::flush`]. Producers never block: a full queue drops the delivery
//! and counts it.
//!
//! ```text
//! MessagePipeline ──try_send──► mpsc (bounded) ──► SinkWorker ──flush──► FileSink / IngestionSink
//! ```

pub mod avro;
pub mod file;
pub mod ingestion;
pub mod worker;

use crate::config::Config;
use crate::error::SinkError;
use crate::message::{Classification, Delivery};
use crate::stats::SinkCounters;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

pub use file::FileSink;
pub use ingestion::IngestionSink;
pub use worker::{SinkWorker, spawn_sink};

/// BatchSink trait - persists batches of deliveries
///
/// A sink only sees deliveries it [`accepts`](BatchSink::accepts). Flushes are
/// called from one worker task at a time, in arrival order.
///
/// # Example
///
/// ```ignore
/// struct CountingSink { seen: AtomicUsize }
///
/// #[async_trait]
/// impl BatchSink for CountingSink {
///     fn name(&self) -> &'static str { "counting" }
///     fn bulk_size(&self) -> usize { 10 }
///
///     async fn flush(&self, batch: Vec<Delivery>) -> Result<(), SinkError> {
///         self.seen.fetch_add(batch.len(), Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Sink name for identification, logging and metrics labels
    fn name(&self) -> &'static str;

    /// Whether deliveries of this classification belong in this sink
    ///
    /// Sinks take valid records by default.
    fn accepts(&self, classification: Classification) -> bool {
        classification != Classification::Malformed
    }

    /// Number of queued deliveries that triggers a flush
    fn bulk_size(&self) -> usize;

    /// Persist one batch, in order
    ///
    /// Per-record failures are logged and counted by the sink itself. An
    /// error return means nothing in the batch was persisted, and the worker
    /// counts the whole batch as failed.
    async fn flush(&self, batch: Vec<Delivery>) -> Result<(), SinkError>;

    /// Pick up tunables from a new configuration snapshot
    fn load(&self, _config: &Config) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Producer side of a running sink
#[derive(Clone)]
pub struct SinkHandle {
    sink: Arc<dyn BatchSink>,
    tx: mpsc::Sender<Delivery>,
    counters: Arc<SinkCounters>,
}

impl SinkHandle {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        tx: mpsc::Sender<Delivery>,
        counters: Arc<SinkCounters>,
    ) -> Self {
        Self { sink, tx, counters }
    }

    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn accepts(&self, classification: Classification) -> bool {
        self.sink.accepts(classification)
    }

    /// Queue a delivery without waiting
    ///
    /// Returns false when the delivery was dropped.
    pub fn enqueue(&self, delivery: Delivery) -> bool {
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.record_dropped(1);
                warn!(sink = self.name(), "Sink queue full, delivery dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.record_dropped(1);
                warn!(sink = self.name(), "Sink stopped, delivery dropped");
                false
            }
        }
    }

    pub fn counters(&self) -> &Arc<SinkCounters> {
        &self.counters
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("sink", &self.name())
            .finish_non_exhaustive()
    }
}
