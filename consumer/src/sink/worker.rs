//! Per-sink batching worker

use crate::config::Config;
use crate::context::Context;
use crate::message::Delivery;
use crate::sink::{BatchSink, SinkHandle};
use crate::stats::SinkCounters;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How often the worker re-checks a batch against the bulk size
pub const FLUSH_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Start a worker for `sink` and return its producer handle
///
/// The worker drains and exits once `stop` is cancelled.
pub fn spawn_sink(
    sink: Arc<dyn BatchSink>,
    ctx: &Context,
    stop: CancellationToken,
) -> (SinkHandle, JoinHandle<()>) {
    let (worker, handle) = SinkWorker::new(sink, ctx, stop);
    (handle, tokio::spawn(worker.run()))
}

/// Single consumer of a sink's queue
///
/// Deliveries are flushed in arrival order. On shutdown the queue is drained
/// and whatever remains is flushed, however small.
pub struct SinkWorker {
    sink: Arc<dyn BatchSink>,
    rx: mpsc::Receiver<Delivery>,
    config: watch::Receiver<Arc<Config>>,
    shutdown: CancellationToken,
    counters: Arc<SinkCounters>,
}

impl SinkWorker {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        ctx: &Context,
        stop: CancellationToken,
    ) -> (Self, SinkHandle) {
        let (tx, rx) = mpsc::channel(ctx.config().general.queue_capacity);
        let counters = ctx.stats().sink(sink.name());
        let handle = SinkHandle::new(Arc::clone(&sink), tx, Arc::clone(&counters));

        let worker = Self {
            sink,
            rx,
            config: ctx.watch_config(),
            shutdown: stop,
            counters,
        };
        (worker, handle)
    }

    pub async fn run(mut self) {
        let name = self.sink.name();
        info!(sink = name, bulk_size = self.sink.bulk_size(), "Sink worker started");

        let mut batch: Vec<Delivery> = Vec::with_capacity(self.sink.bulk_size());
        let mut tick = tokio::time::interval(FLUSH_CHECK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                changed = self.config.changed(), if watching => match changed {
                    Ok(()) => {
                        let config = Arc::clone(&self.config.borrow_and_update());
                        self.reload(&config);
                    }
                    Err(_) => watching = false,
                },

                received = self.rx.recv() => match received {
                    Some(delivery) => {
                        batch.push(delivery);
                        if batch.len() >= self.sink.bulk_size() {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },

                _ = tick.tick() => {
                    // Bulk size may have shrunk on reload
                    if batch.len() >= self.sink.bulk_size() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        self.rx.close();
        while let Ok(delivery) = self.rx.try_recv() {
            batch.push(delivery);
        }
        if !batch.is_empty() {
            debug!(sink = name, count = batch.len(), "Flushing remaining deliveries");
            self.flush(&mut batch).await;
        }

        info!(sink = name, "Sink worker stopped");
    }

    fn reload(&self, config: &Config) {
        match self.sink.load(config) {
            Ok(()) => info!(
                sink = self.sink.name(),
                bulk_size = self.sink.bulk_size(),
                "Sink reloaded configuration"
            ),
            Err(e) => error!(
                sink = self.sink.name(),
                error = %e,
                "Sink rejected new configuration, keeping previous"
            ),
        }
    }

    async fn flush(&self, batch: &mut Vec<Delivery>) {
        let drained = std::mem::take(batch);
        let count = drained.len();

        if let Err(e) = self.sink.flush(drained).await {
            self.counters.record_failed(count as u64);
            error!(sink = self.sink.name(), error = %e, count, "Flush failed, batch dropped");
        }
    }
}
