//! Shared handles passed to every component at construction
//!
//! [`Context`] is the read side: components observe configuration snapshots,
//! the shutdown token, and the counters. [`Control`] is the write side held by
//! the process harness, which publishes reloads, shutdown and status requests.

use crate::config::Config;
use crate::metrics::Metrics;
use crate::stats::Stats;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

/// Read-side handles cloned into each component
#[derive(Debug, Clone)]
pub struct Context {
    config: watch::Receiver<Arc<Config>>,
    shutdown: CancellationToken,
    status: Arc<Notify>,
    stats: Arc<Stats>,
}

/// Harness-side handle driving reload, shutdown and status
#[derive(Debug, Clone)]
pub struct Control {
    config: Arc<watch::Sender<Arc<Config>>>,
    shutdown: CancellationToken,
    status: Arc<Notify>,
}

impl Context {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> (Self, Control) {
        let (tx, rx) = watch::channel(Arc::new(config));
        let shutdown = CancellationToken::new();
        let status = Arc::new(Notify::new());

        let context = Self {
            config: rx,
            shutdown: shutdown.clone(),
            status: Arc::clone(&status),
            stats: Arc::new(Stats::new(metrics)),
        };
        let control = Control {
            config: Arc::new(tx),
            shutdown,
            status,
        };
        (context, control)
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.borrow())
    }

    /// A receiver that wakes on every published reload
    pub fn watch_config(&self) -> watch::Receiver<Arc<Config>> {
        self.config.clone()
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn status(&self) -> &Arc<Notify> {
        &self.status
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.stats.metrics()
    }
}

impl Control {
    /// Publish a new configuration snapshot to every component
    pub fn reload(&self, config: Config) {
        self.config.send_replace(Arc::new(config));
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Ask the reporting timer for an immediate report
    pub fn request_status(&self) {
        self.status.notify_one();
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.borrow())
    }
}
