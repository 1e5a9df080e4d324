//! Wires every component together and runs them until shutdown
//!
//! ```text
//! StompTransport ──► BrokerConnection ──► MessagePipeline ──► SinkWorker(s)
//!                                                 │
//!                      ReportingTimer ◄── Stats ◄─┘
//! ```
//!
//! Shutdown order: the control loop disconnects, sink workers drain and
//! flush, then the reporter emits its final report.

use crate::broker::BrokerConnection;
use crate::config::Config;
use crate::context::{Context, Control};
use crate::error::{ConsumerError, Result, SinkError};
use crate::metrics::Metrics;
use crate::metrics_server::MetricsServer;
use crate::pipeline::MessagePipeline;
use crate::reporting::ReportingTimer;
use crate::sink::{BatchSink, FileSink, IngestionSink, spawn_sink};
use crate::transport::{StompTransport, Transport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The consumer process
pub struct Daemon {
    ctx: Context,
    transport: Arc<dyn Transport>,
}

fn sink_init(sink: &str, err: SinkError) -> ConsumerError {
    ConsumerError::Sink {
        sink: sink.to_string(),
        message: err.to_string(),
    }
}

/// Build the sinks enabled by `config`
///
/// # Errors
/// Fails when an enabled sink cannot be initialised, for example because the
/// Avro schema is unreadable.
pub fn build_sinks(config: &Config, ctx: &Context) -> Result<Vec<Arc<dyn BatchSink>>> {
    let mut sinks: Vec<Arc<dyn BatchSink>> = Vec::new();

    if config.write_msg_file() {
        let sink =
            FileSink::new(config, ctx.stats().sink("file")).map_err(|e| sink_init("file", e))?;
        sinks.push(Arc::new(sink));
    }
    if config.write_msg_ingestion() {
        let sink = IngestionSink::new(config, ctx.stats().sink("ingestion"))
            .map_err(|e| sink_init("ingestion", e))?;
        sinks.push(Arc::new(sink));
    }

    Ok(sinks)
}

impl Daemon {
    /// Daemon talking STOMP to the configured brokers
    pub fn new(config: Config) -> Result<(Self, Control)> {
        Self::with_transport(config, Arc::new(StompTransport::new()))
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<(Self, Control)> {
        let metrics = Arc::new(Metrics::new()?);
        let (ctx, control) = Context::new(config, metrics);
        Ok((Self { ctx, transport }, control))
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run until the shutdown token is cancelled
    ///
    /// # Errors
    /// Only startup failures are returned; once running, failures are logged
    /// and retried.
    pub async fn run(self) -> Result<()> {
        let config = self.ctx.config();

        // Sinks drain only after the broker session is closed
        let sinks_stop = CancellationToken::new();
        let mut workers = Vec::new();
        let mut handles = Vec::new();
        for sink in build_sinks(&config, &self.ctx)? {
            info!(sink = sink.name(), bulk_size = sink.bulk_size(), "Sink enabled");
            let (handle, worker) = spawn_sink(sink, &self.ctx, sinks_stop.clone());
            handles.push(handle);
            workers.push(worker);
        }

        let pipeline = MessagePipeline::new(self.ctx.clone(), handles);
        let connection = match BrokerConnection::new(self.ctx.clone(), self.transport, pipeline) {
            Ok(connection) => connection,
            Err(e) => {
                self.ctx.shutdown().cancel();
                sinks_stop.cancel();
                return Err(e);
            }
        };
        let health = connection.health();

        let metrics_server = config.metrics_addr.map(|addr| {
            MetricsServer::start(
                addr,
                Arc::clone(self.ctx.metrics()),
                health.clone(),
                self.ctx.shutdown().clone(),
            )
        });

        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(
            ReportingTimer::new(self.ctx.clone(), health).run_until(reporter_stop.clone()),
        );

        info!(
            brokers = config.brokers.len(),
            destinations = ?config.subscription.destinations,
            "Consumer started"
        );

        if let Err(e) = tokio::spawn(connection.run()).await {
            error!(error = %e, "Broker connection task failed");
            self.ctx.shutdown().cancel();
        }

        sinks_stop.cancel();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Sink worker task failed");
            }
        }

        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            error!(error = %e, "Reporting task failed");
        }

        if let Some(server) = metrics_server {
            let _ = server.await;
        }

        info!("Consumer stopped");
        Ok(())
    }
}
