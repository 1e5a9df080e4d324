//! Periodic and on-demand counter reports
//!
//! The timer logs connection health and the counters accumulated since the
//! previous report, then resets them. It fires every
//! `General.ReportWritMsgEveryHours`, whenever a status report is requested,
//! and once more on shutdown.

use crate::broker::ConnectionHealth;
use crate::context::Context;
use crate::stats::StatsSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportTrigger {
    Periodic,
    Status,
    Shutdown,
}

impl ReportTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportTrigger::Periodic => "periodic",
            ReportTrigger::Status => "status",
            ReportTrigger::Shutdown => "shutdown",
        }
    }
}

/// One emitted report
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub trigger: ReportTrigger,
    pub connected: bool,
    pub broker: Option<String>,
    /// Age of the current broker session
    pub session_uptime: Option<Duration>,
    pub daemon_uptime: Duration,
    pub destinations: Vec<String>,
    pub counters: StatsSnapshot,
}

pub struct ReportingTimer {
    ctx: Context,
    health: ConnectionHealth,
    started: Instant,
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.max(1).saturating_mul(3600))
}

fn report_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl ReportingTimer {
    pub fn new(ctx: Context, health: ConnectionHealth) -> Self {
        Self {
            ctx,
            health,
            started: Instant::now(),
        }
    }

    /// Run until the context's shutdown token fires
    pub async fn run(self) {
        let stop = self.ctx.shutdown().clone();
        self.run_until(stop).await;
    }

    /// Run until `stop` fires, then emit the final report
    pub async fn run_until(self, stop: CancellationToken) {
        let status = Arc::clone(self.ctx.status());
        let mut config_rx = self.ctx.watch_config();
        let mut watching = true;

        let mut every = self.ctx.config().general.report_every_hours;
        let mut interval = report_interval(hours(every));

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break,

                _ = status.notified() => {
                    self.report(ReportTrigger::Status);
                }

                changed = config_rx.changed(), if watching => match changed {
                    Ok(()) => {
                        let hours_now = config_rx.borrow_and_update().general.report_every_hours;
                        if hours_now != every {
                            info!(from = every, to = hours_now, "Report interval changed");
                            every = hours_now;
                            interval = report_interval(hours(every));
                        }
                    }
                    Err(_) => watching = false,
                },

                _ = interval.tick() => {
                    self.report(ReportTrigger::Periodic);
                }
            }
        }

        self.report(ReportTrigger::Shutdown);
    }

    /// Log the current report and reset the counters
    pub fn report(&self, trigger: ReportTrigger) -> Report {
        let report = Report {
            trigger,
            connected: self.health.is_connected(),
            broker: self.health.endpoint().map(|e| e.to_string()),
            session_uptime: self.health.uptime(),
            daemon_uptime: self.started.elapsed(),
            destinations: self.ctx.config().subscription.destinations.clone(),
            counters: self.ctx.stats().take(),
        };

        let c = &report.counters;
        info!(
            trigger = trigger.as_str(),
            connected = report.connected,
            broker = report.broker.as_deref().unwrap_or("none"),
            session_uptime_secs = report.session_uptime.map(|d| d.as_secs()),
            daemon_uptime_secs = report.daemon_uptime.as_secs(),
            destinations = ?report.destinations,
            received = c.received,
            in_window = c.in_window,
            out_of_window = c.out_of_window,
            malformed = c.malformed,
            "Status report"
        );
        for sink in &c.sinks {
            info!(
                trigger = trigger.as_str(),
                sink = sink.name,
                written = sink.written,
                failed = sink.failed,
                dropped = sink.dropped,
                "Sink report"
            );
        }

        report
    }
}
