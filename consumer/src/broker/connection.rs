//! Broker connection state machine
//!
//! ```text
//! Disconnected ──open──► Connecting ──on_connected──► Connected
//!      ▲                     │                            │
//!      └──── open failed ────┘                            │
//!      └──── on_disconnected / on_error / idle / reload ──┘
//! ```
//!
//! The control loop ticks once per [`TICK_INTERVAL`]. Each tick:
//! 1. a session that is not connected is marked for reconnect
//! 2. a connected session that saw no message during the last
//!    `IdleMsgTimeout` ticks is marked for reconnect
//! 3. a marked (or reload-flagged) connection closes the old session, moves
//!    to the next broker, opens and subscribes to every destination
//! 4. the tick counter advances
//!
//! Connect failures are logged and retried on the next tick, forever.
//!
//! Transport callbacks run on the transport's reader task. Each session gets
//! a listener tagged with a generation number; events from a superseded
//! session are ignored.

use crate::broker::{BrokerEndpoint, BrokerList};
use crate::config::Config;
use crate::context::Context;
use crate::error::{ConsumerError, Result};
use crate::pipeline::MessagePipeline;
use crate::transport::{ConnectOptions, Session, Transport, TransportListener};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Control loop cadence; `IdleMsgTimeout` is counted in ticks
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
struct HealthState {
    state: ConnectionState,
    /// Bumped on every open; identifies the live session's listener
    generation: u64,
    ticks_since_reconnect: u64,
    messages_since_reconnect: u64,
    endpoint: Option<BrokerEndpoint>,
    connected_since: Option<Instant>,
}

/// Connection health shared by the control loop, transport callbacks and
/// the reporting timer
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    inner: Arc<Mutex<HealthState>>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HealthState {
                state: ConnectionState::Disconnected,
                generation: 0,
                ticks_since_reconnect: 0,
                messages_since_reconnect: 0,
                endpoint: None,
                connected_since: None,
            })),
        }
    }
}

impl ConnectionHealth {
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Broker of the current (or last attempted) session
    pub fn endpoint(&self) -> Option<BrokerEndpoint> {
        self.inner.lock().endpoint.clone()
    }

    /// Time since the current session connected
    pub fn uptime(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connected => inner.connected_since.map(|t| t.elapsed()),
            _ => None,
        }
    }

    pub fn messages_since_reconnect(&self) -> u64 {
        self.inner.lock().messages_since_reconnect
    }
}

/// Receives events for one session generation
struct SessionListener {
    generation: u64,
    health: ConnectionHealth,
    pipeline: MessagePipeline,
    ctx: Context,
}

impl SessionListener {
    /// Run `f` on the health state if this listener's session is still live
    fn current(&self, f: impl FnOnce(&mut HealthState)) -> bool {
        let mut inner = self.health.inner.lock();
        if inner.generation != self.generation {
            return false;
        }
        f(&mut inner);
        true
    }
}

impl TransportListener for SessionListener {
    fn on_connected(&self) {
        if self.current(|h| {
            h.state = ConnectionState::Connected;
            h.connected_since = Some(Instant::now());
        }) {
            self.ctx.metrics().set_connected(true);
        }
    }

    fn on_disconnected(&self) {
        let mut was_connected = false;
        let live = self.current(|h| {
            was_connected = h.state != ConnectionState::Disconnected;
            h.state = ConnectionState::Disconnected;
            h.connected_since = None;
        });
        if live && was_connected {
            self.ctx.metrics().set_connected(false);
            warn!(generation = self.generation, "Broker session disconnected");
        }
    }

    fn on_error(&self, message: &str) {
        let live = self.current(|h| {
            h.state = ConnectionState::Disconnected;
            h.connected_since = None;
        });
        if live {
            self.ctx.metrics().set_connected(false);
        }
        error!(generation = self.generation, error = message, "Broker session error");
    }

    fn on_message(&self, headers: Vec<(String, String)>, body: Bytes) {
        self.current(|h| h.messages_since_reconnect += 1);
        self.pipeline.process(headers, &body);
    }
}

/// Keeps one subscribed broker session alive
pub struct BrokerConnection {
    ctx: Context,
    transport: Arc<dyn Transport>,
    pipeline: MessagePipeline,
    /// Snapshot the current session was opened with
    config: Arc<Config>,
    brokers: BrokerList,
    health: ConnectionHealth,
    session: Option<Box<dyn Session>>,
    reload_pending: bool,
}

impl BrokerConnection {
    pub fn new(
        ctx: Context,
        transport: Arc<dyn Transport>,
        pipeline: MessagePipeline,
    ) -> Result<Self> {
        let config = ctx.config();
        let brokers = BrokerList::new(config.brokers.clone())
            .ok_or_else(|| ConsumerError::Config("no broker configured".to_string()))?;

        Ok(Self {
            ctx,
            transport,
            pipeline,
            config,
            brokers,
            health: ConnectionHealth::default(),
            session: None,
            reload_pending: false,
        })
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.health.state()
    }

    /// Run the control loop until shutdown, then disconnect
    pub async fn run(mut self) {
        let shutdown = self.ctx.shutdown().clone();
        let mut config_rx = self.ctx.watch_config();
        let mut watching = true;
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            brokers = self.brokers.len(),
            destinations = ?self.config.subscription.destinations,
            "Broker connection started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                changed = config_rx.changed(), if watching => match changed {
                    Ok(()) => {
                        let config = Arc::clone(&config_rx.borrow_and_update());
                        self.reload(config);
                    }
                    Err(_) => watching = false,
                },

                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.tick() => {}
                    }
                }
            }
        }

        self.disconnect().await;
        info!("Broker connection stopped");
    }

    /// One control loop iteration
    pub async fn tick(&mut self) {
        let idle_ticks = self.config.subscription.idle_msg_timeout;

        let mut reason = {
            let mut h = self.health.inner.lock();
            if h.state != ConnectionState::Connected {
                Some("disconnected")
            } else if idle_ticks > 0 && h.ticks_since_reconnect >= idle_ticks {
                let idle = h.messages_since_reconnect == 0;
                h.ticks_since_reconnect = 0;
                h.messages_since_reconnect = 0;
                if idle {
                    warn!(
                        idle_secs = idle_ticks,
                        endpoint = ?h.endpoint.as_ref().map(ToString::to_string),
                        "No messages received within idle timeout, reconnecting"
                    );
                    Some("idle")
                } else {
                    None
                }
            } else {
                None
            }
        };

        if self.reload_pending {
            self.reload_pending = false;
            reason = Some("reload");
        }

        if let Some(reason) = reason {
            self.reconnect(reason).await;
        }

        self.health.inner.lock().ticks_since_reconnect += 1;
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.disconnect().await {
                debug!(error = %e, "Previous session already closed");
            }
        }
    }

    async fn reconnect(&mut self, reason: &'static str) {
        self.close_session().await;

        let endpoint = self.brokers.advance().clone();
        let generation = {
            let mut h = self.health.inner.lock();
            h.generation += 1;
            h.state = ConnectionState::Connecting;
            h.ticks_since_reconnect = 0;
            h.messages_since_reconnect = 0;
            h.endpoint = Some(endpoint.clone());
            h.connected_since = None;
            h.generation
        };
        self.ctx.metrics().record_reconnect(reason);
        self.ctx.metrics().set_connected(false);

        let listener = Arc::new(SessionListener {
            generation,
            health: self.health.clone(),
            pipeline: self.pipeline.clone(),
            ctx: self.ctx.clone(),
        });
        let options = ConnectOptions::from_config(&self.config);

        info!(%endpoint, reason, use_ssl = options.use_ssl, "Connecting to broker");

        let mut session = match self.transport.open(&endpoint, &options, listener).await {
            Ok(session) => session,
            Err(e) => {
                self.mark_disconnected(generation);
                error!(%endpoint, error = %e, "Failed to connect to broker");
                return;
            }
        };

        for destination in &self.config.subscription.destinations {
            if let Err(e) = session.subscribe(destination).await {
                error!(%endpoint, destination, error = %e, "Failed to subscribe");
                let _ = session.disconnect().await;
                self.mark_disconnected(generation);
                return;
            }
        }

        self.session = Some(session);
        info!(
            %endpoint,
            destinations = ?self.config.subscription.destinations,
            "Connected and subscribed"
        );
    }

    fn mark_disconnected(&self, generation: u64) {
        let mut h = self.health.inner.lock();
        if h.generation == generation {
            h.state = ConnectionState::Disconnected;
            h.connected_since = None;
        }
    }

    /// Adopt a new configuration snapshot
    ///
    /// A changed broker list replaces the rotation; any change to brokers,
    /// destinations or connection settings forces a reconnect on the next
    /// tick.
    pub fn reload(&mut self, config: Arc<Config>) {
        let brokers_changed = !self.brokers.same_endpoints(&config.brokers);
        let destinations_changed =
            self.config.subscription.destinations != config.subscription.destinations;
        let connection_changed = self.config.stomp != config.stomp
            || self.config.authentication != config.authentication;

        if brokers_changed {
            match BrokerList::new(config.brokers.clone()) {
                Some(list) => self.brokers = list,
                None => {
                    warn!("Reloaded configuration has no brokers, keeping previous list");
                    return;
                }
            }
        }

        self.config = config;

        if brokers_changed || destinations_changed || connection_changed {
            self.reload_pending = true;
            info!(
                brokers_changed,
                destinations_changed, connection_changed, "Connection settings changed, reconnecting"
            );
        } else {
            debug!("Configuration reloaded, connection settings unchanged");
        }
    }

    /// Close the session and stop reacting to its events
    pub async fn disconnect(&mut self) {
        self.close_session().await;

        let mut h = self.health.inner.lock();
        h.generation += 1;
        h.state = ConnectionState::Disconnected;
        h.connected_since = None;
        drop(h);

        self.ctx.metrics().set_connected(false);
    }
}
