//! Integration tests for the broker connection state machine
//!
//! A scripted transport stands in for the broker so failover, idle detection
//! and reload can be driven tick by tick.

use argo_consumer::broker::{BrokerConnection, BrokerEndpoint, ConnectionState};
use argo_consumer::config::Config;
use argo_consumer::context::{Context, Control};
use argo_consumer::error::TransportError;
use argo_consumer::metrics::Metrics;
use argo_consumer::pipeline::MessagePipeline;
use argo_consumer::transport::{ConnectOptions, Session, Transport, TransportListener};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Scripted transport
// ============================================================================

#[derive(Default)]
struct ScriptedTransport {
    /// Hosts whose `open` fails
    failing: Mutex<HashSet<String>>,
    /// Host of every `open` call, in order
    opens: Mutex<Vec<String>>,
    /// Listener handed to each successful `open`
    listeners: Mutex<Vec<Arc<dyn TransportListener>>>,
    /// (host, destination) of every subscription
    subscriptions: Arc<Mutex<Vec<(String, String)>>>,
    /// Hosts whose session was disconnected
    disconnects: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    fn failing(hosts: &[&str]) -> Self {
        let transport = Self::default();
        transport
            .failing
            .lock()
            .extend(hosts.iter().map(|h| h.to_string()));
        transport
    }

    fn opens(&self) -> Vec<String> {
        self.opens.lock().clone()
    }

    fn listener(&self, index: usize) -> Arc<dyn TransportListener> {
        Arc::clone(&self.listeners.lock()[index])
    }

    fn last_listener(&self) -> Arc<dyn TransportListener> {
        Arc::clone(self.listeners.lock().last().unwrap())
    }
}

struct ScriptedSession {
    host: String,
    subscriptions: Arc<Mutex<Vec<(String, String)>>>,
    disconnects: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        _options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn Session>, TransportError> {
        self.opens.lock().push(endpoint.host.clone());

        if self.failing.lock().contains(&endpoint.host) {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            });
        }

        listener.on_connected();
        self.listeners.lock().push(listener);
        Ok(Box::new(ScriptedSession {
            host: endpoint.host.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            disconnects: Arc::clone(&self.disconnects),
        }))
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn subscribe(&mut self, destination: &str) -> Result<(), TransportError> {
        self.subscriptions
            .lock()
            .push((self.host.clone(), destination.to_string()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.disconnects.lock().push(self.host.clone());
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(brokers: &[&str], idle: u64) -> Config {
    let servers: String = brokers
        .iter()
        .enumerate()
        .map(|(i, b)| format!("Server{} = \"{b}:6163\"\n", i + 1))
        .collect();

    Config::from_toml_str(&format!(
        r#"
        [General]
        AvroSchema = "schema.avsc"
        WriteMsgFile = true
        [Brokers]
        {servers}
        [Subscription]
        Destinations = "/topic/a, /topic/b"
        IdleMsgTimeout = {idle}
        [MsgFile]
        Directory = "/tmp"
        Filename = "out_DATE.avro"
        "#
    ))
    .unwrap()
}

fn connection(
    config: Config,
    transport: &Arc<ScriptedTransport>,
) -> (BrokerConnection, Context, Control) {
    let (ctx, control) = Context::new(config, Arc::new(Metrics::new().unwrap()));
    let pipeline = MessagePipeline::new(ctx.clone(), Vec::new());
    let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    let conn = BrokerConnection::new(ctx.clone(), transport, pipeline).unwrap();
    (conn, ctx, control)
}

fn message() -> (Vec<(String, String)>, Bytes) {
    (
        vec![("message-id".to_string(), "ID:1".to_string())],
        Bytes::from_static(b"serviceType: CREAM-CE\nhostName: ce01.example.org"),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_failover_reaches_third_broker_within_three_ticks() {
    let transport = Arc::new(ScriptedTransport::failing(&["a", "b"]));
    let (mut conn, ctx, _control) = connection(config(&["a", "b", "c"], 0), &transport);

    conn.tick().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    conn.tick().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    conn.tick().await;
    assert_eq!(conn.state(), ConnectionState::Connected);

    assert_eq!(transport.opens(), ["a", "b", "c"]);
    assert_eq!(
        *transport.subscriptions.lock(),
        [
            ("c".to_string(), "/topic/a".to_string()),
            ("c".to_string(), "/topic/b".to_string()),
        ]
    );
    assert_eq!(conn.health().endpoint().unwrap().host, "c");
    assert_eq!(ctx.metrics().broker_connected.get(), 1);
}

#[tokio::test]
async fn test_idle_timeout_forces_reconnect_on_tenth_tick() {
    let transport = Arc::new(ScriptedTransport::default());
    let (mut conn, ctx, _control) = connection(config(&["a", "b"], 10), &transport);

    conn.tick().await;
    assert_eq!(transport.opens(), ["a"]);

    for _ in 0..9 {
        conn.tick().await;
    }
    assert_eq!(transport.opens(), ["a"], "no reconnect before the timeout");

    conn.tick().await;
    assert_eq!(transport.opens(), ["a", "b"]);
    assert_eq!(*transport.disconnects.lock(), ["a"]);
    assert_eq!(
        ctx.metrics().reconnects.with_label_values(&["idle"]).get(),
        1
    );
}

#[tokio::test]
async fn test_messages_keep_connection_alive() {
    let transport = Arc::new(ScriptedTransport::default());
    let (mut conn, ctx, _control) = connection(config(&["a"], 5), &transport);

    conn.tick().await;
    for _ in 0..20 {
        let (headers, body) = message();
        transport.last_listener().on_message(headers, body);
        conn.tick().await;
    }

    assert_eq!(transport.opens(), ["a"]);
    assert_eq!(ctx.stats().snapshot().received, 20);
}

#[tokio::test]
async fn test_idle_timeout_disabled() {
    let transport = Arc::new(ScriptedTransport::default());
    let (mut conn, _ctx, _control) = connection(config(&["a"], 0), &transport);

    for _ in 0..50 {
        conn.tick().await;
    }
    assert_eq!(transport.opens(), ["a"]);
}

#[tokio::test]
async fn test_disconnect_event_fails_over_to_next_broker() {
    let transport = Arc::new(ScriptedTransport::default());
    let (mut conn, _ctx, _control) = connection(config(&["a", "b"], 0), &transport);

    conn.tick().await;
    transport.last_listener().on_disconnected();
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    conn.tick().await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    transport.last_listener().on_error("broker shutting down");

    conn.tick().await;
    assert_eq!(transport.opens(), ["a", "b", "a"]);
}

#[tokio::test]
async fn test_events_from_replaced_session_are_ignored() {
    let transport = Arc::new(ScriptedTransport::default());
    let (mut conn, _ctx, _control) = connection(config(&["a", "b"], 0), &transport);

    conn.tick().await;
    let stale = transport.listener(0);
    stale.on_disconnected();
    conn.tick().await;
    assert_eq!(conn.state(), ConnectionState::Connected);

    stale.on_error("late error from the old session");
    stale.on_disconnected();
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_reload_with_new_brokers_forces_reconnect() {
    let transport = Arc::new(ScriptedTransport::default());
    let (mut conn, ctx, _control) = connection(config(&["a", "b"], 0), &transport);

    conn.tick().await;
    conn.reload(Arc::new(config(&["a", "b"], 0)));
    conn.tick().await;
    assert_eq!(transport.opens(), ["a"], "unchanged config keeps the session");

    conn.reload(Arc::new(config(&["x", "y"], 0)));
    conn.tick().await;
    assert_eq!(transport.opens(), ["a", "x"]);
    assert_eq!(*transport.disconnects.lock(), ["a"]);
    assert_eq!(
        ctx.metrics().reconnects.with_label_values(&["reload"]).get(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_connects_and_disconnects_on_shutdown() {
    let transport = Arc::new(ScriptedTransport::failing(&["a"]));
    let (conn, _ctx, control) = connection(config(&["a", "b"], 0), &transport);

    let health = conn.health();
    let handle = tokio::spawn(conn.run());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(health.is_connected());
    assert_eq!(transport.opens(), ["a", "b"]);

    control.shutdown();
    handle.await.unwrap();

    assert_eq!(health.state(), ConnectionState::Disconnected);
    assert_eq!(*transport.disconnects.lock(), ["b"]);
}

#[tokio::test(start_paused = true)]
async fn test_run_picks_up_published_reload() {
    let transport = Arc::new(ScriptedTransport::default());
    let (conn, _ctx, control) = connection(config(&["a"], 0), &transport);

    let handle = tokio::spawn(conn.run());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.opens(), ["a"]);

    control.reload(config(&["z"], 0));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.opens(), ["a", "z"]);

    control.shutdown();
    handle.await.unwrap();
}
