//! Broker transport seam
//!
//! A [`Transport`] opens a [`Session`] to one broker endpoint and reports
//! lifecycle events and inbound messages to a [`TransportListener`]. Events
//! arrive from the transport's own reader task, concurrently with whoever
//! drives the session.
//!
//! [`stomp::StompTransport`] is the production implementation; tests supply
//! their own.

pub mod stomp;
pub mod tls;

use crate::broker::BrokerEndpoint;
use crate::config::Config;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use stomp::StompTransport;

/// OS-level TCP keepalive tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveOptions {
    pub idle: Duration,
    pub interval: Duration,
    pub probes: u32,
}

/// Everything a transport needs to open a session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub use_ssl: bool,
    pub host_cert: Option<PathBuf>,
    pub host_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub keepalive: KeepaliveOptions,
    /// Attempts per `open` call before giving up
    pub reconnect_attempts: u32,
    /// Bound on TCP connect and on waiting for the broker handshake
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            use_ssl: config.stomp.use_ssl,
            host_cert: config.authentication.host_cert.clone(),
            host_key: config.authentication.host_key.clone(),
            ca_cert: config.authentication.ca_cert.clone(),
            keepalive: KeepaliveOptions {
                idle: Duration::from_secs(config.stomp.keepalive_idle),
                interval: Duration::from_secs(config.stomp.keepalive_interval),
                probes: config.stomp.keepalive_probes,
            },
            reconnect_attempts: config.stomp.reconnect_attempts,
            connect_timeout: Duration::from_secs(config.stomp.connect_timeout),
        }
    }
}

/// Receives session events
///
/// Called from the transport's reader task; implementations must be cheap
/// and must not block.
pub trait TransportListener: Send + Sync {
    fn on_connected(&self);

    fn on_disconnected(&self);

    fn on_error(&self, message: &str);

    /// One inbound MESSAGE frame
    fn on_message(&self, headers: Vec<(String, String)>, body: Bytes);
}

/// Opens sessions to broker endpoints
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `endpoint` and complete the protocol handshake
    ///
    /// Retries internally up to `options.reconnect_attempts` times. On success
    /// `listener.on_connected` has been called and the session is ready for
    /// subscriptions.
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// An established broker session
#[async_trait]
pub trait Session: Send {
    /// Subscribe to a destination with automatic acknowledgement
    async fn subscribe(&mut self, destination: &str) -> Result<(), TransportError>;

    /// Close the session
    ///
    /// Returns `TransportError::NotConnected` if the session was already gone.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
