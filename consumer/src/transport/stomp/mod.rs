//! STOMP 1.2 transport over TCP, optionally TLS
//!
//! `open` connects, sends CONNECT and waits for CONNECTED. A reader task then
//! owns the inbound half of the connection and reports every MESSAGE, ERROR
//! and the end of the stream to the listener. Subscriptions use
//! `ack:auto`, so nothing is ever acknowledged explicitly.

pub mod codec;
pub mod frame;

use crate::broker::BrokerEndpoint;
use crate::error::TransportError;
use crate::transport::{ConnectOptions, KeepaliveOptions, Session, Transport, TransportListener, tls};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

pub use codec::StompCodec;
pub use frame::{Command, Frame};

/// Protocol versions offered in CONNECT
const ACCEPT_VERSION: &str = "1.0,1.1,1.2";

/// Byte stream a session runs over, plain or TLS
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type StompStream = Framed<Box<dyn AsyncStream>, StompCodec>;

/// Production broker transport
#[derive(Debug, Default, Clone)]
pub struct StompTransport;

impl StompTransport {
    pub fn new() -> Self {
        Self
    }
}

fn apply_keepalive(stream: &TcpStream, keepalive: &KeepaliveOptions) -> std::io::Result<()> {
    let params = TcpKeepalive::new().with_time(keepalive.idle);
    #[cfg(target_os = "linux")]
    let params = params
        .with_interval(keepalive.interval)
        .with_retries(keepalive.probes);

    SockRef::from(stream).set_tcp_keepalive(&params)
}

async fn connect_stream(
    endpoint: &BrokerEndpoint,
    options: &ConnectOptions,
) -> Result<Box<dyn AsyncStream>, TransportError> {
    let tcp = timeout(
        options.connect_timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| TransportError::Timeout("TCP connect"))?
    .map_err(|e| TransportError::Connect {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;

    tcp.set_nodelay(true)?;
    apply_keepalive(&tcp, &options.keepalive)?;

    if !options.use_ssl {
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(tls::client_config(options)?);
    let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
        .map_err(|e| TransportError::Tls(format!("invalid server name {}: {e}", endpoint.host)))?;
    let stream = timeout(options.connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TransportError::Timeout("TLS handshake"))?
        .map_err(|e| TransportError::Tls(format!("handshake with {endpoint} failed: {e}")))?;

    Ok(Box::new(stream))
}

async fn handshake(
    endpoint: &BrokerEndpoint,
    options: &ConnectOptions,
) -> Result<(StompStream, Frame), TransportError> {
    let mut framed = Framed::new(connect_stream(endpoint, options).await?, StompCodec);

    framed
        .send(
            Frame::new(Command::Connect)
                .header("accept-version", ACCEPT_VERSION)
                .header("host", endpoint.host.as_str())
                .header("heart-beat", "0,0"),
        )
        .await?;

    let reply = timeout(options.connect_timeout, framed.next())
        .await
        .map_err(|_| TransportError::Timeout("CONNECTED frame"))?;

    match reply {
        Some(Ok(frame)) if frame.command == Command::Connected => Ok((framed, frame)),
        Some(Ok(frame)) if frame.command == Command::Error => {
            Err(TransportError::Rejected(frame.error_message()))
        }
        Some(Ok(frame)) => Err(TransportError::Protocol(format!(
            "expected CONNECTED, got {}",
            frame.command
        ))),
        Some(Err(e)) => Err(e),
        None => Err(TransportError::Protocol(
            "connection closed before CONNECTED".to_string(),
        )),
    }
}

async fn read_loop(
    mut inbound: SplitStream<StompStream>,
    listener: Arc<dyn TransportListener>,
    endpoint: String,
) {
    while let Some(next) = inbound.next().await {
        match next {
            Ok(frame) => match frame.command {
                Command::Message => {
                    let (headers, body) = frame.into_parts();
                    listener.on_message(headers, body);
                }
                Command::Error => listener.on_error(&frame.error_message()),
                Command::Receipt => {
                    debug!(endpoint, receipt = frame.get("receipt-id"), "Receipt");
                }
                other => debug!(endpoint, command = %other, "Ignoring unexpected frame"),
            },
            Err(e) => {
                listener.on_error(&e.to_string());
                break;
            }
        }
    }

    debug!(endpoint, "Broker stream ended");
    listener.on_disconnected();
}

#[async_trait]
impl Transport for StompTransport {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn Session>, TransportError> {
        let attempts = options.reconnect_attempts.max(1);
        let mut last_error = TransportError::NotConnected;

        for attempt in 1..=attempts {
            match handshake(endpoint, options).await {
                Ok((framed, connected)) => {
                    info!(
                        %endpoint,
                        version = connected.get("version").unwrap_or("1.0"),
                        server = connected.get("server").unwrap_or("unknown"),
                        "STOMP session established"
                    );
                    let (outbound, inbound) = framed.split();
                    listener.on_connected();
                    let reader = tokio::spawn(read_loop(
                        inbound,
                        Arc::clone(&listener),
                        endpoint.to_string(),
                    ));
                    return Ok(Box::new(StompSession {
                        outbound,
                        reader,
                        next_subscription: 0,
                        closed: false,
                    }));
                }
                Err(e) => {
                    warn!(%endpoint, attempt, attempts, error = %e, "STOMP connect attempt failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

/// Outbound half of an established STOMP connection
pub struct StompSession {
    outbound: SplitSink<StompStream, Frame>,
    reader: JoinHandle<()>,
    next_subscription: u32,
    closed: bool,
}

#[async_trait]
impl Session for StompSession {
    async fn subscribe(&mut self, destination: &str) -> Result<(), TransportError> {
        if self.closed || self.reader.is_finished() {
            return Err(TransportError::NotConnected);
        }

        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;

        self.outbound
            .send(
                Frame::new(Command::Subscribe)
                    .header("destination", destination)
                    .header("id", id)
                    .header("ack", "auto"),
            )
            .await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        self.closed = true;

        let sent = self.outbound.send(Frame::new(Command::Disconnect)).await;
        let _ = self.outbound.close().await;
        self.reader.abort();
        sent.map_err(|_| TransportError::NotConnected)
    }
}

impl Drop for StompSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
