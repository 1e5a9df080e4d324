//! STOMP transport against an in-process fake broker

use argo_consumer::broker::BrokerEndpoint;
use argo_consumer::error::TransportError;
use argo_consumer::transport::{ConnectOptions, KeepaliveOptions, StompTransport, Transport, TransportListener};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, PartialEq)]
enum Event {
    Connected,
    Disconnected,
    Error(String),
    Message(Vec<(String, String)>, Bytes),
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl TransportListener for ChannelListener {
    fn on_connected(&self) {
        let _ = self.tx.send(Event::Connected);
    }

    fn on_disconnected(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(Event::Error(message.to_string()));
    }

    fn on_message(&self, headers: Vec<(String, String)>, body: Bytes) {
        let _ = self.tx.send(Event::Message(headers, body));
    }
}

fn listener() -> (Arc<dyn TransportListener>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelListener { tx }), rx)
}

fn options() -> ConnectOptions {
    ConnectOptions {
        use_ssl: false,
        host_cert: None,
        host_key: None,
        ca_cert: None,
        keepalive: KeepaliveOptions {
            idle: Duration::from_secs(20),
            interval: Duration::from_secs(5),
            probes: 10,
        },
        reconnect_attempts: 1,
        connect_timeout: Duration::from_secs(2),
    }
}

/// Read one NUL-terminated frame as text
async fn read_frame(stream: &mut TcpStream) -> String {
    let mut frame = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 || byte[0] == 0 {
            break;
        }
        frame.push(byte[0]);
    }
    String::from_utf8(frame).unwrap().trim_start_matches('\n').to_string()
}

async fn broker() -> (TcpListener, BrokerEndpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, BrokerEndpoint::new("127.0.0.1", port))
}

#[tokio::test]
async fn test_connect_subscribe_receive_disconnect() {
    let (server, endpoint) = broker().await;

    let broker = tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();

        let connect = read_frame(&mut stream).await;
        assert!(connect.starts_with("CONNECT\n"));
        assert!(connect.contains("accept-version:1.0,1.1,1.2"));
        assert!(connect.contains("host:127.0.0.1"));
        stream
            .write_all(b"CONNECTED\nversion:1.2\nserver:fake\n\n\0")
            .await
            .unwrap();

        let subscribe = read_frame(&mut stream).await;
        assert!(subscribe.starts_with("SUBSCRIBE\n"));
        assert!(subscribe.contains("destination:/topic/probe.metricOutput"));
        assert!(subscribe.contains("id:sub-0"));
        assert!(subscribe.contains("ack:auto"));

        stream
            .write_all(
                b"\nMESSAGE\ndestination:/topic/probe.metricOutput\nmessage-id:ID\\c7\nsubscription:sub-0\n\nhostName: ce01.example.org\nmetricStatus: OK\0",
            )
            .await
            .unwrap();

        let disconnect = read_frame(&mut stream).await;
        assert!(disconnect.starts_with("DISCONNECT"));
    });

    let (listener, mut events) = listener();
    let mut session = StompTransport::new()
        .open(&endpoint, &options(), listener)
        .await
        .unwrap();
    assert_eq!(events.recv().await, Some(Event::Connected));

    session.subscribe("/topic/probe.metricOutput").await.unwrap();

    match events.recv().await {
        Some(Event::Message(headers, body)) => {
            assert!(headers.contains(&("message-id".to_string(), "ID:7".to_string())));
            assert_eq!(&body[..], b"hostName: ce01.example.org\nmetricStatus: OK");
        }
        other => panic!("expected a message, got {other:?}"),
    }

    session.disconnect().await.unwrap();
    broker.await.unwrap();

    assert!(matches!(
        session.disconnect().await,
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn test_broker_error_frame_rejects_connect() {
    let (server, endpoint) = broker().await;

    tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        let _ = read_frame(&mut stream).await;
        stream
            .write_all(b"ERROR\nmessage:access denied\n\n\0")
            .await
            .unwrap();
    });

    let (listener, mut events) = listener();
    let result = StompTransport::new()
        .open(&endpoint, &options(), listener)
        .await;

    match result {
        Err(TransportError::Rejected(message)) => assert_eq!(message, "access denied"),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("connect should be rejected"),
    }
    assert!(events.try_recv().is_err(), "no event for a failed open");
}

#[tokio::test]
async fn test_connection_refused_retries_configured_attempts() {
    let (server, endpoint) = broker().await;
    drop(server);

    let mut options = options();
    options.reconnect_attempts = 3;

    let (listener, _events) = listener();
    let result = StompTransport::new()
        .open(&endpoint, &options, listener)
        .await;
    assert!(matches!(result, Err(TransportError::Connect { .. })));
}

#[tokio::test]
async fn test_broker_closing_stream_reports_disconnect() {
    let (server, endpoint) = broker().await;

    tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        let _ = read_frame(&mut stream).await;
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").await.unwrap();
        stream
            .write_all(b"ERROR\nmessage:shutting down\n\n\0")
            .await
            .unwrap();
    });

    let (listener, mut events) = listener();
    let _session = StompTransport::new()
        .open(&endpoint, &options(), listener)
        .await
        .unwrap();

    assert_eq!(events.recv().await, Some(Event::Connected));
    assert_eq!(
        events.recv().await,
        Some(Event::Error("shutting down".to_string()))
    );
    assert_eq!(events.recv().await, Some(Event::Disconnected));
}
