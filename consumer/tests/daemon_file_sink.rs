//! End to end: broker messages through the daemon into Avro partition files

use argo_consumer::Daemon;
use argo_consumer::broker::BrokerEndpoint;
use argo_consumer::config::Config;
use argo_consumer::error::TransportError;
use argo_consumer::sink::avro;
use argo_consumer::transport::{ConnectOptions, Session, Transport, TransportListener};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = include_str!("../schema/metric_data.avsc");

/// Replays a fixed set of frames on every subscription
struct ReplayTransport {
    frames: Vec<(Vec<(String, String)>, Bytes)>,
}

struct ReplaySession {
    listener: Arc<dyn TransportListener>,
    frames: Vec<(Vec<(String, String)>, Bytes)>,
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn open(
        &self,
        _endpoint: &BrokerEndpoint,
        _options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn Session>, TransportError> {
        listener.on_connected();
        Ok(Box::new(ReplaySession {
            listener,
            frames: self.frames.clone(),
        }))
    }
}

#[async_trait]
impl Session for ReplaySession {
    async fn subscribe(&mut self, _destination: &str) -> Result<(), TransportError> {
        for (headers, body) in self.frames.drain(..) {
            self.listener.on_message(headers, body);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn frame(id: &str, body: String) -> (Vec<(String, String)>, Bytes) {
    (
        vec![
            ("message-id".to_string(), id.to_string()),
            ("destination".to_string(), "/topic/probe".to_string()),
        ],
        Bytes::from(body),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_land_in_partition_and_error_files() {
    let dir = tempfile::tempdir().unwrap();
    let schema = dir.path().join("metric_data.avsc");
    std::fs::write(&schema, SCHEMA).unwrap();

    let config = Config::from_toml_str(&format!(
        r#"
        [General]
        AvroSchema = "{schema}"
        WriteMsgFile = true
        LogWrongFormat = true
        [Brokers]
        Server1 = "localhost"
        [Subscription]
        Destinations = "/topic/probe"
        [MsgFile]
        Directory = "{dir}"
        Filename = "argo-consumer_log_DATE.avro"
        ErrorFilename = "argo-consumer_error_log_DATE.avro"
        WritePlaintext = true
        BulkSize = 2
        "#,
        schema = schema.display(),
        dir = dir.path().display(),
    ))
    .unwrap();

    let now = Utc::now();
    let today = now.format("%Y-%m-%d").to_string();
    let timestamp = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let transport = ReplayTransport {
        frames: vec![
            frame(
                "ID:1",
                format!(
                    "serviceType: SRM, webdav\ntimestamp: {timestamp}\nhostName: se01.example.org\nmetricName: org.sam.SRM-Put\nmetricStatus: OK\nsummaryData: file stored\nvoName: ops"
                ),
            ),
            frame(
                "ID:2",
                format!("serviceType: SRM\ntimestamp: {timestamp}\nmetricName: org.sam.SRM-Get\nmetricStatus: CRITICAL"),
            ),
            frame(
                "ID:3",
                "serviceType: SRM\ntimestamp: 2000-01-01T00:00:00Z\nhostName: se02.example.org\nmetricName: org.sam.SRM-Get\nmetricStatus: OK".to_string(),
            ),
        ],
    };

    let (daemon, control) = Daemon::with_transport(config, Arc::new(transport)).unwrap();
    let ctx = daemon.context().clone();
    let handle = tokio::spawn(daemon.run());

    for _ in 0..100 {
        if ctx.metrics().messages_received.get() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ctx.metrics().messages_received.get(), 3);

    control.shutdown();
    handle.await.unwrap().unwrap();

    let partition = dir.path().join(format!("argo-consumer_log_{today}.avro"));
    let records = avro::read_records(&partition).unwrap();
    let services: Vec<&str> = records.iter().map(|r| r.service.as_str()).collect();
    assert_eq!(services, ["SRM", "webdav"]);
    assert_eq!(records[0].summary.as_deref(), Some("file stored"));
    assert_eq!(
        records[0].tags.as_ref().and_then(|t| t.vo_name.as_deref()),
        Some("ops")
    );

    let plaintext =
        std::fs::read_to_string(dir.path().join(format!("argo-consumer_log_{today}.PLAINTEXT")))
            .unwrap();
    assert_eq!(plaintext.lines().count(), 2);

    let wrong_format = std::fs::read_to_string(
        dir.path()
            .join(format!("argo-consumer_error_log_{today}.WRONGFORMAT")),
    )
    .unwrap();
    assert_eq!(wrong_format.lines().count(), 1);
    assert!(wrong_format.contains("ID:2"));

    assert!(!dir.path().join("argo-consumer_log_2000-01-01.avro").exists());

    let file = |name: &str| ctx.metrics().records_written.with_label_values(&[name]).get();
    assert_eq!(file("file"), 3);
    assert_eq!(
        ctx.metrics()
            .messages_classified
            .with_label_values(&["out_of_window"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_unreadable_schema_fails_startup() {
    let config = Config::from_toml_str(
        r#"
        [General]
        AvroSchema = "/nonexistent/metric_data.avsc"
        WriteMsgFile = true
        [Brokers]
        Server1 = "localhost"
        [Subscription]
        Destinations = "/topic/probe"
        [MsgFile]
        Directory = "/tmp"
        Filename = "out_DATE.avro"
        "#,
    )
    .unwrap();

    let transport = ReplayTransport { frames: Vec::new() };
    let (daemon, _control) = Daemon::with_transport(config, Arc::new(transport)).unwrap();
    assert!(daemon.run().await.is_err());
}
