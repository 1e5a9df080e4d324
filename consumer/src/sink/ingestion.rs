//! HTTPS ingestion sink
//!
//! POSTs base64 Avro datums to the ingestion API publish endpoint:
//!
//! ```text
//! POST https://{host}/v1/projects/{tenant}/topics/metric_data:publish?key={token}
//! {"messages": [{"attributes": {"type": "metric_data", "partition_date": "YYYY-MM-DD"},
//!                "data": "<base64 avro datum>"}]}
//! ```
//!
//! Failed requests are logged with the response body and dropped. There is
//! no retry.

use crate::config::{Config, IngestionConfig};
use crate::error::SinkError;
use crate::message::{Classification, DATE_FORMAT, Delivery, NormalizedRecord};
use crate::sink::BatchSink;
use crate::sink::avro;
use crate::stats::SinkCounters;
use apache_avro::Schema;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Upper bound of messages in one publish request
pub const MAX_MESSAGES_PER_REQUEST: usize = 100;

/// Message type attribute expected by the ingestion API
const MESSAGE_TYPE: &str = "metric_data";

/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<PublishMessage<'a>>,
}

#[derive(Serialize)]
struct PublishMessage<'a> {
    attributes: Attributes<'a>,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

#[derive(Serialize)]
struct Attributes<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    partition_date: &'a str,
}

/// Base64 encoding for the binary datum
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::Serializer;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }
}

struct IngestionState {
    client: Client,
    url: String,
    /// Host and tenant, for logs; `url` carries the token
    endpoint: String,
    schema: Arc<Schema>,
    bulk_size: usize,
}

/// Publishes valid records to the ingestion API
pub struct IngestionSink {
    state: RwLock<Arc<IngestionState>>,
    counters: Arc<SinkCounters>,
}

/// Publish URL for the configured host, tenant and token
///
/// A host given with an explicit `http://` or `https://` scheme is used as
/// the base as-is; a bare host gets `https://`.
pub fn publish_url(config: &IngestionConfig) -> String {
    format!(
        "{}/v1/projects/{}/topics/{MESSAGE_TYPE}:publish?key={}",
        base_url(&config.host),
        config.tenant,
        config.token
    )
}

fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

impl IngestionSink {
    /// Create an ingestion sink from the `MsgIngestion` section
    ///
    /// # Errors
    /// Returns `SinkError::Init` if the section is disabled, the schema cannot
    /// be loaded or the HTTP client cannot be created.
    pub fn new(config: &Config, counters: Arc<SinkCounters>) -> Result<Self, SinkError> {
        Ok(Self {
            state: RwLock::new(Arc::new(Self::build_state(config)?)),
            counters,
        })
    }

    fn build_state(config: &Config) -> Result<IngestionState, SinkError> {
        let ingestion = config
            .msg_ingestion
            .as_ref()
            .ok_or_else(|| SinkError::Init("MsgIngestion is not enabled".to_string()))?;
        let schema = avro::load_schema(&config.general.avro_schema)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(ingestion.timeout_secs))
            .connect_timeout(Duration::from_secs(
                DEFAULT_CONNECT_TIMEOUT_SECS.min(ingestion.timeout_secs),
            ))
            .danger_accept_invalid_certs(!ingestion.verify_certificate)
            .build()
            .map_err(|e| SinkError::Init(format!("Failed to build HTTP client: {e}")))?;

        Ok(IngestionState {
            client,
            url: publish_url(ingestion),
            endpoint: format!("{}/{}", base_url(&ingestion.host), ingestion.tenant),
            schema: Arc::new(schema),
            bulk_size: ingestion.bulk_size,
        })
    }

    fn state(&self) -> Arc<IngestionState> {
        Arc::clone(&self.state.read())
    }

    async fn publish(&self, state: &IngestionState, records: &[&NormalizedRecord], today: &str) {
        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            match avro::encode_datum(record, &state.schema) {
                Ok(data) => messages.push(PublishMessage {
                    attributes: Attributes {
                        kind: MESSAGE_TYPE,
                        partition_date: today,
                    },
                    data,
                }),
                Err(e) => {
                    self.counters.record_failed(1);
                    error!(
                        hostname = %record.hostname,
                        metric = %record.metric,
                        error = %e,
                        "Record does not match schema"
                    );
                }
            }
        }
        if messages.is_empty() {
            return;
        }

        let count = messages.len();
        let payload = PublishRequest { messages };

        match state.client.post(&state.url).json(&payload).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    self.counters.record_written(count as u64);
                    debug!(
                        endpoint = %state.endpoint,
                        count,
                        status = %status,
                        "Ingestion request delivered"
                    );
                } else {
                    let body = response.text().await.unwrap_or_default();
                    self.counters.record_failed(count as u64);
                    error!(
                        endpoint = %state.endpoint,
                        status = %status,
                        body = %body,
                        count,
                        "Ingestion request failed, records dropped"
                    );
                }
            }
            Err(e) => {
                self.counters.record_failed(count as u64);
                // The request URL carries the access token
                error!(
                    endpoint = %state.endpoint,
                    error = %e.without_url(),
                    count,
                    "Ingestion request could not be sent, records dropped"
                );
            }
        }
    }
}

#[async_trait]
impl BatchSink for IngestionSink {
    fn name(&self) -> &'static str {
        "ingestion"
    }

    /// Only in-window records are published
    fn accepts(&self, classification: Classification) -> bool {
        classification == Classification::InWindow
    }

    fn bulk_size(&self) -> usize {
        self.state.read().bulk_size
    }

    async fn flush(&self, batch: Vec<Delivery>) -> Result<(), SinkError> {
        let state = self.state();
        let today = chrono::Utc::now().format(DATE_FORMAT).to_string();

        let records: Vec<&NormalizedRecord> = batch.iter().filter_map(Delivery::record).collect();
        for chunk in records.chunks(MAX_MESSAGES_PER_REQUEST) {
            self.publish(&state, chunk, &today).await;
        }
        Ok(())
    }

    fn load(&self, config: &Config) -> Result<(), SinkError> {
        let state = Self::build_state(config)?;
        *self.state.write() = Arc::new(state);
        Ok(())
    }
}
