//! Message types flowing through the consumer
//!
//! ```text
//! STOMP frame ──► RawMessage ──► Classification ──► NormalizedRecord(s) ──► Delivery
//!  (headers+body)   (field map)    (window check)     (one per service)      (per sink)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header every raw message carries
pub const MESSAGE_ID: &str = "message-id";

/// Fields a metric result must carry to be normalised
pub const MANDATORY_FIELDS: [&str; 5] = [
    "serviceType",
    "timestamp",
    "hostName",
    "metricName",
    "metricStatus",
];

/// Timestamp format of metric results
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Date format used for partitions
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Field map built from one inbound frame
///
/// Frame headers are inserted first, `key: value` body lines second, so body
/// fields win on collision.
///
/// # Example
///
/// ```
/// use argo_consumer::message::RawMessage;
///
/// let headers = vec![("message-id".to_string(), "ID:1".to_string())];
/// let raw = RawMessage::parse(headers, b"hostName: ce01.example.org\nmetricStatus: OK");
/// assert_eq!(raw.get("hostName"), Some("ce01.example.org"));
/// assert_eq!(raw.message_id(), "ID:1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawMessage {
    fields: BTreeMap<String, String>,
}

impl RawMessage {
    /// Merge frame headers and body lines into one field map
    ///
    /// Body lines are split on the first `": "`; lines without it are ignored.
    /// Invalid UTF-8 is replaced rather than rejected. A fresh ULID is used as
    /// `message-id` when the frame did not carry one.
    pub fn parse<I>(headers: I, body: &[u8]) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        // Repeated headers: the first occurrence wins
        for (key, value) in headers {
            fields.entry(key).or_insert(value);
        }

        let body = String::from_utf8_lossy(body);
        for line in body.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some((key, value)) = line.split_once(": ") {
                fields.insert(key.to_string(), value.to_string());
            }
        }

        fields
            .entry(MESSAGE_ID.to_string())
            .or_insert_with(|| ulid::Ulid::new().to_string());

        Self { fields }
    }

    pub fn from_fields(fields: BTreeMap<String, String>) -> Self {
        let mut raw = Self { fields };
        raw.fields
            .entry(MESSAGE_ID.to_string())
            .or_insert_with(|| ulid::Ulid::new().to_string());
        raw
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Like [`get`](RawMessage::get) but treats blank values as absent
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn message_id(&self) -> &str {
        self.get(MESSAGE_ID).unwrap_or_default()
    }

    /// Mandatory fields that are absent or blank
    pub fn missing_fields(&self) -> Vec<&'static str> {
        MANDATORY_FIELDS
            .iter()
            .copied()
            .filter(|f| self.get_non_empty(f).is_none())
            .collect()
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// Optional VO/ROC tags attached to a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    pub roc: Option<String>,
    #[serde(rename = "voName")]
    pub vo_name: Option<String>,
    #[serde(rename = "voFqan")]
    pub vo_fqan: Option<String>,
}

impl Tags {
    pub fn is_empty(&self) -> bool {
        self.roc.is_none() && self.vo_name.is_none() && self.vo_fqan.is_none()
    }
}

/// Canonical metric result, one per service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub service: String,
    /// `YYYY-MM-DDThh:mm:ssZ`
    pub timestamp: String,
    pub hostname: String,
    pub metric: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
}

impl NormalizedRecord {
    /// `YYYY-MM-DD` prefix of the timestamp, used for partitioning
    pub fn date(&self) -> &str {
        self.timestamp.get(..10).unwrap_or(&self.timestamp)
    }
}

/// Outcome of validating and window-checking a raw message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    InWindow,
    OutOfWindow,
    Malformed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::InWindow => "in_window",
            Classification::OutOfWindow => "out_of_window",
            Classification::Malformed => "malformed",
        }
    }
}

/// Unit of work handed to a sink
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A valid record, in or out of the retention window
    Record {
        record: NormalizedRecord,
        classification: Classification,
    },
    /// A message that failed validation, kept verbatim for forensics
    Malformed {
        raw: RawMessage,
        /// `YYYY-MM-DD` of reception, keys the error file
        received: String,
    },
}

impl Delivery {
    pub fn classification(&self) -> Classification {
        match self {
            Delivery::Record { classification, .. } => *classification,
            Delivery::Malformed { .. } => Classification::Malformed,
        }
    }

    pub fn record(&self) -> Option<&NormalizedRecord> {
        match self {
            Delivery::Record { record, .. } => Some(record),
            Delivery::Malformed { .. } => None,
        }
    }
}
