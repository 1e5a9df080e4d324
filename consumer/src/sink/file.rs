//! Date-partitioned Avro file sink
//!
//! Records go to the partition file named after their own timestamp date.
//! Malformed messages go, as JSON lines, to a `.WRONGFORMAT` sibling of the
//! error file named after the reception date. With plaintext mirroring on,
//! every record is also appended as a JSON line to a `.PLAINTEXT` sibling of
//! its partition file.

use crate::config::{Config, FileSinkConfig};
use crate::error::SinkError;
use crate::message::{Classification, Delivery, NormalizedRecord, RawMessage};
use crate::sink::BatchSink;
use crate::sink::avro;
use crate::stats::SinkCounters;
use apache_avro::Schema;
use apache_avro::types::Value;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Extension of the JSON-lines mirror of a partition file
pub const PLAINTEXT_EXTENSION: &str = "PLAINTEXT";

/// Extension of the JSON-lines file holding malformed messages
pub const WRONG_FORMAT_EXTENSION: &str = "WRONGFORMAT";

/// Immutable settings snapshot, swapped whole on reload
struct FileSinkState {
    config: FileSinkConfig,
    schema: Arc<Schema>,
}

/// Writes records into Avro container files partitioned by date
pub struct FileSink {
    state: RwLock<Arc<FileSinkState>>,
    /// Serializes every open/append/close on this sink's files
    write_lock: Arc<Mutex<()>>,
    counters: Arc<SinkCounters>,
}

impl FileSink {
    /// Create a file sink from the `MsgFile` section
    ///
    /// # Errors
    /// Returns `SinkError::Init` if the section is disabled or the schema
    /// cannot be loaded.
    pub fn new(config: &Config, counters: Arc<SinkCounters>) -> Result<Self, SinkError> {
        Ok(Self {
            state: RwLock::new(Arc::new(Self::build_state(config)?)),
            write_lock: Arc::new(Mutex::new(())),
            counters,
        })
    }

    fn build_state(config: &Config) -> Result<FileSinkState, SinkError> {
        let file_config = config
            .msg_file
            .clone()
            .ok_or_else(|| SinkError::Init("MsgFile is not enabled".to_string()))?;
        let schema = avro::load_schema(&config.general.avro_schema)?;

        Ok(FileSinkState {
            config: file_config,
            schema: Arc::new(schema),
        })
    }

    fn state(&self) -> Arc<FileSinkState> {
        Arc::clone(&self.state.read())
    }
}

#[async_trait]
impl BatchSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn accepts(&self, classification: Classification) -> bool {
        match classification {
            Classification::Malformed => self.state.read().config.error_filename.is_some(),
            _ => true,
        }
    }

    fn bulk_size(&self) -> usize {
        self.state.read().config.bulk_size
    }

    async fn flush(&self, batch: Vec<Delivery>) -> Result<(), SinkError> {
        let state = self.state();
        let lock = Arc::clone(&self.write_lock);
        let counters = Arc::clone(&self.counters);

        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            write_batch(&state, batch, &counters);
        })
        .await
        .map_err(|e| SinkError::Write(format!("file writer task failed: {e}")))
    }

    fn load(&self, config: &Config) -> Result<(), SinkError> {
        let state = Self::build_state(config)?;
        *self.state.write() = Arc::new(state);
        Ok(())
    }
}

/// Records bound for one partition file, in arrival order
struct Partition<'a> {
    path: PathBuf,
    records: Vec<&'a NormalizedRecord>,
}

fn write_batch(state: &FileSinkState, batch: Vec<Delivery>, counters: &SinkCounters) {
    let mut partitions: Vec<Partition<'_>> = Vec::new();
    let mut malformed: Vec<(PathBuf, &RawMessage)> = Vec::new();

    for delivery in &batch {
        match delivery {
            Delivery::Record { record, .. } => {
                let path = state.config.partition_path(record.date());
                match partitions.iter_mut().find(|p| p.path == path) {
                    Some(partition) => partition.records.push(record),
                    None => partitions.push(Partition {
                        path,
                        records: vec![record],
                    }),
                }
            }
            Delivery::Malformed { raw, received } => match state.config.error_path(received) {
                Some(path) => malformed.push((path.with_extension(WRONG_FORMAT_EXTENSION), raw)),
                None => counters.record_failed(1),
            },
        }
    }

    for partition in &partitions {
        write_partition(state, partition, counters);
    }

    for (path, raw) in malformed {
        match append_json_lines(&path, std::iter::once(raw)) {
            Ok(()) => counters.record_written(1),
            Err(e) => {
                counters.record_failed(1);
                error!(
                    path = %path.display(),
                    message_id = raw.message_id(),
                    error = %e,
                    "Failed to write malformed message"
                );
            }
        }
    }
}

fn write_partition(state: &FileSinkState, partition: &Partition<'_>, counters: &SinkCounters) {
    let mut values: Vec<Value> = Vec::with_capacity(partition.records.len());
    let mut encoded: Vec<&NormalizedRecord> = Vec::with_capacity(partition.records.len());

    for record in &partition.records {
        match avro::to_value(record, &state.schema) {
            Ok(value) => {
                values.push(value);
                encoded.push(record);
            }
            Err(e) => {
                counters.record_failed(1);
                error!(
                    path = %partition.path.display(),
                    hostname = %record.hostname,
                    metric = %record.metric,
                    error = %e,
                    "Record does not match schema"
                );
            }
        }
    }

    match avro::append_values(&partition.path, &state.schema, values) {
        Ok(written) => {
            counters.record_written(written as u64);
            debug!(path = %partition.path.display(), count = written, "Partition appended");
        }
        Err(e) => {
            counters.record_failed(encoded.len() as u64);
            error!(
                path = %partition.path.display(),
                count = encoded.len(),
                error = %e,
                "Failed to append to partition file"
            );
            return;
        }
    }

    if state.config.write_plaintext {
        let mirror = partition.path.with_extension(PLAINTEXT_EXTENSION);
        if let Err(e) = append_json_lines(&mirror, encoded.into_iter()) {
            error!(path = %mirror.display(), error = %e, "Failed to write plaintext mirror");
        }
    }
}

fn append_json_lines<'a, T>(path: &Path, items: impl Iterator<Item = &'a T>) -> Result<(), SinkError>
where
    T: serde::Serialize + 'a,
{
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = BufWriter::new(file);
    for item in items {
        serde_json::to_writer(&mut out, item)
            .map_err(|e| SinkError::Write(format!("{}: {e}", path.display())))?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::stats::Stats;
    use std::collections::BTreeMap;

    const SCHEMA: &str = include_str!("../../schema/metric_data.avsc");

    fn setup(extra: &str) -> (tempfile::TempDir, Config, Arc<SinkCounters>) {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("metric_data.avsc");
        std::fs::write(&schema, SCHEMA).unwrap();

        let toml = format!(
            r#"
            [General]
            AvroSchema = "{schema}"
            WriteMsgFile = true
            LogWrongFormat = true
            [Brokers]
            Server1 = "localhost"
            [Subscription]
            Destinations = "/topic/test"
            [MsgFile]
            Directory = "{dir}"
            Filename = "metrics_DATE.avro"
            ErrorFilename = "errors_DATE.avro"
            {extra}
            "#,
            schema = schema.display(),
            dir = dir.path().display(),
        );
        let config = Config::from_toml_str(&toml).unwrap();
        let stats = Stats::new(Arc::new(Metrics::new().unwrap()));
        (dir, config, stats.sink("file"))
    }

    fn record(timestamp: &str, service: &str) -> Delivery {
        Delivery::Record {
            record: NormalizedRecord {
                service: service.to_string(),
                timestamp: timestamp.to_string(),
                hostname: "se.example.org".to_string(),
                metric: "org.sam.SRM-Put".to_string(),
                status: "CRITICAL".to_string(),
                message: None,
                summary: Some("timeout".to_string()),
                monitoring_host: None,
                tags: None,
            },
            classification: Classification::InWindow,
        }
    }

    #[tokio::test]
    async fn test_records_partitioned_by_date() {
        let (dir, config, counters) = setup("");
        let sink = FileSink::new(&config, Arc::clone(&counters)).unwrap();

        sink.flush(vec![
            record("2024-03-09T23:00:00Z", "SRM"),
            record("2024-03-10T01:00:00Z", "SRMv2"),
            record("2024-03-09T23:30:00Z", "CREAM-CE"),
        ])
        .await
        .unwrap();

        let day1 = avro::read_records(&dir.path().join("metrics_2024-03-09.avro")).unwrap();
        let day2 = avro::read_records(&dir.path().join("metrics_2024-03-10.avro")).unwrap();
        let services: Vec<&str> = day1.iter().map(|r| r.service.as_str()).collect();
        assert_eq!(services, ["SRM", "CREAM-CE"]);
        assert_eq!(day2.len(), 1);
        assert_eq!(counters.written(), 3);
        assert!(!dir.path().join("metrics_2024-03-09.PLAINTEXT").exists());
    }

    #[tokio::test]
    async fn test_plaintext_mirror() {
        let (dir, config, counters) = setup("WritePlaintext = true");
        let sink = FileSink::new(&config, counters).unwrap();

        sink.flush(vec![record("2024-03-10T01:00:00Z", "SRM")])
            .await
            .unwrap();
        sink.flush(vec![record("2024-03-10T02:00:00Z", "SRMv2")])
            .await
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("metrics_2024-03-10.PLAINTEXT")).unwrap();
        let lines: Vec<NormalizedRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].service, "SRMv2");
        assert_eq!(
            avro::read_records(&dir.path().join("metrics_2024-03-10.avro"))
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_malformed_written_to_error_file() {
        let (dir, config, counters) = setup("");
        let sink = FileSink::new(&config, Arc::clone(&counters)).unwrap();
        assert!(sink.accepts(Classification::Malformed));

        let mut fields = BTreeMap::new();
        fields.insert("message-id".to_string(), "ID:broken".to_string());
        fields.insert("hostName".to_string(), "ce01".to_string());
        sink.flush(vec![Delivery::Malformed {
            raw: RawMessage::from_fields(fields),
            received: "2024-03-11".to_string(),
        }])
        .await
        .unwrap();

        let text = std::fs::read_to_string(dir.path().join("errors_2024-03-11.WRONGFORMAT")).unwrap();
        let raw: BTreeMap<String, String> = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(raw["message-id"], "ID:broken");
        assert_eq!(counters.written(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_directory_counts_failure() {
        let (dir, config, counters) = setup("");
        let sink = FileSink::new(&config, Arc::clone(&counters)).unwrap();
        drop(dir);

        sink.flush(vec![record("2024-03-10T01:00:00Z", "SRM")])
            .await
            .unwrap();
        assert_eq!(counters.failed(), 1);
        assert_eq!(counters.written(), 0);
    }

    #[test]
    fn test_reload_swaps_bulk_size() {
        let (_dir, config, counters) = setup("BulkSize = 5");
        let sink = FileSink::new(&config, counters).unwrap();
        assert_eq!(sink.bulk_size(), 5);

        let mut reloaded = config.clone();
        if let Some(file) = reloaded.msg_file.as_mut() {
            file.bulk_size = 2;
        }
        sink.load(&reloaded).unwrap();
        assert_eq!(sink.bulk_size(), 2);

        let mut broken = reloaded.clone();
        broken.general.avro_schema = PathBuf::from("/nonexistent.avsc");
        assert!(sink.load(&broken).is_err());
        assert_eq!(sink.bulk_size(), 2, "failed reload keeps previous settings");
    }
}
