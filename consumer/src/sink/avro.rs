//! Avro encoding of normalized records
//!
//! Two framings are produced from the same schema:
//! - object container files, appended to across flushes (file sink)
//! - bare binary datums without container framing (ingestion sink)

use crate::error::SinkError;
use crate::message::{NormalizedRecord, Tags};
use apache_avro::types::Value;
use apache_avro::{Reader, Schema, Writer};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Length of the sync marker closing every container block
const SYNC_MARKER_LEN: usize = 16;

/// Read and parse a schema definition file
pub fn load_schema(path: &Path) -> Result<Schema, SinkError> {
    let text = fs::read_to_string(path)
        .map_err(|e| SinkError::Init(format!("cannot read schema {}: {e}", path.display())))?;
    let schema = Schema::parse_str(&text)
        .map_err(|e| SinkError::Init(format!("invalid schema {}: {e}", path.display())))?;

    if !matches!(schema, Schema::Record(_)) {
        return Err(SinkError::Init(format!(
            "schema {} must define a record",
            path.display()
        )));
    }
    Ok(schema)
}

fn optional(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn tags_value(tags: &Tags) -> Value {
    let entries = [
        ("roc", &tags.roc),
        ("voName", &tags.vo_name),
        ("voFqan", &tags.vo_fqan),
    ];
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), optional(value)))
            .collect(),
    )
}

/// Build a schema-resolved value for one record
pub fn to_value(record: &NormalizedRecord, schema: &Schema) -> Result<Value, SinkError> {
    let fields = vec![
        ("timestamp".to_string(), Value::String(record.timestamp.clone())),
        ("service".to_string(), Value::String(record.service.clone())),
        ("hostname".to_string(), Value::String(record.hostname.clone())),
        ("metric".to_string(), Value::String(record.metric.clone())),
        ("status".to_string(), Value::String(record.status.clone())),
        ("monitoring_host".to_string(), optional(&record.monitoring_host)),
        ("summary".to_string(), optional(&record.summary)),
        ("message".to_string(), optional(&record.message)),
        (
            "tags".to_string(),
            record.tags.as_ref().map_or(Value::Null, tags_value),
        ),
    ];

    Ok(Value::Record(fields).resolve(schema)?)
}

/// Binary datum for one record, without container framing
pub fn encode_datum(record: &NormalizedRecord, schema: &Schema) -> Result<Vec<u8>, SinkError> {
    let value = to_value(record, schema)?;
    Ok(apache_avro::to_avro_datum(schema, value)?)
}

fn unwrap_union(value: Value) -> Value {
    match value {
        Value::Union(_, inner) => *inner,
        other => other,
    }
}

fn string_field(fields: &mut HashMap<String, Value>, name: &str) -> Result<Option<String>, SinkError> {
    match fields.remove(name).map(unwrap_union) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(SinkError::Encode(format!(
            "field {name} is not a string: {other:?}"
        ))),
    }
}

fn required(fields: &mut HashMap<String, Value>, name: &str) -> Result<String, SinkError> {
    string_field(fields, name)?.ok_or_else(|| SinkError::Encode(format!("field {name} is missing")))
}

/// Decode a record value read back from a container file
pub fn from_value(value: Value) -> Result<NormalizedRecord, SinkError> {
    let Value::Record(fields) = value else {
        return Err(SinkError::Encode("value is not a record".to_string()));
    };
    let mut fields: HashMap<String, Value> = fields.into_iter().collect();

    let tags = match fields.remove("tags").map(unwrap_union) {
        Some(Value::Map(mut map)) => Some(Tags {
            roc: string_field(&mut map, "roc")?,
            vo_name: string_field(&mut map, "voName")?,
            vo_fqan: string_field(&mut map, "voFqan")?,
        }),
        _ => None,
    };

    Ok(NormalizedRecord {
        service: required(&mut fields, "service")?,
        timestamp: required(&mut fields, "timestamp")?,
        hostname: required(&mut fields, "hostname")?,
        metric: required(&mut fields, "metric")?,
        status: required(&mut fields, "status")?,
        message: string_field(&mut fields, "message")?,
        summary: string_field(&mut fields, "summary")?,
        monitoring_host: string_field(&mut fields, "monitoring_host")?,
        tags,
    })
}

/// Sync marker of an existing container file (its last 16 bytes)
fn read_sync_marker(file: &mut File) -> Result<[u8; SYNC_MARKER_LEN], SinkError> {
    let mut marker = [0u8; SYNC_MARKER_LEN];
    file.seek(SeekFrom::End(-(SYNC_MARKER_LEN as i64)))?;
    file.read_exact(&mut marker)?;
    Ok(marker)
}

/// Append values to a container file, creating it with a header if needed
///
/// The schema is embedded only when the file is created; later appends reuse
/// the existing header and sync marker. Callers must serialize access to
/// `path`, the container format has no support for concurrent writers.
pub fn append_values(path: &Path, schema: &Schema, values: Vec<Value>) -> Result<usize, SinkError> {
    if values.is_empty() {
        return Ok(0);
    }

    let existing = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let count = values.len();

    if existing == 0 {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        write_values(Writer::new(schema, BufWriter::new(file)), values)?;
    } else {
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        let marker = read_sync_marker(&mut file)?;
        write_values(
            Writer::append_to(schema, BufWriter::new(file), marker),
            values,
        )?;
    }

    Ok(count)
}

fn write_values(mut writer: Writer<'_, BufWriter<File>>, values: Vec<Value>) -> Result<(), SinkError> {
    for value in values {
        writer.append(value)?;
    }
    let mut inner = writer.into_inner()?;
    inner.flush()?;
    inner.get_ref().sync_data()?;
    Ok(())
}

/// Read every record of a container file
pub fn read_records(path: &Path) -> Result<Vec<NormalizedRecord>, SinkError> {
    let file = File::open(path)?;
    let reader = Reader::new(file)?;
    reader
        .map(|value| from_value(value?))
        .collect()
}
