//! Configuration for the consumer
//!
//! The configuration file is TOML using the section and option names the
//! daemon has always used:
//!
//! ```toml
//! [General]
//! AvroSchema = "/etc/argo-consumer/metric_data.avsc"
//! WriteMsgFile = true
//!
//! [Brokers]
//! Server1 = "mq.cro-ngi.hr:6163"
//! Server2 = "broker-prod1.argo.grnet.gr:6163"
//!
//! [Subscription]
//! Destinations = "/topic/grid.probe.metricOutput.EGEE.ngi.*"
//!
//! [MsgFile]
//! Directory = "/var/lib/argo-consumer"
//! Filename = "argo-consumer_log_DATE.avro"
//! ```
//!
//! Raw values are deserialised once, validated, and turned into an immutable
//! [`Config`] snapshot. Reloads build a new snapshot; nothing is mutated in place.

use crate::broker::BrokerEndpoint;
use crate::error::{ConsumerError, Result};
use figment::Figment;
use figment::providers::{Format, Toml};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Placeholder substituted with `YYYY-MM-DD` in file templates
pub const DATE_PLACEHOLDER: &str = "DATE";

/// Main configuration for the consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub general: GeneralConfig,

    /// Failover order of brokers, sorted by their `ServerN` index
    pub brokers: Vec<BrokerEndpoint>,

    pub subscription: SubscriptionConfig,

    pub authentication: AuthConfig,

    pub stomp: StompConfig,

    /// Present when `General.WriteMsgFile` is enabled
    pub msg_file: Option<FileSinkConfig>,

    /// Present when `General.WriteMsgIngestion` is enabled
    pub msg_ingestion: Option<IngestionConfig>,

    pub retention: RetentionConfig,

    /// Prometheus endpoint address, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralConfig {
    /// Avro schema definition for metric records
    pub avro_schema: PathBuf,
    /// Persist malformed messages to the error file
    pub log_wrong_format: bool,
    /// Hours between periodic counter reports
    pub report_every_hours: u64,
    /// Bound of every sink's inbound channel
    pub queue_capacity: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    pub destinations: Vec<String>,
    /// Seconds without messages before a forced reconnect, 0 disables
    pub idle_msg_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthConfig {
    pub host_key: Option<PathBuf>,
    pub host_cert: Option<PathBuf>,
    /// PEM bundle of trusted CAs; system roots are used when unset
    pub ca_cert: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StompConfig {
    pub use_ssl: bool,
    pub keepalive_idle: u64,
    pub keepalive_interval: u64,
    pub keepalive_probes: u32,
    /// Connect attempts per `open` call inside the transport
    pub reconnect_attempts: u32,
    /// Seconds to wait for TCP connect and the CONNECTED frame
    pub connect_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileSinkConfig {
    pub directory: PathBuf,
    /// Partition file template, contains [`DATE_PLACEHOLDER`]
    pub filename: String,
    /// Error file template, required when `LogWrongFormat` is on
    pub error_filename: Option<String>,
    pub write_plaintext: bool,
    pub bulk_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestionConfig {
    pub host: String,
    pub token: String,
    pub tenant: String,
    pub bulk_size: usize,
    pub verify_certificate: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub past_days_ok: u32,
    pub future_days_ok: u32,
    /// Persist records outside the retention window as well
    pub log_out_allowed_time: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            past_days_ok: 1,
            future_days_ok: 0,
            log_out_allowed_time: false,
        }
    }
}

impl FileSinkConfig {
    /// Partition file for the given `YYYY-MM-DD` date
    pub fn partition_path(&self, date: &str) -> PathBuf {
        self.directory
            .join(self.filename.replace(DATE_PLACEHOLDER, date))
    }

    /// Error file for the given `YYYY-MM-DD` date
    pub fn error_path(&self, date: &str) -> Option<PathBuf> {
        self.error_filename
            .as_ref()
            .map(|t| self.directory.join(t.replace(DATE_PLACEHOLDER, date)))
    }
}

impl Config {
    /// Load and validate the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConsumerError::Config(format!(
                "could not find {}",
                path.display()
            )));
        }

        let raw: RawConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| ConsumerError::Config(format!("{}: {e}", path.display())))?;

        raw.validate()
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let raw: RawConfig = Figment::from(Toml::string(toml))
            .extract()
            .map_err(|e| ConsumerError::Config(e.to_string()))?;

        raw.validate()
    }

    pub fn write_msg_file(&self) -> bool {
        self.msg_file.is_some()
    }

    pub fn write_msg_ingestion(&self) -> bool {
        self.msg_ingestion.is_some()
    }
}

// Raw, as-written configuration. Every field is optional so validation can
// report the precise option that is missing.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawConfig {
    general: RawGeneral,
    brokers: BTreeMap<String, String>,
    subscription: RawSubscription,
    authentication: RawAuthentication,
    #[serde(rename = "STOMP")]
    stomp: RawStomp,
    msg_file: RawMsgFile,
    msg_ingestion: RawMsgIngestion,
    msg_retention: RawMsgRetention,
    metrics: RawMetrics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawGeneral {
    avro_schema: Option<PathBuf>,
    write_msg_file: Option<bool>,
    write_msg_ingestion: Option<bool>,
    log_wrong_format: Option<bool>,
    report_writ_msg_every_hours: Option<u64>,
    queue_capacity: Option<usize>,
    log_level: Option<String>,
    log_format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawSubscription {
    destinations: Option<String>,
    idle_msg_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawAuthentication {
    host_key: Option<PathBuf>,
    host_cert: Option<PathBuf>,
    #[serde(rename = "CACert")]
    ca_cert: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawStomp {
    #[serde(rename = "UseSSL")]
    use_ssl: Option<bool>,
    #[serde(rename = "TCPKeepAliveIdle")]
    keepalive_idle: Option<u64>,
    #[serde(rename = "TCPKeepAliveInterval")]
    keepalive_interval: Option<u64>,
    #[serde(rename = "TCPKeepAliveProbes")]
    keepalive_probes: Option<u32>,
    #[serde(rename = "ReconnectAttempts")]
    reconnect_attempts: Option<u32>,
    #[serde(rename = "ConnectTimeout")]
    connect_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawMsgFile {
    directory: Option<PathBuf>,
    filename: Option<String>,
    error_filename: Option<String>,
    write_plaintext: Option<bool>,
    bulk_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawMsgIngestion {
    host: Option<String>,
    token: Option<String>,
    tenant: Option<String>,
    bulk_size: Option<usize>,
    verify_certificate: Option<bool>,
    timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawMsgRetention {
    past_days_ok: Option<u32>,
    future_days_ok: Option<u32>,
    log_msg_out_allowed_time: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
struct RawMetrics {
    address: Option<String>,
}

const DEFAULT_BULK_SIZE: usize = 50;
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_REPORT_HOURS: u64 = 24;
const MAX_REPORT_HOURS: u64 = 24 * 366;

fn missing(section: &str, option: &str) -> ConsumerError {
    ConsumerError::Config(format!("no option {section}.{option} defined"))
}

fn require_date_placeholder(option: &str, template: &str) -> Result<()> {
    if template.contains(DATE_PLACEHOLDER) {
        Ok(())
    } else {
        Err(ConsumerError::Config(format!(
            "{option} '{template}' must contain the {DATE_PLACEHOLDER} placeholder"
        )))
    }
}

fn require_positive(option: &str, value: usize) -> Result<usize> {
    if value == 0 {
        Err(ConsumerError::Config(format!("{option} must be at least 1")))
    } else {
        Ok(value)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RawConfig {
    fn validate(self) -> Result<Config> {
        let brokers = parse_brokers(self.brokers)?;

        let destinations: Vec<String> = self
            .subscription
            .destinations
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from)
            .collect();
        if destinations.is_empty() {
            return Err(missing("Subscription", "Destinations"));
        }

        let general = &self.general;
        let write_file = general.write_msg_file.unwrap_or(false);
        let write_ingestion = general.write_msg_ingestion.unwrap_or(false);
        if !write_file && !write_ingestion {
            return Err(ConsumerError::Config(
                "at least one of General.WriteMsgFile or General.WriteMsgIngestion must be enabled"
                    .to_string(),
            ));
        }

        let avro_schema = general
            .avro_schema
            .clone()
            .ok_or_else(|| missing("General", "AvroSchema"))?;
        let log_wrong_format = general.log_wrong_format.unwrap_or(false);

        let report_every_hours = general
            .report_writ_msg_every_hours
            .unwrap_or(DEFAULT_REPORT_HOURS);
        if !(1..=MAX_REPORT_HOURS).contains(&report_every_hours) {
            return Err(ConsumerError::Config(format!(
                "General.ReportWritMsgEveryHours must be between 1 and {MAX_REPORT_HOURS}"
            )));
        }

        let log_format = match general
            .log_format
            .as_deref()
            .map(str::to_lowercase)
            .as_deref()
        {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConsumerError::Config(format!(
                    "invalid General.LogFormat: {other} (expected 'json' or 'pretty')"
                )));
            }
        };

        let msg_file = if write_file {
            let raw = self.msg_file;
            let directory = raw
                .directory
                .ok_or_else(|| missing("MsgFile", "Directory"))?;
            let filename = non_empty(raw.filename).ok_or_else(|| missing("MsgFile", "Filename"))?;
            require_date_placeholder("MsgFile.Filename", &filename)?;

            let error_filename = non_empty(raw.error_filename);
            match &error_filename {
                Some(t) => require_date_placeholder("MsgFile.ErrorFilename", t)?,
                None if log_wrong_format => return Err(missing("MsgFile", "ErrorFilename")),
                None => {}
            }

            Some(FileSinkConfig {
                directory,
                filename,
                error_filename,
                write_plaintext: raw.write_plaintext.unwrap_or(false),
                bulk_size: require_positive(
                    "MsgFile.BulkSize",
                    raw.bulk_size.unwrap_or(DEFAULT_BULK_SIZE),
                )?,
            })
        } else {
            None
        };

        let msg_ingestion = if write_ingestion {
            let raw = self.msg_ingestion;
            Some(IngestionConfig {
                host: non_empty(raw.host).ok_or_else(|| missing("MsgIngestion", "Host"))?,
                token: non_empty(raw.token).ok_or_else(|| missing("MsgIngestion", "Token"))?,
                tenant: non_empty(raw.tenant).ok_or_else(|| missing("MsgIngestion", "Tenant"))?,
                bulk_size: require_positive(
                    "MsgIngestion.BulkSize",
                    raw.bulk_size.unwrap_or(DEFAULT_BULK_SIZE),
                )?,
                verify_certificate: raw.verify_certificate.unwrap_or(true),
                timeout_secs: raw.timeout.unwrap_or(30).max(1),
            })
        } else {
            None
        };

        let stomp = StompConfig {
            use_ssl: self.stomp.use_ssl.unwrap_or(false),
            keepalive_idle: self.stomp.keepalive_idle.unwrap_or(20),
            keepalive_interval: self.stomp.keepalive_interval.unwrap_or(5),
            keepalive_probes: self.stomp.keepalive_probes.unwrap_or(10),
            reconnect_attempts: self.stomp.reconnect_attempts.unwrap_or(1).max(1),
            connect_timeout: self.stomp.connect_timeout.unwrap_or(10).max(1),
        };

        let authentication = AuthConfig {
            host_key: self.authentication.host_key,
            host_cert: self.authentication.host_cert,
            ca_cert: self.authentication.ca_cert,
        };
        if stomp.use_ssl {
            if authentication.host_cert.is_none() {
                return Err(missing("Authentication", "HostCert"));
            }
            if authentication.host_key.is_none() {
                return Err(missing("Authentication", "HostKey"));
            }
        }

        let defaults = RetentionConfig::default();
        let retention = RetentionConfig {
            past_days_ok: self
                .msg_retention
                .past_days_ok
                .unwrap_or(defaults.past_days_ok),
            future_days_ok: self
                .msg_retention
                .future_days_ok
                .unwrap_or(defaults.future_days_ok),
            log_out_allowed_time: self
                .msg_retention
                .log_msg_out_allowed_time
                .unwrap_or(defaults.log_out_allowed_time),
        };

        let metrics_addr = match non_empty(self.metrics.address) {
            Some(addr) => Some(addr.parse().map_err(|e| {
                ConsumerError::Config(format!("invalid Metrics.Address '{addr}': {e}"))
            })?),
            None => None,
        };

        Ok(Config {
            general: GeneralConfig {
                avro_schema,
                log_wrong_format,
                report_every_hours,
                queue_capacity: require_positive(
                    "General.QueueCapacity",
                    general.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                )?,
                log_level: non_empty(general.log_level.clone()).unwrap_or_else(|| "info".into()),
                log_format,
            },
            brokers,
            subscription: SubscriptionConfig {
                destinations,
                idle_msg_timeout: self.subscription.idle_msg_timeout.unwrap_or(0),
            },
            authentication,
            stomp,
            msg_file,
            msg_ingestion,
            retention,
            metrics_addr,
        })
    }
}

/// Order `ServerN` entries by N and parse each address
fn parse_brokers(raw: BTreeMap<String, String>) -> Result<Vec<BrokerEndpoint>> {
    let mut numbered = Vec::with_capacity(raw.len());
    for (key, value) in raw {
        let index = key
            .strip_prefix("Server")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| {
                ConsumerError::Config(format!(
                    "broker option '{key}' should be enumerated as ServerN"
                ))
            })?;
        let endpoint = value
            .parse::<BrokerEndpoint>()
            .map_err(|e| ConsumerError::Config(format!("Brokers.{key}: {e}")))?;
        numbered.push((index, endpoint));
    }

    if numbered.is_empty() {
        return Err(missing("Brokers", "Server1"));
    }

    numbered.sort_by_key(|(index, _)| *index);
    Ok(numbered.into_iter().map(|(_, ep)| ep).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [General]
        AvroSchema = "/etc/argo-consumer/metric_data.avsc"
        WriteMsgFile = true

        [Brokers]
        Server2 = "second.example.org"
        Server1 = "first.example.org:6162"
        Server10 = "tenth.example.org:61613"

        [Subscription]
        Destinations = "/topic/a, /topic/b"

        [MsgFile]
        Directory = "/var/lib/argo-consumer"
        Filename = "argo-consumer_log_DATE.avro"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.subscription.destinations, ["/topic/a", "/topic/b"]);
        assert_eq!(config.subscription.idle_msg_timeout, 0);
        assert_eq!(config.retention, RetentionConfig::default());
        assert_eq!(config.general.report_every_hours, 24);
        assert_eq!(config.general.log_format, LogFormat::Pretty);
        assert_eq!(config.stomp.reconnect_attempts, 1);
        assert!(config.write_msg_file());
        assert!(!config.write_msg_ingestion());
        assert_eq!(config.msg_file.as_ref().unwrap().bulk_size, 50);
    }

    #[test]
    fn test_brokers_sorted_by_index() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let hosts: Vec<&str> = config.brokers.iter().map(|b| b.host.as_str()).collect();
        assert_eq!(
            hosts,
            ["first.example.org", "second.example.org", "tenth.example.org"]
        );
        assert_eq!(config.brokers[1].port, 6163);
    }

    #[test]
    fn test_no_sink_enabled_rejected() {
        let toml = MINIMAL.replace("WriteMsgFile = true", "WriteMsgFile = false");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("WriteMsgFile"));
    }

    #[test]
    fn test_filename_requires_placeholder() {
        let toml = MINIMAL.replace("argo-consumer_log_DATE.avro", "argo-consumer.avro");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("DATE"));
    }

    #[test]
    fn test_log_wrong_format_requires_error_filename() {
        let toml = MINIMAL.replace("WriteMsgFile = true", "WriteMsgFile = true\nLogWrongFormat = true");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("ErrorFilename"));
    }

    #[test]
    fn test_unenumerated_broker_rejected() {
        let toml = MINIMAL.replace("Server10", "Backup");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_ingestion_requires_credentials() {
        let toml = format!(
            "{MINIMAL}\n[MsgIngestion]\nHost = \"api.example.org\"\nTenant = \"EGI\"\n"
        )
        .replace("WriteMsgFile = true", "WriteMsgIngestion = true");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("Token"));
    }

    #[test]
    fn test_ssl_requires_certificate() {
        let toml = format!("{MINIMAL}\n[STOMP]\nUseSSL = true\n");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("HostCert"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let toml = format!("{MINIMAL}\n[MsgRetention]\nPastDaysOk = \"yes\"\n");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_misspelled_option_rejected() {
        let toml = MINIMAL.replace(
            "Destinations = \"/topic/a, /topic/b\"",
            "Destinations = \"/topic/a, /topic/b\"\nIdleMsgTimout = 30",
        );
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("IdleMsgTimout"));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let toml = format!("{MINIMAL}\n[Retention]\nPastDaysOk = 2\n");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_report_interval_bounded() {
        let toml = MINIMAL.replace(
            "WriteMsgFile = true",
            "WriteMsgFile = true\nReportWritMsgEveryHours = 10000000",
        );
        assert!(Config::from_toml_str(&toml).is_err());

        let toml = MINIMAL.replace(
            "WriteMsgFile = true",
            "WriteMsgFile = true\nReportWritMsgEveryHours = 168",
        );
        assert_eq!(Config::from_toml_str(&toml).unwrap().general.report_every_hours, 168);
    }

    #[test]
    fn test_partition_paths() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let file = config.msg_file.unwrap();

        let first = file.partition_path("2024-03-01");
        let second = file.partition_path("2024-03-01");
        assert_eq!(first, second);
        assert_eq!(
            first,
            PathBuf::from("/var/lib/argo-consumer/argo-consumer_log_2024-03-01.avro")
        );
        assert!(file.error_path("2024-03-01").is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/argo-consumer.toml").unwrap_err();
        assert!(matches!(err, ConsumerError::Config(_)));
    }
}
