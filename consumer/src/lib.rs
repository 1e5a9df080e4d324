//! ARGO consumer - STOMP metric results to Avro partitions and ingestion
//!
//! Subscribes to monitoring result topics on a list of STOMP brokers,
//! validates and normalizes every message, and hands the records to one or
//! more batching sinks: daily Avro partition files and an HTTPS ingestion
//! endpoint.
//!
//! # Architecture
//!
//! ```text
//! Transport ──► BrokerConnection ──► MessagePipeline ──► BatchSink(s)
//! ```
//!
//! The broker transport and the sinks are pluggable via traits.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod broker;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod message;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod reporting;
pub mod sink;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use context::{Context, Control};
pub use daemon::Daemon;
pub use error::{ConsumerError, Result};
