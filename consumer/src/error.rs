//! Error types for the consumer

use thiserror::Error;

/// Result type alias for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Main error type for the consumer
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Configuration error (fatal at startup only)
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Avro schema could not be read or parsed
    #[error("schema error: {0}")]
    Schema(String),

    /// Broker transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Sink error
    #[error("sink '{sink}' error: {message}")]
    Sink { sink: String, message: String },

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,
}

/// Error type for sink operations
#[derive(Error, Debug)]
pub enum SinkError {
    /// Initialization failed
    #[error("initialization failed: {0}")]
    Init(String),

    /// Record could not be encoded against the schema
    #[error("encode failed: {0}")]
    Encode(String),

    /// Writing to a partition file failed
    #[error("write failed: {0}")]
    Write(String),

    /// Request rejected by the ingestion endpoint
    #[error("send failed: {0}")]
    Send(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Write(err.to_string())
    }
}

impl From<apache_avro::Error> for SinkError {
    fn from(err: apache_avro::Error) -> Self {
        SinkError::Encode(err.to_string())
    }
}

impl From<SinkError> for ConsumerError {
    fn from(err: SinkError) -> Self {
        ConsumerError::Sink {
            sink: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}

/// Error type for broker transports
#[derive(Error, Debug)]
pub enum TransportError {
    /// TCP connect failed
    #[error("connect to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Unexpected frame or malformed wire data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error on an established session
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Broker did not answer in time
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Broker answered with an ERROR frame
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// Session is already closed
    #[error("not connected")]
    NotConnected,
}
