//! Broker connection management
//!
//! [`BrokerConnection`] keeps one subscribed session open against the broker
//! list, failing over and resubscribing as needed. [`BrokerList`] holds the
//! failover order.

pub mod connection;
pub mod endpoint;

pub use connection::{BrokerConnection, ConnectionHealth, ConnectionState, TICK_INTERVAL};
pub use endpoint::{BrokerEndpoint, BrokerList, DEFAULT_BROKER_PORT};
