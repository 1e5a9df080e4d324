//! Broker endpoints and the rotating failover list

use std::fmt;
use std::str::FromStr;

/// Port used when a broker is configured without one
pub const DEFAULT_BROKER_PORT: u16 = 6163;

/// A single STOMP broker address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str, s: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|e| format!("invalid port in '{s}': {e}"))
}

impl FromStr for BrokerEndpoint {
    type Err = String;

    /// Parses `host:port` or `[ipv6]:port`, falling back to
    /// [`DEFAULT_BROKER_PORT`] when the port is omitted.
    ///
    /// A bare IPv6 address is ambiguous and must be bracketed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty broker address".to_string());
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated '[' in '{s}'"))?;
            if host.is_empty() {
                return Err(format!("missing host in '{s}'"));
            }
            let port = match tail {
                "" => DEFAULT_BROKER_PORT,
                _ => {
                    let port = tail
                        .strip_prefix(':')
                        .ok_or_else(|| format!("expected ':' after ']' in '{s}'"))?;
                    parse_port(port, s)?
                }
            };
            return Ok(Self::new(host, port));
        }

        match s.split_once(':') {
            Some((_, rest)) if rest.contains(':') => Err(format!(
                "IPv6 broker address '{s}' must be written as [address]:port"
            )),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(format!("missing host in '{s}'"));
                }
                Ok(Self::new(host, parse_port(port, s)?))
            }
            None => Ok(Self::new(s, DEFAULT_BROKER_PORT)),
        }
    }
}

/// Ordered, non-empty broker list rotated on every reconnect
///
/// The cursor starts before the first element so the first
/// [`advance`](BrokerList::advance) lands on index 0.
#[derive(Debug, Clone)]
pub struct BrokerList {
    endpoints: Vec<BrokerEndpoint>,
    cursor: Option<usize>,
}

impl BrokerList {
    /// Returns `None` for an empty list
    pub fn new(endpoints: Vec<BrokerEndpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Self {
            endpoints,
            cursor: None,
        })
    }

    /// Move to the next endpoint (wrapping) and return it
    pub fn advance(&mut self) -> &BrokerEndpoint {
        let next = self
            .cursor
            .map_or(0, |c| (c + 1) % self.endpoints.len());
        self.cursor = Some(next);
        &self.endpoints[next]
    }

    pub fn endpoints(&self) -> &[BrokerEndpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Whether `other` lists the same endpoints in the same order
    pub fn same_endpoints(&self, other: &[BrokerEndpoint]) -> bool {
        self.endpoints == other
    }
}
