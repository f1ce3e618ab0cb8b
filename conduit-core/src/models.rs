//! Records read from the configuration store.
//!
//! Every value here is a point-in-time snapshot: processes re-fetch them from the
//! store on each reconfiguration signal and never treat them as authoritative.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Opaque protocol-specific properties (JSON object column in the store)
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// One external endpoint, mapped to exactly one connector process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Globally unique id, also the unit name suffix and the topic scope
    pub id: String,
    /// Protocol code (ex: "mtc" for Modbus TCP client)
    pub protocol: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Transport timeout in seconds
    pub timeout_s: f64,
    /// Retry interval in seconds, used as the RECOVER backoff
    pub retry_s: f64,
    pub enabled: bool,
    pub properties: PropertyMap,
    pub updated_at: Option<OffsetDateTime>,
}

/// The connection fields that parameterize the transport.
///
/// A difference in any of them means the running transport no longer matches
/// the store and the process has to restart.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout_s: f64,
    pub retry_s: f64,
}

impl ConnectionDescriptor {
    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            host: self.host.clone(),
            port: self.port,
            timeout_s: self.timeout_s,
            retry_s: self.retry_s,
        }
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_s)
    }

    pub fn retry_interval(&self) -> Duration {
        seconds(self.retry_s)
    }

    /// "host:port" for logs, "-" when the connection has no network address
    pub fn endpoint(&self) -> String {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.clone(),
            _ => "-".to_string(),
        }
    }
}

/// Negative, NaN and out-of-range values read as zero, which callers treat as unset
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Data direction of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

/// What schedules a block's work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Cyclic,
    OnChange,
    OnDemand,
}

/// Error returned when a store code does not map to a known variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCode(pub String);

impl fmt::Display for UnknownCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown code '{}'", self.0)
    }
}

impl std::error::Error for UnknownCode {}

impl FromStr for Direction {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" => Ok(Direction::Read),
            "wo" => Ok(Direction::Write),
            "rw" => Ok(Direction::ReadWrite),
            other => Err(UnknownCode(other.to_string())),
        }
    }
}

impl FromStr for TriggerMode {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cyc" => Ok(TriggerMode::Cyclic),
            "chg" => Ok(TriggerMode::OnChange),
            "dmd" => Ok(TriggerMode::OnDemand),
            other => Err(UnknownCode(other.to_string())),
        }
    }
}

/// A scheduled unit of read/write work belonging to a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub id: String,
    pub connection_id: String,
    pub enabled: bool,
    pub direction: Direction,
    pub trigger: TriggerMode,
    /// Schedule period in seconds
    pub period_s: f64,
    pub properties: PropertyMap,
}

impl BlockDescriptor {
    pub fn period(&self) -> Duration {
        seconds(self.period_s)
    }
}

/// Association between a block data point and a bus-visible tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMapping {
    pub block_id: String,
    pub tag: String,
    /// Field selector (ex: "v" for the value, "q" for quality)
    pub field: String,
    pub scale: f64,
    pub offset: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub properties: PropertyMap,
}

/// Connection ids end up in file names, unit names and topics
pub fn is_valid_conn_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: "mtc-01".into(),
            protocol: "mtc".into(),
            host: Some("10.0.0.1".into()),
            port: Some(502),
            timeout_s: 3.0,
            retry_s: 10.0,
            enabled: true,
            properties: PropertyMap::new(),
            updated_at: None,
        }
    }

    #[test]
    fn test_transport_params_ignore_properties() {
        let a = connection();
        let mut b = connection();
        b.properties.insert("comment".into(), serde_json::json!("line 2"));
        b.updated_at = Some(OffsetDateTime::now_utc());
        assert_eq!(a.transport_params(), b.transport_params());

        b.port = Some(503);
        assert_ne!(a.transport_params(), b.transport_params());
    }

    #[test]
    fn test_durations_clamp_invalid_values() {
        let mut c = connection();
        c.timeout_s = -1.0;
        c.retry_s = f64::NAN;
        assert_eq!(c.timeout(), Duration::ZERO);
        assert_eq!(c.retry_interval(), Duration::ZERO);

        c.retry_s = 1e30;
        c.timeout_s = f64::INFINITY;
        assert_eq!(c.retry_interval(), Duration::ZERO);
        assert_eq!(c.timeout(), Duration::ZERO);
        assert_eq!(c.transport_params().retry_s, 1e30);
    }

    #[test]
    fn test_store_codes() {
        assert_eq!("rw".parse::<Direction>().unwrap(), Direction::ReadWrite);
        assert_eq!("dmd".parse::<TriggerMode>().unwrap(), TriggerMode::OnDemand);
        assert!("xx".parse::<Direction>().is_err());
    }

    #[test]
    fn test_conn_id_validation() {
        assert!(is_valid_conn_id("mtc-01"));
        assert!(is_valid_conn_id("line_2.plc"));
        assert!(!is_valid_conn_id(""));
        assert!(!is_valid_conn_id("../etc"));
        assert!(!is_valid_conn_id("a b"));
    }
}
