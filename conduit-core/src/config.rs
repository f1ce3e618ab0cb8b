//! Shared YAML configuration for the supervisor and every connector process.
//!
//! Durations are written the humantime way (`"500ms"`, `"10s"`, `"5m"`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{error, warn};

pub const CONFIG_ENV: &str = "CONDUIT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "conduit.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    pub store: StoreSettings,
    pub mqtt: MqttSettings,
    pub connector: ConnectorSettings,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/conduit/edge.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Delay before polling again after an event loop error
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    pub clean_session: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keep_alive: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(2),
            clean_session: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorSettings {
    /// Pause between two EXECUTE cycles
    #[serde(with = "humantime_serde")]
    pub execute_interval: Duration,
    /// RECOVER backoff when the connection does not define one
    #[serde(with = "humantime_serde")]
    pub default_retry: Duration,
    /// Consecutive faults logged at warn level before switching to debug
    pub exception_limit: u32,
    /// Where session lock files live
    pub runtime_dir: PathBuf,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            execute_interval: Duration::from_millis(100),
            default_retry: Duration::from_secs(10),
            exception_limit: 1,
            runtime_dir: PathBuf::from("/run/conduit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub unit_dir: PathBuf,
    /// Directory holding the connector module executables
    pub bin_dir: PathBuf,
    pub unit_prefix: String,
    pub registry_path: PathBuf,
    /// Service manager command line, split shell-style
    pub systemctl: String,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
    pub start_limit_burst: u32,
    #[serde(with = "humantime_serde")]
    pub healthcheck_interval: Duration,
    pub max_restarts: u32,
    #[serde(with = "humantime_serde")]
    pub restart_window: Duration,
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            bin_dir: PathBuf::from("/usr/local/bin"),
            unit_prefix: "conduit".into(),
            registry_path: PathBuf::from("/var/lib/conduit/services.json"),
            systemctl: "systemctl".into(),
            command_timeout: Duration::from_secs(30),
            restart_delay: Duration::from_secs(5),
            start_limit_burst: 5,
            healthcheck_interval: Duration::from_secs(60),
            max_restarts: 5,
            restart_window: Duration::from_secs(300),
            status_interval: Duration::from_secs(30),
        }
    }
}

impl ConduitConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }

    /// Applies `CONDUIT_MQTT_HOST`, `CONDUIT_MQTT_PORT` and `CONDUIT_DB_PATH`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CONDUIT_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("CONDUIT_MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => warn!("Ignoring invalid CONDUIT_MQTT_PORT: {}", port),
            }
        }
        if let Some(path) = lookup("CONDUIT_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
    }
}

/// Loads `.env`, then the YAML file named by `CONDUIT_CONFIG`, then env overrides.
///
/// A missing or invalid file falls back to defaults.
pub async fn load_config() -> ConduitConfig {
    let _ = dotenvy::dotenv();
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = load_config_file(Path::new(&path)).await;
    config.apply_env_overrides();
    config
}

pub async fn load_config_file(path: &Path) -> ConduitConfig {
    if !path.exists() {
        warn!("No {}, using default configuration", path.display());
        return ConduitConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            error!("Cannot read {}: {}", path.display(), e);
            return ConduitConfig::default();
        }
    };
    ConduitConfig::from_yaml_str(&txt).unwrap_or_else(|e| {
        error!("Invalid configuration {}: {}", path.display(), e);
        ConduitConfig::default()
    })
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
