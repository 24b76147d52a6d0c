//! Configuration loading, validation and hot-reload support.
//!
//! The agent reads `userConfig.json` from the directory of the executable.
//! Missing optional fields get defaults; validation failures are collected
//! into a single aggregated error and are fatal at startup. At runtime only
//! the `games` map is hot-reloaded (see [`watcher`]); everything else is
//! immutable until restart.

mod watcher;

pub use watcher::ConfigWatcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::core::error::{ConfigError, Result};

/// Config file name, located next to the executable
pub const CONFIG_FILE_NAME: &str = "userConfig.json";

/// User configuration file structure (matches `userConfig.json`).
/// Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    /// Process-name pattern → game identifier
    #[serde(default)]
    pub games: HashMap<String, String>,
}

/// MQTT connection parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub broker: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Sensor polling intervals, in seconds.
///
/// Signed so that negative values survive parsing and reach validation,
/// where they are reported alongside every other violation.
#[derive(Debug, Clone, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_game_sensor_interval")]
    pub game_sensor: i64,
    #[serde(default = "default_last_active_interval")]
    pub last_active: i64,
    #[serde(default = "default_availability_interval")]
    pub availability: i64,
}

fn default_game_sensor_interval() -> i64 {
    5
}

fn default_last_active_interval() -> i64 {
    10
}

fn default_availability_interval() -> i64 {
    30
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            game_sensor: default_game_sensor_interval(),
            last_active: default_last_active_interval(),
            availability: default_availability_interval(),
        }
    }
}

impl AgentConfig {
    /// Derived device identifier: hyphens replaced by underscores.
    pub fn device_id(&self) -> String {
        self.device_name.replace('-', "_")
    }

    /// Broker URL with the well-known local default applied.
    pub fn broker(&self) -> &str {
        if self.mqtt.broker.is_empty() {
            "tcp://homeassistant.local:1883"
        } else {
            &self.mqtt.broker
        }
    }

    /// MQTT client id, defaulting to `pc-agent-<device>`.
    pub fn client_id(&self) -> String {
        match &self.mqtt.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("pc-agent-{}", self.device_name),
        }
    }

    /// Check all fields, collecting every violation.
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.device_name.is_empty() {
            violations.push("device_name is required".to_string());
        } else if self.device_name == "my-pc" {
            violations
                .push("device_name is still the default 'my-pc' - please change it".to_string());
        } else if self.device_name.contains(char::is_whitespace) {
            violations.push("device_name cannot contain whitespace".to_string());
        }

        if !self.mqtt.broker.is_empty() {
            match parse_broker_scheme(&self.mqtt.broker) {
                Some((scheme, host)) => {
                    if !matches!(scheme, "tcp" | "ssl" | "ws" | "wss") {
                        violations.push(format!(
                            "mqtt.broker has unsupported scheme \"{scheme}\" (use tcp, ssl, ws, or wss)"
                        ));
                    } else if host.is_empty() {
                        violations.push("mqtt.broker is missing host".to_string());
                    }
                }
                None => {
                    violations.push(format!(
                        "mqtt.broker \"{}\" is not a valid URL (expected scheme://host[:port])",
                        self.mqtt.broker
                    ));
                }
            }
        }

        if self.intervals.game_sensor < 0 {
            violations.push("intervals.game_sensor cannot be negative".to_string());
        }
        if self.intervals.last_active < 0 {
            violations.push("intervals.last_active cannot be negative".to_string());
        }
        if self.intervals.availability < 0 {
            violations.push("intervals.availability cannot be negative".to_string());
        }

        for (pattern, game_id) in &self.games {
            if pattern.is_empty() {
                violations.push("games map has empty process pattern".to_string());
            }
            if game_id.is_empty() {
                violations.push(format!("games[\"{pattern}\"] has empty game ID"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { violations })
        }
    }
}

/// Split `scheme://rest` into `(scheme, host)`; `None` if the separator is absent.
fn parse_broker_scheme(url: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split(':').next().unwrap_or("");
    Some((scheme, host))
}

/// Thread-safe configuration store with a versioned games map.
///
/// The validated snapshot is immutable for the process lifetime; only the
/// games map is replaced by hot-reload, bumping the version so that readers
/// (the pattern cache) can detect staleness without holding the lock.
pub struct ConfigStore {
    path: PathBuf,
    snapshot: Arc<AgentConfig>,
    games: RwLock<Arc<HashMap<String, String>>>,
    version: AtomicU64,
}

impl ConfigStore {
    /// Load and validate the config file adjacent to the executable.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path()?)
    }

    /// Load and validate the config file at an explicit path.
    pub fn load(path: PathBuf) -> Result<Self> {
        let config = read_config(&path)?;
        config.validate()?;

        if config.games.is_empty() {
            warn!("No games configured - game detection will always return 'none'");
        }
        if config.mqtt.user.is_empty() {
            warn!("MQTT user/pass not set - connecting without authentication");
        }
        info!("Loaded config for device: {}", config.device_name);

        let games = Arc::new(config.games.clone());
        Ok(Self {
            path,
            snapshot: Arc::new(config),
            games: RwLock::new(games),
            version: AtomicU64::new(1),
        })
    }

    /// The immutable validated snapshot.
    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.snapshot
    }

    /// Path of the watched config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current games map and its version, under the shared lock.
    pub fn game_map(&self) -> (Arc<HashMap<String, String>>, u64) {
        let games = self.games.read();
        (Arc::clone(&games), self.version.load(Ordering::Acquire))
    }

    /// Re-read the config file and replace the games map, bumping the
    /// version. Parse or validation failures leave the current map in place.
    pub fn reload_games(&self) {
        let config = match read_config(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Config reload failed, keeping current games: {e}");
                return;
            }
        };
        if let Err(e) = config.validate() {
            warn!("Config reload rejected, keeping current games: {e}");
            return;
        }

        let count = config.games.len();
        let mut games = self.games.write();
        *games = Arc::new(config.games);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        drop(games);

        info!("Reloaded games map: {count} games (version {version})");
    }
}

fn read_config(path: &Path) -> std::result::Result<AgentConfig, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::ParseFailed {
                reason: e.to_string(),
            }
        }
    })?;
    serde_json::from_str(&data).map_err(|e| ConfigError::ParseFailed {
        reason: e.to_string(),
    })
}

fn default_config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(device_name: &str) -> AgentConfig {
        AgentConfig {
            device_name: device_name.to_string(),
            mqtt: MqttConfig::default(),
            intervals: IntervalConfig::default(),
            games: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"device_name": "office-pc"}"#).unwrap();
        assert_eq!(config.device_name, "office-pc");
        assert_eq!(config.broker(), "tcp://homeassistant.local:1883");
        assert_eq!(config.client_id(), "pc-agent-office-pc");
        assert_eq!(config.intervals.game_sensor, 5);
        assert_eq!(config.intervals.last_active, 10);
        assert_eq!(config.intervals.availability, 30);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"device_name": "office-pc", "future_option": {"nested": true}}"#,
        )
        .unwrap();
        assert_eq!(config.device_name, "office-pc");
    }

    #[test]
    fn test_device_id_replaces_hyphens() {
        let config = minimal_config("office-pc-2");
        assert_eq!(config.device_id(), "office_pc_2");
    }

    #[test]
    fn test_explicit_client_id_wins() {
        let mut config = minimal_config("office-pc");
        config.mqtt.client_id = Some("custom-client".to_string());
        assert_eq!(config.client_id(), "custom-client");
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        let mut config = minimal_config("office-pc");
        config.mqtt.broker = "tcp://homeassistant.local:1883".to_string();
        config
            .games
            .insert("fortnite".to_string(), "fortnite_game".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_default_device_name() {
        let config = minimal_config("my-pc");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("my-pc"));
    }

    #[test]
    fn test_validate_rejects_whitespace_device_name() {
        let config = minimal_config("office pc");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_broker_scheme() {
        let mut config = minimal_config("office-pc");
        config.mqtt.broker = "http://homeassistant.local:1883".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_validate_rejects_missing_host() {
        let mut config = minimal_config("office-pc");
        config.mqtt.broker = "tcp://:1883".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing host"));
    }

    #[test]
    fn test_validate_aggregates_all_violations() {
        let mut config = minimal_config("");
        config.mqtt.broker = "nonsense".to_string();
        config.intervals.game_sensor = -1;
        config.games.insert(String::new(), String::new());
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("device_name is required"));
        assert!(msg.contains("not a valid URL"));
        assert!(msg.contains("intervals.game_sensor cannot be negative"));
        assert!(msg.contains("empty process pattern"));
    }

    #[test]
    fn test_validate_rejects_negative_intervals() {
        let mut config = minimal_config("office-pc");
        config.intervals.last_active = -10;
        config.intervals.availability = -30;
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("intervals.last_active cannot be negative"));
        assert!(msg.contains("intervals.availability cannot be negative"));
    }

    #[test]
    fn test_negative_interval_parses_and_fails_validation_not_parsing() {
        // A negative literal must reach validate() as a violation, not die
        // as a serde type error.
        let config: AgentConfig = serde_json::from_str(
            r#"{"device_name": "", "intervals": {"game_sensor": -1}}"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("device_name is required"));
        assert!(msg.contains("intervals.game_sensor cannot be negative"));
    }

    #[test]
    fn test_validate_rejects_empty_game_id() {
        let mut config = minimal_config("office-pc");
        config.games.insert("r5apex".to_string(), String::new());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("empty game ID"));
    }

    #[test]
    fn test_broker_scheme_parsing() {
        assert_eq!(
            parse_broker_scheme("tcp://host:1883"),
            Some(("tcp", "host"))
        );
        assert_eq!(parse_broker_scheme("wss://host"), Some(("wss", "host")));
        assert_eq!(parse_broker_scheme("host:1883"), None);
    }
}
