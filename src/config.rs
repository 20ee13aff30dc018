use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};

use crate::gateway::models::DataFormat;
use crate::gateway::Sid;
use crate::mqtt::config::MqttConfig;

pub const CONFIG_FILE: &str = "config.toml";
const APP_DIR: &str = "xiaomi-mqtt";
const PASSWORD_LEN: usize = 16;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// One of `trace`, `debug`, `info`, `warn`, `error`
    pub log_level: String,
    pub data_format: DataFormat,
    /// Publish every n-th gateway heartbeat; `1` publishes all of them
    pub heartbeat_every: u32,
    pub gateway: GatewayConfig,
    pub mqtt: MqttConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Local UDP port for gateway traffic, including multicast heartbeats
    pub server_port: u16,
    pub multicast_address: Ipv4Addr,
    /// Destination port for `whois`
    pub multicast_port: u16,
    /// Write password per gateway sid, as shown in the vendor app
    pub passwords: HashMap<Sid, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_format: DataFormat::default(),
            heartbeat_every: 1,
            gateway: GatewayConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_port: 9898,
            multicast_address: Ipv4Addr::new(224, 0, 0, 50),
            multicast_port: 4321,
            passwords: HashMap::new(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "udp {} (group {}:{}), mqtt {}, {} gateway password(s), data {:?}",
            self.gateway.server_port,
            self.gateway.multicast_address,
            self.gateway.multicast_port,
            self.mqtt,
            self.gateway.passwords.len(),
            self.data_format,
        )
    }
}

impl Config {
    /// Finds the config file to use: the explicit path if given, then
    /// `./config.toml`, then `<config dir>/xiaomi-mqtt/config.toml`.
    pub async fn resolve_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
        if explicit.is_some() {
            return explicit;
        }

        let mut candidates = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join(APP_DIR).join(CONFIG_FILE));
        }
        for candidate in candidates {
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
            debug!("No config at {}", candidate.display());
        }
        None
    }

    /// Loads the config from `path`, or the defaults when no file was found.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No config file found, using defaults");
            return Ok(Config::default());
        };

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Logs settings that will make writes fail later on.
    pub fn validate(&self) {
        if self.gateway.passwords.is_empty() {
            warn!("No gateway passwords configured, writes will be rejected");
        }
        for (sid, password) in &self.gateway.passwords {
            if password.len() != PASSWORD_LEN {
                warn!(
                    "Password for gateway {} is {} bytes, expected {}",
                    sid,
                    password.len(),
                    PASSWORD_LEN
                );
            }
        }
        if self.heartbeat_every == 0 {
            warn!("heartbeat_every = 0 is treated as 1");
        }
    }

    pub fn log_level(&self) -> Level {
        parse_level(&self.log_level).unwrap_or_else(|| {
            warn!("Unknown log level {}, using info", self.log_level);
            Level::INFO
        })
    }
}

pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::TopicMode;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.gateway.server_port, 9898);
        assert_eq!(config.gateway.multicast_address, Ipv4Addr::new(224, 0, 0, 50));
        assert_eq!(config.gateway.multicast_port, 4321);
        assert_eq!(config.mqtt.topic_prefix, "xiaomi");
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
            log_level = "debug"
            data_format = "raw"
            heartbeat_every = 5

            [gateway]
            server_port = 9999

            [gateway.passwords]
            "34ce0088f1a2" = "0987654321qwerty"

            [mqtt]
            url = "mqtt://broker.lan"
            username = "bridge"
            password = "secret"
            topic_mode = "full"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level(), Level::DEBUG);
        assert_eq!(config.data_format, DataFormat::Raw);
        assert_eq!(config.heartbeat_every, 5);
        assert_eq!(config.gateway.server_port, 9999);
        assert_eq!(config.gateway.multicast_port, 4321);
        assert_eq!(
            config.gateway.passwords.get("34ce0088f1a2").map(String::as_str),
            Some("0987654321qwerty")
        );
        assert_eq!(config.mqtt.topic_mode, TopicMode::Full);
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn test_unknown_data_format_is_rejected() {
        assert!(toml::from_str::<Config>("data_format = \"fancy\"").is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level(" trace "), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/xiaomi-mqtt.toml")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[tokio::test]
    async fn test_load_without_path_uses_defaults() {
        assert_eq!(Config::load(None).await.unwrap(), Config::default());
    }

    #[tokio::test]
    async fn test_explicit_path_wins() {
        let explicit = PathBuf::from("/etc/custom.toml");
        assert_eq!(
            Config::resolve_path(Some(explicit.clone())).await,
            Some(explicit)
        );
    }
}
