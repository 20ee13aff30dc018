use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MqttConfigError {
    #[error("invalid broker url >{0}<")]
    InvalidUrl(String),
}

/// How richly outbound envelopes are mirrored below `<prefix>/from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicMode {
    /// Only the canonical `<prefix>/from` topic
    #[default]
    Short,
    /// `<prefix>/from/<sid>/<cmd>/<model>[/status]`
    Full,
    /// Same as `Full`; kept as a separate name for existing configs
    Both,
    /// One topic per data field plus `<prefix>/from/cmd/<cmd>/<sid>`
    Each,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL, e.g. `mqtt://localhost` or `tcp://broker:1884`
    pub url: String,
    /// Port used when the URL does not carry one
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub topic_mode: TopicMode,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost".to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            topic_prefix: "xiaomi".to_string(),
            topic_mode: TopicMode::default(),
            keep_alive_secs: 30,
        }
    }
}

impl fmt::Display for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}:{}", user, self.url, self.port),
            None => write!(f, "{}:{}", self.url, self.port),
        }
    }
}

impl MqttConfig {
    /// Splits the broker URL into host and port. A port in the URL wins over
    /// the `port` field.
    pub fn broker(&self) -> Result<(String, u16), MqttConfigError> {
        let stripped = self
            .url
            .strip_prefix("mqtt://")
            .or_else(|| self.url.strip_prefix("tcp://"))
            .unwrap_or(&self.url)
            .trim_end_matches('/');

        let (host, port) = match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| MqttConfigError::InvalidUrl(self.url.clone()))?;
                (host, port)
            }
            None => (stripped, self.port),
        };

        if host.is_empty() {
            return Err(MqttConfigError::InvalidUrl(self.url.clone()));
        }
        Ok((host.to_string(), port))
    }

    pub fn mqtt_options(&self, client_id: &str) -> Result<MqttOptions, MqttConfigError> {
        let (host, port) = self.broker()?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        Ok(options)
    }
}
