use crate::config::ConfigError;
use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings (`[mqtt]`)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long the session waits for SUBACKs before giving up on a connection
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_secs: u64,
    /// Maximum number of unacknowledged outgoing QoS 1/2 messages
    #[serde(default = "default_inflight")]
    pub inflight: u16,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Reconnect policy (`[mqtt.backoff]`)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Fraction of each growth step that may be shaved off at random
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before the session gives up; unset retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "blindbridge".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_subscribe_timeout() -> u64 {
    10
}

fn default_inflight() -> u16 {
    3
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    60_000
}

fn default_factor() -> f64 {
    1.5
}

fn default_jitter() -> f64 {
    0.5
}

impl MqttConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            subscribe_timeout_secs: default_subscribe_timeout(),
            inflight: default_inflight(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must not be 0".into()));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid("mqtt.client_id must not be empty".into()));
        }
        // rumqttc refuses keep-alives below five seconds
        if self.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(
                "mqtt.keep_alive_secs must be at least 5".into(),
            ));
        }
        if self.subscribe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.subscribe_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.inflight == 0 {
            return Err(ConfigError::Invalid("mqtt.inflight must be greater than 0".into()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Invalid(
                "mqtt.password is set without mqtt.username".into(),
            ));
        }
        self.backoff.validate()
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }

    /// Connection options for one rumqttc client
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .set_clean_session(true)
            .set_inflight(self.inflight);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.backoff.initial_ms must be greater than 0".into(),
            ));
        }
        if self.max_ms < self.initial_ms {
            return Err(ConfigError::Invalid(
                "mqtt.backoff.max_ms must not be below initial_ms".into(),
            ));
        }
        if !(self.factor > 1.0 && self.factor.is_finite()) {
            return Err(ConfigError::Invalid(
                "mqtt.backoff.factor must be a finite number above 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(
                "mqtt.backoff.jitter must be in [0, 1)".into(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "mqtt.backoff.max_attempts must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MqttConfig::new("localhost");
        assert!(config.validate().is_ok());
        assert_eq!(config.backoff.max_attempts, None);
    }

    #[test]
    fn password_needs_username() {
        let mut config = MqttConfig::new("localhost");
        config.password = Some("secret".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn jitter_of_one_is_rejected() {
        let mut config = MqttConfig::new("localhost");
        config.backoff.jitter = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn options_carry_credentials_through() {
        let mut config = MqttConfig::new("broker.local");
        config.username = Some("am43-gw".into());
        config.password = Some("secret".into());

        let options = config.mqtt_options();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(
            options.credentials(),
            Some(("am43-gw".to_string(), "secret".to_string()))
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn options_without_username_have_no_credentials() {
        let options = MqttConfig::new("broker.local").mqtt_options();
        assert_eq!(options.credentials(), None);
    }
}
