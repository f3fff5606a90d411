use crate::message::{Payload, QoS};
use crate::topic;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

/// Birth or will message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageTemplate {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

impl MessageTemplate {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn payload(&self) -> Payload {
        Payload::Text(self.payload.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Host name, or a full URL such as `ws://host:8080/mqtt`.
    pub broker: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub use_tls: bool,
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Speak MQTT 3.1 (`MQIsdp`) instead of 3.1.1.
    #[serde(default)]
    pub compat_mode: bool,
    #[serde(default)]
    pub credentials: Credentials,
    pub birth: Option<MessageTemplate>,
    pub will: Option<MessageTemplate>,
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_ms: u64,
}

fn default_keep_alive() -> u16 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_reconnect_period() -> u64 {
    5000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: None,
            use_tls: false,
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            clean_session: default_clean_session(),
            compat_mode: false,
            credentials: Credentials::default(),
            birth: None,
            will: None,
            reconnect_period_ms: default_reconnect_period(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl BrokerConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            ..Default::default()
        }
    }

    /// URL handed to the transport.
    pub fn broker_url(&self) -> String {
        if self.broker.contains("://") {
            return self.broker.clone();
        }
        let scheme = if self.use_tls { "mqtts://" } else { "mqtt://" };
        if self.broker.is_empty() {
            return format!("{}localhost:{}", scheme, DEFAULT_PORT);
        }
        format!("{}{}:{}", scheme, self.broker, self.port.unwrap_or(DEFAULT_PORT))
    }

    /// Fills in a generated client id when none was configured and falls back to a
    /// clean session when no stable id exists to resume one with.
    pub fn finalize(mut self) -> Self {
        let has_client_id = self.client_id.as_deref().is_some_and(|id| !id.is_empty());
        if !has_client_id {
            if !self.clean_session {
                warn!("A persistent session requires a client id; using a clean session.");
                self.clean_session = true;
            }
            self.client_id = Some(generate_client_id());
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN_RECONNECT: u64 = 100;
        const MAX_RECONNECT: u64 = 1_000_000;

        if !(MIN_RECONNECT..=MAX_RECONNECT).contains(&self.reconnect_period_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_PERIOD_MS must be between {} and {} ms",
                MIN_RECONNECT, MAX_RECONNECT
            )));
        }

        for (name, template) in [("birth", &self.birth), ("will", &self.will)] {
            if let Some(template) = template {
                if !topic::is_valid_topic(&template.topic) {
                    return Err(ConfigError::ParsingError(format!(
                        "Invalid {} topic '{}'",
                        name, template.topic
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config = Self {
            broker: env::var("MQTT_BROKER")
                .map_err(|_| ConfigError::MissingOrInvalid("MQTT_BROKER".to_string()))?,
            port: optional_var("MQTT_PORT")?,
            use_tls: optional_bool("MQTT_USE_TLS")?.unwrap_or(false),
            client_id: env::var("MQTT_CLIENT_ID").ok().filter(|id| !id.is_empty()),
            keep_alive_secs: optional_var("MQTT_KEEPALIVE")?.unwrap_or_else(default_keep_alive),
            clean_session: optional_bool("MQTT_CLEAN_SESSION")?
                .unwrap_or_else(default_clean_session),
            compat_mode: optional_bool("MQTT_COMPAT_MODE")?.unwrap_or(false),
            credentials: Credentials {
                username: env::var("MQTT_USERNAME").ok().filter(|u| !u.is_empty()),
                password: env::var("MQTT_PASSWORD").ok().filter(|p| !p.is_empty()),
            },
            birth: template_from_env("MQTT_BIRTH")?,
            will: template_from_env("MQTT_WILL")?,
            reconnect_period_ms: optional_var("MQTT_RECONNECT_PERIOD_MS")?
                .unwrap_or_else(default_reconnect_period),
        };

        config.validate()?;

        Ok(config)
    }
}

fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("mqtt_{}", &id[..8])
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value", name))),
        _ => Ok(None),
    }
}

fn optional_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::ParsingError(format!("{} must be true or false", name))),
        },
        Err(_) => Ok(None),
    }
}

fn template_from_env(prefix: &str) -> Result<Option<MessageTemplate>, ConfigError> {
    let topic = match env::var(format!("{}_TOPIC", prefix)) {
        Ok(topic) if !topic.is_empty() => topic,
        _ => return Ok(None),
    };
    let qos_name = format!("{}_QOS", prefix);
    let qos = match optional_var::<u8>(&qos_name)? {
        Some(raw) => QoS::try_from(raw).map_err(ConfigError::ParsingError)?,
        None => QoS::AtMostOnce,
    };

    Ok(Some(MessageTemplate {
        topic,
        payload: env::var(format!("{}_PAYLOAD", prefix)).unwrap_or_default(),
        qos,
        retain: optional_bool(&format!("{}_RETAIN", prefix))?.unwrap_or(false),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 12] = [
        "MQTT_BROKER",
        "MQTT_PORT",
        "MQTT_USE_TLS",
        "MQTT_CLIENT_ID",
        "MQTT_KEEPALIVE",
        "MQTT_CLEAN_SESSION",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
        "MQTT_RECONNECT_PERIOD_MS",
        "MQTT_BIRTH_TOPIC",
        "MQTT_BIRTH_QOS",
        "MQTT_WILL_TOPIC",
    ];

    fn with_env<F: FnOnce()>(values: &[(&str, &str)], f: F) {
        let vars: Vec<(&str, Option<&str>)> = VARS
            .iter()
            .map(|name| {
                let value = values.iter().find(|(k, _)| k == name).map(|(_, v)| *v);
                (*name, value)
            })
            .collect();
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn broker_url_from_host_and_port() {
        let mut config = BrokerConfig::new("broker.local");
        assert_eq!(config.broker_url(), "mqtt://broker.local:1883");
        config.port = Some(8883);
        config.use_tls = true;
        assert_eq!(config.broker_url(), "mqtts://broker.local:8883");
    }

    #[test]
    fn broker_url_verbatim_and_empty() {
        let config = BrokerConfig::new("wss://broker.local/mqtt");
        assert_eq!(config.broker_url(), "wss://broker.local/mqtt");
        let config = BrokerConfig::new("");
        assert_eq!(config.broker_url(), "mqtt://localhost:1883");
    }

    #[test]
    fn finalize_generates_client_id_and_forces_clean_session() {
        let config = BrokerConfig {
            clean_session: false,
            ..BrokerConfig::new("localhost")
        }
        .finalize();
        let id = config.client_id.clone().unwrap();
        assert!(id.starts_with("mqtt_"));
        assert!(config.clean_session);

        let config = BrokerConfig {
            clean_session: false,
            client_id: Some("station-1".to_string()),
            ..BrokerConfig::new("localhost")
        }
        .finalize();
        assert_eq!(config.client_id.as_deref(), Some("station-1"));
        assert!(!config.clean_session);
    }

    #[test]
    fn validate_rejects_bad_reconnect_period_and_topics() {
        let mut config = BrokerConfig::new("localhost");
        assert!(config.validate().is_ok());
        config.reconnect_period_ms = 10;
        assert!(config.validate().is_err());
        config.reconnect_period_ms = 5000;
        config.will = Some(MessageTemplate::new("status/#", "gone"));
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn from_env_reads_variables() {
        with_env(
            &[
                ("MQTT_BROKER", "broker.local"),
                ("MQTT_PORT", "1884"),
                ("MQTT_CLIENT_ID", "gateway"),
                ("MQTT_KEEPALIVE", "30"),
                ("MQTT_CLEAN_SESSION", "false"),
                ("MQTT_USERNAME", "user"),
                ("MQTT_PASSWORD", "secret"),
                ("MQTT_BIRTH_TOPIC", "gateway/status"),
                ("MQTT_BIRTH_QOS", "1"),
            ],
            || {
                let config = BrokerConfig::from_env().unwrap();
                assert_eq!(config.broker_url(), "mqtt://broker.local:1884");
                assert_eq!(config.client_id.as_deref(), Some("gateway"));
                assert_eq!(config.keep_alive_secs, 30);
                assert!(!config.clean_session);
                assert_eq!(config.credentials, Credentials::new("user", "secret"));
                let birth = config.birth.unwrap();
                assert_eq!(birth.topic, "gateway/status");
                assert_eq!(birth.qos, QoS::AtLeastOnce);
                assert!(config.will.is_none());
            },
        );
    }

    #[test]
    #[serial]
    fn from_env_requires_broker() {
        with_env(&[], || {
            assert!(matches!(
                BrokerConfig::from_env(),
                Err(ConfigError::MissingOrInvalid(_))
            ));
        });
    }

    #[test]
    #[serial]
    fn from_env_rejects_invalid_numbers() {
        with_env(&[("MQTT_BROKER", "localhost"), ("MQTT_PORT", "port")], || {
            assert!(matches!(
                BrokerConfig::from_env(),
                Err(ConfigError::ParsingError(_))
            ));
        });
        with_env(
            &[("MQTT_BROKER", "localhost"), ("MQTT_BIRTH_TOPIC", "a"), ("MQTT_BIRTH_QOS", "3")],
            || {
                assert!(BrokerConfig::from_env().is_err());
            },
        );
    }
}
