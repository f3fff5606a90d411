//! A shared MQTT broker connection.
//!
//! Many consumers register with one [`BrokerConnection`]; it connects on the first
//! registration, disconnects after the last, keeps one wire subscription per topic
//! filter at the highest QoS any subscriber asked for and fans inbound messages out to
//! every matching handler.

pub mod config;
pub mod connection;
pub mod consumers;
pub mod error;
pub mod logging;
pub mod message;
pub mod mqtt_transport;
pub mod proxy;
pub mod service_utils;
pub mod subscriptions;
pub mod topic;
pub mod transport;

pub use config::{BrokerConfig, ConfigError, Credentials, MessageTemplate};
pub use connection::{BrokerConnection, ConnectionState};
pub use consumers::Consumer;
pub use error::{ConnectionError, TransportError};
pub use message::{InboundMessage, OutboundMessage, PacketMeta, Payload, QoS, SubscribeCode};
pub use mqtt_transport::MqttTransport;
pub use proxy::ProxyAgent;
pub use subscriptions::{RefKey, DEFAULT_REF_KEY};
pub use topic::matches;
pub use transport::{
    ConnectOptions, EventListener, EventSink, ProtocolVersion, PublishOptions, TlsOptions, Transport,
    TransportEvent, TransportHandle,
};
