//! Boundary to the wire-protocol client.
//!
//! The broker connection never touches sockets itself. It asks a [`Transport`] for a
//! physical connection, drives it through the returned [`TransportHandle`] and learns
//! what happened on the wire through the [`EventSink`] it handed over at connect time.

use crate::config::{Credentials, MessageTemplate};
use crate::error::TransportError;
use crate::message::{InboundMessage, QoS, SubscribeCode};
use crate::proxy::ProxyAgent;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type SubscribeAck = Box<dyn FnOnce(SubscribeCode) + Send>;
pub type PublishAck = Box<dyn FnOnce(Result<(), TransportError>) + Send>;
pub type OnClosed = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (`MQIsdp`), for old brokers.
    V31,
    #[default]
    V311,
}

/// TLS material prepared by the caller, passed through to the transport untouched.
#[derive(Clone)]
pub struct TlsOptions(pub rumqttc::TlsConfiguration);

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsOptions(..)")
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Credentials,
    pub will: Option<MessageTemplate>,
    pub protocol: ProtocolVersion,
    pub reconnect_period: Duration,
    pub tls: Option<TlsOptions>,
    pub proxy: Option<ProxyAgent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established (CONNACK accepted).
    Connected,
    /// The transport is about to dial again after losing the connection.
    Reconnecting,
    Closed,
    Error(String),
    Message(InboundMessage),
}

/// Receives the events of one physical connection.
pub trait EventListener: Send + Sync {
    fn handle_event(&self, connection: u64, event: TransportEvent);
}

/// Listener handle bound to one physical connection.
///
/// Cloned freely by transports. Once the owning manager is gone, events go nowhere.
#[derive(Clone)]
pub struct EventSink {
    connection: u64,
    listener: std::sync::Weak<dyn EventListener>,
}

impl EventSink {
    pub fn new(connection: u64, listener: std::sync::Weak<dyn EventListener>) -> Self {
        Self {
            connection,
            listener,
        }
    }

    /// Generation of the physical connection this sink belongs to.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(listener) = self.listener.upgrade() {
            listener.handle_event(self.connection, event);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("connection", &self.connection)
            .finish()
    }
}

/// One live physical connection. Every method returns immediately; outcomes arrive
/// through the acks, each of which is invoked exactly once.
///
/// Acks, `on_closed` callbacks and sink events must never be invoked from inside one of
/// these calls (nor from inside [`Transport::connect`]): the caller may be holding its
/// own lock while issuing them.
pub trait TransportHandle: Send + Sync {
    fn subscribe(&self, filter: &str, qos: QoS, ack: SubscribeAck);

    fn unsubscribe(&self, filter: &str);

    fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions, ack: PublishAck);

    /// Closes the connection. A graceful end lets the broker see a DISCONNECT; a forced
    /// one drops the connection at once. `on_closed` runs when the connection is gone.
    fn end(&self, force: bool, on_closed: Option<OnClosed>);
}

pub trait Transport: Send + Sync {
    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        (**self).connect(url, options, events)
    }
}
