#![allow(dead_code)]

use mqtt_mux::transport::{OnClosed, PublishAck, SubscribeAck};
use mqtt_mux::{
    BrokerConfig, ConnectOptions, Consumer, Credentials, EventSink, PacketMeta, PublishOptions, QoS, SubscribeCode,
    Transport, TransportError, TransportEvent, TransportHandle,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// What the manager asked of a physical connection, tagged with its generation.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Subscribe { connection: u64, filter: String, qos: QoS },
    Unsubscribe { connection: u64, filter: String },
    Publish { connection: u64, topic: String, payload: Vec<u8>, options: PublishOptions },
    End { connection: u64, force: bool },
}

pub struct ConnectCall {
    pub url: String,
    pub options: ConnectOptions,
    pub sink: EventSink,
}

#[derive(Default)]
struct State {
    connects: Vec<ConnectCall>,
    calls: Vec<Call>,
    subscribe_acks: Vec<SubscribeAck>,
    publish_acks: Vec<PublishAck>,
    on_closed: Vec<OnClosed>,
    fail_connect: bool,
}

/// Transport that records everything and only reacts when the test says so.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn fail_connects(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects.len()
    }

    pub fn last_url(&self) -> String {
        self.lock().connects.last().unwrap().url.clone()
    }

    pub fn last_options(&self) -> ConnectOptions {
        self.lock().connects.last().unwrap().options.clone()
    }

    /// Sink of the `index`-th successful connect, zero based.
    pub fn sink(&self, index: usize) -> EventSink {
        self.lock().connects[index].sink.clone()
    }

    /// Delivers an event on the most recent connection. Never called with the mock's
    /// lock held, so the manager may call straight back in.
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.lock().connects.last().unwrap().sink.clone();
        sink.emit(event);
    }

    pub fn emit_on(&self, index: usize, event: TransportEvent) {
        self.sink(index).emit(event);
    }

    pub fn message(&self, topic: &str, payload: &[u8]) {
        self.emit(TransportEvent::Message(mqtt_mux::InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            meta: PacketMeta::default(),
        }));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn wire_subscribes(&self) -> Vec<(String, QoS)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe { filter, qos, .. } => Some((filter, qos)),
                _ => None,
            })
            .collect()
    }

    pub fn ends(&self) -> Vec<(u64, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::End { connection, force } => Some((connection, force)),
                _ => None,
            })
            .collect()
    }

    /// Answers every outstanding SUBACK with `code`.
    pub fn ack_subscribes(&self, code: SubscribeCode) -> usize {
        let acks = std::mem::take(&mut self.lock().subscribe_acks);
        let count = acks.len();
        for ack in acks {
            ack(code);
        }
        count
    }

    pub fn complete_publishes(&self, result: Result<(), TransportError>) -> usize {
        let acks = std::mem::take(&mut self.lock().publish_acks);
        let count = acks.len();
        for ack in acks {
            ack(result.clone());
        }
        count
    }

    /// Runs the `on_closed` callbacks of every connection asked to end.
    pub fn finish_close(&self) -> usize {
        let callbacks = std::mem::take(&mut self.lock().on_closed);
        let count = callbacks.len();
        for callback in callbacks {
            callback();
        }
        count
    }
}

struct MockHandle {
    connection: u64,
    state: Arc<Mutex<State>>,
}

impl MockHandle {
    fn record(&self, call: Call) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

impl TransportHandle for MockHandle {
    fn subscribe(&self, filter: &str, qos: QoS, ack: SubscribeAck) {
        let mut state = self.record(Call::Subscribe {
            connection: self.connection,
            filter: filter.to_string(),
            qos,
        });
        state.subscribe_acks.push(ack);
    }

    fn unsubscribe(&self, filter: &str) {
        self.record(Call::Unsubscribe {
            connection: self.connection,
            filter: filter.to_string(),
        });
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions, ack: PublishAck) {
        let mut state = self.record(Call::Publish {
            connection: self.connection,
            topic: topic.to_string(),
            payload,
            options,
        });
        state.publish_acks.push(ack);
    }

    fn end(&self, force: bool, on_closed: Option<OnClosed>) {
        let mut state = self.record(Call::End {
            connection: self.connection,
            force,
        });
        if let Some(on_closed) = on_closed {
            state.on_closed.push(on_closed);
        }
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(TransportError::Connect("refused".to_string()));
        }
        let connection = events.connection();
        state.connects.push(ConnectCall {
            url: url.to_string(),
            options: options.clone(),
            sink: events,
        });
        Ok(Box::new(MockHandle {
            connection,
            state: self.state.clone(),
        }))
    }
}

/// Consumer that writes every hook it receives into a log.
pub struct RecordingConsumer {
    id: String,
    events: Mutex<Vec<String>>,
}

impl RecordingConsumer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Consumer for RecordingConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_connect(&self) {
        self.push("connect".to_string());
    }

    fn on_disconnect(&self) {
        self.push("disconnect".to_string());
    }

    fn on_reconnecting(&self) {
        self.push("reconnecting".to_string());
    }

    fn on_subscribe_ack(&self, code: SubscribeCode) {
        self.push(format!("suback:{}", code.code()));
    }
}

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        client_id: Some("test-client".to_string()),
        credentials: Credentials::new("user", "pw"),
        ..BrokerConfig::new("broker.local")
    }
}

/// Handler that stores the topics it sees.
pub fn recorder() -> (
    Arc<Mutex<Vec<String>>>,
    impl Fn(&str, &[u8], &PacketMeta) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = move |topic: &str, _payload: &[u8], _meta: &PacketMeta| {
        sink.lock().unwrap().push(topic.to_string());
    };
    (seen, handler)
}
