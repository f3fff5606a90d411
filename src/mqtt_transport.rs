use crate::error::TransportError;
use crate::message::{InboundMessage, PacketMeta, QoS, SubscribeCode};
use crate::transport::{
    ConnectOptions, EventSink, OnClosed, ProtocolVersion, PublishAck, PublishOptions, SubscribeAck, Transport,
    TransportEvent, TransportHandle,
};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, Proxy, ProxyAuth,
    ProxyType, QoS as WireQoS, SubscribeReasonCode, Transport as WireTransport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::sleep;

const DEFAULT_REQUEST_CAPACITY: usize = 64;

/// [`Transport`] backed by rumqttc. Needs a running tokio runtime at connect time.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    request_capacity: usize,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REQUEST_CAPACITY)
    }

    /// `request_capacity` bounds the queue of requests waiting for the event loop.
    pub fn with_capacity(request_capacity: usize) -> Self {
        Self {
            request_capacity: request_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerAddress {
    scheme: Scheme,
    host: String,
    port: u16,
    url: String,
}

fn parse_broker_url(url: &str) -> Result<BrokerAddress, TransportError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| TransportError::UnsupportedUrl(format!("{}: {}", url, e)))?;
    let scheme = match uri.scheme_str() {
        Some("mqtt") | Some("tcp") => Scheme::Tcp,
        Some("mqtts") | Some("ssl") | Some("tls") => Scheme::Tls,
        Some("ws") => Scheme::Ws,
        Some("wss") => Scheme::Wss,
        _ => return Err(TransportError::UnsupportedUrl(url.to_string())),
    };
    let host = uri
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TransportError::UnsupportedUrl(url.to_string()))?;
    let default_port = match scheme {
        Scheme::Tcp => 1883,
        Scheme::Tls => 8883,
        Scheme::Ws => 80,
        Scheme::Wss => 443,
    };

    Ok(BrokerAddress {
        scheme,
        host: host.to_string(),
        port: uri.port_u16().unwrap_or(default_port),
        url: url.to_string(),
    })
}

fn to_wire(qos: QoS) -> WireQoS {
    match qos {
        QoS::AtMostOnce => WireQoS::AtMostOnce,
        QoS::AtLeastOnce => WireQoS::AtLeastOnce,
        QoS::ExactlyOnce => WireQoS::ExactlyOnce,
    }
}

fn from_wire(qos: WireQoS) -> QoS {
    match qos {
        WireQoS::AtMostOnce => QoS::AtMostOnce,
        WireQoS::AtLeastOnce => QoS::AtLeastOnce,
        WireQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn mqtt_options(address: &BrokerAddress, options: &ConnectOptions) -> Result<MqttOptions, TransportError> {
    if options.client_id.is_empty() {
        return Err(TransportError::Connect("client id must not be empty".to_string()));
    }

    let broker = match address.scheme {
        Scheme::Ws | Scheme::Wss => address.url.clone(),
        Scheme::Tcp | Scheme::Tls => address.host.clone(),
    };
    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), broker, address.port);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);

    if let Some(username) = options.credentials.username.as_deref() {
        let password = options.credentials.password.as_deref().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    if let Some(will) = options.will.as_ref() {
        mqtt_options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_wire(will.qos),
            will.retain,
        ));
    }

    if options.protocol == ProtocolVersion::V31 {
        warn!("MQTT 3.1 is not supported by this transport; connecting with 3.1.1.");
    }

    let tls = || {
        options
            .tls
            .as_ref()
            .map(|tls| tls.0.clone())
            .ok_or_else(|| TransportError::Tls(format!("{} requires TLS options", address.url)))
    };
    match address.scheme {
        Scheme::Tcp => {}
        Scheme::Tls => {
            mqtt_options.set_transport(WireTransport::Tls(tls()?));
        }
        Scheme::Ws => {
            mqtt_options.set_transport(WireTransport::Ws);
        }
        Scheme::Wss => {
            mqtt_options.set_transport(WireTransport::Wss(tls()?));
        }
    }

    if let Some(proxy) = options.proxy.as_ref() {
        let auth = match proxy.credentials.clone() {
            Some((username, password)) => ProxyAuth::Basic { username, password },
            None => ProxyAuth::None,
        };
        mqtt_options.set_proxy(Proxy {
            ty: ProxyType::Http,
            auth,
            addr: proxy.host.clone(),
            port: proxy.port,
        });
    }

    Ok(mqtt_options)
}

/// Acks waiting for the broker, matched to packet ids in the order requests reach the
/// event loop.
#[derive(Default)]
struct PendingAcks {
    unsent_subscribes: VecDeque<SubscribeAck>,
    subscribes: HashMap<u16, SubscribeAck>,
    unsent_publishes: VecDeque<(QoS, PublishAck)>,
    publishes: HashMap<u16, PublishAck>,
}

impl PendingAcks {
    fn subscribe_sent(&mut self, pkid: u16) {
        if self.subscribes.contains_key(&pkid) {
            return;
        }
        if let Some(ack) = self.unsent_subscribes.pop_front() {
            self.subscribes.insert(pkid, ack);
        }
    }

    fn subscribe_acked(&mut self, pkid: u16, codes: &[SubscribeReasonCode]) -> Option<(SubscribeAck, SubscribeCode)> {
        let ack = self.subscribes.remove(&pkid)?;
        let code = match codes.first() {
            Some(SubscribeReasonCode::Success(qos)) => SubscribeCode::Granted(from_wire(*qos)),
            _ => SubscribeCode::Failure,
        };
        Some((ack, code))
    }

    /// QoS 0 publishes are done once written; the ack comes back for the caller to run.
    fn publish_sent(&mut self, pkid: u16) -> Option<PublishAck> {
        if pkid != 0 && self.publishes.contains_key(&pkid) {
            return None;
        }
        let (qos, ack) = self.unsent_publishes.pop_front()?;
        if qos == QoS::AtMostOnce {
            return Some(ack);
        }
        self.publishes.insert(pkid, ack);
        None
    }

    fn publish_acked(&mut self, pkid: u16) -> Option<PublishAck> {
        self.publishes.remove(&pkid)
    }

    /// Sent subscribes whose SUBACK will never arrive on this session.
    fn take_sent_subscribes(&mut self) -> Vec<SubscribeAck> {
        self.subscribes.drain().map(|(_, ack)| ack).collect()
    }

    fn drain(&mut self) -> (Vec<SubscribeAck>, Vec<PublishAck>) {
        let subscribes = self
            .unsent_subscribes
            .drain(..)
            .chain(self.subscribes.drain().map(|(_, ack)| ack))
            .collect();
        let publishes = self
            .unsent_publishes
            .drain(..)
            .map(|(_, ack)| ack)
            .chain(self.publishes.drain().map(|(_, ack)| ack))
            .collect();
        (subscribes, publishes)
    }
}

#[derive(Default)]
struct Control {
    stop: Notify,
    ending: AtomicBool,
    on_closed: Mutex<Vec<OnClosed>>,
}

struct MqttHandle {
    client: AsyncClient,
    pending: Arc<Mutex<PendingAcks>>,
    control: Arc<Control>,
    runtime: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportHandle for MqttHandle {
    fn subscribe(&self, filter: &str, qos: QoS, ack: SubscribeAck) {
        let mut pending = lock(&self.pending);
        pending.unsent_subscribes.push_back(ack);
        if let Err(e) = self.client.try_subscribe(filter, to_wire(qos)) {
            error!("Failed to subscribe to topic '{}': {}", filter, e);
            if let Some(ack) = pending.unsent_subscribes.pop_back() {
                self.runtime.spawn(async move { ack(SubscribeCode::Failure) });
            }
        }
    }

    fn unsubscribe(&self, filter: &str) {
        if let Err(e) = self.client.try_unsubscribe(filter) {
            error!("Failed to unsubscribe from topic '{}': {}", filter, e);
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions, ack: PublishAck) {
        let mut pending = lock(&self.pending);
        pending.unsent_publishes.push_back((options.qos, ack));
        if let Err(e) = self
            .client
            .try_publish(topic, to_wire(options.qos), options.retain, payload)
        {
            error!("Failed to publish message to '{}': {}", topic, e);
            if let Some((_, ack)) = pending.unsent_publishes.pop_back() {
                let error = match e {
                    ClientError::TryRequest(_) => TransportError::RequestQueueFull,
                    other => TransportError::Client(other.to_string()),
                };
                self.runtime.spawn(async move { ack(Err(error)) });
            }
        }
    }

    fn end(&self, force: bool, on_closed: Option<OnClosed>) {
        if let Some(on_closed) = on_closed {
            lock(&self.control.on_closed).push(on_closed);
        }
        self.control.ending.store(true, Ordering::SeqCst);
        if force {
            self.control.stop.notify_one();
        } else if let Err(e) = self.client.try_disconnect() {
            warn!("Graceful disconnect failed ({}), dropping the connection.", e);
            self.control.stop.notify_one();
        }
    }
}

impl Drop for MqttHandle {
    fn drop(&mut self) {
        if !self.control.ending.swap(true, Ordering::SeqCst) {
            self.control.stop.notify_one();
        }
    }
}

impl Transport for MqttTransport {
    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let runtime = Handle::try_current()
            .map_err(|_| TransportError::Connect("no tokio runtime available".to_string()))?;
        let address = parse_broker_url(url)?;
        let mqtt_options = mqtt_options(&address, options)?;

        debug!("Configuring MQTT broker at {}:{}...", address.host, address.port);
        let (client, eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);
        let pending = Arc::new(Mutex::new(PendingAcks::default()));
        let control = Arc::new(Control::default());

        runtime.spawn(run_event_loop(
            eventloop,
            events,
            pending.clone(),
            control.clone(),
            options.reconnect_period,
        ));

        Ok(Box::new(MqttHandle {
            client,
            pending,
            control,
            runtime,
        }))
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: EventSink,
    pending: Arc<Mutex<PendingAcks>>,
    control: Arc<Control>,
    reconnect_period: Duration,
) {
    let mut session_up = false;

    loop {
        let polled = tokio::select! {
            _ = control.stop.notified() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to MQTT broker.");
                    session_up = true;
                    events.emit(TransportEvent::Connected);
                } else {
                    error!("MQTT broker refused the connection: {:?}", ack.code);
                    events.emit(TransportEvent::Error(format!("connection refused: {:?}", ack.code)));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                events.emit(TransportEvent::Message(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    meta: PacketMeta {
                        qos: from_wire(publish.qos),
                        retain: publish.retain,
                        dup: publish.dup,
                        pkid: publish.pkid,
                    },
                }));
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let acked = lock(&pending).subscribe_acked(suback.pkid, &suback.return_codes);
                if let Some((ack, code)) = acked {
                    ack(code);
                }
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                let acked = lock(&pending).publish_acked(puback.pkid);
                if let Some(ack) = acked {
                    ack(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                let acked = lock(&pending).publish_acked(pubcomp.pkid);
                if let Some(ack) = acked {
                    ack(Ok(()));
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                lock(&pending).subscribe_sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let done = lock(&pending).publish_sent(pkid);
                if let Some(ack) = done {
                    ack(Ok(()));
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent.");
                break;
            }
            Ok(event) => {
                debug!("Unhandled event: {:?}", event);
            }
            Err(e) => {
                if control.ending.load(Ordering::SeqCst) {
                    break;
                }
                let unanswered = lock(&pending).take_sent_subscribes();
                for ack in unanswered {
                    ack(SubscribeCode::Failure);
                }
                if session_up {
                    session_up = false;
                    warn!("Lost connection to MQTT broker: {}", e);
                    events.emit(TransportEvent::Closed);
                } else {
                    warn!("Error in MQTT event loop: {}", e);
                    events.emit(TransportEvent::Error(e.to_string()));
                }

                tokio::select! {
                    _ = control.stop.notified() => break,
                    _ = sleep(reconnect_period) => {}
                }
                debug!("Retrying MQTT connection in the event loop.");
                events.emit(TransportEvent::Reconnecting);
            }
        }
    }

    let (subscribes, publishes) = lock(&pending).drain();
    for ack in subscribes {
        ack(SubscribeCode::Failure);
    }
    for ack in publishes {
        ack(Err(TransportError::Closed));
    }
    if session_up {
        events.emit(TransportEvent::Closed);
    }
    let on_closed: Vec<OnClosed> = lock(&control.on_closed).drain(..).collect();
    for callback in on_closed {
        callback();
    }
    debug!("MQTT event loop stopped.");
}
