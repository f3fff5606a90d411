//! The shared broker connection.
//!
//! One [`BrokerConnection`] owns one physical connection at a time and multiplexes any
//! number of consumers and subscriptions onto it. All structural changes (consumers,
//! subscriptions, state transitions) go through a single mutex. Message handlers run
//! after that mutex is released. Consumer hooks are queued under it, in the order of the
//! state changes that caused them, and run outside it by one thread at a time, so a
//! consumer never sees `on_disconnect` overtake its `on_connect`. Hooks may call
//! straight back into the connection; any hooks such a call queues run after the
//! current one returns, possibly on the thread already draining the queue.

use crate::config::{BrokerConfig, Credentials};
use crate::consumers::{Consumer, ConsumerRegistry};
use crate::error::ConnectionError;
use crate::message::{OutboundMessage, PacketMeta, QoS, SubscribeCode};
use crate::proxy::ProxyAgent;
use crate::subscriptions::{MessageHandler, RefKey, Removal, SubscriptionEntry, SubscriptionRegistry};
use crate::topic;
use crate::transport::{
    ConnectOptions, EventListener, EventSink, ProtocolVersion, PublishOptions, TlsOptions, Transport,
    TransportEvent, TransportHandle,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Shutdown requested. Terminal.
    Closing,
}

struct Inner {
    state: ConnectionState,
    /// Present while Connecting or Connected. Also kept while Idle after an unexpected
    /// drop, when the transport is redialing on its own.
    handle: Option<Box<dyn TransportHandle>>,
    /// Generation of the current physical connection. Lifecycle events carrying any
    /// other generation come from a retired connection and are ignored.
    generation: u64,
    /// Set while the attempt we started ourselves is pending; errors during it tear the
    /// attempt down, errors during transport-driven redials don't.
    initial_attempt: bool,
    credentials: Credentials,
    consumers: ConsumerRegistry,
    subscriptions: SubscriptionRegistry,
    /// Consumer hooks and completions, queued in the order the state changes that caused
    /// them happened and run outside the lock.
    jobs: VecDeque<Callback>,
    draining: bool,
}

struct Shared {
    me: Weak<Shared>,
    url: String,
    config: BrokerConfig,
    tls: Option<TlsOptions>,
    proxy: Option<ProxyAgent>,
    transport: Box<dyn Transport>,
    inner: Mutex<Inner>,
}

/// Handle to a shared broker connection. Cheap to clone.
#[derive(Clone)]
pub struct BrokerConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(config: BrokerConfig, transport: impl Transport + 'static) -> Self {
        Self::with_collaborators(config, transport, None, None)
    }

    /// Builds the connection with TLS material and a proxy supplied by their respective
    /// collaborators. Nothing connects until the first consumer registers.
    pub fn with_collaborators(
        config: BrokerConfig,
        transport: impl Transport + 'static,
        tls: Option<TlsOptions>,
        proxy: Option<ProxyAgent>,
    ) -> Self {
        let config = config.finalize();
        let url = config.broker_url();
        let credentials = config.credentials.clone();
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            url,
            config,
            tls,
            proxy,
            transport: Box::new(transport),
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                handle: None,
                generation: 0,
                initial_attempt: false,
                credentials,
                consumers: ConsumerRegistry::new(),
                subscriptions: SubscriptionRegistry::new(),
                jobs: VecDeque::new(),
                draining: false,
            }),
        });
        Self { shared }
    }

    /// Adds a consumer. The first consumer starts the connection; a consumer joining an
    /// already connected session gets `on_connect` right away.
    pub fn register(&self, consumer: Arc<dyn Consumer>) -> Result<(), ConnectionError> {
        self.shared.register(consumer)
    }

    /// Removes a consumer. When it was the last one the physical connection is closed
    /// and `on_complete` runs once the close has finished.
    pub fn deregister<F>(&self, consumer_id: &str, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.deregister(consumer_id, Box::new(on_complete));
    }

    /// Adds or replaces the (filter, ref key) subscription. The ref key also names the
    /// consumer whose `on_subscribe_ack` hears about the wire subscription's outcome.
    pub fn subscribe<H>(&self, filter: impl Into<String>, qos: QoS, handler: H, ref_key: impl Into<RefKey>)
    where
        H: Fn(&str, &[u8], &PacketMeta) + Send + Sync + 'static,
    {
        self.shared.subscribe(SubscriptionEntry {
            filter: filter.into(),
            qos,
            handler: Arc::new(handler),
            ref_key: ref_key.into(),
        });
    }

    pub fn unsubscribe(&self, filter: &str, ref_key: &str) {
        self.shared.unsubscribe(filter, ref_key);
    }

    /// Best-effort publish: returns false and drops the message unless connected.
    /// Otherwise `on_complete` gets the message back exactly once, with `error` set if
    /// the transport failed to deliver it.
    pub fn publish<F>(&self, message: OutboundMessage, on_complete: F) -> bool
    where
        F: FnOnce(OutboundMessage) + Send + 'static,
    {
        self.shared.publish(message, Box::new(on_complete))
    }

    /// Swaps credentials. Omitted values keep their current setting; if nothing changes
    /// this does nothing at all. Otherwise the current physical connection is retired
    /// and a new one dialed, keeping every consumer and subscription.
    pub fn rotate_credentials(&self, username: Option<&str>, password: Option<&str>) {
        self.shared.rotate_credentials(username, password);
    }

    /// Dials again after a failed connect left the connection idle.
    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        self.shared.reconnect()
    }

    /// Shuts the connection down for good. `on_done` runs once the transport has closed.
    pub fn close<F>(&self, on_done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.close(Box::new(on_done));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.lock().consumers.len()
    }

    /// Number of (filter, ref key) entries.
    pub fn subscription_count(&self) -> usize {
        self.shared.lock().subscriptions.len()
    }

    /// QoS the wire subscription for `filter` is (or would be) issued at.
    pub fn effective_qos(&self, filter: &str) -> Option<QoS> {
        self.shared.lock().subscriptions.effective_qos(filter)
    }

    pub fn credentials(&self) -> Credentials {
        self.shared.lock().credentials.clone()
    }

    pub fn broker_url(&self) -> &str {
        &self.shared.url
    }

    pub fn client_id(&self) -> &str {
        self.shared.config.client_id.as_deref().unwrap_or_default()
    }
}

type Callback = Box<dyn FnOnce() + Send>;
type PublishCallback = Box<dyn FnOnce(OutboundMessage) + Send>;

impl Inner {
    fn queue(&mut self, job: Callback) {
        self.jobs.push_back(job);
    }

    fn queue_hooks(&mut self, consumers: Vec<Arc<dyn Consumer>>, hook: fn(&dyn Consumer)) {
        for consumer in consumers {
            self.jobs.push_back(Box::new(move || hook(&*consumer)));
        }
    }
}

/// Clears the draining flag if a queued job panics, so later callers can drain again.
struct DrainGuard<'a>(&'a Shared);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs queued jobs in order, one thread at a time. A caller that finds another
    /// thread draining leaves its jobs to that thread.
    fn run_jobs(&self) {
        {
            let mut inner = self.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }

        let _guard = DrainGuard(self);
        loop {
            let job = {
                let mut inner = self.lock();
                match inner.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };
            job();
        }
    }

    fn label(&self) -> String {
        format!("{}@{}", self.config.client_id.as_deref().unwrap_or_default(), self.url)
    }

    fn connect_options(&self, credentials: &Credentials) -> ConnectOptions {
        ConnectOptions {
            client_id: self.config.client_id.clone().unwrap_or_default(),
            keep_alive: Duration::from_secs(u64::from(self.config.keep_alive_secs)),
            clean_session: self.config.clean_session,
            credentials: credentials.clone(),
            will: self.config.will.clone(),
            protocol: if self.config.compat_mode {
                ProtocolVersion::V31
            } else {
                ProtocolVersion::V311
            },
            reconnect_period: Duration::from_millis(self.config.reconnect_period_ms),
            tls: self.tls.clone(),
            proxy: self.proxy.clone(),
        }
    }

    /// Idle -> Connecting. Never starts a second attempt.
    fn connect_locked(&self, inner: &mut Inner) {
        if inner.state != ConnectionState::Idle || inner.handle.is_some() {
            return;
        }
        inner.generation += 1;
        let listener: Weak<dyn EventListener> = self.me.clone();
        let sink = EventSink::new(inner.generation, listener);
        let options = self.connect_options(&inner.credentials);

        debug!("Connecting to {}...", self.label());
        inner.state = ConnectionState::Connecting;
        match self.transport.connect(&self.url, &options, sink) {
            Ok(handle) => {
                inner.handle = Some(handle);
                inner.initial_attempt = true;
            }
            Err(e) => {
                error!("Connection to {} failed: {}", self.label(), e);
                inner.state = ConnectionState::Idle;
            }
        }
    }

    fn register(&self, consumer: Arc<dyn Consumer>) -> Result<(), ConnectionError> {
        {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closing {
                warn!("Rejecting consumer {}: connection is closing.", consumer.id());
                return Err(ConnectionError::Closing);
            }
            if inner.consumers.insert(&consumer) {
                self.connect_locked(&mut inner);
            }
            if inner.state == ConnectionState::Connected {
                let joined: Vec<Arc<dyn Consumer>> = inner.consumers.mark_connected(consumer.id()).into_iter().collect();
                inner.queue_hooks(joined, |consumer| consumer.on_connect());
            }
        }

        self.run_jobs();
        Ok(())
    }

    fn deregister(&self, consumer_id: &str, on_complete: Callback) {
        let mut inner = self.lock();
        inner.consumers.remove(consumer_id);

        if inner.state != ConnectionState::Closing && inner.consumers.is_empty() {
            if let Some(handle) = inner.handle.take() {
                let was_connected = inner.state == ConnectionState::Connected;
                inner.state = ConnectionState::Idle;
                inner.generation += 1;
                inner.initial_attempt = false;
                if was_connected {
                    info!("Last consumer left, disconnecting from {}.", self.label());
                    handle.end(false, Some(on_complete));
                    return;
                }
                handle.end(true, None);
            }
        }

        drop(inner);
        on_complete();
    }

    fn subscribe(&self, entry: SubscriptionEntry) {
        if !topic::is_valid_filter(&entry.filter) {
            warn!("Rejecting subscription to invalid filter '{}'.", entry.filter);
            {
                let mut inner = self.lock();
                if let Some(owner) = inner.consumers.get(&entry.ref_key) {
                    inner.queue(Box::new(move || owner.on_subscribe_ack(SubscribeCode::Failure)));
                }
            }
            self.run_jobs();
            return;
        }

        let mut inner = self.lock();
        let filter = entry.filter.clone();
        let qos = inner.subscriptions.insert(entry);
        if inner.state == ConnectionState::Connected {
            self.wire_subscribe(&inner, &filter, qos);
        }
    }

    fn unsubscribe(&self, filter: &str, ref_key: &str) {
        let mut inner = self.lock();
        let connected = inner.state == ConnectionState::Connected;
        match inner.subscriptions.remove(filter, ref_key) {
            Removal::NotFound => {}
            Removal::GroupEmptied => {
                if let (true, Some(handle)) = (connected, inner.handle.as_ref()) {
                    debug!("Unsubscribing from '{}'.", filter);
                    handle.unsubscribe(filter);
                }
            }
            Removal::Remaining(qos) => {
                if connected {
                    self.wire_subscribe(&inner, filter, qos);
                }
            }
        }
    }

    fn wire_subscribe(&self, inner: &Inner, filter: &str, qos: QoS) {
        let Some(handle) = inner.handle.as_ref() else {
            return;
        };
        debug!("Subscribing to '{}' at QoS {}.", filter, qos);
        let me = self.me.clone();
        let acked_filter = filter.to_string();
        handle.subscribe(
            filter,
            qos,
            Box::new(move |code| {
                if let Some(shared) = me.upgrade() {
                    shared.report_subscribe(&acked_filter, code);
                }
            }),
        );
    }

    /// The wire subscription is shared, so every entry of the group hears the outcome.
    fn report_subscribe(&self, filter: &str, code: SubscribeCode) {
        match code {
            SubscribeCode::Granted(qos) => debug!("Subscribed to '{}' at QoS {}.", filter, qos),
            SubscribeCode::Failure => warn!("Subscription to '{}' was rejected.", filter),
        }

        {
            let mut inner = self.lock();
            let owners: Vec<Arc<dyn Consumer>> = inner
                .subscriptions
                .ref_keys(filter)
                .iter()
                .filter_map(|key| inner.consumers.get(key))
                .collect();
            for owner in owners {
                inner.queue(Box::new(move || owner.on_subscribe_ack(code)));
            }
        }
        self.run_jobs();
    }

    fn dispatch(&self, topic: &str, payload: &[u8], meta: &PacketMeta) {
        let handlers: Vec<MessageHandler> = self.lock().subscriptions.matching_handlers(topic);
        if handlers.is_empty() {
            debug!("No subscription matches topic '{}'.", topic);
        }
        for handler in handlers {
            handler(topic, payload, meta);
        }
    }

    fn publish(&self, mut message: OutboundMessage, on_complete: PublishCallback) -> bool {
        let inner = self.lock();
        if inner.state != ConnectionState::Connected {
            debug!("Not connected, dropping message for '{}'.", message.topic);
            return false;
        }

        if !topic::is_valid_topic(&message.topic) {
            drop(inner);
            warn!("Refusing to publish to invalid topic '{}'.", message.topic);
            message.error = Some(format!("Invalid topic '{}'", message.topic));
            on_complete(message);
            return true;
        }

        let Some(handle) = inner.handle.as_ref() else {
            return false;
        };

        let topic = message.topic.clone();
        let payload = message.payload.to_bytes();
        let options = PublishOptions {
            qos: message.effective_qos(),
            retain: message.effective_retain(),
        };
        handle.publish(
            &topic,
            payload,
            options,
            Box::new(move |result| {
                if let Err(e) = result {
                    warn!("Failed to publish message to '{}': {}", message.topic, e);
                    message.error = Some(e.to_string());
                }
                on_complete(message);
            }),
        );
        true
    }

    fn rotate_credentials(&self, username: Option<&str>, password: Option<&str>) {
        {
            let mut inner = self.lock();
            let credentials = Credentials {
                username: username.map(str::to_string).or_else(|| inner.credentials.username.clone()),
                password: password.map(str::to_string).or_else(|| inner.credentials.password.clone()),
            };
            if credentials == inner.credentials {
                return;
            }
            inner.credentials = credentials;
            info!("Credentials changed for {}.", self.label());
            if inner.state == ConnectionState::Closing {
                return;
            }

            if let Some(old) = inner.handle.take() {
                // Messages from the old connection still reach dispatch while it winds
                // down; its lifecycle events don't.
                inner.generation += 1;
                inner.initial_attempt = false;
                old.end(false, None);
            }
            inner.state = ConnectionState::Idle;
            let retired = inner.consumers.mark_all_disconnected();
            inner.queue_hooks(retired, |consumer| consumer.on_disconnect());

            if !inner.consumers.is_empty() {
                self.connect_locked(&mut inner);
            }
        }

        self.run_jobs();
    }

    fn reconnect(&self) -> Result<(), ConnectionError> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closing {
            return Err(ConnectionError::Closing);
        }
        if !inner.consumers.is_empty() {
            self.connect_locked(&mut inner);
        }
        Ok(())
    }

    fn close(&self, on_done: Callback) {
        {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closing {
                inner.queue(on_done);
            } else {
                let previous = inner.state;
                inner.state = ConnectionState::Closing;
                info!("Closing connection to {}.", self.label());
                match inner.handle.take() {
                    Some(handle) if previous == ConnectionState::Connected => {
                        let me = self.me.clone();
                        handle.end(
                            false,
                            Some(Box::new(move || match me.upgrade() {
                                Some(shared) => shared.finish_close(on_done),
                                None => on_done(),
                            })),
                        );
                        return;
                    }
                    Some(handle) => {
                        handle.end(true, None);
                        inner.queue(on_done);
                    }
                    None => inner.queue(on_done),
                }
            }
        }

        self.run_jobs();
    }

    fn finish_close(&self, on_done: Callback) {
        {
            let mut inner = self.lock();
            let gone = inner.consumers.mark_all_disconnected();
            inner.queue_hooks(gone, |consumer| consumer.on_disconnect());
            inner.queue(on_done);
        }
        self.run_jobs();
    }

    fn on_connected(&self, connection: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != connection || inner.handle.is_none() {
                return;
            }
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Idle => {}
                ConnectionState::Connected | ConnectionState::Closing => return,
            }
            inner.state = ConnectionState::Connected;
            inner.initial_attempt = false;
            let username = inner.credentials.username.clone().unwrap_or_default();
            info!("Connected to broker {} as {}.", self.label(), username);

            let joined = inner.consumers.mark_all_connected();
            inner.queue_hooks(joined, |consumer| consumer.on_connect());
            // Replay and birth follow the on_connect hooks.
            let me = self.me.clone();
            inner.queue(Box::new(move || {
                if let Some(shared) = me.upgrade() {
                    shared.replay(connection);
                }
            }));
        }

        self.run_jobs();
    }

    fn replay(&self, connection: u64) {
        {
            let inner = self.lock();
            if inner.generation != connection || inner.state != ConnectionState::Connected {
                return;
            }
            for (filter, qos) in inner.subscriptions.wire_subscriptions() {
                self.wire_subscribe(&inner, &filter, qos);
            }
        }

        if let Some(birth) = self.config.birth.as_ref() {
            let message = OutboundMessage::new(birth.topic.clone(), birth.payload())
                .with_qos(birth.qos)
                .with_retain(birth.retain);
            self.publish(message, Box::new(|_| {}));
        }
    }

    fn on_reconnecting(&self, connection: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != connection || inner.handle.is_none() {
                return;
            }
            if inner.state == ConnectionState::Closing {
                return;
            }
            inner.state = ConnectionState::Connecting;
            info!("Reconnecting to {}...", self.label());

            let dropped = inner.consumers.mark_all_disconnected();
            inner.queue_hooks(dropped, |consumer| consumer.on_disconnect());
            let consumers = inner.consumers.snapshot();
            inner.queue_hooks(consumers, |consumer| consumer.on_reconnecting());
        }

        self.run_jobs();
    }

    fn on_closed(&self, connection: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != connection {
                return;
            }
            match inner.state {
                ConnectionState::Connected => {
                    inner.state = ConnectionState::Idle;
                    info!("Disconnected from {}.", self.label());
                    let gone = inner.consumers.mark_all_disconnected();
                    inner.queue_hooks(gone, |consumer| consumer.on_disconnect());
                }
                ConnectionState::Connecting => {
                    inner.state = ConnectionState::Idle;
                    warn!("Connect to {} failed.", self.label());
                    return;
                }
                ConnectionState::Idle | ConnectionState::Closing => return,
            }
        }

        self.run_jobs();
    }

    fn on_error(&self, connection: u64, message: &str) {
        let mut inner = self.lock();
        if inner.generation != connection {
            return;
        }
        let connecting = matches!(inner.state, ConnectionState::Connecting | ConnectionState::Idle);
        if connecting && inner.initial_attempt {
            warn!("Connection to {} failed: {}", self.label(), message);
            if let Some(handle) = inner.handle.take() {
                handle.end(true, None);
            }
            inner.state = ConnectionState::Idle;
            inner.initial_attempt = false;
            inner.generation += 1;
        } else {
            debug!("Transport error on {}: {}", self.label(), message);
        }
    }
}

impl EventListener for Shared {
    fn handle_event(&self, connection: u64, event: TransportEvent) {
        if let TransportEvent::Message(message) = &event {
            self.dispatch(&message.topic, &message.payload, &message.meta);
            return;
        }

        match event {
            TransportEvent::Connected => self.on_connected(connection),
            TransportEvent::Reconnecting => self.on_reconnecting(connection),
            TransportEvent::Closed => self.on_closed(connection),
            TransportEvent::Error(message) => self.on_error(connection, &message),
            TransportEvent::Message(_) => {}
        }
    }
}
