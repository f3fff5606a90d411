use mqtt_mux::service_utils::{handle_shutdown, periodic_status_update};
use mqtt_mux::{logging, BrokerConfig, BrokerConnection, Consumer, MqttTransport, ProxyAgent, QoS, SubscribeCode};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CONSUMER_ID: &str = "mqtt-mux";
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Logs connection changes; its subscriptions log every message they receive.
struct LoggingConsumer;

impl Consumer for LoggingConsumer {
    fn id(&self) -> &str {
        CONSUMER_ID
    }

    fn on_connect(&self) {
        info!("Broker connection is up.");
    }

    fn on_disconnect(&self) {
        warn!("Broker connection is down.");
    }

    fn on_reconnecting(&self) {
        info!("Reconnecting to broker...");
    }

    fn on_subscribe_ack(&self, code: SubscribeCode) {
        if !code.is_granted() {
            error!("Subscription rejected (code {}).", code.code());
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    logging::init(&env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

    // Load configuration
    let config = match BrokerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };
    let status_topic = env::var("MQTT_STATUS_TOPIC").unwrap_or_else(|_| "mqtt-mux/status".to_string());
    let filters: Vec<String> = env::var("MQTT_SUBSCRIBE")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|filter| !filter.is_empty())
        .map(str::to_string)
        .collect();

    let proxy = ProxyAgent::from_env(&config.broker_url());
    let connection = BrokerConnection::with_collaborators(config, MqttTransport::new(), None, proxy);
    info!(
        "Using broker {} with client id {}.",
        connection.broker_url(),
        connection.client_id()
    );

    for filter in &filters {
        connection.subscribe(
            filter.as_str(),
            QoS::AtMostOnce,
            |topic: &str, payload: &[u8], _meta: &mqtt_mux::PacketMeta| {
                info!("Received on '{}': {}", topic, String::from_utf8_lossy(payload));
            },
            CONSUMER_ID,
        );
    }

    let consumer: Arc<dyn Consumer> = Arc::new(LoggingConsumer);
    if let Err(e) = connection.register(consumer.clone()) {
        error!("Failed to register consumer: {}", e);
        return;
    }

    let status_task = periodic_status_update(connection.clone(), status_topic.clone(), STATUS_INTERVAL);

    handle_shutdown(connection.clone(), &status_topic).await;
    status_task.abort();
    drop(consumer);
    info!("All services shut down successfully.");
}
