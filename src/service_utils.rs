use crate::connection::BrokerConnection;
use crate::message::{OutboundMessage, QoS};
use serde_json::json;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn status_message(topic: &str, status: &str, details: Option<&str>) -> OutboundMessage {
    OutboundMessage::new(
        topic,
        json!({
            "status": status,
            "details": details.unwrap_or_default(),
        }),
    )
    .with_qos(QoS::AtLeastOnce)
    .with_retain(true)
}

/// Publish service status. Dropped silently while the broker is unreachable.
pub fn publish_status(connection: &BrokerConnection, topic: &str, status: &str, details: Option<&str>) {
    let message = status_message(topic, status, details);
    let sent = connection.publish(message, |message| {
        if let Some(e) = message.error {
            warn!("Status update to '{}' failed: {}", message.topic, e);
        }
    });
    if !sent {
        info!("Not connected, skipping status '{}'.", status);
    }
}

/// Start periodic status updates
pub fn periodic_status_update(connection: BrokerConnection, topic: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            publish_status(&connection, &topic, "running", Some("Service is operational"));
            tokio::time::sleep(interval).await;
        }
    })
}

/// Closes the connection and waits, bounded, for the transport to finish.
pub async fn close_connection(connection: &BrokerConnection) {
    let (tx, rx) = oneshot::channel();
    connection.close(move || {
        let _ = tx.send(());
    });
    if tokio::time::timeout(CLOSE_TIMEOUT, rx).await.is_err() {
        warn!("Broker connection did not close within {:?}.", CLOSE_TIMEOUT);
    }
}

/// Wait for Ctrl-C, publish the shutdown status and close the connection.
pub async fn handle_shutdown(connection: BrokerConnection, status_topic: &str) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        publish_status(&connection, status_topic, "error", Some("Termination signal failed"));
    } else {
        info!("Service is shutting down...");
        publish_status(&connection, status_topic, "shutdown", Some("Service is shutting down..."));
    }

    close_connection(&connection).await;
}
