//! TETHER command-line client.
//!
//! Subscribes to the configured WebSocket endpoint, logs traffic and network
//! status changes, and shuts down on Ctrl-C.

use tether_client::{init_tracing, ClientResult, DeliveryContext};
use tether_core::TetherConfig;
use tether_realtime::ConnectionEvent;
use tracing::{info, warn};

const SUBSCRIBER_ID: &str = "tether-cli";

#[tokio::main]
async fn main() -> ClientResult<()> {
    let config = TetherConfig::load()?;
    init_tracing(&config.logging)?;

    let context = DeliveryContext::from_config(config)?;
    context.init()?;

    match context.subscribe_realtime(SUBSCRIBER_ID).await {
        Ok(connection) => {
            connection.on(log_event);
            info!(
                endpoint = %connection.endpoint(),
                state = %connection.state(),
                "Subscribed"
            );
        }
        Err(err) => warn!(kind = %err.kind(), error = %err, "Realtime subscription failed"),
    }

    let mut status = context.monitor().subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                info!(
                    os_online = current.os_online,
                    heartbeat_failed = current.heartbeat_failed,
                    offline = current.is_offline(),
                    "Network status changed"
                );
            }
        }
    }

    context.release_realtime(SUBSCRIBER_ID);
    context.shutdown().await;
    Ok(())
}

fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => info!("Connected"),
        ConnectionEvent::Disconnected { reason } => warn!(reason = %reason, "Disconnected"),
        ConnectionEvent::Message(frame) => match frame.as_text() {
            Some(text) => info!(bytes = frame.len(), text = %text, "Message"),
            None => info!(bytes = frame.len(), "Binary message"),
        },
        ConnectionEvent::Error(err) => warn!(kind = %err.kind(), error = %err, "Connection error"),
    }
}
