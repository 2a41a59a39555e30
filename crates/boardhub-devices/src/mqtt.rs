//! Command publishing.

use std::time::Duration;

use async_trait::async_trait;
use boardhub_core::MqttConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use uuid::Uuid;

use crate::error::BrokerError;

/// Sends a command payload to a topic.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publish `payload` on `topic`. Returns once the broker has the message
    /// (QoS 1) or it has been written to the connection (QoS 0).
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

/// Connection options for one client of the hub.
///
/// `role` keeps client ids of the listener and publishers apart; a random
/// suffix makes concurrent publishers unique.
pub(crate) fn mqtt_options(config: &MqttConfig, role: &str) -> MqttOptions {
    let suffix = Uuid::new_v4().simple().to_string();
    base_options(config, format!("{}-{}-{}", config.client_id, role, &suffix[..8]))
}

/// Options for the reply subscription.
///
/// The client id is stable and the session persistent, so QoS 1 replies
/// left unacknowledged are redelivered by the broker on reconnect. Acks are
/// sent by hand once a reply is stored.
pub(crate) fn listener_options(config: &MqttConfig) -> MqttOptions {
    let mut opts = base_options(config, format!("{}-listener", config.client_id));
    opts.set_clean_session(false);
    opts.set_manual_acks(true);
    opts
}

fn base_options(config: &MqttConfig, client_id: String) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, &config.host, config.port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let Some((username, password)) = config.credentials() {
        opts.set_credentials(username, password);
    }
    opts
}

pub(crate) fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Publisher that opens a fresh connection for every message.
///
/// Commands are rare and bursty, so there is no long-lived publishing
/// connection to keep healthy.
#[derive(Debug, Clone)]
pub struct MqttPublisher {
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.publish_timeout_secs)
    }
}

/// Drive the connection until the publish is confirmed for its QoS.
async fn await_delivery(eventloop: &mut EventLoop, qos: QoS) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await? {
            Event::Outgoing(Outgoing::Publish(_)) if qos == QoS::AtMostOnce => return Ok(()),
            Event::Incoming(Packet::PubAck(_)) if qos == QoS::AtLeastOnce => return Ok(()),
            _ => {}
        }
    }
}

#[async_trait]
impl CommandPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let qos = qos_from_level(self.config.publish_qos);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&self.config, "pub"), 10);

        client
            .publish(topic, qos, false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        let delivered =
            tokio::time::timeout(self.timeout(), await_delivery(&mut eventloop, qos)).await;

        match delivered {
            Ok(Ok(())) => {
                tracing::debug!(topic, bytes = payload.len(), "command published");
                // Best effort: let the DISCONNECT go out before dropping the connection.
                if client.try_disconnect().is_ok() {
                    let _ = tokio::time::timeout(Duration::from_millis(500), async {
                        loop {
                            match eventloop.poll().await {
                                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    })
                    .await;
                }
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(topic, error = %e, "command publish failed");
                Err(e)
            }
            Err(_) => {
                let ms = self.timeout().as_millis() as u64;
                tracing::warn!(topic, timeout_ms = ms, "command publish timed out");
                Err(BrokerError::Timeout(ms))
            }
        }
    }
}
