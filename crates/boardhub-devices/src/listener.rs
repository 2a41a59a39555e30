//! Long-lived subscription on the reply topic.

use std::time::Duration;

use boardhub_core::MqttConfig;
use rumqttc::{AsyncClient, Event, Outgoing, Packet, QoS};
use tokio_util::sync::CancellationToken;

use crate::ingest::ReplyIngestor;
use crate::mqtt::listener_options;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Next reconnect delay: doubled, capped at [`MAX_BACKOFF`].
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Subscribes to the reply topic and feeds every message to the ingestor.
pub struct ReplyListener {
    config: MqttConfig,
    ingestor: ReplyIngestor,
}

impl ReplyListener {
    pub fn new(config: MqttConfig, ingestor: ReplyIngestor) -> Self {
        Self { config, ingestor }
    }

    /// Run until `cancel` fires.
    ///
    /// The subscription is renewed on every (re)connect. A reply is acked to
    /// the broker only after it is in the stream. Connection errors
    /// are retried with exponential backoff; the delay resets once the broker
    /// accepts a connection.
    pub async fn run(self, cancel: CancellationToken) {
        let topic = self.config.reply_topic.clone();
        let options = listener_options(&self.config);
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let mut backoff = INITIAL_BACKOFF;

        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            topic = %topic,
            "reply listener starting"
        );

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff = INITIAL_BACKOFF;
                    tracing::info!(topic = %topic, "connected to broker, subscribing");
                    if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                        tracing::error!(topic = %topic, error = %e, "subscribe request failed");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    tracing::debug!(
                        pkid = ack.pkid,
                        codes = ?ack.return_codes,
                        "subscription acknowledged"
                    );
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match self.ingestor.ingest(&publish.topic, &publish.payload).await {
                        Ok(_) => {
                            if let Err(e) = client.ack(&publish).await {
                                tracing::warn!(
                                    topic = %publish.topic,
                                    pkid = publish.pkid,
                                    error = %e,
                                    "failed to queue reply ack"
                                );
                            }
                        }
                        // Unacked, so the broker redelivers it on the next session.
                        Err(e) => tracing::error!(
                            topic = %publish.topic,
                            pkid = publish.pkid,
                            error = %e,
                            "failed to ingest reply, left unacknowledged"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "broker connection error"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }

        tracing::info!("reply listener stopping");
        if client.try_disconnect().is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardhub_storage::{open_database, ReplyStream};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = INITIAL_BACKOFF;
        let mut seen = vec![delay];
        for _ in 0..6 {
            delay = next_backoff(delay);
            seen.push(delay);
        }
        let secs: Vec<u64> = seen.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_listener_session_acks_by_hand() {
        let config = MqttConfig::default();
        let opts = listener_options(&config);
        assert!(opts.manual_acks());
        assert!(!opts.clean_session());
        assert_eq!(opts.client_id(), format!("{}-listener", config.client_id));
        // Stable across restarts so the broker keeps the session.
        assert_eq!(listener_options(&config).client_id(), opts.client_id());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_without_broker() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("boardhub.redb")).unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let listener = ReplyListener::new(config, ReplyIngestor::new(ReplyStream::new(db)));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listener.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}
