use thiserror::Error;

/// Broker communication errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not reach or authenticate with the broker.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The client refused the request.
    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// No confirmation within the configured time.
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),
}

impl From<rumqttc::ConnectionError> for BrokerError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        BrokerError::Connection(e.to_string())
    }
}
