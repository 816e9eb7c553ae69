use std::fmt;
use std::future::Future;

use rumqttc::QoS;

/// One message ready to be handed to a [`Sink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl fmt::Display for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <- {}", self.topic, self.payload)
    }
}

/// Why a publish did not go through
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Temporary condition (network I/O, timeouts, link down); worth retrying
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// Broker refused us, protocol violation or the client is gone
    #[error("Fatal publish failure: {0}")]
    Fatal(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Destination for published events.
///
/// `publish` resolves once the sink has accepted the message or failed.
/// `close` is called once when the publisher stops.
pub trait Sink: Send {
    fn publish(
        &mut self,
        message: &OutgoingMessage,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
