use chrono::{DateTime, Local};
use rumqttc::QoS;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event_queue::EventReceiver;
use super::retry::RetryPolicy;
use crate::controller::event::ControllerEvent;
use crate::mqtt::message_manager::{OutgoingMessage, PublishError, Sink};

#[derive(Clone, Debug)]
pub struct PublishSettings {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub messages_published: u64,
    pub retries: u64,
    pub last_publish: Option<DateTime<Local>>,
}

// Outcome of publishing a single event
enum Delivery {
    Published,
    Cancelled,
}

/// Drains the event queue into a [`Sink`]
pub struct Publisher<S> {
    sink: S,
    receiver: EventReceiver,
    settings: PublishSettings,
    retry: RetryPolicy,
    stats: PublisherStats,
}

impl<S: Sink> Publisher<S> {
    pub fn new(
        sink: S,
        receiver: EventReceiver,
        settings: PublishSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sink,
            receiver,
            settings,
            retry,
            stats: PublisherStats::default(),
        }
    }

    pub fn format(&self, event: &ControllerEvent) -> OutgoingMessage {
        OutgoingMessage {
            topic: self.settings.topic.clone(),
            payload: event.to_string(),
            qos: self.settings.qos,
            retain: self.settings.retain,
        }
    }

    /// Publishes events in queue order until the queue is closed and empty,
    /// a publish fails fatally, or `cancel` fires.
    ///
    /// On a fatal failure `cancel` is triggered so the reader stops as well.
    /// The sink is closed on every exit path.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PublisherStats, PublishError> {
        info!(
            "Starting publisher on topic '{}' (qos {:?}, retain {})",
            self.settings.topic, self.settings.qos, self.settings.retain
        );

        let result = self.publish_loop(&cancel).await;
        if let Err(e) = &result {
            error!("Publisher stopped: {}", e);
            cancel.cancel();
        }

        self.sink.close().await;
        info!("Publisher finished: {:?}", self.stats);
        result.map(|_| self.stats)
    }

    async fn publish_loop(&mut self, cancel: &CancellationToken) -> Result<(), PublishError> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Publisher cancelled");
                    return Ok(());
                }
                event = self.receiver.dequeue() => event,
            };

            let Some(event) = event else {
                info!("Event queue closed and drained");
                return Ok(());
            };

            let message = self.format(&event);
            match self.deliver(&message, cancel).await? {
                Delivery::Published => {
                    self.stats.messages_published += 1;
                    self.stats.last_publish = Some(Local::now());
                }
                Delivery::Cancelled => {
                    warn!("Cancelled before '{}' could be published", message.payload);
                    return Ok(());
                }
            }
        }
    }

    async fn deliver(
        &mut self,
        message: &OutgoingMessage,
        cancel: &CancellationToken,
    ) -> Result<Delivery, PublishError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let published = tokio::select! {
                _ = cancel.cancelled() => return Ok(Delivery::Cancelled),
                published = self.sink.publish(message) => published,
            };

            match published {
                Ok(()) => {
                    debug!("Published '{}' (attempt {})", message.payload, attempt);
                    return Ok(Delivery::Published);
                }
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Publishing '{}' failed (attempt {}): {}; retrying in {:?}",
                        message.payload, attempt, e, delay
                    );
                    self.stats.retries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(Delivery::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_retryable() => {
                    return Err(PublishError::Fatal(format!(
                        "gave up after {} attempts: {}",
                        attempt, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
