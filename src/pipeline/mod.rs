//! Event pipeline between the controller and the broker
//!
//! ```text
//! ReportSource ──► DeviceReader ──► EventQueue ──► Publisher ──► Sink
//!                  (decode)         (bounded)      (retry)
//! ```
//!
//! [`Pipeline`] owns both halves of the queue, the reader, the publisher and
//! the cancellation token they share. Each side runs in its own tokio task.
//! A reader failure closes the queue so the publisher drains and stops; a
//! fatal publisher failure cancels the token so the reader stops.

pub mod event_queue;
pub mod publisher;
pub mod retry;

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controller::device_reader::{DeviceLost, DeviceReader, ReaderStats, ReportSource};
use crate::controller::usb_link::DeviceError;
use crate::mqtt::message_manager::{PublishError, Sink};
use event_queue::EventQueue;
use publisher::{PublishSettings, Publisher, PublisherStats};
use retry::RetryPolicy;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { queue_capacity: 10 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub reader: ReaderStats,
    pub publisher: PublisherStats,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Controller lost: {source}")]
    DeviceLost {
        #[source]
        source: DeviceError,
        report: PipelineReport,
    },

    #[error("Publishing failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Pipeline task failed: {0}")]
    Task(String),
}

pub struct Pipeline<R, S> {
    reader: DeviceReader<R>,
    publisher: Publisher<S>,
    cancel: CancellationToken,
}

impl<R, S> Pipeline<R, S>
where
    R: ReportSource + 'static,
    S: Sink + 'static,
{
    pub fn new(
        source: R,
        sink: S,
        capacity: NonZeroUsize,
        publish: PublishSettings,
        retry: RetryPolicy,
    ) -> Self {
        let (sender, receiver) = EventQueue::bounded(capacity);
        Self {
            reader: DeviceReader::new(source, sender),
            publisher: Publisher::new(sink, receiver, publish, retry),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the pipeline's token, e.g. with one already wired to a
    /// signal handler
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops both tasks when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs reader and publisher to completion.
    ///
    /// A fatal publish error takes precedence over a lost device, since the
    /// former is what stopped the reader in that case.
    pub async fn run(self) -> Result<PipelineReport, PipelineError> {
        info!("Starting event pipeline");
        let reader_task = tokio::spawn(self.reader.run(self.cancel.clone()));
        let publisher_task = tokio::spawn(self.publisher.run(self.cancel.clone()));

        // The publisher ends first or together with the reader; a crashed
        // publisher would otherwise leave the reader waiting on the device.
        let publisher_result = publisher_task.await;
        if publisher_result.is_err() {
            self.cancel.cancel();
        }
        let reader_result = reader_task.await;

        let publisher_stats = match publisher_result {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => return Err(PipelineError::Publish(e)),
            Err(e) => {
                error!("Publisher task panicked: {}", e);
                return Err(PipelineError::Task(e.to_string()));
            }
        };

        match reader_result {
            Ok(Ok(reader_stats)) => {
                let report = PipelineReport {
                    reader: reader_stats,
                    publisher: publisher_stats,
                };
                info!("Event pipeline stopped: {:?}", report);
                Ok(report)
            }
            Ok(Err(DeviceLost { source, stats })) => Err(PipelineError::DeviceLost {
                source,
                report: PipelineReport {
                    reader: stats,
                    publisher: publisher_stats,
                },
            }),
            Err(e) => {
                error!("Device reader task panicked: {}", e);
                Err(PipelineError::Task(e.to_string()))
            }
        }
    }
}
