use std::future::Future;

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::event::Report;
use super::report_decoder;
use super::usb_link::DeviceError;
use crate::pipeline::event_queue::EventSender;

const STATS_LOG_INTERVAL_SECS: i64 = 10;

/// Anything that yields raw controller reports one at a time
pub trait ReportSource: Send {
    /// Waits for the next report. An error means the device is gone.
    fn read_report(&mut self) -> impl Future<Output = Result<Report, DeviceError>> + Send;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub reports_read: u64,
    pub events_enqueued: u64,
    pub reports_ignored: u64,
}

/// The read loop ended because the device failed
#[derive(Debug, thiserror::Error)]
#[error("Device lost after {} reports: {source}", .stats.reports_read)]
pub struct DeviceLost {
    #[source]
    pub source: DeviceError,
    pub stats: ReaderStats,
}

/// Owns the report source and the producer half of the event queue
pub struct DeviceReader<R> {
    source: R,
    sender: EventSender,
    stats: ReaderStats,
}

impl<R: ReportSource> DeviceReader<R> {
    pub fn new(source: R, sender: EventSender) -> Self {
        Self {
            source,
            sender,
            stats: ReaderStats::default(),
        }
    }

    /// Reads, decodes and enqueues reports until the device fails, the
    /// consumer goes away or `cancel` fires.
    ///
    /// A read failure is returned as the error; the other two exits are
    /// clean. The queue is closed when this returns, so the publisher can
    /// drain what is left.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ReaderStats, DeviceLost> {
        info!("Starting device read loop");

        let mut window_reports: u64 = 0;
        let mut window_start: DateTime<Local> = Local::now();
        let log_interval = chrono::Duration::seconds(STATS_LOG_INTERVAL_SECS);

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Device reader cancelled");
                    break;
                }
                read = self.source.read_report() => read,
            };

            let report = match read {
                Ok(report) => report,
                Err(source) => {
                    error!("Device lost: {}", source);
                    return Err(DeviceLost {
                        source,
                        stats: self.stats,
                    });
                }
            };
            self.stats.reports_read += 1;
            window_reports += 1;

            match report_decoder::decode(&report) {
                Some(event) => {
                    debug!("Decoded {:?}", event);
                    if self.sender.free_slots() == 0 {
                        debug!("Event queue full, waiting for the publisher");
                    }
                    let enqueued = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Device reader cancelled while waiting for queue space");
                            break;
                        }
                        enqueued = self.sender.enqueue(event) => enqueued,
                    };
                    if enqueued.is_err() {
                        info!("Publisher is gone, stopping device reader");
                        break;
                    }
                    self.stats.events_enqueued += 1;
                }
                None => self.stats.reports_ignored += 1,
            }

            let now = Local::now();
            if now - window_start > log_interval {
                info!(
                    "Device reader stats: {} reports in last {} seconds (total {:?})",
                    window_reports,
                    (now - window_start).num_seconds(),
                    self.stats
                );
                window_reports = 0;
                window_start = now;
            }
        }

        info!("Device read loop finished: {:?}", self.stats);
        Ok(self.stats)
    }
}
