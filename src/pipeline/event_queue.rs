use std::num::NonZeroUsize;

use tokio::sync::mpsc;
use tracing::debug;

use crate::controller::event::ControllerEvent;

/// The consumer side of the queue has been dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Event queue closed: consumer is gone")]
pub struct QueueClosed;

/// Bounded FIFO between the device reader and the publisher.
///
/// There is exactly one producer and one consumer; neither half can be
/// cloned. `enqueue` waits while the queue is full, `dequeue` waits while it
/// is empty, nothing is ever dropped or reordered.
pub struct EventQueue;

impl EventQueue {
    pub fn bounded(capacity: NonZeroUsize) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.get());
        debug!("Created event queue with capacity {}", capacity);
        (EventSender { tx }, EventReceiver { rx })
    }
}

// Producer half, owned by the device reader
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::Sender<ControllerEvent>,
}

impl EventSender {
    /// Appends an event, waiting for a free slot when the queue is full
    pub async fn enqueue(&self, event: ControllerEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).await.map_err(|_| QueueClosed)
    }

    /// Number of free slots right now
    pub fn free_slots(&self) -> usize {
        self.tx.capacity()
    }
}

// Consumer half, owned by the publisher
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<ControllerEvent>,
}

impl EventReceiver {
    /// Takes the oldest event, waiting while the queue is empty.
    ///
    /// Returns `None` once the producer is gone and every buffered event has
    /// been handed out.
    pub async fn dequeue(&mut self) -> Option<ControllerEvent> {
        self.rx.recv().await
    }
}
