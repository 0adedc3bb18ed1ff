//! Fan-out of events to independent subscribers.
//!
//! # Invariants
//! - Every live subscriber receives every published event, in order.
//! - Each subscriber has its own bounded queue; a subscriber whose queue is
//!   full or whose receiver was dropped is removed on the next publish.

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::warn;
use std::sync::Mutex;

/// Events queued per subscriber before it is considered lagging.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

pub struct EventBroadcaster<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
    capacity: usize,
}

impl<T: Clone> EventBroadcaster<T> {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers a subscriber that sees events published from now on.
    pub fn subscribe(&self) -> Receiver<T> {
        let (sender, receiver) = bounded(self.capacity);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(sender);
        }
        receiver
    }

    pub fn publish(&self, event: &T) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "event=event_subscriber_dropped module=sync status=lagged capacity={}",
                    self.capacity
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map_or(0, |subscribers| subscribers.len())
    }
}

impl<T: Clone> Default for EventBroadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
