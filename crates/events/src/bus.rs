//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! Subscribers either take a raw [`broadcast::Receiver`] or register a
//! callback with [`EventBus::subscribe_fn`]. Each callback runs on its own
//! task and a panicking callback is caught and logged, so one misbehaving
//! subscriber never stops the others from being notified.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out event bus.
///
/// Cloning the bus yields another handle onto the same channel.
///
/// ```rust
/// use reelctl_events::EventBus;
///
/// let bus: EventBus<String> = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish("queue.updated".to_string());
/// assert_eq!(rx.try_recv().unwrap(), "queue.updated");
/// ```
#[derive(Debug)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: E) {
        // Ignore the SendError: it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Invoke `callback` for every event on a dedicated task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_fn<F>(&self, callback: F) -> Subscription
    where
        F: Fn(E) + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                            tracing::warn!("Event subscriber panicked; continuing");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Handle returned by [`EventBus::subscribe_fn`].
///
/// Dropping the handle leaves the callback registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to stop it.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivering events to the callback.
    pub fn unsubscribe(self) {
        self.handle.abort();
    }

    /// True once the callback task has ended (bus closed or unsubscribed).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
