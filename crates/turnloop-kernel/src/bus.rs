//! Event bus and subscriptions.
//!
//! The bus provides a lightweight publish/subscribe mechanism built on top of
//! [`tokio::sync::broadcast`].  Events are wrapped in [`Arc`] so that
//! broadcasting to multiple subscribers does not clone the payload.
//!
//! Listeners are explicit: [`EventBus::listen`] spawns a task that feeds
//! matching events to a handler, in arrival order, and returns a
//! [`Subscription`] that the owner cancels when it no longer wants them.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use turnloop_kernel::bus::EventBus;
//! # async fn example() {
//! let bus: EventBus<String> = EventBus::new(64);
//! let mut rx = bus.subscribe().unwrap();
//!
//! bus.publish("session.created".to_string()).unwrap();
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.as_str(), "session.created");
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus for one event type.
///
/// Cheaply cloneable (`Arc`-backed).  Once [`close`](Self::close)d, publishing
/// and subscribing fail with [`KernelError::BusClosed`] and existing receivers
/// observe the end of the stream.
pub struct EventBus<T> {
    inner: Arc<EventBusInner<T>>,
}

struct EventBusInner<T> {
    sender: RwLock<Option<broadcast::Sender<Arc<T>>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> EventBus<T>
where
    T: Send + Sync + 'static,
{
    /// Create a new bus with the given channel capacity.
    ///
    /// A subscriber that falls behind by more than `capacity` events skips
    /// the missed ones and logs how many were lost.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventBusInner {
                sender: RwLock::new(Some(sender)),
            }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe it.  Publishing with
    /// no receivers is not an error.
    pub fn publish(&self, event: T) -> Result<usize> {
        let guard = self
            .inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(KernelError::BusClosed)?;

        match sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "event published");
                Ok(n)
            }
            Err(_) => {
                tracing::trace!("event published but no active receivers");
                Ok(0)
            }
        }
    }

    /// Create a receiver for all future events.
    ///
    /// Events published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Arc<T>>> {
        let guard = self
            .inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(KernelError::BusClosed)
    }

    /// Feed every event accepted by `filter` to `handler`, in arrival order.
    ///
    /// The handler is awaited before the next event is examined; handlers that
    /// start long-running work should spawn it.
    pub fn listen<F, H, Fut>(&self, filter: F, handler: H) -> Result<Subscription>
    where
        F: Fn(&T) -> bool + Send + 'static,
        H: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe()?;

        Ok(Subscription::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if filter(&event) {
                            handler(event).await;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "subscriber lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Close the bus.  Idempotent.
    pub fn close(&self) {
        let mut guard = self
            .inner
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            tracing::trace!("event bus closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Return the current number of active receivers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to a running listener task.
///
/// Cancelling (or dropping) the subscription stops the listener loop.  Work
/// the listener already spawned elsewhere is not affected.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Run `task` as a subscription.  Requires a tokio runtime.
    pub fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::now_v7();
        tracing::trace!(subscription = %id, "subscription started");
        Self {
            id,
            handle: tokio::spawn(task),
        }
    }

    /// Unique id of this subscription.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the listener task is still running.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the listener.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            tracing::trace!(subscription = %self.id, "subscription cancelled");
        }
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
