//! Publish/subscribe abstraction (mechanics only).
//!
//! The bus distributes notifications *after* the state they describe has been
//! written to durable storage. It is not a source of truth:
//!
//! - **Transport-agnostic**: in-process channels, Redis pub/sub, or anything else
//! - **Best-effort fan-out**: a subscriber that has gone away is dropped silently
//! - **No persistence**: a subscriber that was not listening misses the message;
//!   it re-reads the store to catch up
//! - **No cross-publisher ordering**: messages from one publisher arrive in
//!   publish order; concurrent publishers interleave arbitrarily

use std::sync::{Arc, Weak};
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a bus.
///
/// Every subscription receives its own copy of each message published after it
/// was created (broadcast semantics). A subscription is consumed by one thread.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_millis(250)) {
///         Ok(msg) => handle(msg),
///         Err(RecvTimeoutError::Timeout) => continue, // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    _alive: Option<Arc<()>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            _alive: None,
        }
    }

    /// Subscription plus a handle the feeding side can poll to notice it was dropped.
    ///
    /// A sender only learns about a dropped receiver when its next send
    /// fails; feeders that may sit idle for a long time poll the returned
    /// [`SubscriberLiveness`] instead.
    pub fn tracked(receiver: Receiver<M>) -> (Self, SubscriberLiveness) {
        let alive = Arc::new(());
        let liveness = SubscriberLiveness(Arc::downgrade(&alive));
        (
            Self {
                receiver,
                _alive: Some(alive),
            },
            liveness,
        )
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every message that is already queued, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Held by whatever feeds a [`Subscription::tracked`] subscription.
#[derive(Debug, Clone)]
pub struct SubscriberLiveness(Weak<()>);

impl SubscriberLiveness {
    /// `false` once the subscription has been dropped.
    pub fn is_subscribed(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Publish/subscribe bus.
///
/// `publish()` may fail (lock poisoning, network error). Callers that publish
/// after a durable write log the failure and carry on; the write stands.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn liveness_follows_the_subscription() {
        let (tx, rx) = mpsc::channel::<u32>();
        let (sub, liveness) = Subscription::tracked(rx);
        assert!(liveness.is_subscribed());

        tx.send(3).unwrap();
        assert_eq!(sub.recv().unwrap(), 3);

        drop(sub);
        assert!(!liveness.is_subscribed());
        assert!(!liveness.clone().is_subscribed());
    }
}
