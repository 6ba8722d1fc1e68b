//! Publish/subscribe abstraction for billing triggers and invoice notifications.
//!
//! Delivery is **at-least-once**: a trigger may arrive twice and a notification
//! may be republished after a crash. The billing engine does not deduplicate at
//! the bus; duplicate triggers are absorbed by the idempotent invoice commit
//! (tracking ids + reconciliation), so handlers only need to be re-runnable.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Receiving end of a bus subscription.
///
/// Each subscription gets its own copy of every message published after it was
/// created (broadcast). Meant to be drained by a single thread.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_millis(250)) {
///         Ok(trigger) => dispatcher.handle_trigger(&trigger)?,
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct BusSubscription<M> {
    receiver: Receiver<M>,
}

impl<M> BusSubscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
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

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Transport-agnostic event bus.
///
/// Publishing happens only after the corresponding ledger commit succeeded, so a
/// failed publish never loses state: the caller may republish, and consumers
/// must tolerate the duplicate.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> BusSubscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> BusSubscription<M> {
        (**self).subscribe()
    }
}
