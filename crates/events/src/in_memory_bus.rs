//! In-memory event bus for tests/dev.

use std::sync::{Mutex, mpsc};

use tracing::debug;

use crate::bus::{BusSubscription, EventBus};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("bus lock poisoned")]
    Poisoned,
}

/// In-memory broadcast bus.
///
/// - No IO / no async
/// - Subscribers that have been dropped are pruned on the next publish
/// - `publish_count` lets tests assert what was sent without subscribing first
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
    published: Mutex<u64>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of messages published so far.
    pub fn publish_count(&self) -> u64 {
        self.published.lock().map(|n| *n).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(0),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let before = subs.len();
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        if subs.len() < before {
            debug!(pruned = before - subs.len(), "dropped closed bus subscriptions");
        }

        let mut published = self.published.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        *published += 1;
        Ok(())
    }

    fn subscribe(&self) -> BusSubscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        BusSubscription::new(rx)
    }
}
