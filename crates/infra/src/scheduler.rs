//! Future-notification scheduling.
//!
//! Every recompute replaces the account's schedule with the instants at which
//! its billing next changes. A poller turns due instants into `BillingTrigger`s
//! on the bus, where the trigger worker picks them up like any other trigger.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cadence_core::AccountId;
use cadence_events::{BillingTrigger, EventBus};
use cadence_invoicing::FutureAccountNotifications;

use crate::config::EngineConfig;
use crate::ledger::LedgerError;
use crate::workers::WorkerHandle;

/// Storage of pending notifications.
///
/// `take_due` removes what it returns; a trigger lost after that point is
/// recovered by the next lifecycle event or manual trigger for the account.
pub trait NotificationScheduler: Send + Sync {
    /// Replace the account's per-subscription schedule.
    fn schedule_next(
        &self,
        account_id: AccountId,
        notifications: FutureAccountNotifications,
    ) -> Result<(), LedgerError>;

    /// Ask for an account-wide re-evaluation at `at`.
    fn reschedule(&self, account_id: AccountId, at: DateTime<Utc>) -> Result<(), LedgerError>;

    fn pending(&self, account_id: AccountId) -> Result<FutureAccountNotifications, LedgerError>;

    /// Remove and return every notification due at or before `as_of`, in time order.
    fn take_due(&self, as_of: DateTime<Utc>) -> Result<Vec<BillingTrigger>, LedgerError>;
}

impl<S> NotificationScheduler for Arc<S>
where
    S: NotificationScheduler + ?Sized,
{
    fn schedule_next(
        &self,
        account_id: AccountId,
        notifications: FutureAccountNotifications,
    ) -> Result<(), LedgerError> {
        (**self).schedule_next(account_id, notifications)
    }

    fn reschedule(&self, account_id: AccountId, at: DateTime<Utc>) -> Result<(), LedgerError> {
        (**self).reschedule(account_id, at)
    }

    fn pending(&self, account_id: AccountId) -> Result<FutureAccountNotifications, LedgerError> {
        (**self).pending(account_id)
    }

    fn take_due(&self, as_of: DateTime<Utc>) -> Result<Vec<BillingTrigger>, LedgerError> {
        (**self).take_due(as_of)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("trigger publish failed: {0}")]
    Publish(String),
}

/// Publishes due notifications as billing triggers.
pub struct NotificationPoller<S, B> {
    scheduler: S,
    bus: B,
}

impl<S, B> NotificationPoller<S, B>
where
    S: NotificationScheduler,
    B: EventBus<BillingTrigger>,
{
    pub fn new(scheduler: S, bus: B) -> Self {
        Self { scheduler, bus }
    }

    /// Publish everything due as of `as_of` and return how many triggers went out.
    pub fn poll(&self, as_of: DateTime<Utc>) -> Result<usize, PollError> {
        let due = self.scheduler.take_due(as_of)?;
        let count = due.len();
        for trigger in due {
            debug!(
                account_id = %trigger.account_id,
                effective_at = %trigger.effective_at,
                "publishing scheduled trigger"
            );
            self.bus
                .publish(trigger)
                .map_err(|err| PollError::Publish(format!("{err:?}")))?;
        }
        Ok(count)
    }
}

impl<S, B> NotificationPoller<S, B>
where
    S: NotificationScheduler + 'static,
    B: EventBus<BillingTrigger> + 'static,
{
    /// Poll against the wall clock every `config.poll_interval` on a
    /// background thread.
    pub fn spawn(self, name: &'static str, config: &EngineConfig) -> std::io::Result<WorkerHandle> {
        let interval = config.poll_interval;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                if let Err(err) = self.poll(Utc::now()) {
                    warn!(worker = name, error = ?err, "notification poll failed");
                }
            }
        })?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}
