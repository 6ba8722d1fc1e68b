use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use cadence_core::AccountId;
use cadence_events::{AccountScoped, BillingTrigger, BusSubscription, EventBus};

use super::WorkerHandle;

/// Consumes billing triggers and recomputes the affected account.
///
/// - Subscribes to the trigger bus
/// - Optional account filter, so several workers can split the accounts
/// - Handler failures are logged and the loop keeps going; redelivery is the
///   bus's concern
#[derive(Debug)]
pub struct InvoiceTriggerWorker;

impl InvoiceTriggerWorker {
    /// Spawn a worker thread draining `bus`.
    ///
    /// `handler` must tolerate the same trigger twice.
    pub fn spawn<B, H, E>(
        name: &'static str,
        bus: B,
        accounts: Option<HashSet<AccountId>>,
        mut handler: H,
    ) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<BillingTrigger> + 'static,
        H: FnMut(BillingTrigger) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, accounts, &mut handler))?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn worker_loop<H, E>(
    name: &'static str,
    sub: BusSubscription<BillingTrigger>,
    shutdown_rx: mpsc::Receiver<()>,
    accounts: Option<HashSet<AccountId>>,
    handler: &mut H,
) where
    H: FnMut(BillingTrigger) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(trigger) => {
                if let Some(accounts) = &accounts {
                    if !accounts.contains(&trigger.account_id()) {
                        continue;
                    }
                }

                let account_id = trigger.account_id;
                debug!(worker = name, account_id = %account_id, reason = ?trigger.reason, "handling trigger");
                if let Err(err) = handler(trigger) {
                    warn!(worker = name, account_id = %account_id, error = ?err, "trigger handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
