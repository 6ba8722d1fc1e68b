//! Replays a billing fixture through the engine.
//!
//! ```text
//! cadence-engine <fixture.json> [as-of RFC 3339] [--follow]
//! ```
//!
//! Every account of the fixture is recomputed as of the given instant (now by
//! default) and each outcome is printed as one JSON line. `--follow` keeps the
//! notification poller and trigger worker running until stdin closes.

use std::collections::HashSet;
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use cadence_billing::{BillingEvent, InMemoryCatalog, Plan};
use cadence_core::AccountId;
use cadence_events::{BillingTrigger, EventEnvelope, InMemoryEventBus};
use cadence_infra::{
    BillingAccount, DispatchError, EngineConfig, InMemoryAccountStore, InMemoryBillingEventSource,
    InMemoryInvoiceStore, InvoiceDispatcher, InvoiceOutcome, InvoiceTriggerWorker,
    NotificationPoller,
};
use cadence_invoicing::TrackingId;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Deserialize)]
struct Fixture {
    plans: Vec<Plan>,
    accounts: Vec<BillingAccount>,
    events: Vec<AccountEvent>,
}

#[derive(Debug, Deserialize)]
struct AccountEvent {
    account_id: AccountId,
    #[serde(flatten)]
    event: BillingEvent,
}

struct Args {
    fixture: String,
    as_of: DateTime<Utc>,
    follow: bool,
}

fn parse_args() -> Result<Args, Error> {
    let mut fixture = None;
    let mut as_of = None;
    let mut follow = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--follow" => follow = true,
            _ if fixture.is_none() => fixture = Some(arg),
            _ => as_of = Some(DateTime::parse_from_rfc3339(&arg)?.with_timezone(&Utc)),
        }
    }
    Ok(Args {
        fixture: fixture.ok_or("usage: cadence-engine <fixture.json> [as-of] [--follow]")?,
        as_of: as_of.unwrap_or_else(Utc::now),
        follow,
    })
}

type Dispatcher = InvoiceDispatcher<Arc<InMemoryInvoiceStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

/// In-memory engine loaded with a fixture.
struct Engine {
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<InMemoryInvoiceStore>,
    account_ids: Vec<AccountId>,
}

impl Fixture {
    fn load(self, config: &EngineConfig) -> Result<Engine, Error> {
        let catalog = self
            .plans
            .into_iter()
            .fold(InMemoryCatalog::new(), InMemoryCatalog::with_plan);

        let accounts = Arc::new(InMemoryAccountStore::new());
        let mut seen = HashSet::new();
        let mut account_ids = Vec::new();
        for account in self.accounts {
            if seen.insert(account.account_id) {
                account_ids.push(account.account_id);
            }
            accounts.upsert(account)?;
        }
        let events = Arc::new(InMemoryBillingEventSource::new());
        for AccountEvent { account_id, event } in self.events {
            events.record(account_id, event)?;
        }

        let ledger = Arc::new(InMemoryInvoiceStore::new());
        let dispatcher = Arc::new(InvoiceDispatcher::new(
            ledger.clone(),
            Arc::new(InMemoryEventBus::new()),
            accounts,
            events,
            Arc::new(catalog),
            config.clone(),
        ));
        Ok(Engine {
            dispatcher,
            ledger,
            account_ids,
        })
    }
}

impl Engine {
    /// Recompute every account as of `as_of`, in fixture order.
    fn replay(&self, as_of: DateTime<Utc>) -> Result<Vec<InvoiceOutcome>, DispatchError> {
        self.account_ids
            .iter()
            .map(|&account_id| {
                let tracking = TrackingId::new(format!("replay-{account_id}-{}", as_of.timestamp()))?;
                self.dispatcher.create_invoices(account_id, as_of, tracking)
            })
            .collect()
    }

    /// Run the poller and trigger worker until stdin closes.
    fn follow(&self, config: &EngineConfig) -> Result<(), Error> {
        let triggers: Arc<InMemoryEventBus<BillingTrigger>> = Arc::new(InMemoryEventBus::new());
        let poller = NotificationPoller::new(self.ledger.clone(), triggers.clone()).spawn("notification-poller", config)?;
        let handler = self.dispatcher.clone();
        let worker = InvoiceTriggerWorker::spawn("invoice-trigger-worker", triggers, None, move |trigger: BillingTrigger| {
            let outcome = handler.handle_trigger(&trigger)?;
            report(&outcome)?;
            Ok::<(), DispatchError>(())
        })?;

        tracing::info!(poll_interval = ?config.poll_interval, "following scheduled notifications; close stdin to stop");
        let mut sink = Vec::new();
        let read = std::io::stdin().read_to_end(&mut sink);

        poller.shutdown();
        worker.shutdown();
        read?;
        Ok(())
    }
}

fn report(outcome: &InvoiceOutcome) -> Result<(), serde_json::Error> {
    let line = json!({
        "account_id": outcome.account_id,
        "target_date": outcome.target_date,
        "duplicate_submission": outcome.duplicate_submission,
        "amount": outcome.amount(),
        "invoice": outcome.invoice,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn run() -> Result<(), Error> {
    let args = parse_args()?;
    let config = EngineConfig::from_env()?;
    let fixture: Fixture = serde_json::from_str(&std::fs::read_to_string(&args.fixture)?)?;
    let engine = fixture.load(&config)?;
    tracing::info!(accounts = engine.account_ids.len(), as_of = %args.as_of, "replaying fixture");

    for outcome in engine.replay(args.as_of)? {
        report(&outcome)?;
    }
    if args.follow {
        engine.follow(&config)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    cadence_observability::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "cadence-engine failed");
            ExitCode::FAILURE
        }
    }
}
