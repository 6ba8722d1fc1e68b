use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_core::AccountId;

use crate::event::Event;

/// Envelope for a published event, carrying account and ordering metadata.
///
/// - `account_id` scopes the payload; consumers may filter on it.
/// - `sequence_number` increases per account in publish order. Redelivery keeps
///   the same `event_id` and `sequence_number`. A notification republished
///   after a failed publish keeps its `event_id` under a new
///   `sequence_number`, so consumers drop duplicates by `event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    account_id: AccountId,
    event_type: String,
    event_version: u32,
    sequence_number: u64,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        account_id: AccountId,
        event_type: impl Into<String>,
        event_version: u32,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            account_id,
            event_type: event_type.into(),
            event_version,
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap a typed event, copying its type name and schema version.
    pub fn wrap(event_id: Uuid, account_id: AccountId, sequence_number: u64, payload: E) -> Self {
        Self::new(
            event_id,
            account_id,
            payload.event_type(),
            payload.version(),
            sequence_number,
            payload,
        )
    }
}

impl<E: Serialize> EventEnvelope<E> {
    /// Envelope with a JSON payload, for transports that carry untyped bodies.
    pub fn to_json(&self) -> Result<EventEnvelope<serde_json::Value>, serde_json::Error> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            account_id: self.account_id,
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            sequence_number: self.sequence_number,
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}
