//! Catalog contract: plans, their phases and prices.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cadence_core::{Currency, DomainError, DomainResult, SubscriptionId};

use crate::calendar::BillingPeriod;

/// Names a phase of a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanPhaseRef {
    pub plan: String,
    pub phase: String,
}

impl PlanPhaseRef {
    pub fn new(plan: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            phase: phase.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Trial,
    Discount,
    FixedTerm,
    Evergreen,
}

/// How long a phase lasts before the next phase of the plan starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseDuration {
    Days(u32),
    Months(u32),
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Bill a period once it starts.
    InAdvance,
    /// Bill a period once it has fully elapsed.
    InArrears,
}

/// What recurring periods are anchored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingAlignment {
    /// The phase start date.
    Subscription,
    /// The account bill-cycle day (monthly and longer periods only).
    Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    pub phase_type: PhaseType,
    pub duration: PhaseDuration,
    pub fixed_price: Option<Decimal>,
    pub recurring_price: Option<Decimal>,
    pub billing_period: BillingPeriod,
    pub billing_mode: BillingMode,
    pub alignment: BillingAlignment,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub phases: Vec<PlanPhase>,
}

impl Plan {
    pub fn phase_index(&self, phase_name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == phase_name)
    }
}

/// Plan and price lookup.
///
/// `at` is the instant the plan or phase becomes effective, so implementations
/// can serve the catalog version in force at that time.
pub trait Catalog: Send + Sync {
    fn plan(&self, plan_name: &str, at: DateTime<Utc>) -> DomainResult<Plan>;

    fn phase_at(
        &self,
        subscription_id: SubscriptionId,
        phase_ref: &PlanPhaseRef,
        at: DateTime<Utc>,
    ) -> DomainResult<PlanPhase> {
        let _ = subscription_id;
        let plan = self.plan(&phase_ref.plan, at)?;
        plan.phases
            .into_iter()
            .find(|p| p.name == phase_ref.phase)
            .ok_or_else(|| {
                DomainError::not_found(format!(
                    "phase '{}' of plan '{}'",
                    phase_ref.phase, phase_ref.plan
                ))
            })
    }
}

/// Unversioned catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    plans: BTreeMap<String, Plan>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plans.insert(plan.name.clone(), plan);
        self
    }
}

impl Catalog for InMemoryCatalog {
    fn plan(&self, plan_name: &str, _at: DateTime<Utc>) -> DomainResult<Plan> {
        self.plans
            .get(plan_name)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("plan '{plan_name}'")))
    }
}
