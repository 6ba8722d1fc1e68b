//! Phase timeline derivation.
//!
//! Turns the ordered billing events of a subscription into the list of phase
//! segments that were (or will be) in force, each a half-open local date range.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::{DomainError, DomainResult, SubscriptionId, ValueObject};

use crate::billing_event::{BillingEvent, BillingEventKind, BillingEventSet};
use crate::calendar::{CalendarResolver, clamped_date};
use crate::catalog::{Catalog, PhaseDuration, PlanPhase, PlanPhaseRef};

/// A plan phase becoming effective for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedPhase {
    pub subscription_id: SubscriptionId,
    pub plan_name: String,
    pub phase: PlanPhase,
    pub start_instant: DateTime<Utc>,
    pub start_date: NaiveDate,
}

impl ValueObject for TimedPhase {}

/// A timed phase and the local date it stops billing (exclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSegment {
    pub timed_phase: TimedPhase,
    /// `None` while the phase runs open-ended.
    pub end: Option<NaiveDate>,
}

impl PhaseSegment {
    pub fn subscription_id(&self) -> SubscriptionId {
        self.timed_phase.subscription_id
    }

    pub fn start(&self) -> NaiveDate {
        self.timed_phase.start_date
    }

    pub fn phase(&self) -> &PlanPhase {
        &self.timed_phase.phase
    }
}

/// Phases of one plan scheduled back to back from some starting phase.
#[derive(Debug, Default)]
struct Schedule {
    phases: Vec<TimedPhase>,
    /// End of the last phase when it has a finite duration.
    end: Option<NaiveDate>,
}

impl Schedule {
    fn build(
        event: &BillingEvent,
        catalog: &dyn Catalog,
        resolver: &CalendarResolver,
    ) -> DomainResult<Self> {
        let plan = catalog.plan(&event.phase.plan, event.effective_at)?;
        let first = plan.phase_index(&event.phase.phase).ok_or_else(|| {
            DomainError::not_found(format!(
                "phase '{}' of plan '{}'",
                event.phase.phase, event.phase.plan
            ))
        })?;

        let mut schedule = Schedule::default();
        let mut start_instant = event.effective_at;
        let mut start_date = resolver.local_date(start_instant);

        for template in &plan.phases[first..] {
            let phase_ref = PlanPhaseRef::new(plan.name.clone(), template.name.clone());
            let phase = catalog.phase_at(event.subscription_id, &phase_ref, start_instant)?;
            let duration = phase.duration;
            schedule.phases.push(TimedPhase {
                subscription_id: event.subscription_id,
                plan_name: plan.name.clone(),
                phase,
                start_instant,
                start_date,
            });

            let next_date = match duration {
                PhaseDuration::Unlimited => return Ok(schedule),
                PhaseDuration::Days(n) => start_date.checked_add_days(Days::new(u64::from(n))),
                PhaseDuration::Months(n) => add_months(start_date, n),
            }
            .ok_or_else(|| DomainError::validation(format!("phase end out of range from {start_date}")))?;

            start_date = next_date;
            start_instant = resolver.start_of_day(next_date)?;
        }

        schedule.end = Some(start_date);
        Ok(schedule)
    }

    /// Emit the segments of this schedule that start before `at` (all of them
    /// when `at` is `None`), clipped to `at`.
    fn close(self, at: Option<NaiveDate>, out: &mut Vec<PhaseSegment>) {
        let count = self.phases.len();
        let starts: Vec<NaiveDate> = self.phases.iter().map(|p| p.start_date).collect();
        for (i, timed_phase) in self.phases.into_iter().enumerate() {
            let natural_end = if i + 1 < count { Some(starts[i + 1]) } else { self.end };
            let end = match (natural_end, at) {
                (Some(e), Some(a)) => Some(e.min(a)),
                (None, Some(a)) => Some(a),
                (e, None) => e,
            };
            if end.is_some_and(|e| e <= timed_phase.start_date) {
                continue;
            }
            out.push(PhaseSegment { timed_phase, end });
        }
    }
}

fn add_months(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    let ordinal = i64::from(date.year()) * 12 + i64::from(date.month0()) + i64::from(months);
    let year = i32::try_from(ordinal.div_euclid(12)).ok()?;
    let month = u32::try_from(ordinal.rem_euclid(12)).ok()? + 1;
    clamped_date(year, month, date.day()).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Active,
    Paused,
    Cancelled,
}

/// Derive the phase segments of every subscription in the set.
///
/// Segments are returned per subscription in chronological order,
/// subscriptions ordered by id.
pub fn derive_segments(
    events: &BillingEventSet,
    catalog: &dyn Catalog,
    resolver: &CalendarResolver,
) -> DomainResult<Vec<PhaseSegment>> {
    let mut out = Vec::new();
    for subscription_id in events.subscriptions() {
        subscription_segments(events.events_for(subscription_id), catalog, resolver, &mut out)?;
    }
    Ok(out)
}

fn subscription_segments<'a>(
    events: impl Iterator<Item = &'a BillingEvent>,
    catalog: &dyn Catalog,
    resolver: &CalendarResolver,
    out: &mut Vec<PhaseSegment>,
) -> DomainResult<()> {
    let mut state = State::NotStarted;
    let mut schedule: Option<Schedule> = None;

    for event in events {
        let date = resolver.local_date(event.effective_at);
        let kind = event.kind;
        state = match (state, kind) {
            (State::NotStarted, BillingEventKind::Start) => {
                schedule = Some(Schedule::build(event, catalog, resolver)?);
                State::Active
            }
            (State::NotStarted, _) => {
                return Err(DomainError::validation(format!(
                    "{kind:?} for subscription {} before its start",
                    event.subscription_id
                )));
            }
            (State::Cancelled, _) => {
                return Err(DomainError::validation(format!(
                    "{kind:?} for subscription {} after its cancellation",
                    event.subscription_id
                )));
            }
            (_, BillingEventKind::Start) => {
                return Err(DomainError::validation(format!(
                    "subscription {} started twice",
                    event.subscription_id
                )));
            }
            (State::Active, BillingEventKind::PlanChange | BillingEventKind::PhaseChange) => {
                if let Some(current) = schedule.take() {
                    current.close(Some(date), out);
                }
                schedule = Some(Schedule::build(event, catalog, resolver)?);
                State::Active
            }
            // Billing stays stopped; the resume event names the phase to restart.
            (State::Paused, BillingEventKind::PlanChange | BillingEventKind::PhaseChange) => {
                State::Paused
            }
            (State::Active, BillingEventKind::Pause) => {
                if let Some(current) = schedule.take() {
                    current.close(Some(date), out);
                }
                State::Paused
            }
            (State::Paused, BillingEventKind::Resume) => {
                schedule = Some(Schedule::build(event, catalog, resolver)?);
                State::Active
            }
            (State::Active, BillingEventKind::Resume) | (State::Paused, BillingEventKind::Pause) => {
                return Err(DomainError::validation(format!(
                    "{kind:?} for subscription {} in state {state:?}",
                    event.subscription_id
                )));
            }
            (_, BillingEventKind::Cancel) => {
                if let Some(current) = schedule.take() {
                    current.close(Some(date), out);
                }
                State::Cancelled
            }
        };
    }

    if let Some(current) = schedule {
        current.close(None, out);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::BillingPeriod;
    use crate::catalog::{BillingAlignment, BillingMode, InMemoryCatalog, PhaseType, Plan};
    use cadence_core::{AccountId, Currency};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn phase(name: &str, duration: PhaseDuration) -> PlanPhase {
        PlanPhase {
            name: name.to_string(),
            phase_type: PhaseType::Evergreen,
            duration,
            fixed_price: None,
            recurring_price: Some(Decimal::from(10)),
            billing_period: BillingPeriod::Monthly,
            billing_mode: BillingMode::InAdvance,
            alignment: BillingAlignment::Subscription,
            currency: Currency::Usd,
        }
    }

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::new()
            .with_plan(Plan {
                name: "gold".to_string(),
                phases: vec![
                    phase("gold-trial", PhaseDuration::Days(30)),
                    phase("gold-discount", PhaseDuration::Months(1)),
                    phase("gold-evergreen", PhaseDuration::Unlimited),
                ],
            })
            .with_plan(Plan {
                name: "silver".to_string(),
                phases: vec![phase("silver-evergreen", PhaseDuration::Unlimited)],
            })
            .with_plan(Plan {
                name: "term".to_string(),
                phases: vec![phase("term-fixed", PhaseDuration::Months(12))],
            })
    }

    fn event(
        sub: SubscriptionId,
        at: DateTime<Utc>,
        sequence: u64,
        kind: BillingEventKind,
        plan: &str,
        phase: &str,
    ) -> BillingEvent {
        BillingEvent {
            subscription_id: sub,
            effective_at: at,
            sequence,
            kind,
            phase: PlanPhaseRef::new(plan, phase),
        }
    }

    fn segments(events: Vec<BillingEvent>) -> DomainResult<Vec<PhaseSegment>> {
        let set = BillingEventSet::new(AccountId::new(), chrono_tz::UTC, Currency::Usd, None, events)?;
        derive_segments(&set, &catalog(), &CalendarResolver::new(chrono_tz::UTC))
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn start_chains_the_plan_phases() {
        let sub = SubscriptionId::new();
        let segs = segments(vec![event(sub, noon(2024, 1, 1), 1, BillingEventKind::Start, "gold", "gold-trial")]).unwrap();

        let spans: Vec<(&str, NaiveDate, Option<NaiveDate>)> = segs
            .iter()
            .map(|s| (s.phase().name.as_str(), s.start(), s.end))
            .collect();
        assert_eq!(
            spans,
            vec![
                ("gold-trial", date(2024, 1, 1), Some(date(2024, 1, 31))),
                ("gold-discount", date(2024, 1, 31), Some(date(2024, 2, 29))),
                ("gold-evergreen", date(2024, 2, 29), None),
            ]
        );
        // Later phases start at local midnight.
        assert_eq!(segs[1].timed_phase.start_instant, Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap());
    }

    #[test]
    fn plan_change_truncates_the_current_schedule() {
        let sub = SubscriptionId::new();
        let segs = segments(vec![
            event(sub, noon(2024, 1, 1), 1, BillingEventKind::Start, "gold", "gold-trial"),
            event(sub, noon(2024, 1, 10), 2, BillingEventKind::PlanChange, "silver", "silver-evergreen"),
        ])
        .unwrap();

        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].end, Some(date(2024, 1, 10)));
        assert_eq!(segs[1].phase().name, "silver-evergreen");
        assert_eq!(segs[1].start(), date(2024, 1, 10));
        assert_eq!(segs[1].end, None);
    }

    #[test]
    fn same_day_changes_keep_only_the_later_phase() {
        let sub = SubscriptionId::new();
        let segs = segments(vec![
            event(sub, noon(2024, 1, 1), 1, BillingEventKind::Start, "silver", "silver-evergreen"),
            event(sub, noon(2024, 1, 1), 2, BillingEventKind::PlanChange, "gold", "gold-evergreen"),
        ])
        .unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].phase().name, "gold-evergreen");
    }

    #[test]
    fn cancel_ends_billing_and_blocks_later_events() {
        let sub = SubscriptionId::new();
        let segs = segments(vec![
            event(sub, noon(2024, 1, 1), 1, BillingEventKind::Start, "silver", "silver-evergreen"),
            event(sub, noon(2024, 1, 16), 2, BillingEventKind::Cancel, "silver", "silver-evergreen"),
        ])
        .unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].end, Some(date(2024, 1, 16)));

        let err = segments(vec![
            event(sub, noon(2024, 1, 1), 1, BillingEventKind::Start, "silver", "silver-evergreen"),
            event(sub, noon(2024, 1, 16), 2, BillingEventKind::Cancel, "silver", "silver-evergreen"),
            event(sub, noon(2024, 1, 20), 3, BillingEventKind::PlanChange, "gold", "gold-evergreen"),
        ])
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn pause_and_resume_leave_a_gap() {
        let sub = SubscriptionId::new();
        let segs = segments(vec![
            event(sub, noon(2024, 1, 1), 1, BillingEventKind::Start, "silver", "silver-evergreen"),
            event(sub, noon(2024, 1, 10), 2, BillingEventKind::Pause, "silver", "silver-evergreen"),
            event(sub, noon(2024, 1, 20), 3, BillingEventKind::Resume, "silver", "silver-evergreen"),
        ])
        .unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].start(), segs[0].end), (date(2024, 1, 1), Some(date(2024, 1, 10))));
        assert_eq!((segs[1].start(), segs[1].end), (date(2024, 1, 20), None));
    }

    #[test]
    fn finite_last_phase_ends_the_subscription() {
        let sub = SubscriptionId::new();
        let segs = segments(vec![event(sub, noon(2024, 3, 31), 1, BillingEventKind::Start, "term", "term-fixed")]).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].end, Some(date(2025, 3, 31)));
    }

    #[test]
    fn event_before_start_is_rejected() {
        let sub = SubscriptionId::new();
        let err = segments(vec![event(sub, noon(2024, 1, 1), 1, BillingEventKind::Cancel, "silver", "silver-evergreen")])
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn unknown_phase_is_not_found() {
        let sub = SubscriptionId::new();
        let err = segments(vec![event(sub, noon(2024, 1, 1), 1, BillingEventKind::Start, "silver", "silver-trial")])
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }
}
