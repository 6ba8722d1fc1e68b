//! Timeline projection: billing events → candidate invoice items.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use cadence_core::{DomainError, DomainResult, SubscriptionId};
use cadence_invoicing::{FutureAccountNotifications, ProposedItem};

use crate::billing_event::BillingEventSet;
use crate::calendar::{
    BillingPeriod, CalendarPeriod, CalendarResolver, aligned_period, next_bill_cycle_date,
};
use crate::catalog::{BillingAlignment, BillingMode, Catalog};
use crate::proration::{RoundingMode, prorate, round_amount};
use crate::timeline::{PhaseSegment, derive_segments};

/// A recurring period clipped to the segment it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentPeriod {
    actual: CalendarPeriod,
    full: CalendarPeriod,
}

impl SegmentPeriod {
    fn is_billable(&self, mode: BillingMode, target: NaiveDate) -> bool {
        match mode {
            BillingMode::InAdvance => self.actual.start <= target,
            BillingMode::InArrears => self.actual.end <= target,
        }
    }

    /// First date after `target` at which this period becomes billable.
    fn billable_on(&self, mode: BillingMode) -> NaiveDate {
        match mode {
            BillingMode::InAdvance => self.actual.start,
            BillingMode::InArrears => self.actual.end,
        }
    }
}

/// Recurring periods of one segment in chronological order.
///
/// Open-ended segments yield periods forever; callers stop on the target.
struct SegmentPeriods {
    billing_period: BillingPeriod,
    segment_start: NaiveDate,
    segment_end: Option<NaiveDate>,
    anchor: NaiveDate,
    day: u32,
    index: i64,
    leading: bool,
    done: bool,
}

impl SegmentPeriods {
    fn new(segment: &PhaseSegment, bill_cycle_day: Option<u32>) -> DomainResult<Self> {
        let phase = segment.phase();
        let start = segment.start();
        let account_aligned = phase.alignment == BillingAlignment::Account
            && phase.billing_period.is_monthly_or_longer();

        let (anchor, day) = match (account_aligned, bill_cycle_day) {
            (true, Some(bcd)) => (next_bill_cycle_date(start, bcd)?, bcd),
            _ => (start, start.day()),
        };

        Ok(Self {
            billing_period: phase.billing_period,
            segment_start: start,
            segment_end: segment.end,
            anchor,
            day,
            index: 0,
            leading: anchor > start,
            done: false,
        })
    }

    fn clip(&self, full: CalendarPeriod, start: NaiveDate) -> SegmentPeriod {
        let end = match self.segment_end {
            Some(e) => e.min(full.end),
            None => full.end,
        };
        SegmentPeriod {
            actual: CalendarPeriod { start, end },
            full,
        }
    }

    fn step(&mut self) -> DomainResult<Option<SegmentPeriod>> {
        if self.done {
            return Ok(None);
        }
        if self.leading {
            self.leading = false;
            let full = aligned_period(self.anchor, self.billing_period, -1, self.day)?;
            return Ok(Some(self.clip(full, self.segment_start)));
        }
        let full = aligned_period(self.anchor, self.billing_period, self.index, self.day)?;
        self.index += 1;
        if self.segment_end.is_some_and(|end| full.start >= end) {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(self.clip(full, full.start)))
    }
}

impl Iterator for SegmentPeriods {
    type Item = DomainResult<SegmentPeriod>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(period)) => Some(Ok(period)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Projects billing events onto candidate invoice items.
///
/// Pure: the same event set, target date and catalog always produce the same
/// items, identifiers included.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineProjector {
    rounding: RoundingMode,
}

impl TimelineProjector {
    pub fn new(rounding: RoundingMode) -> Self {
        Self { rounding }
    }

    pub fn rounding(&self) -> RoundingMode {
        self.rounding
    }

    /// Candidate items for every period billable on `target` (a local date).
    pub fn project(
        &self,
        events: &BillingEventSet,
        target: NaiveDate,
        catalog: &dyn Catalog,
    ) -> DomainResult<Vec<ProposedItem>> {
        let resolver = CalendarResolver::new(events.time_zone());
        let segments = derive_segments(events, catalog, &resolver)?;

        let mut items = Vec::new();
        for segment in &segments {
            check_currency(segment, events)?;
            if segment.start() > target {
                continue;
            }
            let phase = segment.phase();
            let tp = &segment.timed_phase;

            if let Some(price) = phase.fixed_price {
                items.push(ProposedItem::fixed(
                    tp.subscription_id,
                    &tp.plan_name,
                    &phase.name,
                    segment.start(),
                    round_amount(price, events.currency(), self.rounding),
                    events.currency(),
                ));
            }

            let Some(rate) = recurring_rate(segment) else {
                continue;
            };
            let rate = round_amount(rate, events.currency(), self.rounding);
            for period in SegmentPeriods::new(segment, events.bill_cycle_day())? {
                let period = period?;
                if !period.is_billable(phase.billing_mode, target) {
                    break;
                }
                let amount = if period.actual == period.full {
                    rate
                } else {
                    prorate(
                        rate,
                        period.actual.days(),
                        period.full.days(),
                        events.currency(),
                        self.rounding,
                    )?
                };
                items.push(ProposedItem::recurring(
                    tp.subscription_id,
                    &tp.plan_name,
                    &phase.name,
                    period.actual.start,
                    period.actual.end,
                    amount,
                    rate,
                    events.currency(),
                ));
            }
        }

        items.sort_by(|a, b| {
            (a.start_date, a.subscription_id, a.item_type, a.end_date).cmp(&(
                b.start_date,
                b.subscription_id,
                b.item_type,
                b.end_date,
            ))
        });
        Ok(items)
    }

    /// Next instant after `target` at which each subscription needs another
    /// look: a period becoming billable, a phase starting or billing ending.
    pub fn future_notifications(
        &self,
        events: &BillingEventSet,
        target: NaiveDate,
        catalog: &dyn Catalog,
    ) -> DomainResult<FutureAccountNotifications> {
        let resolver = CalendarResolver::new(events.time_zone());
        let segments = derive_segments(events, catalog, &resolver)?;

        let mut next: BTreeMap<SubscriptionId, NaiveDate> = BTreeMap::new();
        let mut offer = |sub: SubscriptionId, date: NaiveDate| {
            next.entry(sub)
                .and_modify(|d| *d = (*d).min(date))
                .or_insert(date);
        };

        for segment in &segments {
            let sub = segment.subscription_id();
            if segment.start() > target {
                offer(sub, segment.start());
                continue;
            }
            if let Some(end) = segment.end.filter(|end| *end > target) {
                offer(sub, end);
            }
            if recurring_rate(segment).is_none() {
                continue;
            }
            let mode = segment.phase().billing_mode;
            for period in SegmentPeriods::new(segment, events.bill_cycle_day())? {
                let period = period?;
                if !period.is_billable(mode, target) {
                    offer(sub, period.billable_on(mode));
                    break;
                }
            }
        }

        let mut notifications = FutureAccountNotifications::new();
        for (sub, date) in next {
            notifications.add(sub, resolver.start_of_day(date)?);
        }
        Ok(notifications)
    }
}

fn recurring_rate(segment: &PhaseSegment) -> Option<Decimal> {
    let phase = segment.phase();
    match (phase.recurring_price, phase.billing_period) {
        (_, BillingPeriod::NoBillingPeriod) => None,
        (price, _) => price,
    }
}

fn check_currency(segment: &PhaseSegment, events: &BillingEventSet) -> DomainResult<()> {
    let phase = segment.phase();
    if phase.currency != events.currency() {
        return Err(DomainError::validation(format!(
            "phase '{}' is priced in {}, account bills in {}",
            phase.name,
            phase.currency,
            events.currency()
        )));
    }
    Ok(())
}
