//! Calendar boundary resolution in an account's local time zone.
//!
//! Billing periods are expressed as half-open local date ranges `[start, end)`.
//! All arithmetic happens on local calendar dates; UTC instants only enter
//! through [`CalendarResolver::local_date`] and leave through
//! [`CalendarResolver::start_of_day`].

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use cadence_core::{DomainError, DomainResult, ValueObject};

/// Recurring billing cadence of a plan phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Biannual,
    Annual,
    NoBillingPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Days(u32),
    Months(u32),
}

impl BillingPeriod {
    fn step(self) -> Option<Step> {
        match self {
            BillingPeriod::Daily => Some(Step::Days(1)),
            BillingPeriod::Weekly => Some(Step::Days(7)),
            BillingPeriod::Biweekly => Some(Step::Days(14)),
            BillingPeriod::Monthly => Some(Step::Months(1)),
            BillingPeriod::Quarterly => Some(Step::Months(3)),
            BillingPeriod::Biannual => Some(Step::Months(6)),
            BillingPeriod::Annual => Some(Step::Months(12)),
            BillingPeriod::NoBillingPeriod => None,
        }
    }

    /// Periods long enough to be aligned on an account bill-cycle day.
    pub fn is_monthly_or_longer(self) -> bool {
        matches!(self.step(), Some(Step::Months(_)))
    }
}

/// A half-open local date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalendarPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ValueObject for CalendarPeriod {}

impl CalendarPeriod {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

/// Maps instants to local dates and computes period boundaries for one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarResolver {
    tz: Tz,
}

/// Longest DST gap we step across when local midnight does not exist.
const MAX_GAP_STEPS: u32 = 12;
const GAP_STEP_MINUTES: i64 = 15;

impl CalendarResolver {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    /// Local calendar date of an instant.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// First instant of a local date.
    ///
    /// On a repeated midnight the earlier instant wins; when midnight falls in
    /// a DST gap the first valid local time after it is used.
    pub fn start_of_day(&self, date: NaiveDate) -> DomainResult<DateTime<Utc>> {
        let mut local = date.and_time(NaiveTime::MIN);
        for _ in 0..=MAX_GAP_STEPS {
            if let Some(resolved) = self.tz.from_local_datetime(&local).earliest() {
                return Ok(resolved.with_timezone(&Utc));
            }
            local += TimeDelta::minutes(GAP_STEP_MINUTES);
        }
        Err(DomainError::validation(format!(
            "local date {date} has no valid start in {}",
            self.tz
        )))
    }

    /// The `index`-th period of `billing_period` anchored at `anchor`.
    ///
    /// Boundaries are always computed from the anchor, so month-end anchors do
    /// not drift (Jan 31, Feb 29, Mar 31, ...).
    pub fn period_boundaries(
        &self,
        anchor: NaiveDate,
        billing_period: BillingPeriod,
        index: u32,
    ) -> DomainResult<CalendarPeriod> {
        aligned_period(anchor, billing_period, i64::from(index), anchor.day())
    }

    /// The period (and its index) containing `date`, or `None` before the anchor.
    pub fn period_containing(
        &self,
        anchor: NaiveDate,
        billing_period: BillingPeriod,
        date: NaiveDate,
    ) -> DomainResult<Option<(u32, CalendarPeriod)>> {
        if date < anchor {
            return Ok(None);
        }
        let step = step_of(billing_period)?;
        let mut index = match step {
            Step::Days(d) => (date - anchor).num_days() / i64::from(d),
            Step::Months(m) => (month_ordinal(date) - month_ordinal(anchor)) / i64::from(m),
        };
        let day = anchor.day();
        loop {
            let period = aligned_period(anchor, billing_period, index, day)?;
            if period.start > date {
                index -= 1;
            } else if period.end <= date {
                index += 1;
            } else {
                let index = u32::try_from(index)
                    .map_err(|_| DomainError::validation("period index out of range"))?;
                return Ok(Some((index, period)));
            }
        }
    }
}

/// Period `index` (may be negative) from `anchor`, landing month boundaries on
/// `day` clamped to the month length.
pub(crate) fn aligned_period(
    anchor: NaiveDate,
    billing_period: BillingPeriod,
    index: i64,
    day: u32,
) -> DomainResult<CalendarPeriod> {
    let step = step_of(billing_period)?;
    Ok(CalendarPeriod {
        start: nth_boundary(anchor, step, index, day)?,
        end: nth_boundary(anchor, step, index + 1, day)?,
    })
}

/// Date in `year`/`month` with `day` clamped to the month length.
pub fn clamped_date(year: i32, month: u32, day: u32) -> DomainResult<NaiveDate> {
    (1..=day)
        .rev()
        .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
        .ok_or_else(|| DomainError::validation(format!("no date for {year}-{month:02}-{day:02}")))
}

/// First date on or after `from` that falls on the bill-cycle day.
pub fn next_bill_cycle_date(from: NaiveDate, bill_cycle_day: u32) -> DomainResult<NaiveDate> {
    let candidate = clamped_date(from.year(), from.month(), bill_cycle_day)?;
    if candidate >= from {
        return Ok(candidate);
    }
    let ordinal = month_ordinal(from) + 1;
    let (year, month) = from_month_ordinal(ordinal)?;
    clamped_date(year, month, bill_cycle_day)
}

fn step_of(billing_period: BillingPeriod) -> DomainResult<Step> {
    billing_period
        .step()
        .ok_or_else(|| DomainError::validation("phase has no billing period"))
}

fn nth_boundary(anchor: NaiveDate, step: Step, n: i64, day: u32) -> DomainResult<NaiveDate> {
    let overflow = || DomainError::validation(format!("period boundary out of range from {anchor}"));
    match step {
        Step::Days(d) => {
            let offset = i64::from(d).checked_mul(n).ok_or_else(overflow)?;
            let days = Days::new(offset.unsigned_abs());
            let shifted = if offset >= 0 {
                anchor.checked_add_days(days)
            } else {
                anchor.checked_sub_days(days)
            };
            shifted.ok_or_else(overflow)
        }
        Step::Months(m) => {
            let ordinal = i64::from(m)
                .checked_mul(n)
                .and_then(|o| o.checked_add(month_ordinal(anchor)))
                .ok_or_else(overflow)?;
            let (year, month) = from_month_ordinal(ordinal)?;
            clamped_date(year, month, day)
        }
    }
}

fn month_ordinal(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn from_month_ordinal(ordinal: i64) -> DomainResult<(i32, u32)> {
    let year = i32::try_from(ordinal.div_euclid(12))
        .map_err(|_| DomainError::validation("year out of range"))?;
    // rem_euclid(12) is always in 0..12
    let month = ordinal.rem_euclid(12) as u32 + 1;
    Ok((year, month))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn new_york() -> CalendarResolver {
        CalendarResolver::new(chrono_tz::America::New_York)
    }

    #[test]
    fn local_date_follows_the_account_zone() {
        let resolver = new_york();
        // 02:30 UTC is still the previous evening in New York.
        let instant = Utc.with_ymd_and_hms(2024, 4, 13, 2, 30, 0).unwrap();
        assert_eq!(resolver.local_date(instant), date(2024, 4, 12));

        let utc = CalendarResolver::new(chrono_tz::UTC);
        assert_eq!(utc.local_date(instant), date(2024, 4, 13));
    }

    #[test]
    fn local_midnight_belongs_to_the_new_day() {
        let resolver = new_york();
        let midnight = resolver.start_of_day(date(2024, 4, 13)).unwrap();
        assert_eq!(midnight, Utc.with_ymd_and_hms(2024, 4, 13, 4, 0, 0).unwrap());
        assert_eq!(resolver.local_date(midnight), date(2024, 4, 13));
        assert_eq!(
            resolver.local_date(midnight - TimeDelta::seconds(1)),
            date(2024, 4, 12)
        );
    }

    #[test]
    fn dst_gap_at_midnight_resolves_to_first_valid_instant() {
        // Sao Paulo used to spring forward at local midnight.
        let resolver = CalendarResolver::new(chrono_tz::America::Sao_Paulo);
        let start = resolver.start_of_day(date(2018, 11, 4)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2018, 11, 4, 3, 0, 0).unwrap());
        assert_eq!(resolver.local_date(start), date(2018, 11, 4));
    }

    #[test]
    fn dst_day_is_one_calendar_day() {
        let resolver = new_york();
        let p = resolver
            .period_boundaries(date(2024, 3, 10), BillingPeriod::Daily, 0)
            .unwrap();
        assert_eq!(p.end, date(2024, 3, 11));
        let hours = resolver.start_of_day(p.end).unwrap() - resolver.start_of_day(p.start).unwrap();
        assert_eq!(hours.num_hours(), 23);
    }

    #[test]
    fn month_end_anchor_does_not_drift() {
        let resolver = new_york();
        let anchor = date(2024, 1, 31);
        let feb = resolver.period_boundaries(anchor, BillingPeriod::Monthly, 1).unwrap();
        let mar = resolver.period_boundaries(anchor, BillingPeriod::Monthly, 2).unwrap();
        assert_eq!(feb.start, date(2024, 2, 29));
        assert_eq!(feb.end, date(2024, 3, 31));
        assert_eq!(mar.end, date(2024, 4, 30));
    }

    #[test]
    fn quarterly_and_annual_periods() {
        let resolver = new_york();
        let q = resolver
            .period_boundaries(date(2024, 11, 30), BillingPeriod::Quarterly, 0)
            .unwrap();
        assert_eq!(q.end, date(2025, 2, 28));
        let y = resolver
            .period_boundaries(date(2024, 2, 29), BillingPeriod::Annual, 1)
            .unwrap();
        assert_eq!(y, CalendarPeriod { start: date(2025, 2, 28), end: date(2026, 2, 28) });
    }

    #[test]
    fn no_billing_period_has_no_boundaries() {
        let resolver = new_york();
        assert!(resolver
            .period_boundaries(date(2024, 1, 1), BillingPeriod::NoBillingPeriod, 0)
            .is_err());
    }

    #[test]
    fn period_containing_finds_the_enclosing_period() {
        let resolver = new_york();
        let anchor = date(2024, 1, 31);
        let (index, p) = resolver
            .period_containing(anchor, BillingPeriod::Monthly, date(2024, 3, 15))
            .unwrap()
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(p, CalendarPeriod { start: date(2024, 2, 29), end: date(2024, 3, 31) });

        assert!(resolver
            .period_containing(anchor, BillingPeriod::Monthly, date(2024, 1, 30))
            .unwrap()
            .is_none());
    }

    #[test]
    fn bill_cycle_date_clamps_and_rolls_forward() {
        assert_eq!(next_bill_cycle_date(date(2024, 2, 10), 31).unwrap(), date(2024, 2, 29));
        assert_eq!(next_bill_cycle_date(date(2024, 2, 10), 5).unwrap(), date(2024, 3, 5));
        assert_eq!(next_bill_cycle_date(date(2024, 2, 5), 5).unwrap(), date(2024, 2, 5));
        assert_eq!(next_bill_cycle_date(date(2024, 12, 20), 1).unwrap(), date(2025, 1, 1));
    }

    fn any_period() -> impl Strategy<Value = BillingPeriod> {
        prop_oneof![
            Just(BillingPeriod::Daily),
            Just(BillingPeriod::Weekly),
            Just(BillingPeriod::Biweekly),
            Just(BillingPeriod::Monthly),
            Just(BillingPeriod::Quarterly),
            Just(BillingPeriod::Biannual),
            Just(BillingPeriod::Annual),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn consecutive_periods_tile_the_calendar(
            offset in 0i64..3650,
            period in any_period(),
            index in 0u32..60,
        ) {
            let resolver = new_york();
            let anchor = date(2020, 1, 1) + TimeDelta::days(offset);
            let p = resolver.period_boundaries(anchor, period, index).unwrap();
            let next = resolver.period_boundaries(anchor, period, index + 1).unwrap();
            prop_assert!(p.start < p.end);
            prop_assert_eq!(p.end, next.start);

            let (found, q) = resolver.period_containing(anchor, period, p.start).unwrap().unwrap();
            prop_assert_eq!(found, index);
            prop_assert_eq!(q, p);
        }
    }
}
