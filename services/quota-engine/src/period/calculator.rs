use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::{NO_RESET_CEILING_YEAR, NO_RESET_FLOOR_YEAR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetCadence {
    Monthly,
    Yearly,
    Weekly,
    Daily,
    None,
}

impl ResetCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetCadence::Monthly => "monthly",
            ResetCadence::Yearly => "yearly",
            ResetCadence::Weekly => "weekly",
            ResetCadence::Daily => "daily",
            ResetCadence::None => "none",
        }
    }

    /// Whether quota usage is ever reset. `None` plans accumulate forever.
    pub fn is_periodic(&self) -> bool {
        !matches!(self, ResetCadence::None)
    }
}

impl fmt::Display for ResetCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResetCadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" => Ok(ResetCadence::Monthly),
            "yearly" => Ok(ResetCadence::Yearly),
            "weekly" => Ok(ResetCadence::Weekly),
            "daily" => Ok(ResetCadence::Daily),
            "none" => Ok(ResetCadence::None),
            other => Err(format!("unknown reset cadence: {other}")),
        }
    }
}

/// Half-open window `[start, end)` over which a quota limit applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodBoundary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodBoundary {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whole days left before `end`, rounded up. Zero once the period is over.
    pub fn days_until_end(&self, now: DateTime<Utc>) -> i64 {
        let remaining = self.end - now;
        if remaining <= Duration::zero() {
            return 0;
        }
        let secs = remaining.num_seconds();
        let day = Duration::days(1).num_seconds();
        (secs + day - 1) / day
    }

    /// Provenance marker stored on carry-over credits that originate here.
    pub fn marker(&self) -> String {
        format!(
            "{}_{}",
            crate::storage::format_timestamp(&self.start),
            crate::storage::format_timestamp(&self.end)
        )
    }
}

impl fmt::Display for PeriodBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Maps a reset cadence and a reference instant to the enclosing period.
/// All boundaries are computed in UTC.
#[derive(Debug, Clone, Copy)]
pub struct PeriodCalculator {
    week_start: Weekday,
}

impl Default for PeriodCalculator {
    fn default() -> Self {
        Self {
            week_start: Weekday::Sun,
        }
    }
}

impl PeriodCalculator {
    pub fn new(week_start: Weekday) -> Self {
        Self { week_start }
    }

    pub fn week_start(&self) -> Weekday {
        self.week_start
    }

    pub fn resolve_period(
        &self,
        cadence: ResetCadence,
        reference: DateTime<Utc>,
    ) -> PeriodBoundary {
        let date = reference.date_naive();

        match cadence {
            ResetCadence::Monthly => {
                let (next_year, next_month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                PeriodBoundary::new(
                    midnight(date.year(), date.month(), 1),
                    midnight(next_year, next_month, 1),
                )
            }
            ResetCadence::Yearly => PeriodBoundary::new(
                midnight(date.year(), 1, 1),
                midnight(date.year() + 1, 1, 1),
            ),
            ResetCadence::Weekly => {
                let offset = (date.weekday().num_days_from_sunday() + 7
                    - self.week_start.num_days_from_sunday())
                    % 7;
                let start = date
                    .checked_sub_signed(Duration::days(offset as i64))
                    .map(start_of_day)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                PeriodBoundary::new(start, add_saturating(start, Duration::days(7)))
            }
            ResetCadence::Daily => {
                let start = start_of_day(date);
                PeriodBoundary::new(start, add_saturating(start, Duration::days(1)))
            }
            ResetCadence::None => PeriodBoundary::new(
                midnight(NO_RESET_FLOOR_YEAR, 1, 1),
                midnight(NO_RESET_CEILING_YEAR, 1, 1),
            ),
        }
    }

    /// The period that ends exactly where `period` starts. `None` cadences
    /// have a single period and therefore no predecessor.
    pub fn previous_period(
        &self,
        cadence: ResetCadence,
        period: &PeriodBoundary,
    ) -> Option<PeriodBoundary> {
        if !cadence.is_periodic() {
            return None;
        }
        let last_instant = period
            .start
            .checked_sub_signed(Duration::microseconds(1))?;
        Some(self.resolve_period(cadence, last_instant))
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    midnight(date.year(), date.month(), date.day())
}

/// Boundaries past chrono's last representable date clamp to `MAX_UTC`, so a
/// reference in the final year still gets a well-formed (if short) period.
fn midnight(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn add_saturating(start: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(span)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_monthly_boundaries_are_stable_within_month() {
        let calc = PeriodCalculator::default();
        let expected = PeriodBoundary::new(at(2024, 2, 1, 0, 0), at(2024, 3, 1, 0, 0));

        for day in 1..=29 {
            let period = calc.resolve_period(ResetCadence::Monthly, at(2024, 2, day, 13, 45));
            assert_eq!(period, expected, "day {day}");
        }
        let last_instant = at(2024, 3, 1, 0, 0) - Duration::microseconds(1);
        assert_eq!(calc.resolve_period(ResetCadence::Monthly, last_instant), expected);
    }

    #[test]
    fn test_monthly_periods_are_contiguous() {
        let calc = PeriodCalculator::default();
        let mut reference = at(2023, 1, 15, 0, 0);

        for _ in 0..24 {
            let current = calc.resolve_period(ResetCadence::Monthly, reference);
            let next = calc.resolve_period(ResetCadence::Monthly, current.end);
            assert_eq!(current.end, next.start);
            assert!(current.start < current.end);
            assert!(!current.contains(next.start));
            reference = next.start;
        }
    }

    #[test]
    fn test_december_rolls_into_next_year() {
        let calc = PeriodCalculator::default();
        let period = calc.resolve_period(ResetCadence::Monthly, at(2024, 12, 31, 23, 59));
        assert_eq!(period.start, at(2024, 12, 1, 0, 0));
        assert_eq!(period.end, at(2025, 1, 1, 0, 0));
    }

    #[test]
    fn test_yearly_boundaries() {
        let calc = PeriodCalculator::default();
        let period = calc.resolve_period(ResetCadence::Yearly, at(2024, 7, 4, 12, 0));
        assert_eq!(period.start, at(2024, 1, 1, 0, 0));
        assert_eq!(period.end, at(2025, 1, 1, 0, 0));
    }

    #[test]
    fn test_weekly_defaults_to_sunday_start() {
        let calc = PeriodCalculator::default();
        // 2024-05-15 is a Wednesday.
        let period = calc.resolve_period(ResetCadence::Weekly, at(2024, 5, 15, 9, 30));
        assert_eq!(period.start, at(2024, 5, 12, 0, 0));
        assert_eq!(period.end, at(2024, 5, 19, 0, 0));

        let sunday = calc.resolve_period(ResetCadence::Weekly, at(2024, 5, 12, 0, 0));
        assert_eq!(sunday, period);
    }

    #[test]
    fn test_weekly_honours_configured_week_start() {
        let calc = PeriodCalculator::new(Weekday::Mon);
        let period = calc.resolve_period(ResetCadence::Weekly, at(2024, 5, 12, 9, 30));
        assert_eq!(period.start, at(2024, 5, 6, 0, 0));
        assert_eq!(period.end, at(2024, 5, 13, 0, 0));
    }

    #[test]
    fn test_daily_boundaries() {
        let calc = PeriodCalculator::default();
        let period = calc.resolve_period(ResetCadence::Daily, at(2024, 2, 29, 23, 59));
        assert_eq!(period.start, at(2024, 2, 29, 0, 0));
        assert_eq!(period.end, at(2024, 3, 1, 0, 0));
    }

    #[test]
    fn test_none_cadence_is_effectively_unbounded() {
        let calc = PeriodCalculator::default();
        let early = calc.resolve_period(ResetCadence::None, at(2001, 1, 1, 0, 0));
        let late = calc.resolve_period(ResetCadence::None, at(2099, 6, 1, 0, 0));
        assert_eq!(early, late);
        assert_eq!(early.start, at(2000, 1, 1, 0, 0));
        assert_eq!(early.end, at(2100, 1, 1, 0, 0));
        assert!(calc.previous_period(ResetCadence::None, &early).is_none());
    }

    #[test]
    fn test_previous_period_is_adjacent() {
        let calc = PeriodCalculator::default();
        let march = calc.resolve_period(ResetCadence::Monthly, at(2024, 3, 10, 0, 0));
        let feb = calc.previous_period(ResetCadence::Monthly, &march).unwrap();
        assert_eq!(feb.start, at(2024, 2, 1, 0, 0));
        assert_eq!(feb.end, march.start);
    }

    #[test]
    fn test_days_until_end_rounds_up() {
        let period = PeriodBoundary::new(at(2024, 3, 1, 0, 0), at(2024, 4, 1, 0, 0));
        assert_eq!(period.days_until_end(at(2024, 3, 30, 12, 0)), 2);
        assert_eq!(period.days_until_end(at(2024, 3, 31, 0, 0)), 1);
        assert_eq!(period.days_until_end(at(2024, 4, 2, 0, 0)), 0);
    }

    #[test]
    fn test_last_representable_instant_does_not_panic() {
        let calc = PeriodCalculator::default();
        let last = DateTime::<Utc>::MAX_UTC;

        for cadence in [
            ResetCadence::Monthly,
            ResetCadence::Yearly,
            ResetCadence::Weekly,
            ResetCadence::Daily,
        ] {
            let period = calc.resolve_period(cadence, last);
            assert!(period.start <= last, "{cadence}");
            assert_eq!(period.end, DateTime::<Utc>::MAX_UTC, "{cadence}");
        }
    }

    #[test]
    fn test_first_representable_instant_has_no_predecessor() {
        let calc = PeriodCalculator::default();
        let first = DateTime::<Utc>::MIN_UTC;

        let daily = calc.resolve_period(ResetCadence::Daily, first);
        assert_eq!(daily.start, first);
        assert!(calc.previous_period(ResetCadence::Daily, &daily).is_none());
    }

    #[test]
    fn test_cadence_parsing() {
        assert_eq!("Monthly".parse::<ResetCadence>().unwrap(), ResetCadence::Monthly);
        assert_eq!("none".parse::<ResetCadence>().unwrap(), ResetCadence::None);
        assert!("fortnightly".parse::<ResetCadence>().is_err());
    }
}
