use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use cronfleet_core::Clock;

use crate::error::{CronError, Result};
use crate::pattern::{Component, Field, Pattern, Step};

/// Day-of-month is processed as "day" and also covers day-of-week.
const PROCESSING_ORDER: [Field; 6] = [
    Field::Year,
    Field::Month,
    Field::DayOfMonth,
    Field::Hour,
    Field::Minute,
    Field::Second,
];

/// Calendar values indexed by `Field::index()`. `-1` means "unset, below
/// the minimum". The day-of-week slot is unused.
type Values = [i32; 7];

/// Which of day-of-month and day-of-week decide whether a day matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayBehavior {
    DayOfMonthOnly,
    DayOfWeekOnly,
    DayOfMonthOrWeek,
}

impl DayBehavior {
    /// POSIX crontab rules.
    fn for_components(components: &[Component]) -> Self {
        let month = components[Field::Month.index()].is_asterisk();
        let dom = components[Field::DayOfMonth.index()].is_asterisk();
        let dow = components[Field::DayOfWeek.index()].is_asterisk();
        match (month && dom, dow) {
            (_, true) => DayBehavior::DayOfMonthOnly,
            (true, false) => DayBehavior::DayOfWeekOnly,
            (false, false) => DayBehavior::DayOfMonthOrWeek,
        }
    }

    fn uses_day_of_month(self) -> bool {
        self != DayBehavior::DayOfWeekOnly
    }

    fn uses_day_of_week(self) -> bool {
        self != DayBehavior::DayOfMonthOnly
    }
}

/// Next firing after the clock's current time.
pub fn next(pattern: &Pattern, clock: &dyn Clock, inclusive: bool) -> Result<DateTime<Utc>> {
    next_after(pattern, clock.now(), inclusive)
}

/// Check that the pattern is well formed and fires at least once after
/// 2020-01-01T00:00:00Z.
pub fn validate(pattern: &Pattern) -> Result<()> {
    let seed = Utc
        .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| CronError::NoNextTime(pattern.to_string()))?;
    next_after(pattern, seed, true).map(|_| ())
}

/// Smallest instant matching `pattern` that is `>= origin` when `inclusive`,
/// `> origin` otherwise. Sub-second origins always round up.
pub fn next_after(
    pattern: &Pattern,
    origin: DateTime<Utc>,
    inclusive: bool,
) -> Result<DateTime<Utc>> {
    let nanos = origin.nanosecond();
    let origin = if !inclusive || nanos != 0 {
        origin + Duration::seconds(1) - Duration::nanoseconds(i64::from(nanos))
    } else {
        origin
    };

    let components = pattern.validated_components()?;
    let mut values = values_from_time(origin);
    let not_found = || CronError::NoNextTime(pattern.to_string());

    let Some(first_disallowed) = PROCESSING_ORDER
        .iter()
        .position(|&field| !is_current_value_allowed(&components, &values, field))
    else {
        return time_from_values(&values).ok_or_else(not_found);
    };

    let mut i = first_disallowed as isize;
    while i >= 0 {
        let idx = i as usize;
        let field = PROCESSING_ORDER[idx];
        let Some(next) = next_value(&components, &values, field) else {
            // Exhausted this field: reset it and everything smaller, then ascend.
            for &smaller in &PROCESSING_ORDER[idx..] {
                values[smaller.index()] = -1;
            }
            i -= 1;
            continue;
        };

        values[field.index()] = next;
        let mut reseed_failed = None;
        for (offset, &smaller) in PROCESSING_ORDER[idx + 1..].iter().enumerate() {
            match first_value(&components, &values, smaller) {
                Some(first) => values[smaller.index()] = first,
                None => {
                    reseed_failed = Some(idx + 1 + offset);
                    break;
                }
            }
        }
        match reseed_failed {
            // e.g. Feb 30: advance the parent of the field that had no value.
            Some(failed) => i = failed as isize - 1,
            None => return time_from_values(&values).ok_or_else(not_found),
        }
    }

    Err(not_found())
}

fn values_from_time(t: DateTime<Utc>) -> Values {
    [
        t.second() as i32,
        t.minute() as i32,
        t.hour() as i32,
        t.day() as i32,
        t.month() as i32,
        t.weekday().num_days_from_sunday() as i32,
        t.year(),
    ]
}

fn time_from_values(values: &Values) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(
        values[Field::Year.index()],
        u32::try_from(values[Field::Month.index()]).ok()?,
        u32::try_from(values[Field::DayOfMonth.index()]).ok()?,
    )?;
    let time = date.and_hms_opt(
        u32::try_from(values[Field::Hour.index()]).ok()?,
        u32::try_from(values[Field::Minute.index()]).ok()?,
        u32::try_from(values[Field::Second.index()]).ok()?,
    )?;
    Some(Utc.from_utc_datetime(&time))
}

fn days_in_month(year: i32, month: i32) -> Option<i32> {
    let first = NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, 1)?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, u32::try_from(month + 1).ok()?, 1)?
    };
    Some((next_first - first).num_days() as i32)
}

/// Weekday (Sunday = 0) of `day` in the given month. Day 0 is the last day
/// of the previous month.
fn weekday(year: i32, month: i32, day: i32) -> Option<i32> {
    let first = NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, 1)?;
    let date = first.checked_add_signed(Duration::days(i64::from(day) - 1))?;
    Some(date.weekday().num_days_from_sunday() as i32)
}

fn is_current_value_allowed(components: &[Component], values: &Values, field: Field) -> bool {
    if field != Field::DayOfMonth {
        return components[field.index()]
            .steps
            .iter()
            .any(|step| step_allows(step, field, values[field.index()]));
    }

    let behavior = DayBehavior::for_components(components);
    if behavior.uses_day_of_month()
        && components[Field::DayOfMonth.index()]
            .steps
            .iter()
            .any(|step| step_allows(step, Field::DayOfMonth, values[Field::DayOfMonth.index()]))
    {
        return true;
    }
    if behavior.uses_day_of_week() {
        let Some(today) = weekday(
            values[Field::Year.index()],
            values[Field::Month.index()],
            values[Field::DayOfMonth.index()],
        ) else {
            return false;
        };
        // Sunday matches both 0 and 7.
        let candidates: &[i32] = if today == 0 { &[0, 7] } else { &[today] };
        return components[Field::DayOfWeek.index()].steps.iter().any(|step| {
            candidates
                .iter()
                .any(|&day| step_allows(step, Field::DayOfWeek, day))
        });
    }
    false
}

fn step_allows(step: &Step, field: Field, value: i32) -> bool {
    let (start, end, incr) = step.parameters(field);
    value >= start && value <= end && (value - start) % incr == 0
}

fn first_value(components: &[Component], values: &Values, field: Field) -> Option<i32> {
    let mut unset = *values;
    unset[field.index()] = -1;
    next_value(components, &unset, field)
}

/// Smallest permitted value strictly greater than the current one.
fn next_value(components: &[Component], values: &Values, field: Field) -> Option<i32> {
    if field != Field::DayOfMonth {
        return components[field.index()]
            .steps
            .iter()
            .filter_map(|step| next_value_for_step(step, values, field))
            .min();
    }

    let behavior = DayBehavior::for_components(components);
    let by_month_day = components[Field::DayOfMonth.index()]
        .steps
        .iter()
        .filter(|_| behavior.uses_day_of_month())
        .filter_map(|step| next_value_for_step(step, values, Field::DayOfMonth));
    let by_week_day = components[Field::DayOfWeek.index()]
        .steps
        .iter()
        .filter(|_| behavior.uses_day_of_week())
        .filter_map(|step| next_day_for_weekday_step(step, values));
    by_month_day.chain(by_week_day).min()
}

fn next_value_for_step(step: &Step, values: &Values, field: Field) -> Option<i32> {
    let (start, end, incr) = step.parameters(field);
    let current = values[field.index()];
    let next = if current < start {
        start
    } else {
        start + ((current - start) / incr + 1) * incr
    };
    if next < start || next > end {
        return None;
    }
    if field == Field::DayOfMonth
        && next > days_in_month(values[Field::Year.index()], values[Field::Month.index()])?
    {
        return None;
    }
    Some(next)
}

/// Next day of the month matching a day-of-week step. A step that reaches
/// 7 is also tried as Sunday = 0; the earlier day wins.
fn next_day_for_weekday_step(step: &Step, values: &Values) -> Option<i32> {
    let (start, end, incr) = step.parameters(Field::DayOfWeek);
    let allows_second_sunday = start <= 7 && end >= 7 && (7 - start) % incr == 0;

    let standard = next_day_for_weekday_range(start, end, incr, values);
    let sunday = if allows_second_sunday {
        next_day_for_weekday_range(0, 0, 1, values)
    } else {
        None
    };
    match (standard, sunday) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Treats the range as 0-6 only; Sunday as 7 is handled by the caller.
fn next_day_for_weekday_range(start: i32, end: i32, incr: i32, values: &Values) -> Option<i32> {
    if start == 7 {
        return None;
    }
    let end = end.min(6);

    let year = values[Field::Year.index()];
    let month = values[Field::Month.index()];
    // Unset day: search from the day before the 1st.
    let current_day = values[Field::DayOfMonth.index()].max(0);
    let current_weekday = weekday(year, month, current_day)?;
    let start_of_week = current_day - current_weekday;

    let mut next_weekday = if current_weekday < start {
        start
    } else {
        start + ((current_weekday - start) / incr + 1) * incr
    };
    if next_weekday < start || next_weekday > end {
        next_weekday = 7 + start;
    }

    let next = start_of_week + next_weekday;
    if next < 1 || next > days_in_month(year, month)? {
        return None;
    }
    Some(next)
}
