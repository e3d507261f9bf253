//! Calendar triggers driven by cron expressions.
//!
//! Expression grammar is delegated to the `cron` crate. This module adapts
//! it to the classic POSIX surface (5 fields, Sunday = 0 or 7) and evaluates
//! matches against local wall-clock time while stepping through real UTC
//! instants, which keeps daylight-saving transitions well defined:
//!
//! - local times skipped by a spring-forward transition never match;
//! - local times repeated by a fall-back transition match once, on their
//!   first occurrence, unless the hour field is a wildcard (an "every minute"
//!   job keeps firing every 60 real seconds through the repeated hour).

use std::str::FromStr;

use ::cron::{Schedule, TimeUnitSpec};
use chrono::{DateTime, Datelike, Duration, LocalResult, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use super::{validate_max_runs, Trigger, TriggerKind};
use crate::error::{Result, SchedulerError};

/// Matches further out than this are reported as "no further matches".
/// Eight years always contains a February 29th.
const SEARCH_HORIZON_DAYS: i64 = 8 * 366;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Computes calendar-aligned occurrences for a [`CronTrigger`].
pub trait CronEvaluator: Send + Sync + std::fmt::Debug {
    /// First matching instant strictly after `after`, or `None` when the
    /// expression has no further occurrences.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Default evaluator: a parsed expression bound to an IANA timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    tz: Tz,
}

impl CronSchedule {
    /// Parse a 5-field (`min hour dom month dow`), 6-field (leading seconds)
    /// or 7-field (trailing year) expression evaluated in `timezone`.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))?;

        let invalid = |reason: String| SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };
        let normalized = normalize_expression(expression).map_err(invalid)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self { schedule, tz })
    }

    fn matches_day_and_hour(&self, local: &DateTime<Tz>) -> bool {
        let s = &self.schedule;
        let (dom, dow) = (s.days_of_month(), s.days_of_week());
        let dom_hit = dom.includes(local.day());
        let dow_hit = dow.includes(local.weekday().number_from_sunday());
        // POSIX: when both day fields are restricted, either one may match.
        let day_hit = if dom.is_all() || dow.is_all() {
            dom_hit && dow_hit
        } else {
            dom_hit || dow_hit
        };

        day_hit
            && u32::try_from(local.year()).is_ok_and(|year| s.years().includes(year))
            && s.months().includes(local.month())
            && s.hours().includes(local.hour())
    }

    /// True for the second occurrence of a wall-clock time repeated by a
    /// fall-back transition, when the hour field pins specific hours.
    fn is_repeated_wall_time(&self, at: DateTime<Utc>, local: &DateTime<Tz>) -> bool {
        if self.schedule.hours().is_all() {
            return false;
        }
        match self.tz.from_local_datetime(&local.naive_local()) {
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc) != at,
            _ => false,
        }
    }
}

impl CronEvaluator for CronSchedule {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Local readings must stay inside chrono's calendar, so the walk
        // stops well short of its last instant.
        let ceiling = DateTime::<Utc>::MAX_UTC - Duration::days(2);
        let limit = after
            .checked_add_signed(Duration::days(SEARCH_HORIZON_DAYS))
            .map_or(ceiling, |limit| limit.min(ceiling));
        // Cron resolution is one second; start at the next whole second.
        let mut at = DateTime::from_timestamp(after.timestamp().checked_add(1)?, 0)?;

        while at <= limit {
            let local = at.with_timezone(&self.tz);
            let step = if !self.matches_day_and_hour(&local) {
                3600 - i64::from(local.minute() * 60 + local.second())
            } else if !self.schedule.minutes().includes(local.minute()) {
                60 - i64::from(local.second())
            } else if !self.schedule.seconds().includes(local.second())
                || self.is_repeated_wall_time(at, &local)
            {
                1
            } else {
                return Some(at);
            };
            at = at.checked_add_signed(Duration::seconds(step))?;
        }
        None
    }
}

/// Bring a POSIX-style expression into the 6/7-field form the `cron` crate
/// parses.
fn normalize_expression(expression: &str) -> std::result::Result<String, String> {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => return Err(format!("expected 5, 6 or 7 fields, found {n}")),
    }
    fields[5] = normalize_day_of_week(&fields[5])?;
    Ok(fields.join(" "))
}

/// Rewrite the day-of-week field as explicit day names.
///
/// POSIX numbers Sunday as 0 (or 7) while the `cron` crate starts at
/// 1 = Sunday, so numeric days, ranges and steps are expanded here.
fn normalize_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = match range {
            "*" | "?" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => {
                    let lo = parse_day(a)?;
                    let mut hi = parse_day(b)?;
                    // FRI-SUN style ranges end on Sunday.
                    if hi == 0 && lo > 0 {
                        hi = 7;
                    }
                    if hi < lo {
                        return Err(format!("invalid day-of-week range '{range}'"));
                    }
                    (lo, hi)
                }
                // "n/step" runs from n to the end of the week.
                None => {
                    let day = parse_day(range)?;
                    (day, if step.is_some() { 6 } else { day })
                }
            },
        };

        let step = step.unwrap_or(1);
        let mut day = lo;
        while day <= hi {
            days[(day % 7) as usize] = true;
            day += step;
        }
    }

    if days.iter().all(|&d| d) {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = (0..7).filter(|&d| days[d]).map(|d| DAY_NAMES[d]).collect();
    Ok(names.join(","))
}

fn parse_day(token: &str) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {n} out of range 0-7"))
        };
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day-of-week '{token}'"))
}

/// Fires on every match of a cron expression, optionally bounded by a run
/// count and a start time.
#[derive(Debug)]
pub struct CronTrigger {
    evaluator: Box<dyn CronEvaluator>,
    max_runs: Option<u32>,
    start: Option<DateTime<Utc>>,
    run_count: u32,
}

impl CronTrigger {
    /// Build a trigger backed by the default [`CronSchedule`] evaluator.
    /// Without a start time, matching begins at registration.
    pub fn new(
        expression: &str,
        max_runs: Option<u32>,
        timezone: &str,
        start: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let schedule = CronSchedule::parse(expression, timezone)?;
        Self::with_evaluator(Box::new(schedule), max_runs, start)
    }

    /// Build a trigger around a caller-supplied evaluator.
    pub fn with_evaluator(
        evaluator: Box<dyn CronEvaluator>,
        max_runs: Option<u32>,
        start: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        validate_max_runs(max_runs)?;
        Ok(Self {
            evaluator,
            max_runs,
            start,
            run_count: 0,
        })
    }
}

impl Trigger for CronTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Cron
    }

    fn activate(&mut self, now: DateTime<Utc>) {
        self.start.get_or_insert(now);
    }

    fn next_due(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        if self.is_exhausted() {
            return None;
        }
        let after = after.unwrap_or_else(Utc::now);
        let reference = match self.start {
            // Let a match exactly at the start instant count.
            Some(start) if start > after => {
                start.checked_sub_signed(Duration::nanoseconds(1))?
            }
            _ => after,
        };
        self.evaluator.next_after(reference)
    }

    fn mark_fired(&mut self, _at: DateTime<Utc>) {
        self.run_count = self.run_count.saturating_add(1);
    }

    fn is_exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn take(schedule: &CronSchedule, mut after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        for _ in 0..n {
            let next = schedule.next_after(after).unwrap();
            out.push(next);
            after = next;
        }
        out
    }

    #[test]
    fn normalizes_five_fields_and_posix_weekdays() {
        assert_eq!(normalize_expression("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(
            normalize_expression("0 9 * * 1-5").unwrap(),
            "0 0 9 * * MON,TUE,WED,THU,FRI"
        );
        assert_eq!(normalize_expression("0 0 * * 0").unwrap(), "0 0 0 * * SUN");
        assert_eq!(normalize_expression("0 0 * * 7").unwrap(), "0 0 0 * * SUN");
        assert_eq!(normalize_expression("0 0 * * 5-7").unwrap(), "0 0 0 * * SUN,FRI,SAT");
        assert_eq!(normalize_expression("0 0 * * */2").unwrap(), "0 0 0 * * SUN,TUE,THU,SAT");
        assert_eq!(normalize_expression("0 0 * * mon-sun").unwrap(), "0 0 0 * * *");
        assert_eq!(normalize_expression("0 0 0 1 1 * 2030").unwrap(), "0 0 0 1 1 * 2030");
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["", "* * * *", "* * * * * * * *", "0 0 * * 8", "0 0 * * FUNDAY", "0 0 * * */0"] {
            assert!(CronSchedule::parse(expr, "UTC").is_err(), "{expr} should be rejected");
        }
        let err = CronSchedule::parse("61 * * * *", "UTC").unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON");
    }

    #[test]
    fn rejects_unknown_timezone() {
        let err = CronSchedule::parse("* * * * *", "Mars/Olympus_Mons").unwrap_err();
        assert_eq!(err.code(), "INVALID_TIMEZONE");
    }

    #[test]
    fn every_minute_is_strictly_after_reference() {
        let schedule = CronSchedule::parse("* * * * *", "UTC").unwrap();
        assert_eq!(schedule.next_after(utc(2025, 1, 1, 12, 0, 0)), Some(utc(2025, 1, 1, 12, 1, 0)));
        assert_eq!(schedule.next_after(utc(2025, 1, 1, 12, 0, 59)), Some(utc(2025, 1, 1, 12, 1, 0)));
    }

    #[test]
    fn seconds_field_with_step() {
        let schedule = CronSchedule::parse("*/30 * * * * *", "UTC").unwrap();
        let got = take(&schedule, utc(2025, 1, 1, 12, 0, 10), 3);
        assert_eq!(
            got,
            vec![utc(2025, 1, 1, 12, 0, 30), utc(2025, 1, 1, 12, 1, 0), utc(2025, 1, 1, 12, 1, 30)]
        );
    }

    #[test]
    fn weekday_ranges_by_name_and_number_agree() {
        // 2024-03-09 is a Saturday.
        let saturday_noon = utc(2024, 3, 9, 12, 0, 0);
        for expr in ["0 9 * * MON-FRI", "0 9 * * 1-5"] {
            let schedule = CronSchedule::parse(expr, "UTC").unwrap();
            let next = schedule.next_after(saturday_noon).unwrap();
            assert_eq!(next, utc(2024, 3, 11, 9, 0, 0));
            assert_eq!(next.weekday(), Weekday::Mon);
        }
    }

    #[test]
    fn sunday_as_zero_or_seven() {
        let friday = utc(2024, 3, 8, 12, 0, 0);
        for expr in ["0 0 * * 0", "0 0 * * 7", "0 0 * * SUN"] {
            let schedule = CronSchedule::parse(expr, "UTC").unwrap();
            assert_eq!(schedule.next_after(friday), Some(utc(2024, 3, 10, 0, 0, 0)));
        }
    }

    #[test]
    fn every_minute_across_spring_forward_is_sixty_seconds_apart() {
        // America/New_York jumps 02:00 EST -> 03:00 EDT at 07:00 UTC on 2024-03-10.
        let schedule = CronSchedule::parse("* * * * *", "America/New_York").unwrap();
        let got = take(&schedule, utc(2024, 3, 10, 6, 57, 30), 4);

        for pair in got.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::seconds(60));
        }
        let local: Vec<String> = got
            .iter()
            .map(|at| at.with_timezone(&schedule.tz).format("%H:%M %Z").to_string())
            .collect();
        assert_eq!(local, vec!["01:58 EST", "01:59 EST", "03:00 EDT", "03:01 EDT"]);
    }

    #[test]
    fn every_minute_across_fall_back_is_sixty_seconds_apart() {
        // 02:00 EDT -> 01:00 EST at 06:00 UTC on 2024-11-03; 01:xx happens twice.
        let schedule = CronSchedule::parse("* * * * *", "America/New_York").unwrap();
        let got = take(&schedule, utc(2024, 11, 3, 5, 57, 30), 4);

        for pair in got.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::seconds(60));
        }
        let local: Vec<String> = got
            .iter()
            .map(|at| at.with_timezone(&schedule.tz).format("%H:%M %Z").to_string())
            .collect();
        assert_eq!(local, vec!["01:58 EDT", "01:59 EDT", "01:00 EST", "01:01 EST"]);
    }

    #[test]
    fn fixed_time_in_repeated_hour_fires_once() {
        let schedule = CronSchedule::parse("30 1 * * *", "America/New_York").unwrap();
        let first = schedule.next_after(utc(2024, 11, 3, 4, 0, 0)).unwrap();
        assert_eq!(first, utc(2024, 11, 3, 5, 30, 0)); // 01:30 EDT
        // 01:30 EST (06:30 UTC) is skipped; next is the following day.
        assert_eq!(schedule.next_after(first), Some(utc(2024, 11, 4, 6, 30, 0)));
    }

    #[test]
    fn wildcard_hour_fires_in_both_copies_of_repeated_hour() {
        let schedule = CronSchedule::parse("30 * * * *", "America/New_York").unwrap();
        let first = schedule.next_after(utc(2024, 11, 3, 5, 0, 0)).unwrap();
        assert_eq!(first, utc(2024, 11, 3, 5, 30, 0));
        assert_eq!(schedule.next_after(first), Some(utc(2024, 11, 3, 6, 30, 0)));
    }

    #[test]
    fn nonexistent_local_time_is_skipped() {
        // 02:30 does not exist in New York on 2024-03-10.
        let schedule = CronSchedule::parse("30 2 * * *", "America/New_York").unwrap();
        let next = schedule.next_after(utc(2024, 3, 9, 8, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 11, 6, 30, 0));
        assert_eq!(
            next.with_timezone(&schedule.tz).date_naive(),
            NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
        );
    }

    #[test]
    fn localizes_to_timezone() {
        let schedule = CronSchedule::parse("0 9 * * *", "Asia/Tokyo").unwrap();
        let next = schedule
            .next_after(utc(2025, 1, 1, 0, 30, 0))
            .unwrap()
            .with_timezone(&schedule.tz);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.with_timezone(&Utc), utc(2025, 1, 2, 0, 0, 0));
    }

    #[test]
    fn leap_day_is_within_horizon_and_past_year_is_exhausted() {
        let leap = CronSchedule::parse("0 0 29 2 *", "UTC").unwrap();
        assert_eq!(leap.next_after(utc(2025, 3, 1, 0, 0, 0)), Some(utc(2028, 2, 29, 0, 0, 0)));

        let past = CronSchedule::parse("0 0 0 1 1 * 2020", "UTC").unwrap();
        assert_eq!(past.next_after(utc(2025, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn trigger_honours_max_runs_and_start() {
        let start = utc(2025, 1, 1, 12, 0, 0);
        let mut trigger = CronTrigger::new("* * * * *", Some(2), "UTC", Some(start)).unwrap();
        trigger.activate(utc(2025, 1, 1, 0, 0, 0));

        // Start lies ahead of the reference: the first match is the start itself.
        let first = trigger.next_due(Some(utc(2025, 1, 1, 0, 0, 0))).unwrap();
        assert_eq!(first, start);
        trigger.mark_fired(first);

        let second = trigger.next_due(Some(first)).unwrap();
        assert_eq!(second - first, Duration::seconds(60));
        trigger.mark_fired(second);

        assert!(trigger.is_exhausted());
        assert_eq!(trigger.next_due(Some(second)), None);
    }

    #[test]
    fn next_due_is_monotonic() {
        let mut trigger = CronTrigger::new("*/7 * * * * *", None, "Europe/Berlin", None).unwrap();
        let t0 = utc(2024, 3, 31, 0, 55, 0); // spans the Berlin spring-forward at 01:00 UTC
        trigger.activate(t0);
        let mut prev = t0;
        for step in 0..200 {
            let after = t0 + Duration::seconds(step * 3);
            let due = trigger.next_due(Some(after)).unwrap();
            assert!(due > after);
            assert!(due >= prev);
            prev = due;
        }
    }

    #[test]
    fn restricted_day_of_month_and_weekday_match_either() {
        let schedule = CronSchedule::parse("0 0 1 * MON", "UTC").unwrap();
        assert_eq!(schedule.next_after(utc(2025, 1, 1, 12, 0, 0)), Some(utc(2025, 1, 6, 0, 0, 0)));
        assert_eq!(
            take(&schedule, utc(2025, 1, 26, 12, 0, 0), 4),
            vec![
                utc(2025, 1, 27, 0, 0, 0), // Monday
                utc(2025, 2, 1, 0, 0, 0),  // Saturday the 1st
                utc(2025, 2, 3, 0, 0, 0),
                utc(2025, 2, 10, 0, 0, 0),
            ]
        );

        // A wildcard in either day field leaves the other one in charge.
        let fridays = CronSchedule::parse("0 0 * * FRI", "UTC").unwrap();
        assert_eq!(fridays.next_after(utc(2025, 1, 1, 12, 0, 0)), Some(utc(2025, 1, 3, 0, 0, 0)));
        let thirteenth = CronSchedule::parse("0 0 13 * *", "UTC").unwrap();
        assert_eq!(
            thirteenth.next_after(utc(2025, 1, 1, 12, 0, 0)),
            Some(utc(2025, 1, 13, 0, 0, 0))
        );
    }

    #[test]
    fn end_of_calendar_has_no_next_match() {
        let schedule = CronSchedule::parse("* * * * * *", "America/New_York").unwrap();
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::seconds(30);
        assert_eq!(schedule.next_after(near_end), None);

        let mut trigger = CronTrigger::new("* * * * *", None, "UTC", Some(near_end)).unwrap();
        trigger.activate(utc(2025, 1, 1, 0, 0, 0));
        assert_eq!(trigger.next_due(Some(utc(2025, 1, 1, 0, 0, 0))), None);
    }
}
