//! Time Range Normalization
//!
//! Turns explicit or relative time expressions into concrete inclusive date
//! ranges with a reporting granularity. Weeks run Monday to Sunday.

use crate::model::{Granularity, TimeRange};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Source of "now" for relative periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(instant) => *instant,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativePeriod {
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
    ThisMonth,
    LastMonth,
    Last30Days,
    Last90Days,
    ThisQuarter,
    LastQuarter,
    ThisYear,
    LastYear,
}

impl RelativePeriod {
    pub const ALL: [RelativePeriod; 12] = [
        RelativePeriod::Today,
        RelativePeriod::Yesterday,
        RelativePeriod::ThisWeek,
        RelativePeriod::LastWeek,
        RelativePeriod::ThisMonth,
        RelativePeriod::LastMonth,
        RelativePeriod::Last30Days,
        RelativePeriod::Last90Days,
        RelativePeriod::ThisQuarter,
        RelativePeriod::LastQuarter,
        RelativePeriod::ThisYear,
        RelativePeriod::LastYear,
    ];

    /// Accepts `last_week`, `last week`, `Last-Week`, ...
    pub fn parse(token: &str) -> Option<Self> {
        let normalized = normalize_token(token);
        Self::ALL.iter().copied().find(|p| p.as_str() == normalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelativePeriod::Today => "today",
            RelativePeriod::Yesterday => "yesterday",
            RelativePeriod::ThisWeek => "this_week",
            RelativePeriod::LastWeek => "last_week",
            RelativePeriod::ThisMonth => "this_month",
            RelativePeriod::LastMonth => "last_month",
            RelativePeriod::Last30Days => "last_30_days",
            RelativePeriod::Last90Days => "last_90_days",
            RelativePeriod::ThisQuarter => "this_quarter",
            RelativePeriod::LastQuarter => "last_quarter",
            RelativePeriod::ThisYear => "this_year",
            RelativePeriod::LastYear => "last_year",
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            RelativePeriod::Today | RelativePeriod::Yesterday => Granularity::Hourly,
            RelativePeriod::ThisQuarter
            | RelativePeriod::LastQuarter
            | RelativePeriod::ThisYear
            | RelativePeriod::LastYear => Granularity::Monthly,
            _ => Granularity::Daily,
        }
    }

    /// Inclusive `(start, end)` relative to `today`
    pub fn bounds(&self, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
        let week_start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        let quarter_start =
            NaiveDate::from_ymd_opt(today.year(), ((today.month() - 1) / 3) * 3 + 1, 1)?;
        let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;

        let range = match self {
            RelativePeriod::Today => (today, today),
            RelativePeriod::Yesterday => {
                let day = today - Duration::days(1);
                (day, day)
            }
            RelativePeriod::ThisWeek => (week_start, today),
            RelativePeriod::LastWeek => (
                week_start - Duration::days(7),
                week_start - Duration::days(1),
            ),
            RelativePeriod::ThisMonth => (month_start, today),
            RelativePeriod::LastMonth => (
                month_start.checked_sub_months(Months::new(1))?,
                month_start - Duration::days(1),
            ),
            RelativePeriod::Last30Days => (today - Duration::days(30), today),
            RelativePeriod::Last90Days => (today - Duration::days(90), today),
            RelativePeriod::ThisQuarter => (quarter_start, today),
            RelativePeriod::LastQuarter => (
                quarter_start.checked_sub_months(Months::new(3))?,
                quarter_start - Duration::days(1),
            ),
            RelativePeriod::ThisYear => (year_start, today),
            RelativePeriod::LastYear => (
                NaiveDate::from_ymd_opt(today.year() - 1, 1, 1)?,
                year_start - Duration::days(1),
            ),
        };
        Some(range)
    }
}

fn normalize_token(token: &str) -> String {
    token
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Parse a date or timestamp in the formats callers send
pub fn parse_instant(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return date.and_hms_opt(0, 0, 0);
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
}

fn explicit_is_valid(range: &TimeRange) -> bool {
    match (range.start.as_deref(), range.end.as_deref()) {
        (Some(start), Some(end)) => match (parse_instant(start), parse_instant(end)) {
            (Some(start), Some(end)) => start <= end,
            _ => false,
        },
        _ => false,
    }
}

fn relative_range(period: RelativePeriod, today: NaiveDate) -> Option<TimeRange> {
    let (start, end) = period.bounds(today)?;
    Some(TimeRange {
        start: Some(start.format(DATE_FORMAT).to_string()),
        end: Some(end.format(DATE_FORMAT).to_string()),
        granularity: Some(period.granularity()),
        relative_period: Some(period.as_str().to_string()),
    })
}

fn default_range(today: NaiveDate) -> TimeRange {
    let start = today - Duration::days(30);
    TimeRange {
        start: Some(start.format(DATE_FORMAT).to_string()),
        end: Some(today.format(DATE_FORMAT).to_string()),
        granularity: Some(Granularity::Daily),
        relative_period: Some(RelativePeriod::Last30Days.as_str().to_string()),
    }
}

/// Resolve a (possibly absent) time range against `clock`.
pub fn resolve_time_range(range: Option<&TimeRange>, clock: &Clock) -> TimeRange {
    let today = clock.today();

    let Some(range) = range else {
        return default_range(today);
    };

    if explicit_is_valid(range) {
        return range.clone();
    }

    match range.relative_period.as_deref() {
        Some(token) => match RelativePeriod::parse(token).and_then(|p| relative_range(p, today)) {
            Some(resolved) => {
                debug!("Resolved relative period '{}' to {:?}..{:?}", token, resolved.start, resolved.end);
                resolved
            }
            None => {
                warn!("Unrecognized relative time period '{}', using last 30 days", token);
                default_range(today)
            }
        },
        None => default_range(today),
    }
}
