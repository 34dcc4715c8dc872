//! Day boundaries and the overview buckets built on top of them.
//!
//! Days are cut in the configured timezone and handed to the store as UTC
//! instants, so the SQL only ever compares plain timestamps.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::models::Event;

/// How far ahead the overview looks before handing off to `more`.
pub const OVERVIEW_DAYS: i64 = 14;

/// Start of `date` in `tz`, as a UTC instant.
pub fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the day starts an hour later.
        LocalResult::None => tz
            .from_local_datetime(&(midnight + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc()),
    }
}

/// The calendar date `now` falls on in `tz`.
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// `[start, end)` in UTC covering whole local days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// From the start of `first` through the end of `last`.
    pub fn days(first: NaiveDate, last: NaiveDate, tz: Tz) -> Self {
        let after_last = last.succ_opt().unwrap_or(last);
        Self {
            start: start_of_day(first, tz),
            end: start_of_day(after_last, tz),
        }
    }

    /// An event with no end occupies the single instant it starts at.
    pub fn overlaps(&self, event: &Event) -> bool {
        let starts_inside = event.start_time >= self.start && event.start_time < self.end;
        let still_running = event.start_time < self.start
            && event.end_time.map_or(false, |end| end >= self.start);
        starts_inside || still_running
    }
}

/// Reference points for "today" questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Today {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub tomorrow: DateTime<Utc>,
    pub after_tomorrow: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
}

impl Today {
    pub fn new(date: NaiveDate, tz: Tz) -> Self {
        let day = |offset: i64| start_of_day(date + Duration::days(offset), tz);
        Self {
            date,
            start: day(0),
            tomorrow: day(1),
            after_tomorrow: day(2),
            cutoff: day(OVERVIEW_DAYS),
        }
    }

    pub fn at(now: DateTime<Utc>, tz: Tz) -> Self {
        Self::new(local_date(now, tz), tz)
    }

    /// The window the overview selects from: today up to the cutoff instant.
    pub fn overview_range(&self) -> DateRange {
        DateRange {
            start: self.start,
            end: self.cutoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Today,
    Tomorrow,
    Later,
}

/// Buckets an event by when it starts. Anything starting before tomorrow,
/// including events already running, lands in `Today`.
pub fn bucket_for(event: &Event, today: &Today) -> Bucket {
    if event.start_time < today.tomorrow {
        Bucket::Today
    } else if event.start_time < today.after_tomorrow {
        Bucket::Tomorrow
    } else {
        Bucket::Later
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Overview {
    pub today: Vec<Event>,
    pub tomorrow: Vec<Event>,
    pub later: Vec<Event>,
    /// First event beyond the overview window, for linking onward.
    pub more: Option<Event>,
}

impl Overview {
    pub fn from_events(events: Vec<Event>, today: &Today, more: Option<Event>) -> Self {
        let mut overview = Overview {
            more,
            ..Overview::default()
        };
        let window = today.overview_range();
        for event in events.into_iter().filter(|event| window.overlaps(event)) {
            match bucket_for(&event, today) {
                Bucket::Today => overview.today.push(event),
                Bucket::Tomorrow => overview.tomorrow.push(event),
                Bucket::Later => overview.later.push(event),
            }
        }
        overview
    }
}
