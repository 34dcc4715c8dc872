//! iCalendar import and export through the icalendar crate.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use icalendar::{
    parser::{read_calendar, unfold, Component as ParsedComponent},
    Calendar, CalendarDateTime, Component, DatePerhapsTime, EventLike,
};

use super::{base, AbstractEvent, AbstractLocation, ParseError, ParseOptions, SourceParser};
use crate::dates;
use crate::models::{Event, Venue};

const UID_DOMAIN: &str = "community-calendar";

pub struct ICalendar;

impl SourceParser for ICalendar {
    fn label(&self) -> &'static str {
        "iCalendar"
    }

    fn matches(&self, content: &str) -> bool {
        content.contains("BEGIN:VCALENDAR")
    }

    fn parse(&self, content: &str, options: &ParseOptions) -> Result<Vec<AbstractEvent>, ParseError> {
        let unfolded = unfold(content);
        let calendar = read_calendar(&unfolded).map_err(ParseError::ICalendar)?;

        let mut vevents = Vec::new();
        collect_vevents(&calendar.components, &mut vevents);

        let mut events = Vec::new();
        for vevent in vevents {
            match to_abstract_event(vevent, options.tz) {
                Some(event) => events.push(event),
                None => tracing::debug!("skipping VEVENT without summary or start"),
            }
        }
        Ok(events)
    }
}

fn collect_vevents<'a, 'b>(components: &'b [ParsedComponent<'a>], out: &mut Vec<&'b ParsedComponent<'a>>) {
    for component in components {
        if component.name == "VEVENT" {
            out.push(component);
        } else {
            collect_vevents(&component.components, out);
        }
    }
}

fn to_abstract_event(vevent: &ParsedComponent<'_>, tz: Tz) -> Option<AbstractEvent> {
    let text = |name: &str| {
        vevent
            .find_prop(name)
            .map(|prop| unescape(prop.val.as_ref()))
            .filter(|value| !value.is_empty())
    };
    let time = |name: &str| {
        vevent
            .find_prop(name)
            .and_then(|prop| DatePerhapsTime::try_from(prop).ok())
            .and_then(|value| to_utc(value, tz))
    };

    let title = text("SUMMARY")?;
    let start_time = time("DTSTART")?;
    let tags = text("CATEGORIES")
        .map(|value| {
            value
                .split(',')
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(AbstractEvent {
        title,
        description: text("DESCRIPTION"),
        start_time,
        end_time: time("DTEND").filter(|end| *end >= start_time),
        url: text("URL"),
        location: text("LOCATION").map(|title| AbstractLocation {
            title,
            address: None,
        }),
        tags,
    })
}

fn to_utc(value: DatePerhapsTime, tz: Tz) -> Option<DateTime<Utc>> {
    match value {
        DatePerhapsTime::Date(date) => Some(dates::start_of_day(date, tz)),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => Some(dt),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => base::local_to_utc(naive, tz),
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            let zone = tzid.parse::<Tz>().unwrap_or(tz);
            base::local_to_utc(date_time, zone)
        }
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out.trim().to_string()
}

/// One event to export, with the venue it takes place at.
pub struct CalendarEntry<'a> {
    pub event: &'a Event,
    pub venue: Option<&'a Venue>,
}

fn ics_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Renders a VCALENDAR. Events lacking a url get one from `url_helper`.
pub fn to_ical(entries: &[CalendarEntry<'_>], url_helper: Option<&dyn Fn(&Event) -> String>) -> String {
    let mut cal = Calendar::new();
    cal.name("Community Calendar");

    for entry in entries {
        let event = entry.event;
        let mut ics_event = icalendar::Event::new();
        ics_event.uid(&format!("event-{}@{UID_DOMAIN}", event.id));
        ics_event.summary(&event.title);
        ics_event.add_property("DTSTAMP", ics_time(event.updated_at));
        ics_event.add_property("DTSTART", ics_time(event.start_time));
        if let Some(end) = event.end_time {
            ics_event.add_property("DTEND", ics_time(end));
        }
        if let Some(ref description) = event.description {
            ics_event.description(description);
        }
        if let Some(venue) = entry.venue {
            ics_event.location(&venue.title);
        }
        let url = event
            .url
            .clone()
            .or_else(|| url_helper.map(|helper| helper(event)));
        if let Some(url) = url {
            ics_event.add_property("URL", url);
        }
        if !event.tags.is_empty() {
            ics_event.add_property("CATEGORIES", event.tags.join(","));
        }
        cal.push(ics_event.done());
    }

    cal.done().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn basic_event(url: Option<&str>) -> Event {
        let start = Utc.with_ymd_and_hms(2007, 10, 5, 0, 0, 0).single().expect("time");
        Event {
            id: 42,
            title: "Web 2.0 Conference".to_string(),
            description: Some("Talks; and more".to_string()),
            url: url.map(str::to_string),
            start_time: start,
            end_time: None,
            venue_id: Some(1),
            source_id: None,
            duplicate_of_id: None,
            tags: vec!["web".to_string(), "conference".to_string()],
            created_at: start,
            updated_at: start,
        }
    }

    fn basic_venue() -> Venue {
        let at = Utc.with_ymd_and_hms(2007, 1, 1, 0, 0, 0).single().expect("time");
        Venue {
            id: 1,
            title: "Argent Hotel".to_string(),
            description: None,
            address: None,
            url: None,
            duplicate_of_id: None,
            source_id: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn parse(content: &str) -> Vec<AbstractEvent> {
        ICalendar
            .parse(content, &ParseOptions::default())
            .expect("parse ical")
    }

    #[test]
    fn exported_event_parses_back() {
        let event = basic_event(Some("http://www.web2con.com/"));
        let venue = basic_venue();
        let ical = to_ical(
            &[CalendarEntry {
                event: &event,
                venue: Some(&venue),
            }],
            None,
        );
        assert!(ical.contains("UID:event-42@community-calendar"));

        let parsed = parse(&ical);
        assert_eq!(parsed.len(), 1);
        let abstract_event = &parsed[0];
        assert_eq!(abstract_event.title, event.title);
        assert_eq!(abstract_event.url, event.url);
        assert_eq!(abstract_event.start_time, event.start_time);
        assert_eq!(abstract_event.end_time, None);
        assert_eq!(abstract_event.tags, event.tags);
        assert_eq!(
            abstract_event.location.as_ref().map(|l| l.title.as_str()),
            Some("Argent Hotel")
        );
    }

    #[test]
    fn missing_url_is_generated() {
        let event = basic_event(None);
        let helper: &dyn Fn(&Event) -> String = &|_| "http://foo.bar/".to_string();
        let ical = to_ical(&[CalendarEntry { event: &event, venue: None }], Some(helper));

        let parsed = parse(&ical);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].url.as_deref(), Some("http://foo.bar/"));
        assert!(parsed[0].location.is_none());
    }

    #[test]
    fn reads_dates_zones_and_escapes() {
        let ics = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:TEST\r\n\
BEGIN:VEVENT\r\n\
UID:a\r\n\
SUMMARY:All day\\, outdoors\r\n\
DTSTART;VALUE=DATE:20080412\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:b\r\n\
SUMMARY:Zoned\r\n\
DTSTART;TZID=America/New_York:20080412T190000\r\n\
DTEND;TZID=America/New_York:20080412T210000\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:c\r\n\
DTSTART:20080412T190000Z\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

        let parsed = parse(ics);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].title, "All day, outdoors");
        assert_eq!(parsed[0].start_time.to_rfc3339(), "2008-04-12T00:00:00+00:00");
        assert_eq!(parsed[1].start_time.to_rfc3339(), "2008-04-12T23:00:00+00:00");
        assert_eq!(
            parsed[1].end_time.map(|end| end.to_rfc3339()).as_deref(),
            Some("2008-04-13T01:00:00+00:00")
        );
    }
}
