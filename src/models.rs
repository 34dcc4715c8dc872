use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::utils;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub venue_id: Option<i64>,
    pub source_id: Option<i64>,
    pub duplicate_of_id: Option<i64>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn tag_list(&self) -> String {
        self.tags.join(", ")
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of_id.is_some()
    }

    /// Happening today or later, relative to the start of the current day.
    pub fn is_current(&self, today: DateTime<Utc>) -> bool {
        self.end_time.unwrap_or(self.start_time) >= today
    }

    /// Over before today began. Events without an end count as one hour long.
    pub fn is_old(&self, today: DateTime<Utc>) -> bool {
        self.end_time
            .unwrap_or_else(|| self.start_time + Duration::hours(1))
            <= today
    }

    /// Started before today and still running.
    pub fn is_ongoing(&self, today: DateTime<Utc>) -> bool {
        match self.end_time {
            Some(end) => self.start_time < today && end >= today,
            None => false,
        }
    }

    pub fn to_draft(&self) -> EventDraft {
        EventDraft {
            title: self.title.clone(),
            description: self.description.clone(),
            url: self.url.clone(),
            start_time: Some(self.start_time),
            end_time: self.end_time,
            venue_id: self.venue_id,
            tag_list: self.tag_list(),
        }
    }
}

/// User supplied event fields, as submitted by a form or produced by an import.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct EventDraft {
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub venue_id: Option<i64>,
    pub tag_list: String,
}

impl EventDraft {
    pub fn normalized(self) -> Self {
        Self {
            title: utils::clean_text(&self.title),
            description: utils::blank_to_none(self.description),
            url: utils::normalize_url(self.url.as_deref()),
            tag_list: parse_tag_list(&self.tag_list).join(", "),
            ..self
        }
    }

    pub fn tags(&self) -> Vec<String> {
        parse_tag_list(&self.tag_list)
    }

    /// Returns the start time once every field checks out.
    pub fn validate(&self) -> Result<DateTime<Utc>, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.title.trim().is_empty() {
            errors.add("title", "can't be blank");
        }
        match (self.start_time, self.end_time) {
            (None, _) => errors.add("start_time", "can't be blank"),
            (Some(start), Some(end)) if end < start => {
                errors.add("end_time", "cannot be before start")
            }
            _ => {}
        }
        match self.start_time {
            Some(start) if errors.is_empty() => Ok(start),
            _ => Err(errors),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Venue {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub url: Option<String>,
    pub duplicate_of_id: Option<i64>,
    pub source_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Venue {
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of_id.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct VenueDraft {
    pub title: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub url: Option<String>,
}

impl VenueDraft {
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
        .normalized()
    }

    pub fn normalized(self) -> Self {
        Self {
            title: utils::clean_text(&self.title),
            description: utils::blank_to_none(self.description),
            address: utils::blank_to_none(self.address),
            url: utils::normalize_url(self.url.as_deref()),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.title.trim().is_empty() {
            errors.add("title", "can't be blank");
        }
        errors.into_result()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Source {
    pub id: i64,
    pub title: Option<String>,
    pub url: String,
    pub imported_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SourceDraft {
    pub title: Option<String>,
    pub url: String,
}

impl SourceDraft {
    pub fn for_url(url: &str) -> Self {
        Self {
            title: None,
            url: url.to_string(),
        }
        .normalized()
    }

    pub fn normalized(self) -> Self {
        Self {
            title: utils::blank_to_none(self.title),
            url: utils::normalize_url(Some(&self.url)).unwrap_or_default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.url.trim().is_empty() {
            errors.add("url", "can't be blank");
        } else if reqwest::Url::parse(&self.url).is_err() {
            errors.add("url", "is invalid");
        }
        errors.into_result()
    }
}

/// What an event's venue should be set to.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueRef {
    None,
    Venue(Venue),
    Title(String),
    Id(i64),
}

/// Keeps the current venue when the candidate carries the same title.
pub fn choose_venue(current: Option<Venue>, candidate: Venue) -> Venue {
    match current {
        Some(existing) if existing.title == candidate.title => existing,
        _ => candidate,
    }
}

/// Splits a comma separated tag list into trimmed, distinct, non-empty names.
pub fn parse_tag_list(input: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for raw in input.split(',') {
        let tag = utils::clean_text(raw);
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Field level validation messages keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, thiserror::Error)]
#[error("validation failed: {}", full_messages(.0).join(", "))]
pub struct ValidationErrors(pub BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: &str) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn on(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn full_messages(&self) -> Vec<String> {
        full_messages(&self.0)
    }

    fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn full_messages(errors: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    errors
        .iter()
        .flat_map(|(field, messages)| {
            messages
                .iter()
                .map(move |message| format!("{} {message}", field.replace('_', " ")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("valid time")
    }

    fn event(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Event {
        Event {
            id: 1,
            title: "Event title".to_string(),
            description: None,
            url: None,
            start_time: start,
            end_time: end,
            venue_id: None,
            source_id: None,
            duplicate_of_id: None,
            tags: Vec::new(),
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn valid_with_title_and_start() {
        let draft = EventDraft {
            title: "Event title".to_string(),
            start_time: Some(at(2008, 4, 12, 0)),
            ..EventDraft::default()
        };
        assert_eq!(draft.validate(), Ok(at(2008, 4, 12, 0)));
    }

    #[test]
    fn normalizing_adds_http_prefix() {
        let draft = EventDraft {
            title: " Event   title ".to_string(),
            start_time: Some(at(2008, 4, 12, 0)),
            url: Some("google.com".to_string()),
            ..EventDraft::default()
        }
        .normalized();
        assert_eq!(draft.url.as_deref(), Some("http://google.com"));
        assert_eq!(draft.title, "Event title");
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn end_before_start_fails_on_end_time() {
        let start = at(2008, 4, 12, 12);
        let draft = EventDraft {
            title: "Backwards".to_string(),
            start_time: Some(start),
            end_time: Some(start - Duration::hours(2)),
            ..EventDraft::default()
        };
        let errors = draft.validate().expect_err("must fail");
        assert_eq!(errors.on("end_time").len(), 1);
        assert!(errors.on("start_time").is_empty());
        assert_eq!(
            errors.to_string(),
            "validation failed: end time cannot be before start"
        );
    }

    #[test]
    fn end_equal_to_start_is_allowed() {
        let start = at(2008, 4, 12, 12);
        let draft = EventDraft {
            title: "Instant".to_string(),
            start_time: Some(start),
            end_time: Some(start),
            ..EventDraft::default()
        };
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn blank_title_and_missing_start_are_reported() {
        let errors = EventDraft::default().validate().expect_err("must fail");
        assert_eq!(errors.on("title"), ["can't be blank".to_string()]);
        assert_eq!(errors.on("start_time"), ["can't be blank".to_string()]);
    }

    #[test]
    fn tag_list_is_trimmed_and_deduplicated() {
        assert_eq!(parse_tag_list("some, tags,,some , more"), vec!["some", "tags", "more"]);
        let draft = EventDraft {
            tag_list: "some,  tags".to_string(),
            ..EventDraft::default()
        }
        .normalized();
        assert_eq!(draft.tag_list, "some, tags");
        assert_eq!(parse_tag_list(""), Vec::<String>::new());
    }

    #[test]
    fn time_status_relative_to_today() {
        let today = at(2008, 4, 12, 0);

        let old = event(at(2008, 4, 10, 10), Some(at(2008, 4, 10, 12)));
        assert!(old.is_old(today));
        assert!(!old.is_current(today));

        let tomorrow = event(at(2008, 4, 13, 10), None);
        assert!(tomorrow.is_current(today));
        assert!(!tomorrow.is_old(today));

        let ongoing = event(at(2008, 4, 11, 10), Some(at(2008, 4, 14, 0)));
        assert!(ongoing.is_ongoing(today));
        assert!(ongoing.is_current(today));

        let open_ended = event(at(2008, 4, 11, 10), None);
        assert!(!open_ended.is_ongoing(today));
    }

    #[test]
    fn venue_with_same_title_is_kept() {
        let base = Venue {
            id: 1,
            title: "MyVenue".to_string(),
            description: None,
            address: None,
            url: None,
            duplicate_of_id: None,
            source_id: None,
            created_at: at(2008, 1, 1, 0),
            updated_at: at(2008, 1, 1, 0),
        };
        let same_name = Venue { id: 2, ..base.clone() };
        let other = Venue {
            id: 3,
            title: "OtherVenue".to_string(),
            ..base.clone()
        };

        assert_eq!(choose_venue(None, base.clone()).id, 1);
        assert_eq!(choose_venue(Some(same_name), base.clone()).id, 2);
        assert_eq!(choose_venue(Some(other), base).id, 1);
    }

    #[test]
    fn source_url_is_normalized_and_checked() {
        let draft = SourceDraft::for_url("my.url/");
        assert_eq!(draft.url, "http://my.url/");
        assert!(draft.validate().is_ok());

        let blank = SourceDraft::for_url("  ");
        assert_eq!(blank.validate().expect_err("blank").on("url").len(), 1);
    }
}
