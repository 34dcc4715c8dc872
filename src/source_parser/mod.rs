pub mod base;
pub mod hcal;
pub mod ical;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::models::EventDraft;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("content is not a recognized calendar format")]
    Unrecognized,
    #[error("invalid iCalendar: {0}")]
    ICalendar(String),
}

/// An event as read from a feed, before it touches the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbstractEvent {
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub location: Option<AbstractLocation>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbstractLocation {
    pub title: String,
    pub address: Option<String>,
}

impl AbstractEvent {
    pub fn new(
        title: &str,
        description: Option<&str>,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            title: title.to_string(),
            description: description.map(str::to_string),
            start_time,
            end_time,
            url: None,
            location: None,
            tags: Vec::new(),
        }
    }

    pub fn to_draft(&self) -> EventDraft {
        EventDraft {
            title: self.title.clone(),
            description: self.description.clone(),
            url: self.url.clone(),
            start_time: Some(self.start_time),
            end_time: self.end_time,
            venue_id: None,
            tag_list: self.tags.join(", "),
        }
        .normalized()
    }

    fn is_past(&self, today: DateTime<Utc>) -> bool {
        self.end_time.unwrap_or(self.start_time) < today
    }
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Drop events that were over before `today`.
    pub skip_old: bool,
    pub today: DateTime<Utc>,
    /// Zone for floating times and all-day dates.
    pub tz: Tz,
    /// Page the content came from; relative links resolve against it.
    pub base_url: Option<String>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            skip_old: false,
            today: Utc::now(),
            tz: Tz::UTC,
            base_url: None,
        }
    }
}

pub trait SourceParser: Send + Sync {
    fn label(&self) -> &'static str;
    fn matches(&self, content: &str) -> bool;
    fn parse(&self, content: &str, options: &ParseOptions) -> Result<Vec<AbstractEvent>, ParseError>;
}

#[derive(Clone, Serialize)]
pub struct ParserInfo {
    pub label: String,
}

fn active_parsers() -> Vec<Box<dyn SourceParser>> {
    vec![Box::new(ical::ICalendar), Box::new(hcal::HCalendar)]
}

pub fn list_parsers() -> Vec<ParserInfo> {
    active_parsers()
        .into_iter()
        .map(|parser| ParserInfo {
            label: parser.label().to_string(),
        })
        .collect()
}

/// Parses `content` with the first parser that recognizes it.
pub fn to_abstract_events(
    content: &str,
    options: &ParseOptions,
) -> Result<Vec<AbstractEvent>, ParseError> {
    let parser = active_parsers()
        .into_iter()
        .find(|parser| parser.matches(content))
        .ok_or(ParseError::Unrecognized)?;
    let mut events = parser.parse(content, options)?;
    tracing::debug!(parser = parser.label(), count = events.len(), "parsed source");
    if options.skip_old {
        events.retain(|event| !event.is_past(options.today));
    }
    Ok(events)
}
