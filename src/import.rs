//! Pulls a source's feed into the store.

use std::fmt;

use anyhow::Context;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::{Store, StoreError};
use crate::models::{Event, Source};
use crate::source_parser::{self, base, AbstractEvent, ParseError, ParseOptions};

pub const MAXIMUM_EVENTS_TO_DISPLAY_IN_FLASH: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("unable to fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Retrieves the raw content behind a source url.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Fetches over HTTP, or reads `file://` urls from disk.
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<String> {
        match url.strip_prefix("file://") {
            Some(path) => {
                std::fs::read_to_string(path).with_context(|| format!("unable to read {path}"))
            }
            None => base::fetch_content(url),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub source: Source,
    pub events: Vec<Event>,
    pub created: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flash {
    Success(String),
    Failure(String),
}

impl Flash {
    pub fn for_result(result: &Result<ImportReport, ImportError>) -> Self {
        match result {
            Ok(report) => Flash::imported(&report.events),
            Err(err) => Flash::Failure(format!("Unable to import: {err}")),
        }
    }

    pub fn imported(events: &[Event]) -> Self {
        if events.is_empty() {
            return Flash::Success("Nothing to import".to_string());
        }
        let mut lines = vec![format!("Imported {} entries:", events.len())];
        lines.extend(
            events
                .iter()
                .take(MAXIMUM_EVENTS_TO_DISPLAY_IN_FLASH)
                .map(|event| format!("- {}", event.title)),
        );
        if events.len() > MAXIMUM_EVENTS_TO_DISPLAY_IN_FLASH {
            lines.push(format!(
                "And {} other events.",
                events.len() - MAXIMUM_EVENTS_TO_DISPLAY_IN_FLASH
            ));
        }
        Flash::Success(lines.join("\n"))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Flash::Success(_))
    }
}

impl fmt::Display for Flash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flash::Success(message) | Flash::Failure(message) => f.write_str(message),
        }
    }
}

/// Identifies an imported event across re-imports of the same source.
pub fn import_key(event: &AbstractEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.title.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(event.start_time.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(event.url.as_deref().unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn import_source(
    store: &Store,
    fetcher: &dyn Fetcher,
    url: &str,
    options: &ParseOptions,
) -> Result<ImportReport, ImportError> {
    let source = store.find_or_create_source_by_url(url)?;
    tracing::info!(source_id = source.id, url = %source.url, "importing source");

    let content = fetcher.fetch(&source.url).map_err(|err| ImportError::Fetch {
        url: source.url.clone(),
        message: format!("{err:#}"),
    })?;
    let options = ParseOptions {
        base_url: Some(source.url.clone()),
        ..options.clone()
    };
    let abstract_events = source_parser::to_abstract_events(&content, &options)?;

    // Events, venues and the import stamp land together or not at all.
    let tx = store.conn.unchecked_transaction().map_err(StoreError::from)?;
    let mut events = Vec::with_capacity(abstract_events.len());
    let (mut created, mut updated) = (0, 0);
    for abstract_event in &abstract_events {
        let mut draft = abstract_event.to_draft();
        if let Some(ref location) = abstract_event.location {
            let venue = store.find_or_create_venue_by_title(&location.title, Some(source.id))?;
            draft.venue_id = Some(venue.id);
        }

        let key = import_key(abstract_event);
        let event = match store.find_imported_event(source.id, &key)? {
            Some(existing) => {
                updated += 1;
                store.update_event(existing.id, &draft)?
            }
            None => {
                created += 1;
                store.insert_event(&draft, Some(source.id), Some(&key))?
            }
        };
        events.push(event);
    }

    let source = store.mark_imported(source.id)?;
    tx.commit().map_err(StoreError::from)?;
    tracing::info!(source_id = source.id, created, updated, "import finished");
    Ok(ImportReport {
        source,
        events,
        created,
        updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    struct StubFetcher(Result<String, String>);

    impl Fetcher for StubFetcher {
        fn fetch(&self, _url: &str) -> anyhow::Result<String> {
            self.0.clone().map_err(|err| anyhow::anyhow!(err))
        }
    }

    fn ics_with(count: usize) -> String {
        let mut ics = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:TEST\r\n");
        for i in 0..count {
            ics.push_str(&format!(
                "BEGIN:VEVENT\r\nUID:{i}\r\nSUMMARY:Event {i}\r\nDTSTART:20300101T1{i}0000Z\r\nLOCATION:Hall\r\nEND:VEVENT\r\n"
            ));
        }
        ics.push_str("END:VCALENDAR\r\n");
        ics
    }

    fn sample_event(title: &str) -> Event {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().expect("time");
        Event {
            id: 1,
            title: title.to_string(),
            description: None,
            url: None,
            start_time: at,
            end_time: None,
            venue_id: None,
            source_id: None,
            duplicate_of_id: None,
            tags: Vec::new(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn imports_events_and_venues() {
        let store = Store::open_in_memory().expect("store");
        let fetcher = StubFetcher(Ok(ics_with(3)));
        let report = import_source(&store, &fetcher, "example.com/feed.ics", &ParseOptions::default())
            .expect("import");

        assert_eq!(report.created, 3);
        assert_eq!(report.source.url, "http://example.com/feed.ics");
        assert!(report.source.imported_at.is_some());
        assert_eq!(store.events_for_source(report.source.id).expect("events").len(), 3);

        let venues = store.list_venues().expect("venues");
        assert_eq!(venues.len(), 1);
        assert_eq!(venues[0].title, "Hall");
        assert_eq!(venues[0].source_id, Some(report.source.id));
        assert!(report.events.iter().all(|e| e.venue_id == Some(venues[0].id)));
    }

    #[test]
    fn reimport_updates_instead_of_duplicating() {
        let store = Store::open_in_memory().expect("store");
        let fetcher = StubFetcher(Ok(ics_with(2)));
        let options = ParseOptions::default();
        let first = import_source(&store, &fetcher, "http://example.com/a.ics", &options).expect("import");
        let second = import_source(&store, &fetcher, "http://example.com/a.ics", &options).expect("import");

        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(first.source.id, second.source.id);
        assert_eq!(store.list_events(crate::db::EventOrder::StartTime).expect("list").len(), 2);
    }

    #[test]
    fn failed_import_leaves_nothing_behind() {
        let store = Store::open_in_memory().expect("store");
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_event_1 BEFORE INSERT ON events
                 WHEN NEW.title = 'Event 1'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .expect("trigger");
        let fetcher = StubFetcher(Ok(ics_with(3)));
        let result = import_source(&store, &fetcher, "http://example.com/a.ics", &ParseOptions::default());

        assert!(matches!(result, Err(ImportError::Store(StoreError::Sqlite(_)))));
        assert!(store.list_events(crate::db::EventOrder::StartTime).expect("list").is_empty());
        assert!(store.list_venues().expect("venues").is_empty());
        let sources = store.list_sources().expect("sources");
        assert_eq!(sources.len(), 1);
        assert!(sources[0].imported_at.is_none());
    }

    #[test]
    fn relative_hcal_links_resolve_against_the_source() {
        let store = Store::open_in_memory().expect("store");
        let fetcher = StubFetcher(Ok(r#"<div class="vevent"><a class="url summary" href="/events/9">Swap meet</a><abbr class="dtstart" title="2030-01-02">Jan 2</abbr></div>"#.to_string()));
        let report = import_source(&store, &fetcher, "http://example.com/list", &ParseOptions::default())
            .expect("import");

        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].url.as_deref(), Some("http://example.com/events/9"));
    }

    #[test]
    fn flash_caps_listed_titles() {
        let events: Vec<Event> = (0..MAXIMUM_EVENTS_TO_DISPLAY_IN_FLASH + 5)
            .map(|i| sample_event(&format!("Show {i}")))
            .collect();
        let flash = Flash::imported(&events);
        let text = flash.to_string();

        assert!(flash.is_success());
        assert!(text.starts_with("Imported 10 entries:"));
        assert!(text.contains("- Show 4"));
        assert!(!text.contains("- Show 5"));
        assert!(text.ends_with("And 5 other events."));
        assert_eq!(Flash::imported(&[]).to_string(), "Nothing to import");
    }

    #[test]
    fn failures_become_failure_flash() {
        let store = Store::open_in_memory().expect("store");
        let fetcher = StubFetcher(Err("bad".to_string()));
        let result = import_source(&store, &fetcher, "http://example.com/x", &ParseOptions::default());
        let flash = Flash::for_result(&result);

        assert!(!flash.is_success());
        assert!(flash.to_string().starts_with("Unable to import: "));
        assert!(flash.to_string().contains("bad"));

        let unrecognized = StubFetcher(Ok("<p>nothing here</p>".to_string()));
        let result = import_source(&store, &unrecognized, "http://example.com/y", &ParseOptions::default());
        assert!(matches!(result, Err(ImportError::Parse(ParseError::Unrecognized))));
    }

    #[test]
    fn import_key_depends_on_identity_fields() {
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().expect("time");
        let a = AbstractEvent::new("Show", None, start, None);
        let mut b = AbstractEvent::new("Show", Some("other description"), start, None);
        assert_eq!(import_key(&a), import_key(&b));
        b.url = Some("http://example.com".to_string());
        assert_ne!(import_key(&a), import_key(&b));
        assert_eq!(import_key(&a).len(), 64);
    }
}
