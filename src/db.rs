use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::dates::{DateRange, Overview, Today};
use crate::models::{
    choose_venue, Event, EventDraft, Source, SourceDraft, ValidationErrors, Venue, VenueDraft,
    VenueRef,
};
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("cannot squash {kind} {id}: {reason}")]
    Squash {
        kind: &'static str,
        id: i64,
        reason: &'static str,
    },
    #[error("unknown field: {0}")]
    UnknownField(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sources(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT,
        url TEXT NOT NULL,
        imported_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS venues(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT,
        address TEXT,
        url TEXT,
        duplicate_of_id INTEGER,
        source_id INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS events(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT,
        url TEXT,
        start_time INTEGER NOT NULL,
        end_time INTEGER,
        venue_id INTEGER,
        source_id INTEGER,
        duplicate_of_id INTEGER,
        import_key TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS event_tags(
        event_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        PRIMARY KEY (event_id, position)
    );
    CREATE INDEX IF NOT EXISTS events_start_time ON events(start_time);
    CREATE INDEX IF NOT EXISTS events_import_key ON events(source_id, import_key);
    CREATE INDEX IF NOT EXISTS event_tags_name ON event_tags(name);
    CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(title, description, url, tags);
";

/// Columns the duplicate finder may compare on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateField {
    Title,
    Description,
    Url,
    StartTime,
    EndTime,
    VenueId,
}

impl DuplicateField {
    pub fn column(self) -> &'static str {
        match self {
            DuplicateField::Title => "title",
            DuplicateField::Description => "description",
            DuplicateField::Url => "url",
            DuplicateField::StartTime => "start_time",
            DuplicateField::EndTime => "end_time",
            DuplicateField::VenueId => "venue_id",
        }
    }

    /// Parses `"title,url"` into its fields, keeping the given order.
    pub fn parse_list(input: &str) -> StoreResult<Vec<DuplicateField>> {
        input
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(DuplicateField::from_str)
            .collect()
    }
}

impl FromStr for DuplicateField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "title" => Ok(DuplicateField::Title),
            "description" => Ok(DuplicateField::Description),
            "url" => Ok(DuplicateField::Url),
            "start_time" => Ok(DuplicateField::StartTime),
            "end_time" => Ok(DuplicateField::EndTime),
            "venue_id" => Ok(DuplicateField::VenueId),
            other => Err(StoreError::UnknownField(other.to_string())),
        }
    }
}

/// Builds the self-join that finds events sharing every given field.
pub fn duplicates_sql(fields: &[DuplicateField]) -> String {
    let matches = fields
        .iter()
        .map(|field| format!("a.{col} = b.{col}", col = field.column()))
        .collect::<Vec<_>>()
        .join(" AND ");
    let order = fields
        .iter()
        .map(|field| format!("a.{}", field.column()))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "SELECT DISTINCT a.* from events a, events b WHERE a.id <> b.id AND ( {matches} ) ORDER BY {order}"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrder {
    #[default]
    StartTime,
    EndTime,
    Title,
    Venue,
}

impl EventOrder {
    fn sql(self) -> &'static str {
        match self {
            EventOrder::StartTime => "e.start_time, e.id",
            EventOrder::EndTime => "e.end_time, e.start_time, e.id",
            EventOrder::Title => "LOWER(e.title), e.start_time, e.id",
            EventOrder::Venue => "LOWER(v.title), e.start_time, e.id",
        }
    }
}

impl FromStr for EventOrder {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_time" | "date" => Ok(EventOrder::StartTime),
            "end_time" => Ok(EventOrder::EndTime),
            "title" | "name" => Ok(EventOrder::Title),
            "venue" => Ok(EventOrder::Venue),
            other => Err(StoreError::UnknownField(other.to_string())),
        }
    }
}

/// Two stored events that agree on the compared fields.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicatePair {
    pub original: Event,
    pub duplicate: Event,
}

pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        utils::ensure_parent(path);
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(SCHEMA)
    }

    // Events

    pub fn create_event(&self, draft: &EventDraft) -> StoreResult<Event> {
        self.insert_event(draft, None, None)
    }

    pub(crate) fn insert_event(
        &self,
        draft: &EventDraft,
        source_id: Option<i64>,
        import_key: Option<&str>,
    ) -> StoreResult<Event> {
        let draft = draft.clone().normalized();
        let start = draft.validate()?;
        if let Some(venue_id) = draft.venue_id {
            self.get_venue(venue_id)?;
        }
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO events (title, description, url, start_time, end_time, venue_id,
                                 source_id, import_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                draft.title,
                draft.description,
                draft.url,
                start.timestamp(),
                draft.end_time.map(|end| end.timestamp()),
                draft.venue_id,
                source_id,
                import_key,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.write_tags(id, &draft.tags())?;
        let event = self.get_event(id)?;
        self.index_event(&event)?;
        tracing::debug!(event_id = id, title = %event.title, "created event");
        Ok(event)
    }

    pub fn update_event(&self, id: i64, draft: &EventDraft) -> StoreResult<Event> {
        self.get_event(id)?;
        let draft = draft.clone().normalized();
        let start = draft.validate()?;
        if let Some(venue_id) = draft.venue_id {
            self.get_venue(venue_id)?;
        }
        self.conn.execute(
            "UPDATE events SET title = ?2, description = ?3, url = ?4, start_time = ?5,
                               end_time = ?6, venue_id = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                id,
                draft.title,
                draft.description,
                draft.url,
                start.timestamp(),
                draft.end_time.map(|end| end.timestamp()),
                draft.venue_id,
                Utc::now(),
            ],
        )?;
        self.write_tags(id, &draft.tags())?;
        let event = self.get_event(id)?;
        self.index_event(&event)?;
        Ok(event)
    }

    pub fn find_event(&self, id: i64) -> StoreResult<Option<Event>> {
        let event = self
            .conn
            .query_row("SELECT * FROM events WHERE id = ?1", params![id], event_from_row)
            .optional()?;
        match event {
            Some(event) => Ok(self.with_tags(vec![event])?.pop()),
            None => Ok(None),
        }
    }

    pub fn get_event(&self, id: i64) -> StoreResult<Event> {
        self.find_event(id)?
            .ok_or(StoreError::NotFound { kind: "event", id })
    }

    pub fn list_events(&self, order: EventOrder) -> StoreResult<Vec<Event>> {
        let sql = format!(
            "SELECT e.* FROM events e LEFT JOIN venues v ON v.id = e.venue_id
             WHERE e.duplicate_of_id IS NULL ORDER BY {}",
            order.sql()
        );
        self.query_events(&sql, [])
    }

    pub fn events_for_source(&self, source_id: i64) -> StoreResult<Vec<Event>> {
        self.query_events(
            "SELECT e.* FROM events e WHERE e.source_id = ?1 ORDER BY e.start_time, e.id",
            params![source_id],
        )
    }

    pub fn delete_event(&self, id: i64) -> StoreResult<()> {
        self.get_event(id)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM event_tags WHERE event_id = ?1", params![id])?;
        tx.execute("DELETE FROM events_fts WHERE rowid = ?1", params![id])?;
        tx.execute(
            "UPDATE events SET duplicate_of_id = NULL WHERE duplicate_of_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Points the event at a venue. Returns the venue the event ends up with.
    pub fn associate_with_venue(&self, event_id: i64, venue: VenueRef) -> StoreResult<Option<Venue>> {
        let event = self.get_event(event_id)?;
        let current = match event.venue_id {
            Some(id) => self.find_venue(id)?,
            None => None,
        };
        let chosen = match venue {
            VenueRef::None => None,
            VenueRef::Venue(candidate) => Some(choose_venue(current, candidate)),
            VenueRef::Title(title) => Some(choose_venue(
                current,
                self.find_or_create_venue_by_title(&title, None)?,
            )),
            VenueRef::Id(id) => Some(choose_venue(current, self.get_venue(id)?)),
        };
        self.conn.execute(
            "UPDATE events SET venue_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![event_id, chosen.as_ref().map(|v| v.id), Utc::now()],
        )?;
        Ok(chosen)
    }

    /// Finds an event a previous import of `source_id` produced under `import_key`.
    pub(crate) fn find_imported_event(
        &self,
        source_id: i64,
        import_key: &str,
    ) -> StoreResult<Option<Event>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM events WHERE source_id = ?1 AND import_key = ?2",
                params![source_id, import_key],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.find_event(id),
            None => Ok(None),
        }
    }

    fn write_tags(&self, event_id: i64, tags: &[String]) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM event_tags WHERE event_id = ?1", params![event_id])?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO event_tags (event_id, position, name) VALUES (?1, ?2, ?3)")?;
        for (position, name) in tags.iter().enumerate() {
            stmt.execute(params![event_id, position as i64, name])?;
        }
        Ok(())
    }

    fn with_tags(&self, mut events: Vec<Event>) -> StoreResult<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM event_tags WHERE event_id = ?1 ORDER BY position")?;
        for event in &mut events {
            let rows = stmt.query_map(params![event.id], |row| row.get::<_, String>(0))?;
            event.tags = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        }
        Ok(events)
    }

    fn index_event(&self, event: &Event) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM events_fts WHERE rowid = ?1", params![event.id])?;
        self.conn.execute(
            "INSERT INTO events_fts (rowid, title, description, url, tags)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                event.title,
                event.description,
                event.url,
                event.tags.join(" "),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn query_events<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> StoreResult<Vec<Event>> {
        let mut stmt = self.conn.prepare(sql)?;
        let events = stmt
            .query_map(params, event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.with_tags(events)
    }

    // Duplicates

    /// Events that share every field in `fields` with some other event.
    pub fn find_duplicates_by(&self, fields: &[DuplicateField]) -> StoreResult<Vec<Event>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        self.query_events(&duplicates_sql(fields), [])
    }

    /// Every unordered pair of events agreeing on `fields`, lower id first.
    pub fn find_duplicate_pairs(&self, fields: &[DuplicateField]) -> StoreResult<Vec<DuplicatePair>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let matches = fields
            .iter()
            .map(|field| format!("a.{col} = b.{col}", col = field.column()))
            .collect::<Vec<_>>()
            .join(" AND ");
        let order = fields
            .iter()
            .map(|field| format!("a.{}", field.column()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT a.id, b.id FROM events a, events b
             WHERE a.id < b.id AND ( {matches} ) ORDER BY {order}, a.id, b.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.into_iter()
            .map(|(original, duplicate)| {
                Ok(DuplicatePair {
                    original: self.get_event(original)?,
                    duplicate: self.get_event(duplicate)?,
                })
            })
            .collect()
    }

    /// Marks `duplicate_ids` as duplicates of `master_id`. Nothing is deleted.
    pub fn squash_events(&self, master_id: i64, duplicate_ids: &[i64]) -> StoreResult<Vec<Event>> {
        let master = self.get_event(master_id)?;
        if master.is_duplicate() {
            return Err(StoreError::Squash {
                kind: "event",
                id: master_id,
                reason: "target is itself a duplicate",
            });
        }
        for &id in duplicate_ids {
            if id == master_id {
                return Err(StoreError::Squash {
                    kind: "event",
                    id,
                    reason: "cannot be a duplicate of itself",
                });
            }
            self.get_event(id)?;
        }

        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        for &id in duplicate_ids {
            tx.execute(
                "UPDATE events SET duplicate_of_id = ?1, updated_at = ?3
                 WHERE id = ?2 OR duplicate_of_id = ?2",
                params![master_id, id, now],
            )?;
        }
        tx.commit()?;
        tracing::info!(master_id, count = duplicate_ids.len(), "squashed duplicate events");

        duplicate_ids.iter().map(|&id| self.get_event(id)).collect()
    }

    // Date ranges

    /// Non-duplicate events starting inside `range` or still running when it opens.
    pub fn find_by_dates(&self, range: DateRange, order: EventOrder) -> StoreResult<Vec<Event>> {
        let sql = format!(
            "SELECT e.* FROM events e LEFT JOIN venues v ON v.id = e.venue_id
             WHERE e.duplicate_of_id IS NULL AND (
                 (e.start_time >= :start AND e.start_time < :end)
                 OR (e.start_time < :start AND e.end_time IS NOT NULL AND e.end_time >= :start)
             )
             ORDER BY {}",
            order.sql()
        );
        self.query_events(
            &sql,
            named_params! {
                ":start": range.start.timestamp(),
                ":end": range.end.timestamp(),
            },
        )
    }

    /// Events starting today or later, plus those still running today.
    pub fn find_future_events(&self, today: DateTime<Utc>, order: EventOrder) -> StoreResult<Vec<Event>> {
        let sql = format!(
            "SELECT e.* FROM events e LEFT JOIN venues v ON v.id = e.venue_id
             WHERE e.duplicate_of_id IS NULL AND (
                 e.start_time >= :today OR (e.end_time IS NOT NULL AND e.end_time >= :today)
             )
             ORDER BY {}",
            order.sql()
        );
        self.query_events(&sql, named_params! { ":today": today.timestamp() })
    }

    pub fn select_for_overview(&self, today: &Today) -> StoreResult<Overview> {
        let events = self.find_by_dates(today.overview_range(), EventOrder::StartTime)?;
        let more = self
            .query_events(
                "SELECT e.* FROM events e
                 WHERE e.duplicate_of_id IS NULL AND e.start_time >= ?1
                 ORDER BY e.start_time, e.id LIMIT 1",
                params![today.cutoff.timestamp()],
            )?
            .pop();
        Ok(Overview::from_events(events, today, more))
    }

    // Venues

    pub fn create_venue(&self, draft: &VenueDraft) -> StoreResult<Venue> {
        self.insert_venue(draft, None)
    }

    fn insert_venue(&self, draft: &VenueDraft, source_id: Option<i64>) -> StoreResult<Venue> {
        let draft = draft.clone().normalized();
        draft.validate()?;
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO venues (title, description, address, url, source_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![draft.title, draft.description, draft.address, draft.url, source_id, now],
        )?;
        self.get_venue(self.conn.last_insert_rowid())
    }

    pub fn update_venue(&self, id: i64, draft: &VenueDraft) -> StoreResult<Venue> {
        self.get_venue(id)?;
        let draft = draft.clone().normalized();
        draft.validate()?;
        self.conn.execute(
            "UPDATE venues SET title = ?2, description = ?3, address = ?4, url = ?5, updated_at = ?6
             WHERE id = ?1",
            params![id, draft.title, draft.description, draft.address, draft.url, Utc::now()],
        )?;
        self.get_venue(id)
    }

    pub fn find_venue(&self, id: i64) -> StoreResult<Option<Venue>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM venues WHERE id = ?1", params![id], venue_from_row)
            .optional()?)
    }

    pub fn get_venue(&self, id: i64) -> StoreResult<Venue> {
        self.find_venue(id)?
            .ok_or(StoreError::NotFound { kind: "venue", id })
    }

    pub fn list_venues(&self) -> StoreResult<Vec<Venue>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM venues WHERE duplicate_of_id IS NULL ORDER BY LOWER(title), id",
        )?;
        let venues = stmt
            .query_map([], venue_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(venues)
    }

    pub fn find_or_create_venue_by_title(
        &self,
        title: &str,
        source_id: Option<i64>,
    ) -> StoreResult<Venue> {
        let draft = VenueDraft::titled(title);
        let existing = self
            .conn
            .query_row(
                "SELECT * FROM venues WHERE title = ?1 AND duplicate_of_id IS NULL
                 ORDER BY id LIMIT 1",
                params![draft.title],
                venue_from_row,
            )
            .optional()?;
        match existing {
            Some(venue) => Ok(venue),
            None => self.insert_venue(&draft, source_id),
        }
    }

    pub fn delete_venue(&self, id: i64) -> StoreResult<()> {
        self.get_venue(id)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("UPDATE events SET venue_id = NULL WHERE venue_id = ?1", params![id])?;
        tx.execute(
            "UPDATE venues SET duplicate_of_id = NULL WHERE duplicate_of_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM venues WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Marks venues as duplicates of `master_id` and moves their events over.
    pub fn squash_venues(&self, master_id: i64, duplicate_ids: &[i64]) -> StoreResult<Vec<Venue>> {
        let master = self.get_venue(master_id)?;
        if master.is_duplicate() {
            return Err(StoreError::Squash {
                kind: "venue",
                id: master_id,
                reason: "target is itself a duplicate",
            });
        }
        for &id in duplicate_ids {
            if id == master_id {
                return Err(StoreError::Squash {
                    kind: "venue",
                    id,
                    reason: "cannot be a duplicate of itself",
                });
            }
            self.get_venue(id)?;
        }

        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        for &id in duplicate_ids {
            tx.execute(
                "UPDATE venues SET duplicate_of_id = ?1, updated_at = ?3
                 WHERE id = ?2 OR duplicate_of_id = ?2",
                params![master_id, id, now],
            )?;
            tx.execute(
                "UPDATE events SET venue_id = ?1, updated_at = ?3 WHERE venue_id = ?2",
                params![master_id, id, now],
            )?;
        }
        tx.commit()?;
        tracing::info!(master_id, count = duplicate_ids.len(), "squashed duplicate venues");

        duplicate_ids.iter().map(|&id| self.get_venue(id)).collect()
    }

    // Sources

    pub fn create_source(&self, draft: &SourceDraft) -> StoreResult<Source> {
        let draft = draft.clone().normalized();
        draft.validate()?;
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO sources (title, url, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![draft.title, draft.url, now],
        )?;
        self.get_source(self.conn.last_insert_rowid())
    }

    pub fn update_source(&self, id: i64, draft: &SourceDraft) -> StoreResult<Source> {
        self.get_source(id)?;
        let draft = draft.clone().normalized();
        draft.validate()?;
        self.conn.execute(
            "UPDATE sources SET title = ?2, url = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, draft.title, draft.url, Utc::now()],
        )?;
        self.get_source(id)
    }

    pub fn find_source(&self, id: i64) -> StoreResult<Option<Source>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM sources WHERE id = ?1", params![id], source_from_row)
            .optional()?)
    }

    pub fn get_source(&self, id: i64) -> StoreResult<Source> {
        self.find_source(id)?
            .ok_or(StoreError::NotFound { kind: "source", id })
    }

    pub fn list_sources(&self) -> StoreResult<Vec<Source>> {
        let mut stmt = self.conn.prepare("SELECT * FROM sources ORDER BY id")?;
        let sources = stmt
            .query_map([], source_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }

    pub fn find_or_create_source_by_url(&self, url: &str) -> StoreResult<Source> {
        let draft = SourceDraft::for_url(url);
        draft.validate()?;
        let existing = self
            .conn
            .query_row(
                "SELECT * FROM sources WHERE url = ?1 ORDER BY id LIMIT 1",
                params![draft.url],
                source_from_row,
            )
            .optional()?;
        match existing {
            Some(source) => Ok(source),
            None => self.create_source(&draft),
        }
    }

    pub fn mark_imported(&self, source_id: i64) -> StoreResult<Source> {
        let now = Utc::now();
        self.conn.execute(
            "UPDATE sources SET imported_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![source_id, now],
        )?;
        self.get_source(source_id)
    }

    pub fn delete_source(&self, id: i64) -> StoreResult<()> {
        self.get_source(id)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("UPDATE events SET source_id = NULL WHERE source_id = ?1", params![id])?;
        tx.execute("UPDATE venues SET source_id = NULL WHERE source_id = ?1", params![id])?;
        tx.execute("DELETE FROM sources WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

fn instant(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(column)?;
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp {secs} out of range").into(),
        )
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let end_time = match row.get::<_, Option<i64>>("end_time")? {
        Some(_) => Some(instant(row, "end_time")?),
        None => None,
    };
    Ok(Event {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        url: row.get("url")?,
        start_time: instant(row, "start_time")?,
        end_time,
        venue_id: row.get("venue_id")?,
        source_id: row.get("source_id")?,
        duplicate_of_id: row.get("duplicate_of_id")?,
        tags: Vec::new(),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn venue_from_row(row: &Row<'_>) -> rusqlite::Result<Venue> {
    Ok(Venue {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        address: row.get("address")?,
        url: row.get("url")?,
        duplicate_of_id: row.get("duplicate_of_id")?,
        source_id: row.get("source_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get("id")?,
        title: row.get("title")?,
        url: row.get("url")?,
        imported_at: row.get("imported_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
