//! Event search behind a single, swappable engine selector.
//!
//! `sql` scans the events table with `LIKE` predicates and cannot rank;
//! `indexed` queries the FTS5 mirror kept by the store and scores with bm25.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::dates;
use crate::db::{Store, StoreResult};
use crate::models::Event;

const DEFAULT_LIMIT: usize = 50;

static KEYWORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid keyword regex"));

static ENGINE_KIND: Lazy<RwLock<SearchEngineKind>> =
    Lazy::new(|| RwLock::new(SearchEngineKind::default()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchEngineKind {
    #[default]
    Sql,
    Indexed,
}

impl FromStr for SearchEngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Ok(SearchEngineKind::Sql),
            "indexed" | "fts" => Ok(SearchEngineKind::Indexed),
            other => Err(format!("unknown search engine: {other}")),
        }
    }
}

impl fmt::Display for SearchEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchEngineKind::Sql => write!(f, "sql"),
            SearchEngineKind::Indexed => write!(f, "indexed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOrder {
    Score,
    Date,
    Name,
    Venue,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Drop events that started before yesterday.
    pub skip_old: bool,
    pub order: Option<SearchOrder>,
    pub limit: Option<usize>,
    /// Reference instant for `skip_old`; defaults to now.
    #[serde(skip)]
    pub now: Option<DateTime<Utc>>,
    /// Zone whose calendar days `skip_old` counts in; defaults to UTC.
    #[serde(skip)]
    pub tz: Option<Tz>,
}

impl SearchOptions {
    fn limit(&self) -> i64 {
        i64::try_from(self.limit.unwrap_or(DEFAULT_LIMIT)).unwrap_or(i64::MAX)
    }

    /// Start of yesterday in the search zone.
    fn skip_before(&self) -> Option<i64> {
        self.skip_old.then(|| {
            let tz = self.tz.unwrap_or(Tz::UTC);
            let today = dates::local_date(self.now.unwrap_or_else(Utc::now), tz);
            dates::start_of_day(today - Duration::days(1), tz).timestamp()
        })
    }
}

/// Escapes `LIKE` wildcards so keywords match literally under `ESCAPE '\'`.
fn like_pattern(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    escaped.push('%');
    for ch in keyword.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub event: Event,
    /// Relevance, higher is better. Only engines that can rank fill it in.
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupedResults {
    pub current: Vec<SearchHit>,
    pub past: Vec<SearchHit>,
}

pub trait SearchEngine: Send + Sync {
    fn kind(&self) -> SearchEngineKind;
    fn search(&self, store: &Store, query: &str, options: &SearchOptions) -> StoreResult<Vec<SearchHit>>;
    /// Whether hits carry a relevance score.
    fn score(&self) -> bool;
}

pub struct SqlSearch;

pub struct IndexedSearch;

static SQL_SEARCH: SqlSearch = SqlSearch;
static INDEXED_SEARCH: IndexedSearch = IndexedSearch;

pub fn kind() -> SearchEngineKind {
    match ENGINE_KIND.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Swaps the engine used by every later search.
pub fn set_kind(kind: SearchEngineKind) {
    let mut guard = match ENGINE_KIND.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if *guard != kind {
        tracing::info!(from = %*guard, to = %kind, "switching search engine");
    }
    *guard = kind;
}

pub fn engine_for(kind: SearchEngineKind) -> &'static dyn SearchEngine {
    match kind {
        SearchEngineKind::Sql => &SQL_SEARCH,
        SearchEngineKind::Indexed => &INDEXED_SEARCH,
    }
}

pub fn engine() -> &'static dyn SearchEngine {
    engine_for(kind())
}

pub fn search(store: &Store, query: &str, options: &SearchOptions) -> StoreResult<Vec<SearchHit>> {
    engine().search(store, query, options)
}

pub fn score() -> bool {
    engine().score()
}

/// Splits hits into events still current at `today` and those already past.
pub fn group_by_currentness(hits: Vec<SearchHit>, today: DateTime<Utc>) -> GroupedResults {
    let (current, past): (Vec<SearchHit>, Vec<SearchHit>) = hits
        .into_iter()
        .partition(|hit| hit.event.is_current(today));
    GroupedResults { current, past }
}

pub fn search_grouped_by_currentness(
    store: &Store,
    query: &str,
    options: &SearchOptions,
    today: DateTime<Utc>,
) -> StoreResult<GroupedResults> {
    Ok(group_by_currentness(search(store, query, options)?, today))
}

fn keywords(query: &str) -> Vec<String> {
    KEYWORD_RE
        .find_iter(query)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

impl SearchEngine for SqlSearch {
    fn kind(&self) -> SearchEngineKind {
        SearchEngineKind::Sql
    }

    fn search(&self, store: &Store, query: &str, options: &SearchOptions) -> StoreResult<Vec<SearchHit>> {
        let keywords = keywords(query);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let mut values: Vec<Value> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();
        for keyword in keywords {
            let like = values.len() + 1;
            let exact = values.len() + 2;
            clauses.push(format!(
                "LOWER(e.title) LIKE ?{like} ESCAPE '\\' \
                 OR LOWER(e.description) LIKE ?{like} ESCAPE '\\' \
                 OR LOWER(e.url) LIKE ?{like} ESCAPE '\\' \
                 OR e.id IN (SELECT event_id FROM event_tags WHERE LOWER(name) = ?{exact})"
            ));
            values.push(Value::Text(like_pattern(&keyword)));
            values.push(Value::Text(keyword));
        }

        let mut sql = format!(
            "SELECT e.* FROM events e LEFT JOIN venues v ON v.id = e.venue_id
             WHERE e.duplicate_of_id IS NULL AND ({})",
            clauses.join(" OR ")
        );
        if let Some(cutoff) = options.skip_before() {
            values.push(Value::Integer(cutoff));
            sql.push_str(&format!(" AND e.start_time >= ?{}", values.len()));
        }
        let order = match options.order {
            Some(SearchOrder::Date) => "e.start_time, e.id",
            Some(SearchOrder::Name) => "LOWER(e.title), e.start_time",
            Some(SearchOrder::Venue) => "LOWER(v.title), e.start_time",
            Some(SearchOrder::Score) | None => "e.start_time DESC, e.id DESC",
        };
        values.push(Value::Integer(options.limit()));
        sql.push_str(&format!(" ORDER BY {order} LIMIT ?{}", values.len()));

        let events = store.query_events(&sql, params_from_iter(values.iter()))?;
        Ok(events
            .into_iter()
            .map(|event| SearchHit { event, score: None })
            .collect())
    }

    fn score(&self) -> bool {
        false
    }
}

/// Quotes each keyword so FTS5 never sees operators from user input.
fn fts_query(query: &str) -> Option<String> {
    let terms = keywords(query)
        .into_iter()
        .map(|keyword| format!("\"{}\"", keyword.replace('"', "")))
        .collect::<Vec<_>>();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

impl SearchEngine for IndexedSearch {
    fn kind(&self) -> SearchEngineKind {
        SearchEngineKind::Indexed
    }

    fn search(&self, store: &Store, query: &str, options: &SearchOptions) -> StoreResult<Vec<SearchHit>> {
        let Some(matcher) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut values: Vec<Value> = vec![Value::Text(matcher)];
        let mut sql = String::from(
            "SELECT e.id, -bm25(events_fts) AS score FROM events_fts
             JOIN events e ON e.id = events_fts.rowid
             LEFT JOIN venues v ON v.id = e.venue_id
             WHERE events_fts MATCH ?1 AND e.duplicate_of_id IS NULL",
        );
        if let Some(cutoff) = options.skip_before() {
            values.push(Value::Integer(cutoff));
            sql.push_str(&format!(" AND e.start_time >= ?{}", values.len()));
        }
        let order = match options.order {
            Some(SearchOrder::Date) => "e.start_time, e.id",
            Some(SearchOrder::Name) => "LOWER(e.title), e.start_time",
            Some(SearchOrder::Venue) => "LOWER(v.title), e.start_time",
            Some(SearchOrder::Score) | None => "score DESC, e.start_time",
        };
        values.push(Value::Integer(options.limit()));
        sql.push_str(&format!(" ORDER BY {order} LIMIT ?{}", values.len()));

        let mut stmt = store.conn.prepare(&sql)?;
        let scored = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        scored
            .into_iter()
            .map(|(id, score)| {
                Ok(SearchHit {
                    event: store.get_event(id)?,
                    score: Some(score),
                })
            })
            .collect()
    }

    fn score(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventDraft;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("valid time")
    }

    fn seeded() -> Store {
        let store = Store::open_in_memory().expect("store");
        for (title, description, tags, start) in [
            ("Ruby Meetup", "Monthly ruby hacking", "ruby, code", at(2008, 4, 20, 18)),
            ("Rust Night", "Systems programming", "rust", at(2008, 4, 10, 18)),
            ("Potluck", "Bring food about ruby", "", at(2008, 3, 1, 18)),
            ("Knitting Circle", "Yarn", "craft", at(2008, 4, 21, 18)),
        ] {
            store
                .create_event(&EventDraft {
                    title: title.to_string(),
                    description: Some(description.to_string()),
                    start_time: Some(start),
                    tag_list: tags.to_string(),
                    ..EventDraft::default()
                })
                .expect("seed event");
        }
        store
    }

    fn ids(hits: &[SearchHit]) -> Vec<i64> {
        hits.iter().map(|hit| hit.event.id).collect()
    }

    fn titles(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|hit| hit.event.title.as_str()).collect()
    }

    #[test]
    fn engines_report_scoring() {
        assert!(!engine_for(SearchEngineKind::Sql).score());
        assert!(engine_for(SearchEngineKind::Indexed).score());
        assert_eq!(engine_for(SearchEngineKind::Indexed).kind(), SearchEngineKind::Indexed);
        assert_eq!("fts".parse::<SearchEngineKind>(), Ok(SearchEngineKind::Indexed));
        assert!("solr".parse::<SearchEngineKind>().is_err());
    }

    #[test]
    fn no_matches_is_empty_for_both_engines() {
        let store = seeded();
        for kind in [SearchEngineKind::Sql, SearchEngineKind::Indexed] {
            let engine = engine_for(kind);
            assert!(engine
                .search(&store, "myquery", &SearchOptions::default())
                .expect("search")
                .is_empty());
            assert!(engine
                .search(&store, "  !! ", &SearchOptions::default())
                .expect("blank search")
                .is_empty());
        }
    }

    #[test]
    fn sql_search_matches_text_and_tags_newest_first() {
        let store = seeded();
        let hits = SqlSearch
            .search(&store, "ruby", &SearchOptions::default())
            .expect("search");
        assert_eq!(titles(&hits), vec!["Ruby Meetup", "Potluck"]);
        assert!(hits.iter().all(|hit| hit.score.is_none()));

        let by_tag = SqlSearch
            .search(&store, "CRAFT", &SearchOptions::default())
            .expect("tag search");
        assert_eq!(titles(&by_tag), vec!["Knitting Circle"]);

        let either = SqlSearch
            .search(
                &store,
                "rust knitting",
                &SearchOptions {
                    order: Some(SearchOrder::Name),
                    ..SearchOptions::default()
                },
            )
            .expect("or search");
        assert_eq!(titles(&either), vec!["Knitting Circle", "Rust Night"]);
    }

    #[test]
    fn skip_old_and_limit() {
        let store = seeded();
        let options = SearchOptions {
            skip_old: true,
            now: Some(at(2008, 4, 15, 12)),
            ..SearchOptions::default()
        };
        let hits = SqlSearch.search(&store, "ruby", &options).expect("search");
        assert_eq!(titles(&hits), vec!["Ruby Meetup"]);

        let hits = IndexedSearch.search(&store, "ruby", &options).expect("search");
        assert_eq!(titles(&hits), vec!["Ruby Meetup"]);

        let yesterday_morning = store
            .create_event(&EventDraft {
                title: "Ruby Brunch".to_string(),
                start_time: Some(at(2008, 4, 14, 8)),
                ..EventDraft::default()
            })
            .expect("event");
        let hits = SqlSearch.search(&store, "brunch", &options).expect("search");
        assert_eq!(ids(&hits), vec![yesterday_morning.id]);
        let hits = IndexedSearch.search(&store, "brunch", &options).expect("search");
        assert_eq!(ids(&hits), vec![yesterday_morning.id]);

        // Kiritimati is already on the 16th, so its yesterday starts at 10:00Z on the 14th.
        let in_kiritimati = SearchOptions {
            tz: Some(chrono_tz::Pacific::Kiritimati),
            ..options.clone()
        };
        let hits = SqlSearch
            .search(&store, "brunch", &in_kiritimati)
            .expect("search");
        assert!(hits.is_empty());

        let limited = SqlSearch
            .search(
                &store,
                "ruby",
                &SearchOptions {
                    limit: Some(1),
                    ..SearchOptions::default()
                },
            )
            .expect("search");
        assert_eq!(limited.len(), 1);

        let unbounded = SqlSearch
            .search(
                &store,
                "ruby",
                &SearchOptions {
                    limit: Some(usize::MAX),
                    ..SearchOptions::default()
                },
            )
            .expect("search");
        assert_eq!(unbounded.len(), 3);
    }

    #[test]
    fn like_wildcards_in_keywords_match_literally() {
        let store = seeded();
        for title in ["snake_case talk", "snakexcase talk"] {
            store
                .create_event(&EventDraft {
                    title: title.to_string(),
                    start_time: Some(at(2008, 5, 1, 18)),
                    ..EventDraft::default()
                })
                .expect("event");
        }
        let hits = SqlSearch
            .search(&store, "snake_case", &SearchOptions::default())
            .expect("search");
        assert_eq!(titles(&hits), vec!["snake_case talk"]);
    }

    #[test]
    fn indexed_search_ranks_with_scores() {
        let store = seeded();
        let hits = IndexedSearch
            .search(&store, "ruby", &SearchOptions::default())
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.score.is_some()));
        let scores: Vec<f64> = hits.iter().filter_map(|hit| hit.score).collect();
        assert!(scores.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[test]
    fn duplicates_are_hidden_from_search() {
        let store = seeded();
        let copy = store
            .create_event(&EventDraft {
                title: "Ruby Meetup".to_string(),
                start_time: Some(at(2008, 4, 20, 18)),
                ..EventDraft::default()
            })
            .expect("copy");
        let master = SqlSearch
            .search(&store, "meetup", &SearchOptions::default())
            .expect("search");
        assert_eq!(master.len(), 2);
        let original = master
            .iter()
            .find(|hit| hit.event.id != copy.id)
            .expect("original")
            .event
            .id;
        store.squash_events(original, &[copy.id]).expect("squash");
        for kind in [SearchEngineKind::Sql, SearchEngineKind::Indexed] {
            let hits = engine_for(kind)
                .search(&store, "meetup", &SearchOptions::default())
                .expect("search");
            assert_eq!(hits.len(), 1);
        }
    }

    #[test]
    fn groups_by_currentness() {
        let store = seeded();
        let hits = SqlSearch
            .search(&store, "ruby rust", &SearchOptions::default())
            .expect("search");
        let grouped = group_by_currentness(hits, at(2008, 4, 15, 0));
        assert_eq!(titles(&grouped.current), vec!["Ruby Meetup"]);
        assert_eq!(titles(&grouped.past), vec!["Rust Night", "Potluck"]);
    }

    #[test]
    fn global_selector_swaps_engines() {
        let before = kind();
        set_kind(SearchEngineKind::Indexed);
        assert!(score());
        assert_eq!(engine().kind(), SearchEngineKind::Indexed);
        set_kind(SearchEngineKind::Sql);
        assert!(!score());
        set_kind(before);
    }
}
