//! JSON HTTP surface over the store, search engines, importer and exports.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{AppConfig, ConfigStore};
use crate::dates::{DateRange, Today};
use crate::db::{DuplicateField, EventOrder, Store, StoreError};
use crate::import::{self, Fetcher, Flash};
use crate::models::{Event, EventDraft, SourceDraft, VenueDraft, VenueRef};
use crate::search::{self, SearchEngineKind, SearchHit, SearchOptions, SearchOrder};
use crate::source_parser::{self, hcal, ical, ParseOptions, ParserInfo};

pub struct AppState {
    pub config: ConfigStore,
    pub fetcher: Arc<dyn Fetcher>,
}

type SharedState = Arc<AppState>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Store(StoreError::Invalid(errors)) => {
                let body = serde_json::json!({ "errors": errors.0 });
                return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
            }
            ApiError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Squash { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Store(StoreError::UnknownField(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(StoreError::Sqlite(_)) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        let body = Json(ErrorBody {
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs `work` against a freshly opened store on the blocking pool.
async fn with_store<T, F>(state: &SharedState, work: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Store, &AppConfig) -> ApiResult<T> + Send + 'static,
{
    let config = state.config.read();
    tokio::task::spawn_blocking(move || {
        let store = Store::open(&config.database_path())?;
        work(&store, &config)
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?
}

fn parse_id(raw: &str) -> ApiResult<i64> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid id: {raw}")))
}

fn calendar_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/calendar; charset=utf-8")], body).into_response()
}

fn html_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/events", get(list_events).post(create_event))
        .route("/events.ics", get(events_ics))
        .route("/events/search", get(search_events))
        .route("/events/overview", get(overview))
        .route("/events/duplicates", get(duplicate_events))
        .route("/events/squash", post(squash_events))
        .route(
            "/events/{id}",
            get(show_event).put(update_event).delete(delete_event),
        )
        .route("/events/{id}/hcal", get(event_hcal))
        .route("/events/{id}/venue", put(assign_venue))
        .route("/venues", get(list_venues).post(create_venue))
        .route("/venues/squash", post(squash_venues))
        .route(
            "/venues/{id}",
            get(show_venue).put(update_venue).delete(delete_venue),
        )
        .route("/sources", get(list_sources).post(create_source))
        .route("/sources/import", post(import_source))
        .route("/sources/parsers", get(list_parsers))
        .route(
            "/sources/{id}",
            get(show_source).put(update_source).delete(delete_source),
        )
        .route("/search_engine", get(show_search_engine).put(set_search_engine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(config: ConfigStore, fetcher: Arc<dyn Fetcher>) -> anyhow::Result<()> {
    let settings = config.read();
    search::set_kind(settings.search_engine);
    let db_path = settings.database_path();
    tokio::task::spawn_blocking(move || Store::open(&db_path).map(|_| ())).await??;

    let state = Arc::new(AppState { config, fetcher });
    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    tracing::info!(address = %settings.bind_address, engine = %settings.search_engine, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("unable to listen for shutdown signal: {err}");
            }
        })
        .await?;
    Ok(())
}

// Events

#[derive(Deserialize, Default)]
#[serde(default)]
struct ListParams {
    order: Option<String>,
    /// `upcoming` limits the list to events that are not over yet.
    filter: Option<String>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
}

async fn list_events(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let order = match params.order {
        Some(ref raw) => raw.parse::<EventOrder>()?,
        None => EventOrder::StartTime,
    };
    with_store(&state, move |store, config| {
        let tz = config.tz();
        let events = match (params.start_date, params.end_date, params.filter.as_deref()) {
            (Some(first), last, _) => {
                let last = last.unwrap_or(first);
                if last < first {
                    return Err(ApiError::BadRequest("end_date is before start_date".to_string()));
                }
                store.find_by_dates(DateRange::days(first, last, tz), order)?
            }
            (None, Some(_), _) => {
                return Err(ApiError::BadRequest("end_date needs a start_date".to_string()))
            }
            (None, None, Some("upcoming")) => {
                store.find_future_events(Today::at(Utc::now(), tz).start, order)?
            }
            (None, None, Some(other)) => {
                return Err(ApiError::BadRequest(format!("unknown filter: {other}")))
            }
            (None, None, None) => store.list_events(order)?,
        };
        Ok(Json(events))
    })
    .await
}

async fn create_event(
    State(state): State<SharedState>,
    Json(draft): Json<EventDraft>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    with_store(&state, move |store, _| {
        Ok((StatusCode::CREATED, Json(store.create_event(&draft)?)))
    })
    .await
}

/// `GET /events/{id}` answers JSON, or iCalendar when the id ends in `.ics`.
async fn show_event(State(state): State<SharedState>, Path(raw): Path<String>) -> ApiResult<Response> {
    match raw.strip_suffix(".ics") {
        Some(id) => {
            let id = parse_id(id)?;
            with_store(&state, move |store, config| {
                let event = store.get_event(id)?;
                Ok(calendar_response(export_ical(store, config, &[event])?))
            })
            .await
        }
        None => {
            let id = parse_id(&raw)?;
            with_store(&state, move |store, _| Ok(Json(store.get_event(id)?).into_response())).await
        }
    }
}

async fn update_event(
    State(state): State<SharedState>,
    Path(raw): Path<String>,
    Json(draft): Json<EventDraft>,
) -> ApiResult<Json<Event>> {
    let id = parse_id(&raw)?;
    with_store(&state, move |store, _| Ok(Json(store.update_event(id, &draft)?))).await
}

async fn delete_event(State(state): State<SharedState>, Path(raw): Path<String>) -> ApiResult<StatusCode> {
    let id = parse_id(&raw)?;
    with_store(&state, move |store, _| {
        store.delete_event(id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct VenueAssignment {
    venue_id: Option<i64>,
    venue_title: Option<String>,
}

/// Sets or clears an event's venue by id or by title.
async fn assign_venue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<VenueAssignment>,
) -> ApiResult<Response> {
    let venue = match (body.venue_id, body.venue_title) {
        (Some(venue_id), _) => VenueRef::Id(venue_id),
        (None, Some(title)) if !title.trim().is_empty() => VenueRef::Title(title),
        _ => VenueRef::None,
    };
    with_store(&state, move |store, _| {
        let venue = store.associate_with_venue(id, venue)?;
        Ok(Json(serde_json::json!({ "event": store.get_event(id)?, "venue": venue })).into_response())
    })
    .await
}

async fn event_hcal(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<Response> {
    with_store(&state, move |store, _| {
        let event = store.get_event(id)?;
        let venue = match event.venue_id {
            Some(venue_id) => store.find_venue(venue_id)?,
            None => None,
        };
        Ok(html_response(hcal::to_hcal(&event, venue.as_ref())))
    })
    .await
}

async fn events_ics(State(state): State<SharedState>) -> ApiResult<Response> {
    with_store(&state, |store, config| {
        let events = store.list_events(EventOrder::StartTime)?;
        Ok(calendar_response(export_ical(store, config, &events)?))
    })
    .await
}

fn export_ical(store: &Store, config: &AppConfig, events: &[Event]) -> ApiResult<String> {
    let mut venues = Vec::with_capacity(events.len());
    for event in events {
        venues.push(match event.venue_id {
            Some(id) => store.find_venue(id)?,
            None => None,
        });
    }
    let entries: Vec<ical::CalendarEntry<'_>> = events
        .iter()
        .zip(venues.iter())
        .map(|(event, venue)| ical::CalendarEntry {
            event,
            venue: venue.as_ref(),
        })
        .collect();
    let url_helper: &dyn Fn(&Event) -> String = &|event| config.event_url(event.id);
    Ok(ical::to_ical(&entries, Some(url_helper)))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SearchParams {
    q: String,
    order: Option<SearchOrder>,
    skip_old: Option<bool>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    current: Vec<SearchHit>,
    past: Vec<SearchHit>,
    score: bool,
}

async fn search_events(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    with_store(&state, move |store, config| {
        let now = Utc::now();
        let options = SearchOptions {
            skip_old: params.skip_old.unwrap_or(false),
            order: params.order,
            limit: params.limit,
            now: Some(now),
            tz: Some(config.tz()),
        };
        let today = Today::at(now, config.tz());
        let grouped = search::search_grouped_by_currentness(store, &params.q, &options, today.start)?;
        Ok(Json(SearchResponse {
            current: grouped.current,
            past: grouped.past,
            score: search::score(),
        }))
    })
    .await
}

async fn overview(State(state): State<SharedState>) -> ApiResult<Json<crate::dates::Overview>> {
    with_store(&state, |store, config| {
        let today = Today::at(Utc::now(), config.tz());
        Ok(Json(store.select_for_overview(&today)?))
    })
    .await
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DuplicateParams {
    by: Option<String>,
}

async fn duplicate_events(
    State(state): State<SharedState>,
    Query(params): Query<DuplicateParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let fields = DuplicateField::parse_list(params.by.as_deref().unwrap_or("title"))?;
    with_store(&state, move |store, _| Ok(Json(store.find_duplicates_by(&fields)?))).await
}

#[derive(Deserialize)]
struct SquashRequest {
    master_id: i64,
    duplicate_ids: Vec<i64>,
}

async fn squash_events(
    State(state): State<SharedState>,
    Json(request): Json<SquashRequest>,
) -> ApiResult<Json<Vec<Event>>> {
    with_store(&state, move |store, _| {
        Ok(Json(store.squash_events(request.master_id, &request.duplicate_ids)?))
    })
    .await
}

// Venues

async fn list_venues(State(state): State<SharedState>) -> ApiResult<Response> {
    with_store(&state, |store, _| Ok(Json(store.list_venues()?).into_response())).await
}

async fn create_venue(
    State(state): State<SharedState>,
    Json(draft): Json<VenueDraft>,
) -> ApiResult<Response> {
    with_store(&state, move |store, _| {
        Ok((StatusCode::CREATED, Json(store.create_venue(&draft)?)).into_response())
    })
    .await
}

async fn show_venue(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<Response> {
    with_store(&state, move |store, _| Ok(Json(store.get_venue(id)?).into_response())).await
}

async fn update_venue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(draft): Json<VenueDraft>,
) -> ApiResult<Response> {
    with_store(&state, move |store, _| {
        Ok(Json(store.update_venue(id, &draft)?).into_response())
    })
    .await
}

async fn delete_venue(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    with_store(&state, move |store, _| {
        store.delete_venue(id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

async fn squash_venues(
    State(state): State<SharedState>,
    Json(request): Json<SquashRequest>,
) -> ApiResult<Response> {
    with_store(&state, move |store, _| {
        let squashed = store.squash_venues(request.master_id, &request.duplicate_ids)?;
        Ok(Json(squashed).into_response())
    })
    .await
}

// Sources

async fn list_sources(State(state): State<SharedState>) -> ApiResult<Response> {
    with_store(&state, |store, _| Ok(Json(store.list_sources()?).into_response())).await
}

async fn create_source(
    State(state): State<SharedState>,
    Json(draft): Json<SourceDraft>,
) -> ApiResult<Response> {
    with_store(&state, move |store, _| {
        Ok((StatusCode::CREATED, Json(store.create_source(&draft)?)).into_response())
    })
    .await
}

#[derive(Serialize)]
struct SourceDetail {
    #[serde(flatten)]
    source: crate::models::Source,
    events: Vec<Event>,
}

async fn show_source(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<Response> {
    with_store(&state, move |store, _| {
        let source = store.get_source(id)?;
        let events = store.events_for_source(id)?;
        Ok(Json(SourceDetail { source, events }).into_response())
    })
    .await
}

async fn update_source(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(draft): Json<SourceDraft>,
) -> ApiResult<Response> {
    with_store(&state, move |store, _| {
        Ok(Json(store.update_source(id, &draft)?).into_response())
    })
    .await
}

async fn delete_source(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    with_store(&state, move |store, _| {
        store.delete_source(id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

#[derive(Deserialize)]
struct ImportRequest {
    url: String,
    #[serde(default)]
    skip_old: bool,
}

async fn list_parsers() -> Json<Vec<ParserInfo>> {
    Json(source_parser::list_parsers())
}

async fn import_source(
    State(state): State<SharedState>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<(StatusCode, Json<Flash>)> {
    let fetcher = Arc::clone(&state.fetcher);
    with_store(&state, move |store, config| {
        let tz = config.tz();
        let options = ParseOptions {
            skip_old: request.skip_old,
            today: Today::at(Utc::now(), tz).start,
            tz,
            base_url: None,
        };
        let result = import::import_source(store, fetcher.as_ref(), &request.url, &options);
        if let Err(ref err) = result {
            tracing::warn!(url = %request.url, "import failed: {err}");
        }
        let flash = Flash::for_result(&result);
        let status = if flash.is_success() {
            StatusCode::OK
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        };
        Ok((status, Json(flash)))
    })
    .await
}

// Search engine selector

#[derive(Serialize, Deserialize)]
struct EngineBody {
    kind: SearchEngineKind,
}

async fn show_search_engine() -> Json<EngineBody> {
    Json(EngineBody { kind: search::kind() })
}

async fn set_search_engine(
    State(state): State<SharedState>,
    Json(body): Json<EngineBody>,
) -> ApiResult<Json<EngineBody>> {
    search::set_kind(body.kind);
    state
        .config
        .update(|config| config.search_engine = body.kind)
        .map_err(ApiError::Internal)?;
    Ok(Json(EngineBody { kind: search::kind() }))
}
