//! HTTP surfaces
//!
//! Two routers live here:
//!
//! - the MAPE configuration API (`/config/temperature`, per-zone get and
//!   put, `/config/reload`), backed by the runtime setpoint store;
//! - the ledger query API (`/events` with filters, `/events/{id}`),
//!   backed by the append-ordered query index.
//!
//! Both carry `/health` and `/metrics`, CORS, request tracing, and a
//! request timeout. Error responses are `(StatusCode, String)` naming
//! the offending input.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::blockstore::{query_entries, EventQuery, LedgerEntry};
use crate::canonical;
use crate::mape::{MapeRuntime, SetpointError};
use crate::metrics::{AggregatorMetrics, LedgerMetrics, MapeMetrics};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn common_layers(router: Router) -> Router {
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

// ============================================================================
// MAPE configuration API
// ============================================================================

#[derive(Clone)]
pub struct MapeApiState {
    pub runtime: Arc<MapeRuntime>,
    pub metrics: Arc<MapeMetrics>,
}

#[derive(Serialize)]
struct SetpointsBody {
    setpoints: BTreeMap<String, f64>,
}

#[derive(Serialize, Debug)]
struct ZoneSetpointBody {
    #[serde(rename = "zoneId")]
    zone_id: String,
    #[serde(rename = "setpointC")]
    setpoint_c: f64,
}

#[derive(Deserialize)]
struct PutSetpointBody {
    #[serde(rename = "setpointC")]
    setpoint_c: f64,
}

async fn get_setpoints(State(state): State<MapeApiState>) -> Json<SetpointsBody> {
    Json(SetpointsBody { setpoints: state.runtime.setpoints.snapshot() })
}

async fn get_zone_setpoint(
    State(state): State<MapeApiState>,
    Path(zone): Path<String>,
) -> Result<Json<ZoneSetpointBody>, (StatusCode, String)> {
    match state.runtime.setpoints.get(&zone) {
        Some(setpoint_c) => Ok(Json(ZoneSetpointBody { zone_id: zone, setpoint_c })),
        None => Err((StatusCode::NOT_FOUND, format!("unknown zone {zone}"))),
    }
}

async fn put_zone_setpoint(
    State(state): State<MapeApiState>,
    Path(zone): Path<String>,
    Json(body): Json<PutSetpointBody>,
) -> Result<Json<ZoneSetpointBody>, (StatusCode, String)> {
    match state.runtime.setpoints.set(&zone, body.setpoint_c) {
        Ok(()) => {
            info!(zone = %zone, setpoint_c = body.setpoint_c, "setpoint updated");
            Ok(Json(ZoneSetpointBody { zone_id: zone, setpoint_c: body.setpoint_c }))
        }
        Err(e @ SetpointError::OutOfRange { .. }) => {
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e @ SetpointError::UnknownZone(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
    }
}

async fn reload_properties(
    State(state): State<MapeApiState>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .runtime
        .reload()
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("reload failed: {e}")))
}

async fn mape_metrics(State(state): State<MapeApiState>) -> impl IntoResponse {
    state.metrics.render_prometheus()
}

/// `GET /config/temperature`, `GET|PUT /config/temperature/{zone}`,
/// `POST /config/reload`, plus `/health` and `/metrics`.
pub fn mape_router(state: MapeApiState) -> Router {
    common_layers(
        Router::new()
            .route("/config/temperature", get(get_setpoints))
            .route(
                "/config/temperature/:zone",
                get(get_zone_setpoint).put(put_zone_setpoint),
            )
            .route("/config/reload", post(reload_properties))
            .route("/health", get(health))
            .route("/metrics", get(mape_metrics))
            .with_state(state),
    )
}

// ============================================================================
// Ledger query API
// ============================================================================

#[derive(Clone)]
pub struct LedgerApiState {
    /// One append-ordered index per owned zone.
    pub indexes: Vec<Arc<RwLock<Vec<LedgerEntry>>>>,
    pub metrics: Arc<LedgerMetrics>,
}

#[derive(Deserialize)]
struct EventsParams {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    #[serde(rename = "zoneId")]
    zone_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    page: Option<usize>,
    size: Option<usize>,
}

#[derive(Serialize, Debug)]
struct EventsBody {
    events: Vec<LedgerEntry>,
    page: usize,
    size: usize,
}

fn parse_bound(
    name: &str,
    value: &Option<String>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, (StatusCode, String)> {
    match value {
        None => Ok(None),
        Some(s) => canonical::parse_rfc3339(s).map(Some).map_err(|e| {
            (StatusCode::BAD_REQUEST, format!("{name} must be RFC3339, got {s:?}: {e}"))
        }),
    }
}

async fn get_events(
    State(state): State<LedgerApiState>,
    Query(params): Query<EventsParams>,
) -> Result<Json<EventsBody>, (StatusCode, String)> {
    let q = EventQuery {
        entry_type: params.entry_type,
        zone_id: params.zone_id,
        from: parse_bound("from", &params.from)?,
        to: parse_bound("to", &params.to)?,
        page: params.page.unwrap_or(0),
        size: params.size.unwrap_or(50),
    };
    let mut all: Vec<LedgerEntry> = Vec::new();
    for index in &state.indexes {
        all.extend(index.read().unwrap().iter().cloned());
    }
    let events = query_entries(&all, &q);
    Ok(Json(EventsBody { events, page: q.page, size: q.size }))
}

async fn get_event(
    State(state): State<LedgerApiState>,
    Path(id): Path<String>,
) -> Result<Json<LedgerEntry>, (StatusCode, String)> {
    for index in &state.indexes {
        if let Some(entry) = index.read().unwrap().iter().find(|e| e.id == id) {
            return Ok(Json(entry.clone()));
        }
    }
    Err((StatusCode::NOT_FOUND, format!("no event with id {id}")))
}

async fn ledger_metrics(State(state): State<LedgerApiState>) -> impl IntoResponse {
    state.metrics.render_prometheus()
}

/// `GET /events`, `GET /events/{id}`, `/health`, `/metrics`.
pub fn ledger_router(state: LedgerApiState) -> Router {
    common_layers(
        Router::new()
            .route("/events", get(get_events))
            .route("/events/:id", get(get_event))
            .route("/health", get(health))
            .route("/metrics", get(ledger_metrics))
            .with_state(state),
    )
}

// ============================================================================
// Aggregator health surface
// ============================================================================

#[derive(Clone)]
pub struct AggregatorApiState {
    pub metrics: Arc<AggregatorMetrics>,
}

async fn aggregator_metrics(State(state): State<AggregatorApiState>) -> impl IntoResponse {
    state.metrics.render_prometheus()
}

/// `/health` and `/metrics` for the aggregator daemon.
pub fn aggregator_router(state: AggregatorApiState) -> Router {
    common_layers(
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(aggregator_metrics))
            .with_state(state),
    )
}

// ============================================================================
// Tests
// ============================================================================
