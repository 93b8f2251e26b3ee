//! Routes and endpoints

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, NoContent, Response},
    routing::get,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::store::{ConnectionRecord, Store, StoreError};

/// State shared by all handlers
#[derive(Clone, Debug)]
pub struct AppState {
    /// Connection table, read only
    pub store: Store,
    /// Maximum number of rows returned by `/api/history`
    pub history_limit: u32,
}

/// Creates a [`Router`] with the routes for our application.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(async || NoContent))
        .route("/api/current", get(current))
        .route("/api/history", get(history))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// An active connection as shown to API clients.
#[derive(Debug, Serialize)]
struct ActiveConnection {
    client_ip: String,
    ssrc: i64,
    frequency: Option<i64>,
    freq_range: Option<String>,
    center_frequency: Option<i64>,
    bins: Option<u32>,
    bin_width: Option<u32>,
    audio_active: bool,
    geo_city: Option<String>,
    geo_country: Option<String>,
    first_seen: DateTime<Utc>,
    /// Time since `first_seen` as `H:MM:SS`
    duration: String,
}

impl ActiveConnection {
    fn new(record: ConnectionRecord, now: DateTime<Utc>) -> Self {
        ActiveConnection {
            duration: format_duration(now - record.first_seen),
            client_ip: record.client_ip,
            ssrc: record.ssrc,
            frequency: record.frequency,
            freq_range: record.freq_range,
            center_frequency: record.center_frequency,
            bins: record.bins,
            bin_width: record.bin_width,
            audio_active: record.audio_active,
            geo_city: record.geo_city,
            geo_country: record.geo_country,
            first_seen: record.first_seen,
        }
    }
}

/// Format an elapsed time as `H:MM:SS`. Hours are not wrapped into days and negative spans count
/// as zero.
fn format_duration(elapsed: TimeDelta) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Database failure while answering a request
struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Failed to read connections: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Active connections, newest first.
async fn current(State(state): State<AppState>) -> Result<Json<Vec<ActiveConnection>>, ApiError> {
    let now = Utc::now();
    let rows = state.store.active_connections().await?;
    Ok(Json(
        rows.into_iter()
            .map(|record| ActiveConnection::new(record, now))
            .collect(),
    ))
}

/// Closed connections, most recently disconnected first.
async fn history(
    State(state): State<AppState>,
) -> Result<Json<Vec<ConnectionRecord>>, ApiError> {
    Ok(Json(
        state.store.closed_connections(state.history_limit).await?,
    ))
}
