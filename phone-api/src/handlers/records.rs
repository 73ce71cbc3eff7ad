use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use phone_common::store::{RecordStore, StoreError};
use phone_common::types::EnrichedRecord;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub scan_limit: usize,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    /// Details stay in the logs: callers only ever see a generic 500.
    fn into_response(self) -> Response {
        error!(error = %self, "request failed");

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal server error" })),
        )
            .into_response()
    }
}

pub async fn list_records(
    State(state): State<AppState>,
) -> Result<Json<Vec<EnrichedRecord>>, ApiError> {
    let records = state.store.scan(state.scan_limit).await?;
    Ok(Json(records))
}

pub async fn records_by_country(
    State(state): State<AppState>,
    Path(country): Path<String>,
) -> Result<Json<Vec<EnrichedRecord>>, ApiError> {
    let records = state
        .store
        .query_by_country(&country.to_uppercase())
        .await?;
    Ok(Json(records))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
