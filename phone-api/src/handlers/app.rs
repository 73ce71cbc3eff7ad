use axum::{routing, Json, Router};
use serde_json::{json, Value};
use tower::limit::ConcurrencyLimitLayer;

use super::records::{self, AppState};

pub fn add_routes(router: Router, state: AppState, concurrency_limit: usize) -> Router {
    // `/numbers` is kept for clients of the previous API.
    let records = Router::new()
        .route("/records", routing::get(records::list_records))
        .route("/records/:country", routing::get(records::records_by_country))
        .route("/numbers", routing::get(records::list_records))
        .route("/numbers/:country", routing::get(records::records_by_country))
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .with_state(state);

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop to report on, axum being up is enough
        .route("/health", routing::get(records::health))
        .merge(records)
}

pub async fn index() -> Json<Value> {
    Json(json!({ "ok": true, "service": "phone-api" }))
}
