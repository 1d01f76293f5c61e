pub mod invocations;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;
use std::sync::Arc;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations::invocations))
        .with_state(state)
}

async fn ping() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
