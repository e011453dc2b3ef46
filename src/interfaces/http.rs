//! Inbound HTTP: the processor's webhook and a health check.

use crate::application::reconciliation::{Reconciler, WebhookAck};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

pub const WEBHOOK_PATH: &str = "/webhooks/achq";

pub fn router(reconciler: Reconciler) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(WEBHOOK_PATH, post(achq_webhook))
        .with_state(reconciler)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Always answers 200 so the processor does not redeliver; failures are only
/// logged.
async fn achq_webhook(State(reconciler): State<Reconciler>, body: Bytes) -> Json<WebhookAck> {
    let raw = String::from_utf8_lossy(&body);
    Json(reconciler.handle_webhook(&raw).await)
}
