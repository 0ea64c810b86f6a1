use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::task::BackupTask;

pub struct TriggerState {
    pub tasks: HashMap<String, Arc<BackupTask>>,
}

#[derive(Deserialize)]
pub struct TriggerQuery {
    pub id: Option<String>,
}

pub fn router(state: Arc<TriggerState>) -> Router {
    Router::new()
        .route("/backup", get(trigger_backup))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(addr: &str, state: Arc<TriggerState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind trigger server on {}", addr))?;
    info!(%addr, "Trigger server listening");
    axum::serve(listener, router(state))
        .await
        .context("Trigger server error")
}

/// Start the job in the background and answer immediately; the outcome is
/// delivered through the notification channels.
async fn trigger_backup(
    State(state): State<Arc<TriggerState>>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing id").into_response();
    };
    let Some(task) = state.tasks.get(&id).cloned() else {
        warn!(job = %id, "Trigger for unknown job");
        return (StatusCode::NOT_FOUND, "unknown job").into_response();
    };

    info!(job = %id, "Backup triggered over HTTP");
    tokio::spawn(async move {
        task.run().await;
    });
    (StatusCode::ACCEPTED, "accepted").into_response()
}

async fn health() -> &'static str {
    "ok"
}
