//! Sync endpoint routes.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use tether_engine::{ChangeSet, DeletionSet, PushRequest, PushResult};

use crate::error::Result;
use crate::handlers::{handle_changes, handle_deletions, handle_push, SinceQuery};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/push", post(push_handler))
        .route("/sync/changes", get(changes_handler))
        .route("/sync/deletions", get(deletions_handler))
}

/// POST /sync/push - Push one operation.
async fn push_handler(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResult>> {
    Ok(Json(handle_push(&state.pool, request).await?))
}

/// GET /sync/changes?since=N - Live entities changed after N.
async fn changes_handler(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<ChangeSet>> {
    Ok(Json(handle_changes(&state.pool, query).await?))
}

/// GET /sync/deletions?since=N - Tombstones recorded after N.
async fn deletions_handler(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<DeletionSet>> {
    Ok(Json(handle_deletions(&state.pool, query).await?))
}
