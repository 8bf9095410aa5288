use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::{debug, error};

use palaver_db::CasOutcome;
use palaver_types::api::{CompareAndSetRequest, ValueQuery, VersionedValue};

use crate::state::AppState;

/// Read the value at a path inside an entry, with the entry's revision.
pub async fn get_value(
    State(state): State<AppState>,
    Path((channel_id, key)): Path<(String, String)>,
    Query(query): Query<ValueQuery>,
) -> Result<Json<VersionedValue>, StatusCode> {
    let db = state.db.clone();
    let value = tokio::task::spawn_blocking(move || db.read_value(&channel_id, &key, &query.path))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("value read failed: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    Ok(Json(value))
}

/// Optimistic write used by client-side transactions. 409 carries the
/// current value so the client can recompute and retry without a re-read.
pub async fn compare_and_set(
    State(state): State<AppState>,
    Path((channel_id, key)): Path<(String, String)>,
    Json(req): Json<CompareAndSetRequest>,
) -> Result<(StatusCode, Json<VersionedValue>), StatusCode> {
    if req.path.trim_matches('/').is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let cid = channel_id.clone();
    let k = key.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        db.compare_and_set(&cid, &k, &req.path, req.expected_revision, req.value)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|e| { error!("compare-and-set failed: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    match outcome {
        CasOutcome::Committed(value) => Ok((StatusCode::OK, Json(value))),
        CasOutcome::Conflict(current) => {
            debug!("CAS conflict on {}/{} at revision {}", channel_id, key, current.revision);
            Ok((StatusCode::CONFLICT, Json(current)))
        }
        CasOutcome::Missing => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use palaver_db::Database;
    use palaver_gateway::dispatcher::Dispatcher;
    use serde_json::json;

    use super::*;
    use crate::state::{AppState, AppStateInner};

    fn state_with_message() -> AppState {
        let db = Database::open_in_memory().unwrap();
        db.write_entry("c", "m1", json!({ "text": "hi" }).as_object().unwrap())
            .unwrap();
        Arc::new(AppStateInner {
            db: Arc::new(db),
            dispatcher: Dispatcher::default(),
        })
    }

    fn cas(expected_revision: u64, value: serde_json::Value) -> Json<CompareAndSetRequest> {
        Json(CompareAndSetRequest {
            path: "reactions/👍".into(),
            expected_revision,
            value,
        })
    }

    #[tokio::test]
    async fn conflict_returns_current_value() {
        let state = state_with_message();
        let path = || Path(("c".to_string(), "m1".to_string()));

        let Json(current) = get_value(
            State(state.clone()),
            path(),
            Query(ValueQuery { path: "reactions/👍".into() }),
        )
        .await
        .unwrap();
        assert_eq!(current.value, None);

        let (status, Json(v)) = compare_and_set(State(state.clone()), path(), cas(current.revision, json!(1)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v.value, Some(json!(1)));

        let (status, Json(v)) = compare_and_set(State(state), path(), cas(current.revision, json!(1)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(v.value, Some(json!(1)));
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let state = state_with_message();
        let result = compare_and_set(
            State(state),
            Path(("c".to_string(), "ghost".to_string())),
            cas(0, json!(1)),
        )
        .await;
        assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
    }
}
