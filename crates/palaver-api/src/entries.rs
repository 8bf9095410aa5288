use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::{debug, error};

use palaver_types::api::{MAX_RANGE_LIMIT, RangeQuery, WriteRequest};
use palaver_types::fields::LogEntry;

use crate::state::AppState;
use crate::valid_segment;

/// Range read over a channel log. Bounds are inclusive; results ascend by key.
pub async fn get_entries(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<LogEntry>>, StatusCode> {
    if !valid_segment(&channel_id) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let limit = query.limit.min(MAX_RANGE_LIMIT);
    if limit == 0 {
        return Ok(Json(vec![]));
    }

    // Run blocking DB query off the async runtime
    let db = state.db.clone();
    let entries = tokio::task::spawn_blocking(move || {
        db.get_range(&channel_id, query.bound.as_deref(), query.direction, limit)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|e| { error!("range read failed: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    Ok(Json(entries))
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path((channel_id, key)): Path<(String, String)>,
) -> Result<Json<LogEntry>, StatusCode> {
    let db = state.db.clone();
    let entry = tokio::task::spawn_blocking(move || db.get_entry(&channel_id, &key))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("point read failed: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(entry))
}

/// Create or update an entry with path updates. Only writes that append a
/// new key are announced on the gateway.
pub async fn write_entry(
    State(state): State<AppState>,
    Path((channel_id, key)): Path<(String, String)>,
    Json(req): Json<WriteRequest>,
) -> Result<(StatusCode, Json<LogEntry>), StatusCode> {
    if !valid_segment(&channel_id) || !valid_segment(&key) || req.fields.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let cid = channel_id.clone();
    let outcome = tokio::task::spawn_blocking(move || db.write_entry(&cid, &key, &req.fields))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("write failed: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    if outcome.created {
        debug!("Appended {} to {}", outcome.entry.key, channel_id);
        state.dispatcher.publish_append(&channel_id, outcome.entry.clone());
        Ok((StatusCode::CREATED, Json(outcome.entry)))
    } else {
        Ok((StatusCode::OK, Json(outcome.entry)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use palaver_db::Database;
    use palaver_gateway::dispatcher::Dispatcher;
    use palaver_types::api::Direction;
    use serde_json::json;

    use super::*;
    use crate::state::AppStateInner;

    fn state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: Dispatcher::default(),
        })
    }

    fn write(text: &str) -> Json<WriteRequest> {
        Json(WriteRequest {
            fields: json!({ "text": text }).as_object().cloned().unwrap(),
        })
    }

    #[tokio::test]
    async fn append_is_announced_once() {
        let state = state();
        let mut rx = state.dispatcher.subscribe();

        let (status, _) = write_entry(State(state.clone()), Path(("c".into(), "k1".into())), write("a"))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let (status, Json(entry)) =
            write_entry(State(state.clone()), Path(("c".into(), "k1".into())), write("b"))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry.fields["text"], "b");

        let notice = rx.recv().await.unwrap();
        assert_eq!(&*notice.channel_id, "c");
        assert!(rx.try_recv().is_err(), "updates are not appends");
    }

    #[tokio::test]
    async fn range_and_point_reads() {
        let state = state();
        for key in ["m1", "m2", "m3"] {
            write_entry(State(state.clone()), Path(("c".into(), key.into())), write(key))
                .await
                .unwrap();
        }

        let Json(entries) = get_entries(
            State(state.clone()),
            Path("c".into()),
            Query(RangeQuery {
                bound: Some("m2".into()),
                direction: Direction::Backward,
                limit: 10,
            }),
        )
        .await
        .unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["m1", "m2"]);

        let missing = get_entry(State(state.clone()), Path(("c".into(), "nope".into()))).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_path_keys_and_empty_writes() {
        let state = state();
        let bad_key = write_entry(State(state.clone()), Path(("c".into(), "a/b".into())), write("x")).await;
        assert_eq!(bad_key.unwrap_err(), StatusCode::BAD_REQUEST);

        let empty = write_entry(
            State(state),
            Path(("c".into(), "k".into())),
            Json(WriteRequest { fields: Default::default() }),
        )
        .await;
        assert_eq!(empty.unwrap_err(), StatusCode::BAD_REQUEST);
    }
}
