use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use palaver_gateway::connection;

use crate::entries;
use crate::state::AppState;
use crate::values;

/// The log service: entry reads and writes, path values, compare-and-set and
/// the append gateway.
pub fn router(state: AppState) -> Router {
    let log_routes = Router::new()
        .route("/channels/{channel_id}/entries", get(entries::get_entries))
        .route(
            "/channels/{channel_id}/entries/{key}",
            get(entries::get_entry).patch(entries::write_entry),
        )
        .route("/channels/{channel_id}/entries/{key}/value", get(values::get_value))
        .route("/channels/{channel_id}/entries/{key}/cas", post(values::compare_and_set));

    Router::new()
        .merge(log_routes)
        .route("/gateway", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher))
}
