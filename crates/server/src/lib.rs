//! HTTP surface: the axum router, request auth, and the WebSocket endpoint.

use std::sync::Arc;

use agent::AgentDeps;
use axum::routing::{
    get,
    post,
};
use axum::Router;
use tower_http::cors::{
    AllowOrigin,
    CorsLayer,
};
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod http_error;
mod routes;

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<AgentDeps>,
}

fn cors_layer() -> CorsLayer {
    // The embed endpoint's allowlist doubles as the API's CORS policy when
    // configured; otherwise any origin may read.
    match std::env::var("MUNDI_EMBED_ALLOWED_ORIGINS") {
        Ok(origins) if !origins.is_empty() => {
            let origins: Vec<http::HeaderValue> = origins
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        },
        _ => CorsLayer::permissive(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/maps/create", post(routes::maps::create_map))
        .route("/api/maps/{map_id}/style.json", get(routes::maps::style_json))
        .route("/api/maps/{map_id}/tree", get(routes::maps::map_tree))
        .route("/api/maps/{map_id}/layers", post(routes::layers::upload_layer))
        .route(
            "/api/maps/conversations/{conversation_ref}/maps/{map_id}/send",
            post(routes::maps::send_map_message),
        )
        .route(
            "/api/maps/{map_id}/messages/cancel",
            post(routes::maps::cancel_map_message),
        )
        .route(
            "/api/maps/ws/{conversation_id}/messages/updates",
            get(routes::ws::conversation_updates),
        )
        .route(
            "/api/conversations",
            post(routes::conversations::create_conversation)
                .get(routes::conversations::list_conversations),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(routes::conversations::conversation_messages),
        )
        .route("/api/layer/{filename}", get(routes::layers::layer_bytes))
        .route(
            "/api/layer/{layer_id}/{z}/{x}/{y_ext}",
            get(routes::layers::mvt_tile),
        )
        .route("/api/layers/{layer_id}/style", post(routes::layers::set_layer_style))
        .route(
            "/api/projects/{project_id}/postgis-connections",
            post(routes::postgres::add_connection).get(routes::postgres::list_connections),
        )
        .route(
            "/api/projects/{project_id}/postgis-connections/{connection_id}",
            axum::routing::delete(routes::postgres::delete_connection),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}
