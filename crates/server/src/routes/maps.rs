use agent::style::compose_style_document;
use anyhow::Context as _;
use axum::extract::{
    Path,
    State,
};
use axum::Json;
use errors::ErrorMetadata;
use model::map_state::SelectedFeature;
use model::messages::SanitizedMessage;
use model::store;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::auth::UserContext;
use crate::http_error::HttpResult;
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateMapRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Serialize)]
pub struct CreateMapResponse {
    pub id: String,
    pub project_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created_on: chrono::DateTime<chrono::Utc>,
    pub last_edited: chrono::DateTime<chrono::Utc>,
}

pub async fn create_map(
    State(state): State<AppState>,
    user: UserContext,
    Json(body): Json<CreateMapRequest>,
) -> HttpResult<Json<CreateMapResponse>> {
    let conn = state.deps.app_pool.acquire("create_map").await?;
    let created = store::create_project_with_map(
        &conn,
        user.user_id,
        body.title.as_deref().unwrap_or("Untitled map"),
        body.description.as_deref(),
    )
    .await?;
    Ok(Json(CreateMapResponse {
        id: created.map.id,
        project_id: created.project_id,
        title: created.map.title,
        description: created.map.description,
        created_on: created.map.created_on,
        last_edited: created.map.last_edited,
    }))
}

/// The composed style document for a map: base map plus the active style of
/// every attached layer.
pub async fn style_json(
    State(state): State<AppState>,
    user: UserContext,
    Path(map_id): Path<String>,
) -> HttpResult<Json<JsonValue>> {
    let conn = state.deps.app_pool.acquire("style_json").await?;
    let map = store::get_map(&conn, &map_id)
        .await?
        .filter(|m| m.owner_uuid == user.user_id)
        .with_context(|| {
            ErrorMetadata::not_found("MapNotFound", format!("Map {map_id} not found"))
        })?;

    let styles = store::active_styles_for_map(&conn, &map).await?;
    let mut layers = Vec::new();
    for (layer_id, style_layers) in &styles {
        if let Some(layer) = store::get_layer(&conn, layer_id, user.user_id).await? {
            layers.push((layer, style_layers.clone()));
        }
    }
    let entries: Vec<(&model::MapLayer, JsonValue)> = layers
        .iter()
        .map(|(layer, style_layers)| (layer, style_layers.clone()))
        .collect();
    let website_domain =
        std::env::var("WEBSITE_DOMAIN").unwrap_or_else(|_| "http://localhost:8000".to_string());
    Ok(Json(compose_style_document(
        &website_domain,
        map.title.as_deref(),
        &entries,
    )))
}

#[derive(Deserialize)]
pub struct UserMessageBody {
    #[serde(default)]
    #[allow(dead_code)]
    pub role: Option<String>,
    pub content: String,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub message: UserMessageBody,
    #[serde(default)]
    pub selected_feature: Option<SelectedFeature>,
}

#[derive(Serialize)]
pub struct SendMessageResponse {
    pub conversation_id: i32,
    pub sent_message: SanitizedMessage,
    pub message_id: String,
    pub status: String,
}

/// Launches the agentic loop for one user turn. Returns 409 when another
/// turn holds the conversation lock.
pub async fn send_map_message(
    State(state): State<AppState>,
    user: UserContext,
    Path((conversation_ref, map_id)): Path<(String, String)>,
    Json(body): Json<SendMessageRequest>,
) -> HttpResult<Json<SendMessageResponse>> {
    let outcome = agent::send_message(
        &state.deps,
        user.user_id,
        &conversation_ref,
        &map_id,
        body.message.content,
        body.selected_feature,
    )
    .await?;
    Ok(Json(SendMessageResponse {
        conversation_id: outcome.conversation.id,
        sent_message: outcome.sent_message,
        message_id: outcome.message_id.to_string(),
        status: "processing_started".to_string(),
    }))
}

pub async fn cancel_map_message(
    State(state): State<AppState>,
    user: UserContext,
    Path(map_id): Path<String>,
) -> HttpResult<Json<JsonValue>> {
    agent::cancel_map_messages(&state.deps, user.user_id, &map_id).await?;
    Ok(Json(serde_json::json!({"status": "cancelled"})))
}

#[derive(Serialize)]
pub struct LayerInfo {
    pub layer_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry_type: Option<String>,
    pub feature_count: Option<i32>,
}

impl LayerInfo {
    fn from_layer(layer: &model::MapLayer) -> Self {
        Self {
            layer_id: layer.layer_id.clone(),
            name: layer.display_name(),
            kind: layer.kind.as_str().to_string(),
            geometry_type: layer.geometry_type.clone(),
            feature_count: layer.feature_count,
        }
    }
}

#[derive(Serialize)]
pub struct LayerDiff {
    pub added_layers: Vec<LayerInfo>,
    pub removed_layers: Vec<LayerInfo>,
}

#[derive(Serialize)]
pub struct MapNode {
    pub map_id: String,
    pub messages: Vec<SanitizedMessage>,
    pub fork_reason: Option<String>,
    pub created_on: chrono::DateTime<chrono::Utc>,
    pub diff_from_previous: Option<LayerDiff>,
}

#[derive(Serialize)]
pub struct MapTreeResponse {
    pub project_id: String,
    pub tree: Vec<MapNode>,
}

#[derive(Deserialize)]
pub struct MapTreeQuery {
    #[serde(default)]
    pub conversation_id: Option<i32>,
}

/// The snapshot chain from the root down to this map, each node annotated
/// with its layer diff against the previous snapshot and, when a
/// conversation is given, its messages.
pub async fn map_tree(
    State(state): State<AppState>,
    user: UserContext,
    Path(map_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<MapTreeQuery>,
) -> HttpResult<Json<MapTreeResponse>> {
    let conn = state.deps.app_pool.acquire("map_tree").await?;
    let leaf = store::get_map(&conn, &map_id)
        .await?
        .filter(|m| m.owner_uuid == user.user_id)
        .with_context(|| {
            ErrorMetadata::not_found("MapNotFound", format!("Map {map_id} not found"))
        })?;

    let chain = model::dag::parent_chain(&conn, &map_id).await?;
    let mut maps = Vec::with_capacity(chain.len());
    for chain_map_id in &chain {
        if let Some(map) = store::get_map(&conn, chain_map_id).await? {
            maps.push(map);
        }
    }

    let mut layers_by_id = std::collections::HashMap::new();
    for map in &maps {
        for layer_id in map.layer_ids() {
            if !layers_by_id.contains_key(layer_id) {
                if let Some(layer) = store::get_layer(&conn, layer_id, user.user_id).await? {
                    layers_by_id.insert(layer_id.clone(), layer);
                }
            }
        }
    }

    let mut messages_by_map: std::collections::HashMap<String, Vec<SanitizedMessage>> =
        std::collections::HashMap::new();
    if let Some(conversation_id) = query.conversation_id {
        let messages =
            store::conversation_messages(&conn, conversation_id, user.user_id).await?;
        for sanitized in messages.iter().filter_map(|message| message.sanitize()) {
            messages_by_map
                .entry(sanitized.map_id.clone())
                .or_default()
                .push(sanitized);
        }
    }

    let mut tree = Vec::with_capacity(maps.len());
    for (i, map) in maps.iter().enumerate() {
        let diff_from_previous = (i > 0).then(|| {
            let previous: std::collections::HashSet<&String> =
                maps[i - 1].layer_ids().iter().collect();
            let current: std::collections::HashSet<&String> = map.layer_ids().iter().collect();
            let info = |ids: Vec<&&String>| {
                ids.into_iter()
                    .filter_map(|id| layers_by_id.get(*id).map(LayerInfo::from_layer))
                    .collect::<Vec<_>>()
            };
            LayerDiff {
                added_layers: info(current.difference(&previous).collect()),
                removed_layers: info(previous.difference(&current).collect()),
            }
        });
        tree.push(MapNode {
            map_id: map.id.clone(),
            messages: messages_by_map.remove(&map.id).unwrap_or_default(),
            fork_reason: map.fork_reason.map(|reason| reason.as_str().to_string()),
            created_on: map.created_on,
            diff_from_previous,
        });
    }

    Ok(Json(MapTreeResponse {
        project_id: leaf.project_id,
        tree,
    }))
}
