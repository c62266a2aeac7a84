//! Queries over the application database. Everything takes a borrowed
//! [`PgConnection`] so callers control acquisition scope.

use anyhow::Context as _;
use chrono::{
    DateTime,
    Utc,
};
use errors::ErrorMetadata;
use pg::PgConnection;
use uuid::Uuid;

use crate::ids::{
    generate_id,
    IdPrefix,
};
use crate::messages::{
    ChatMessage,
    StoredMessage,
};
use crate::types::{
    Conversation,
    LayerKind,
    MapLayer,
    MundiMap,
};

fn parse_stored_message(row: &tokio_postgres::Row) -> anyhow::Result<StoredMessage> {
    let raw: String = row.get("message_json");
    let message: ChatMessage = serde_json::from_str(&raw)
        .with_context(|| format!("unparseable message_json for message {}", row.get::<_, i64>("id")))?;
    Ok(StoredMessage {
        id: row.get("id"),
        map_id: row.get("map_id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        message,
        created_at: row.get("created_at"),
    })
}

pub async fn insert_message(
    conn: &PgConnection,
    map_id: &str,
    conversation_id: i32,
    sender_id: Uuid,
    message: &ChatMessage,
) -> anyhow::Result<StoredMessage> {
    let message_json = serde_json::to_string(message)?;
    let row = conn
        .query_one(
            "INSERT INTO chat_completion_messages
             (map_id, sender_id, message_json, conversation_id)
             VALUES ($1, $2, $3, $4)
             RETURNING id, map_id, conversation_id, sender_id, message_json, created_at",
            &[&map_id, &sender_id, &message_json, &conversation_id],
        )
        .await?;
    parse_stored_message(&row)
}

/// The full transcript of a conversation owned by `owner`, oldest first.
pub async fn conversation_messages(
    conn: &PgConnection,
    conversation_id: i32,
    owner: Uuid,
) -> anyhow::Result<Vec<StoredMessage>> {
    let rows = conn
        .query(
            "SELECT ccm.id, ccm.map_id, ccm.conversation_id, ccm.sender_id,
                    ccm.message_json, ccm.created_at
             FROM chat_completion_messages ccm
             JOIN conversations c ON ccm.conversation_id = c.id
             WHERE ccm.conversation_id = $1
               AND c.owner_uuid = $2
               AND c.soft_deleted_at IS NULL
             ORDER BY ccm.created_at ASC",
            &[&conversation_id, &owner],
        )
        .await?;
    rows.iter().map(parse_stored_message).collect()
}

pub async fn get_message(
    conn: &PgConnection,
    message_id: i64,
    conversation_id: i32,
) -> anyhow::Result<Option<StoredMessage>> {
    let row = conn
        .query_opt(
            "SELECT id, map_id, conversation_id, sender_id, message_json, created_at
             FROM chat_completion_messages
             WHERE id = $1 AND conversation_id = $2",
            &[&message_id, &conversation_id],
        )
        .await?;
    row.as_ref().map(parse_stored_message).transpose()
}

pub async fn get_conversation(
    conn: &PgConnection,
    conversation_id: i32,
    owner: Uuid,
) -> anyhow::Result<Option<Conversation>> {
    let row = conn
        .query_opt(
            "SELECT id, project_id, owner_uuid, title, created_at, updated_at
             FROM conversations
             WHERE id = $1 AND owner_uuid = $2 AND soft_deleted_at IS NULL",
            &[&conversation_id, &owner],
        )
        .await?;
    Ok(row.as_ref().map(Conversation::from_row))
}

pub async fn list_conversations(
    conn: &PgConnection,
    project_id: &str,
    owner: Uuid,
) -> anyhow::Result<Vec<Conversation>> {
    let rows = conn
        .query(
            "SELECT id, project_id, owner_uuid, title, created_at, updated_at
             FROM conversations
             WHERE project_id = $1 AND owner_uuid = $2 AND soft_deleted_at IS NULL
             ORDER BY created_at ASC",
            &[&project_id, &owner],
        )
        .await?;
    Ok(rows.iter().map(Conversation::from_row).collect())
}

pub async fn create_conversation(
    conn: &PgConnection,
    project_id: &str,
    owner: Uuid,
) -> anyhow::Result<Conversation> {
    let row = conn
        .query_one(
            "INSERT INTO conversations (project_id, owner_uuid, title)
             VALUES ($1, $2, 'pending')
             RETURNING id, project_id, owner_uuid, title, created_at, updated_at",
            &[&project_id, &owner],
        )
        .await?;
    Ok(Conversation::from_row(&row))
}

/// Resolves the `{conversation_id|NEW}` path segment of the send endpoint.
/// `NEW` creates a conversation in the map's project; an id must belong to
/// `owner` and to the same project as `map_id`.
pub async fn get_or_create_conversation(
    conn: &PgConnection,
    conversation_ref: &str,
    map_id: &str,
    owner: Uuid,
) -> anyhow::Result<Conversation> {
    if conversation_ref == "NEW" {
        let map = get_map(conn, map_id)
            .await?
            .filter(|m| m.owner_uuid == owner)
            .with_context(|| {
                ErrorMetadata::not_found("MapNotFound", format!("Map {map_id} not found"))
            })?;
        return create_conversation(conn, &map.project_id, owner).await;
    }

    let conversation_id: i32 = conversation_ref.parse().map_err(|_| {
        ErrorMetadata::bad_request(
            "InvalidConversationId",
            format!("Conversation {conversation_ref} not found"),
        )
    })?;
    let row = conn
        .query_opt(
            "SELECT c.id, c.project_id, c.owner_uuid, c.title, c.created_at, c.updated_at
             FROM conversations c
             JOIN user_mundiai_maps m ON c.project_id = m.project_id
             WHERE c.id = $1 AND c.owner_uuid = $2 AND c.soft_deleted_at IS NULL
               AND m.id = $3 AND m.owner_uuid = $2 AND m.soft_deleted_at IS NULL",
            &[&conversation_id, &owner, &map_id],
        )
        .await?;
    row.as_ref().map(Conversation::from_row).with_context(|| {
        ErrorMetadata::not_found(
            "ConversationNotFound",
            format!("Conversation {conversation_ref} or map {map_id} not found"),
        )
    })
}

pub async fn update_conversation_title(
    conn: &PgConnection,
    conversation_id: i32,
    title: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE conversations SET title = $1, updated_at = now() WHERE id = $2",
        &[&title, &conversation_id],
    )
    .await?;
    Ok(())
}

pub async fn get_map(conn: &PgConnection, map_id: &str) -> anyhow::Result<Option<MundiMap>> {
    let row = conn
        .query_opt(
            "SELECT id, project_id, owner_uuid, title, description, layers,
                    parent_map_id, fork_reason, created_on, last_edited
             FROM user_mundiai_maps
             WHERE id = $1 AND soft_deleted_at IS NULL",
            &[&map_id],
        )
        .await?;
    Ok(row.as_ref().map(MundiMap::from_row))
}

pub async fn get_layer(
    conn: &PgConnection,
    layer_id: &str,
    owner: Uuid,
) -> anyhow::Result<Option<MapLayer>> {
    let row = conn
        .query_opt(
            "SELECT layer_id, owner_uuid, name, type, s3_key, postgis_connection_id,
                    postgis_query, postgis_attribute_column_list, metadata, bounds,
                    geometry_type, feature_count, source_map_id, created_on, last_edited
             FROM map_layers
             WHERE layer_id = $1 AND owner_uuid = $2",
            &[&layer_id, &owner],
        )
        .await?;
    row.as_ref().map(MapLayer::from_row).transpose()
}

pub async fn layers_for_map(conn: &PgConnection, map: &MundiMap) -> anyhow::Result<Vec<MapLayer>> {
    let ids = map.layer_ids().to_vec();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = conn
        .query(
            "SELECT layer_id, owner_uuid, name, type, s3_key, postgis_connection_id,
                    postgis_query, postgis_attribute_column_list, metadata, bounds,
                    geometry_type, feature_count, source_map_id, created_on, last_edited
             FROM map_layers
             WHERE layer_id = ANY($1)
             ORDER BY array_position($1, layer_id)",
            &[&ids],
        )
        .await?;
    rows.iter().map(MapLayer::from_row).collect()
}

#[derive(Debug, Clone)]
pub struct UnattachedLayer {
    pub layer_id: String,
    pub name: Option<String>,
    pub kind: String,
    pub created_on: DateTime<Utc>,
}

impl UnattachedLayer {
    /// Description shown to the LLM next to the enum value.
    pub fn describe(&self) -> String {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => format!("Unnamed Layer ({})", &self.layer_id[..8]),
        };
        format!("{name} (type: {}, created: {})", self.kind, self.created_on)
    }
}

/// Layers the user owns that appear on none of their maps; these populate
/// the `add_layer_to_map` enum, newest first, capped at 10.
pub async fn unattached_layers(
    conn: &PgConnection,
    owner: Uuid,
) -> anyhow::Result<Vec<UnattachedLayer>> {
    let rows = conn
        .query(
            "SELECT ml.layer_id, ml.name, ml.type, ml.created_on
             FROM map_layers ml
             WHERE ml.owner_uuid = $1
             AND NOT EXISTS (
                 SELECT 1 FROM user_mundiai_maps m
                 WHERE ml.layer_id = ANY(m.layers) AND m.owner_uuid = $1
             )
             ORDER BY ml.created_on DESC
             LIMIT 10",
            &[&owner],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| UnattachedLayer {
            layer_id: row.get("layer_id"),
            name: row.get("name"),
            kind: row.get("type"),
            created_on: row.get("created_on"),
        })
        .collect())
}

/// Appends a layer to a map's layers array, tolerating NULL arrays and
/// double-appends.
pub async fn append_layer_to_map(
    conn: &PgConnection,
    map_id: &str,
    layer_id: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE user_mundiai_maps
         SET layers = CASE
             WHEN layers IS NULL THEN ARRAY[$1]
             ELSE array_append(layers, $1)
         END
         WHERE id = $2 AND (layers IS NULL OR NOT ($1 = ANY(layers)))",
        &[&layer_id, &map_id],
    )
    .await?;
    Ok(())
}

pub async fn rename_layer(
    conn: &PgConnection,
    layer_id: &str,
    name: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE map_layers SET name = $1, last_edited = now() WHERE layer_id = $2",
        &[&name, &layer_id],
    )
    .await?;
    Ok(())
}

pub struct NewPostgisLayer {
    pub layer_id: String,
    pub owner_uuid: Uuid,
    pub name: String,
    pub postgis_connection_id: String,
    pub postgis_query: String,
    pub attribute_columns: Vec<String>,
    pub feature_count: Option<i32>,
    pub bounds: Option<Vec<f64>>,
    pub geometry_type: Option<String>,
    pub source_map_id: String,
}

pub async fn insert_postgis_layer(
    conn: &PgConnection,
    layer: &NewPostgisLayer,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO map_layers
         (layer_id, owner_uuid, name, type, postgis_connection_id, postgis_query,
          feature_count, bounds, geometry_type, source_map_id,
          postgis_attribute_column_list)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        &[
            &layer.layer_id,
            &layer.owner_uuid,
            &layer.name,
            &LayerKind::Postgis.as_str(),
            &layer.postgis_connection_id,
            &layer.postgis_query,
            &layer.feature_count,
            &layer.bounds,
            &layer.geometry_type,
            &layer.source_map_id,
            &layer.attribute_columns,
        ],
    )
    .await?;
    Ok(())
}

pub struct NewFileLayer {
    pub layer_id: String,
    pub owner_uuid: Uuid,
    pub name: String,
    pub kind: LayerKind,
    pub s3_key: String,
    pub metadata: Option<serde_json::Value>,
    pub source_map_id: Option<String>,
}

pub async fn insert_file_layer(conn: &PgConnection, layer: &NewFileLayer) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO map_layers
         (layer_id, owner_uuid, name, type, s3_key, metadata, source_map_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        &[
            &layer.layer_id,
            &layer.owner_uuid,
            &layer.name,
            &layer.kind.as_str(),
            &layer.s3_key,
            &layer.metadata,
            &layer.source_map_id,
        ],
    )
    .await?;
    Ok(())
}

/// Inserts a style version and returns its id.
pub async fn insert_style(
    conn: &PgConnection,
    layer_id: &str,
    style_json: &serde_json::Value,
    created_by: Uuid,
    parent_style_id: Option<&str>,
) -> anyhow::Result<String> {
    let style_id = generate_id(IdPrefix::Style);
    conn.execute(
        "INSERT INTO layer_styles (style_id, layer_id, style_json, parent_style_id, created_by)
         VALUES ($1, $2, $3, $4, $5)",
        &[&style_id, &layer_id, &style_json, &parent_style_id, &created_by],
    )
    .await?;
    Ok(style_id)
}

/// Selects `style_id` as the active style for (map, layer). Reassignment
/// overwrites the previous link.
pub async fn link_style(
    conn: &PgConnection,
    map_id: &str,
    layer_id: &str,
    style_id: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO map_layer_styles (map_id, layer_id, style_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (map_id, layer_id) DO UPDATE SET style_id = EXCLUDED.style_id",
        &[&map_id, &layer_id, &style_id],
    )
    .await?;
    Ok(())
}

/// Active (layer_id, style_json) pairs for a map, in the map's layer order.
pub async fn active_styles_for_map(
    conn: &PgConnection,
    map: &MundiMap,
) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
    let ids = map.layer_ids().to_vec();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = conn
        .query(
            "SELECT mls.layer_id, ls.style_json
             FROM map_layer_styles mls
             JOIN layer_styles ls ON mls.style_id = ls.style_id
             WHERE mls.map_id = $1 AND mls.layer_id = ANY($2)
             ORDER BY array_position($2, mls.layer_id)",
            &[&map.id, &ids],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("layer_id"), row.get("style_json")))
        .collect())
}

pub struct NewProjectAndMap {
    pub project_id: String,
    pub map: MundiMap,
}

/// Creates a project with a single empty map snapshot.
pub async fn create_project_with_map(
    conn: &PgConnection,
    owner: Uuid,
    title: &str,
    description: Option<&str>,
) -> anyhow::Result<NewProjectAndMap> {
    let project_id = generate_id(IdPrefix::Project);
    let map_id = generate_id(IdPrefix::Map);
    conn.execute(
        "INSERT INTO user_mundiai_projects (id, owner_uuid, title, maps, map_diff_messages)
         VALUES ($1, $2, $3, ARRAY[$4], ARRAY[]::text[])",
        &[&project_id, &owner, &title, &map_id],
    )
    .await?;
    let row = conn
        .query_one(
            "INSERT INTO user_mundiai_maps (id, project_id, owner_uuid, title, description)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, project_id, owner_uuid, title, description, layers,
                       parent_map_id, fork_reason, created_on, last_edited",
            &[&map_id, &project_id, &owner, &title, &description],
        )
        .await?;
    Ok(NewProjectAndMap {
        project_id,
        map: MundiMap::from_row(&row),
    })
}
