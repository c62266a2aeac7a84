//! The map snapshot DAG. Mutating a map forks a child carrying the parent's
//! state; the parent chain is walked leaf-to-root with cycle detection.

use std::collections::HashSet;

use anyhow::Context as _;
use errors::ErrorMetadata;
use pg::PgConnection;
use uuid::Uuid;

use crate::ids::{
    generate_id,
    IdPrefix,
};
use crate::types::ForkReason;

/// Creates a child snapshot of `map_id` with identical layers and style
/// links, records the fork reason, and appends the child to the project's
/// map sequence. Returns the new map id.
pub async fn fork_map(
    conn: &PgConnection,
    map_id: &str,
    user_id: Uuid,
    fork_reason: ForkReason,
) -> anyhow::Result<String> {
    let source = conn
        .query_opt(
            "SELECT id, project_id, title, description, layers
             FROM user_mundiai_maps
             WHERE id = $1 AND soft_deleted_at IS NULL",
            &[&map_id],
        )
        .await?
        .with_context(|| {
            ErrorMetadata::not_found("MapNotFound", format!("Map {map_id} not found"))
        })?;

    let project_id: String = source.get("project_id");
    let title: Option<String> = source.get("title");
    let description: Option<String> = source.get("description");
    let layers: Option<Vec<String>> = source.get("layers");

    let new_map_id = generate_id(IdPrefix::Map);
    conn.execute(
        "INSERT INTO user_mundiai_maps
         (id, project_id, owner_uuid, title, description, layers, parent_map_id,
          display_as_diff, fork_reason)
         VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8)",
        &[
            &new_map_id,
            &project_id,
            &user_id,
            &title,
            &description,
            &layers,
            &map_id,
            &fork_reason.as_str(),
        ],
    )
    .await?;

    if layers.is_some_and(|l| !l.is_empty()) {
        conn.execute(
            "INSERT INTO map_layer_styles (map_id, layer_id, style_id)
             SELECT $1, layer_id, style_id
             FROM map_layer_styles
             WHERE map_id = $2",
            &[&new_map_id, &map_id],
        )
        .await?;
    }

    conn.execute(
        "UPDATE user_mundiai_projects
         SET maps = array_append(maps, $1),
             map_diff_messages = array_append(map_diff_messages, $2)
         WHERE id = $3",
        &[&new_map_id, &"N/A", &project_id],
    )
    .await?;

    Ok(new_map_id)
}

/// All map ids from the root down to `leaf_map_id`, oldest first. Refuses to
/// walk a chain that re-encounters a visited id.
pub async fn parent_chain(
    conn: &PgConnection,
    leaf_map_id: &str,
) -> anyhow::Result<Vec<String>> {
    let mut chain: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut current = Some(leaf_map_id.to_string());

    while let Some(map_id) = current {
        if !seen.insert(map_id.clone()) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MapDagCycle",
                "Encountered loop in map parent chain",
            ));
        }
        chain.insert(0, map_id.clone());

        let row = conn
            .query_opt(
                "SELECT parent_map_id
                 FROM user_mundiai_maps
                 WHERE id = $1 AND soft_deleted_at IS NULL",
                &[&map_id],
            )
            .await?;
        current = match row {
            Some(row) => row.get("parent_map_id"),
            None => None,
        };
    }

    Ok(chain)
}
