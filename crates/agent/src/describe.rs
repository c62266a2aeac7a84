//! Builds the markdown map description the loop injects as system context.

use model::store;
use model::types::MundiMap;
use pg::PgConnection;

use crate::AgentDeps;

/// Markdown overview of a map: its layers with their salient attributes,
/// plus the project's PostGIS connections and their table listings.
pub async fn map_description(
    deps: &AgentDeps,
    conn: &PgConnection,
    map: &MundiMap,
) -> anyhow::Result<String> {
    let mut out = String::new();
    out.push_str(&format!(
        "# {}\n\n",
        map.title.as_deref().unwrap_or("Untitled map")
    ));
    if let Some(description) = map.description.as_deref().filter(|d| !d.is_empty()) {
        out.push_str(description);
        out.push_str("\n\n");
    }

    let layers = store::layers_for_map(conn, map).await?;
    if layers.is_empty() {
        out.push_str("The map has no layers.\n");
    } else {
        out.push_str("## Layers\n\n");
        for layer in &layers {
            out.push_str(&format!(
                "- {} (ID {}, {}",
                layer.display_name(),
                layer.layer_id,
                layer.kind.as_str()
            ));
            if let Some(geometry_type) = &layer.geometry_type {
                out.push_str(&format!(", {geometry_type}"));
            }
            if let Some(feature_count) = layer.feature_count {
                out.push_str(&format!(", {feature_count} features"));
            }
            if let Some(bounds) = &layer.bounds {
                if bounds.len() == 4 {
                    out.push_str(&format!(
                        ", bounds [{:.4}, {:.4}, {:.4}, {:.4}]",
                        bounds[0], bounds[1], bounds[2], bounds[3]
                    ));
                }
            }
            if let Some(columns) = &layer.postgis_attribute_column_list {
                if !columns.is_empty() {
                    out.push_str(&format!(", attributes: {}", columns.join(", ")));
                }
            }
            out.push_str(")\n");
        }
    }

    let connections = conn
        .query(
            "SELECT id, connection_name, last_error_text
             FROM project_postgres_connections
             WHERE project_id = $1 AND soft_deleted_at IS NULL",
            &[&map.project_id],
        )
        .await?;
    if !connections.is_empty() {
        out.push_str("\n## PostGIS connections\n\n");
        for row in &connections {
            let connection_id: String = row.get("id");
            let name: Option<String> = row.get("connection_name");
            let last_error: Option<String> = row.get("last_error_text");
            out.push_str(&format!(
                "- {} (ID {connection_id})",
                name.as_deref().unwrap_or("Unnamed database")
            ));
            if let Some(error) = last_error {
                out.push_str(&format!(" - last error: {error}"));
            }
            out.push('\n');
            match tables_for_connection(deps, &connection_id).await {
                Ok(tables) => {
                    out.push_str(&format!("  Tables: {tables}\n"));
                },
                Err(e) => {
                    tracing::warn!("failed to list tables for {connection_id}: {e:#}");
                    out.push_str("  Tables: (unavailable)\n");
                },
            }
        }
    }

    Ok(out)
}

/// Table listing for a user database, cached in Redis for an hour.
async fn tables_for_connection(deps: &AgentDeps, connection_id: &str) -> anyhow::Result<String> {
    if let Some(cached) = deps.redis.cached_tables(connection_id).await? {
        return Ok(cached);
    }

    let session = deps.manager.connect(connection_id).await?;
    let rows = session
        .query(
            "SELECT t.table_name, t.table_schema
             FROM information_schema.tables t
             WHERE t.table_schema NOT IN ('information_schema', 'pg_catalog', 'pg_toast')
             AND t.table_type = 'BASE TABLE'
             ORDER BY t.table_schema, t.table_name",
            &[],
        )
        .await?;
    let listing = rows
        .iter()
        .map(|row| {
            let schema: String = row.get("table_schema");
            let table: String = row.get("table_name");
            format!("{schema}.{table}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    deps.redis.cache_tables(connection_id, &listing).await?;
    Ok(listing)
}
