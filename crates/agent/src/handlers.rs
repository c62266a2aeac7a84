//! Per-tool handlers and the dispatcher.
//!
//! Handlers return the tool-result JSON persisted as the `tool` message.
//! Anything the conversation can recover from is an `{status: "error"}`
//! result; only infrastructure failures (application DB down, broken
//! invariants) propagate as `Err` and terminate the loop.

use model::ids::{
    generate_id,
    IdPrefix,
};
use model::messages::ToolCall;
use model::store::{
    self,
    NewPostgisLayer,
};
use model::symbology;
use notifications::{
    EphemeralAction,
    EphemeralOptions,
};
use serde_json::{
    json,
    Value as JsonValue,
};
use uuid::Uuid;

use crate::guard;
use crate::osm;
use crate::qgis;
use crate::style;
use crate::tools::{
    self,
    AddLayerToMapArgs,
    NewLayerFromPostgisArgs,
    OsmDownloadArgs,
    QueryDuckdbArgs,
    QueryPostgisArgs,
    SetLayerStyleArgs,
    ZoomToBoundsArgs,
};
use crate::AgentDeps;

fn error_result(message: impl Into<String>) -> JsonValue {
    json!({"status": "error", "error": message.into()})
}

/// Runs one tool call and returns its result document. Unknown tool names
/// are a protocol violation and abort the loop.
pub async fn dispatch_tool_call(
    deps: &AgentDeps,
    user_id: Uuid,
    map_id: &str,
    conversation_id: i32,
    call: &ToolCall,
) -> anyhow::Result<JsonValue> {
    let name = call.function.name.as_str();
    let arguments = call.function.arguments.as_str();
    tracing::info!(tool = name, conversation_id, "running tool call");

    let result = match name {
        tools::NEW_LAYER_FROM_POSTGIS => match tools::parse_args(arguments) {
            Ok(args) => new_layer_from_postgis(deps, user_id, map_id, conversation_id, args).await?,
            Err(e) => error_result(e),
        },
        tools::ADD_LAYER_TO_MAP => match tools::parse_args(arguments) {
            Ok(args) => add_layer_to_map(deps, user_id, map_id, conversation_id, args).await?,
            Err(e) => error_result(e),
        },
        tools::SET_LAYER_STYLE => match tools::parse_args(arguments) {
            Ok(args) => set_layer_style(deps, user_id, map_id, conversation_id, args).await?,
            Err(e) => error_result(e),
        },
        tools::QUERY_DUCKDB_SQL => match tools::parse_args(arguments) {
            Ok(args) => query_duckdb_sql(deps, user_id, conversation_id, args).await?,
            Err(e) => error_result(e),
        },
        tools::QUERY_POSTGIS_DATABASE => match tools::parse_args(arguments) {
            Ok(args) => query_postgis_database(deps, user_id, conversation_id, args).await?,
            Err(e) => error_result(e),
        },
        tools::ZOOM_TO_BOUNDS => match tools::parse_args(arguments) {
            Ok(args) => zoom_to_bounds(deps, conversation_id, args).await?,
            Err(e) => error_result(e),
        },
        tools::DOWNLOAD_FROM_OPENSTREETMAP => match tools::parse_args(arguments) {
            Ok(args) => download_from_openstreetmap(deps, user_id, map_id, conversation_id, args).await?,
            Err(e) => error_result(e),
        },
        name if qgis::is_geoprocessing_tool(name) => {
            let args: JsonValue = serde_json::from_str(arguments).unwrap_or(JsonValue::Null);
            qgis::run_geoprocessing_tool(deps, user_id, map_id, conversation_id, name, &args)
                .await?
        },
        unknown => anyhow::bail!(errors::ErrorMetadata::bad_request(
            "UnknownTool",
            format!("LLM requested unknown tool {unknown}"),
        )),
    };
    Ok(result)
}

async fn new_layer_from_postgis(
    deps: &AgentDeps,
    user_id: Uuid,
    map_id: &str,
    conversation_id: i32,
    args: NewLayerFromPostgisArgs,
) -> anyhow::Result<JsonValue> {
    // Trailing semicolons break every subquery wrapping below.
    let query = args.query.trim().trim_end_matches(';').trim_end().to_string();
    if query.is_empty() {
        return Ok(error_result("Missing required parameters (postgis_connection_id or query)."));
    }

    let conn = deps.app_pool.acquire("new_layer_from_postgis").await?;
    let owned = conn
        .query_opt(
            "SELECT connection_uri FROM project_postgres_connections
             WHERE id = $1 AND user_id = $2",
            &[&args.postgis_connection_id, &user_id.to_string()],
        )
        .await?;
    if owned.is_none() {
        return Ok(error_result(format!(
            "PostGIS connection '{}' not found or you do not have access to it.",
            args.postgis_connection_id
        )));
    }

    let _action = EphemeralAction::begin_with(
        &deps.bus,
        conversation_id,
        "Adding layer from PostGIS...",
        EphemeralOptions {
            update_style_json: true,
            ..Default::default()
        },
    )
    .await;

    let inspected = match inspect_postgis_query(deps, &args.postgis_connection_id, &query).await {
        Ok(inspected) => inspected,
        Err(e) => return Ok(error_result(format!("Query validation failed: {e:#}"))),
    };

    let layer_id = generate_id(IdPrefix::Layer);
    let style_layers = inspected
        .geometry_type
        .as_deref()
        .map(|geometry_type| symbology::default_layers_for_geometry(&layer_id, geometry_type));

    store::insert_postgis_layer(
        &conn,
        &NewPostgisLayer {
            layer_id: layer_id.clone(),
            owner_uuid: user_id,
            name: args.layer_name.clone(),
            postgis_connection_id: args.postgis_connection_id.clone(),
            postgis_query: query.clone(),
            attribute_columns: inspected.attribute_columns.clone(),
            feature_count: inspected.feature_count,
            bounds: inspected.bounds.clone(),
            geometry_type: inspected.geometry_type.clone(),
            source_map_id: map_id.to_string(),
        },
    )
    .await?;
    if let Some(style_layers) = style_layers {
        let style_id =
            store::insert_style(&conn, &layer_id, &json!(style_layers), user_id, None).await?;
        store::link_style(&conn, map_id, &layer_id, &style_id).await?;
    }
    store::append_layer_to_map(&conn, map_id, &layer_id).await?;

    Ok(json!({
        "status": "success",
        "message": format!("PostGIS layer created successfully with ID: {layer_id} and added to map"),
        "layer_id": layer_id,
        "query": query,
        "added_to_map": true,
    }))
}

struct InspectedQuery {
    attribute_columns: Vec<String>,
    feature_count: Option<i32>,
    geometry_type: Option<String>,
    bounds: Option<Vec<f64>>,
}

/// Validates a layer query against the user database and derives the layer's
/// statistics: plan must be read-only, columns must include `id` and `geom`,
/// and count/geometry kind/WGS84 extent are computed server-side.
async fn inspect_postgis_query(
    deps: &AgentDeps,
    connection_id: &str,
    query: &str,
) -> anyhow::Result<InspectedQuery> {
    let session = deps.manager.connect(connection_id).await?;

    let explain = session
        .query_one(&format!("EXPLAIN (FORMAT JSON) {query}"), &[])
        .await?;
    let plan_doc: JsonValue = explain.get(0);
    let plan = plan_doc
        .get(0)
        .and_then(|entry| entry.get("Plan"))
        .ok_or_else(|| anyhow::anyhow!("unexpected EXPLAIN output shape"))?;
    guard::check_plan_readonly(plan).map_err(|e| anyhow::anyhow!(e))?;

    let prepared = session
        .prepare(&format!("SELECT * FROM ({query}) AS sub LIMIT 1"))
        .await?;
    let column_names: Vec<String> = prepared
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();
    if !column_names.iter().any(|name| name == "geom") {
        anyhow::bail!("Query must return a column named 'geom'");
    }
    if !column_names.iter().any(|name| name == "id") {
        anyhow::bail!("Query must return a column named 'id'");
    }
    let attribute_columns: Vec<String> = column_names
        .into_iter()
        .filter(|name| name != "geom" && name != "id")
        .collect();

    let count_row = session
        .query_one(&format!("SELECT COUNT(*) FROM ({query}) AS sub"), &[])
        .await?;
    let feature_count = Some(count_row.get::<_, i64>(0) as i32);

    let geometry_row = session
        .query_opt(
            &format!(
                "SELECT ST_GeometryType(geom) AS geom_type, COUNT(*) AS count
                 FROM ({query}) AS sub
                 WHERE geom IS NOT NULL
                 GROUP BY ST_GeometryType(geom)
                 ORDER BY count DESC
                 LIMIT 1"
            ),
            &[],
        )
        .await?;
    let geometry_type = geometry_row.map(|row| {
        row.get::<_, String>("geom_type")
            .trim_start_matches("ST_")
            .to_ascii_lowercase()
    });

    let mut bounds = None;
    if geometry_type.is_some() {
        // ST_Extent returns a BOX2D with SRID 0; restore the source SRID
        // before transforming to 4326 (a no-op when already 4326).
        let bounds_row = session
            .query_opt(
                &format!(
                    "WITH extent_data AS (
                        SELECT
                            ST_Extent(geom) AS extent_geom,
                            (SELECT ST_SRID(geom) FROM ({query}) AS sub2
                             WHERE geom IS NOT NULL LIMIT 1) AS original_srid
                        FROM ({query}) AS sub
                        WHERE geom IS NOT NULL
                    )
                    SELECT
                        CASE WHEN original_srid = 4326 THEN ST_XMin(extent_geom)
                             ELSE ST_XMin(ST_Transform(ST_SetSRID(extent_geom, original_srid), 4326))
                        END AS xmin,
                        CASE WHEN original_srid = 4326 THEN ST_YMin(extent_geom)
                             ELSE ST_YMin(ST_Transform(ST_SetSRID(extent_geom, original_srid), 4326))
                        END AS ymin,
                        CASE WHEN original_srid = 4326 THEN ST_XMax(extent_geom)
                             ELSE ST_XMax(ST_Transform(ST_SetSRID(extent_geom, original_srid), 4326))
                        END AS xmax,
                        CASE WHEN original_srid = 4326 THEN ST_YMax(extent_geom)
                             ELSE ST_YMax(ST_Transform(ST_SetSRID(extent_geom, original_srid), 4326))
                        END AS ymax
                    FROM extent_data
                    WHERE extent_geom IS NOT NULL"
                ),
                &[],
            )
            .await?;
        if let Some(row) = bounds_row {
            let coords = [
                row.get::<_, Option<f64>>("xmin"),
                row.get::<_, Option<f64>>("ymin"),
                row.get::<_, Option<f64>>("xmax"),
                row.get::<_, Option<f64>>("ymax"),
            ];
            if coords.iter().all(|c| c.is_some()) {
                bounds = Some(coords.iter().map(|c| c.unwrap()).collect());
            }
        }
    } else {
        tracing::warn!("no geometry rows found in PostGIS layer query");
    }

    Ok(InspectedQuery {
        attribute_columns,
        feature_count,
        geometry_type,
        bounds,
    })
}

async fn add_layer_to_map(
    deps: &AgentDeps,
    user_id: Uuid,
    map_id: &str,
    conversation_id: i32,
    args: AddLayerToMapArgs,
) -> anyhow::Result<JsonValue> {
    let _action = EphemeralAction::begin_with(
        &deps.bus,
        conversation_id,
        "Adding layer to map...",
        EphemeralOptions {
            update_style_json: true,
            ..Default::default()
        },
    )
    .await;

    let conn = deps.app_pool.acquire("add_layer_to_map").await?;
    if store::get_layer(&conn, &args.layer_id, user_id).await?.is_none() {
        return Ok(error_result(format!(
            "Layer ID '{}' not found or you do not have permission to use it.",
            args.layer_id
        )));
    }
    store::rename_layer(&conn, &args.layer_id, &args.new_name).await?;
    store::append_layer_to_map(&conn, map_id, &args.layer_id).await?;

    Ok(json!({
        "status": format!("Layer '{}' (ID: {}) added to map '{map_id}'.", args.new_name, args.layer_id),
        "layer_id": args.layer_id,
        "name": args.new_name,
    }))
}

async fn set_layer_style(
    deps: &AgentDeps,
    user_id: Uuid,
    map_id: &str,
    conversation_id: i32,
    args: SetLayerStyleArgs,
) -> anyhow::Result<JsonValue> {
    let mut render_layers: Vec<JsonValue> =
        match serde_json::from_str(&args.maplibre_json_layers_str) {
            Ok(layers) => layers,
            Err(e) => {
                return Ok(json!({
                    "status": "error",
                    "error": format!("Invalid JSON format: {e}"),
                    "layer_id": args.layer_id,
                }))
            },
        };

    let conn = deps.app_pool.acquire("set_layer_style").await?;
    let Some(layer) = store::get_layer(&conn, &args.layer_id, user_id).await? else {
        return Ok(error_result(format!(
            "Layer ID '{}' not found or you do not have permission to use it.",
            args.layer_id
        )));
    };

    let _action = EphemeralAction::begin_with(
        &deps.bus,
        conversation_id,
        format!("Styling layer {}...", layer.display_name()),
        EphemeralOptions {
            update_style_json: true,
            ..Default::default()
        },
    )
    .await;

    if let Err(e) = style::normalize_render_layers(&mut render_layers, &layer) {
        return Ok(json!({
            "status": "error",
            "error": format!("Failed to create and apply style: {e}"),
            "layer_id": args.layer_id,
        }));
    }

    // Validate the document the clients will actually consume: this style
    // composed together with the map's other active styles.
    let map = store::get_map(&conn, map_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("map {map_id} vanished mid-tool-call"))?;
    let mut entries: Vec<(String, JsonValue)> = store::active_styles_for_map(&conn, &map).await?;
    entries.retain(|(existing, _)| existing != &args.layer_id);
    entries.push((args.layer_id.clone(), json!(render_layers)));

    let mut layers_by_id = Vec::new();
    for (layer_id, style_layers) in &entries {
        if let Some(map_layer) = store::get_layer(&conn, layer_id, user_id).await? {
            layers_by_id.push((map_layer, style_layers.clone()));
        }
    }
    let entry_refs: Vec<(&model::MapLayer, JsonValue)> = layers_by_id
        .iter()
        .map(|(layer, style_layers)| (layer, style_layers.clone()))
        .collect();
    let website_domain =
        std::env::var("WEBSITE_DOMAIN").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let document =
        style::compose_style_document(&website_domain, map.title.as_deref(), &entry_refs);
    if let Err(e) = style::validate_style_document(&document).await {
        return Ok(json!({
            "status": "error",
            "error": format!("Failed to create and apply style: {e:#}"),
            "layer_id": args.layer_id,
        }));
    }

    let style_id =
        store::insert_style(&conn, &args.layer_id, &json!(render_layers), user_id, None).await?;
    store::link_style(&conn, map_id, &args.layer_id, &style_id).await?;

    Ok(json!({
        "status": "success",
        "style_id": style_id,
        "layer_id": args.layer_id,
        "message": format!("Style {style_id} created and applied to layer {}", args.layer_id),
    }))
}

async fn query_duckdb_sql(
    deps: &AgentDeps,
    user_id: Uuid,
    conversation_id: i32,
    args: QueryDuckdbArgs,
) -> anyhow::Result<JsonValue> {
    let Some(layer_id) = args.layer_ids.first() else {
        return Ok(error_result("layer_ids must name one vector layer"));
    };

    let conn = deps.app_pool.acquire("query_duckdb_sql").await?;
    let Some(layer) = store::get_layer(&conn, layer_id, user_id).await? else {
        return Ok(error_result(format!(
            "Layer ID '{layer_id}' not found or you do not have permission to access it."
        )));
    };
    drop(conn);

    let _action = EphemeralAction::begin_with(
        &deps.bus,
        conversation_id,
        "Querying with SQL...",
        EphemeralOptions {
            layer_id: Some(layer_id.clone()),
            ..Default::default()
        },
    )
    .await;

    let guard_file = match deps.layer_cache.layer_file(&deps.store, &layer).await {
        Ok(guard_file) => guard_file,
        Err(e) => return Ok(error_result(format!("DuckDB query error: {e:#}"))),
    };
    let result = crate::duck::execute_duckdb_query(
        guard_file.path(),
        layer_id,
        &args.sql_query,
        args.head_n_rows,
    )
    .await;
    let result = match result {
        Ok(result) => result,
        Err(e) => return Ok(error_result(format!("DuckDB query error: {e:#}"))),
    };

    let csv = guard::to_csv(&result.headers, &result.rows);
    if csv.len() > guard::MAX_TOOL_RESULT_CHARS {
        return Ok(error_result(format!(
            "DuckDB CSV result too large: {} characters exceeds {} character limit, try reducing columns or head_n_rows",
            csv.len(),
            guard::MAX_TOOL_RESULT_CHARS,
        )));
    }
    Ok(json!({
        "status": "success",
        "result": csv,
        "row_count": result.row_count,
        "query": args.sql_query,
    }))
}

fn json_scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn query_postgis_database(
    deps: &AgentDeps,
    user_id: Uuid,
    conversation_id: i32,
    args: QueryPostgisArgs,
) -> anyhow::Result<JsonValue> {
    let conn = deps.app_pool.acquire("query_postgis_database").await?;
    let owned = conn
        .query_opt(
            "SELECT connection_uri FROM project_postgres_connections
             WHERE id = $1 AND user_id = $2",
            &[&args.postgis_connection_id, &user_id.to_string()],
        )
        .await?;
    drop(conn);
    if owned.is_none() {
        return Ok(error_result(format!(
            "PostGIS connection '{}' not found or you do not have access to it.",
            args.postgis_connection_id
        )));
    }

    let sql = args.sql_query.trim().trim_end_matches(';').to_string();
    if let Err(e) = guard::validate_limit_clause(&sql) {
        return Ok(error_result(e));
    }

    let _action =
        EphemeralAction::begin(&deps.bus, conversation_id, "Querying PostgreSQL database...").await;

    let session = match deps.manager.connect(&args.postgis_connection_id).await {
        Ok(session) => session,
        Err(e) => return Ok(error_result(format!("PostgreSQL query error: {e:#}"))),
    };
    // Serialize server-side so heterogeneous column types come back as one
    // JSON document, preserving column order.
    let wrapped = format!(
        "SELECT coalesce(array_to_json(array_agg(row_to_json(sub))), '[]'::json) FROM ({sql}) AS sub"
    );
    let row = match session.query_one(&wrapped, &[]).await {
        Ok(row) => row,
        Err(e) => {
            return Ok(json!({
                "status": "error",
                "error": format!("PostgreSQL query error: {e:#}"),
                "query": sql,
            }))
        },
    };
    let rows_json: JsonValue = row.get(0);
    let rows = rows_json.as_array().cloned().unwrap_or_default();

    if rows.is_empty() {
        return Ok(json!({
            "status": "success",
            "message": "Query executed successfully but returned no rows",
            "row_count": 0,
            "query": sql,
        }));
    }

    let headers: Vec<String> = rows[0]
        .as_object()
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default();
    let table: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            headers
                .iter()
                .map(|header| json_scalar_to_string(row.get(header).unwrap_or(&JsonValue::Null)))
                .collect()
        })
        .collect();
    let text = guard::to_tsv(&headers, &table);

    if text.len() > guard::MAX_TOOL_RESULT_CHARS {
        return Ok(error_result(format!(
            "Query result too large: {} characters exceeds {} character limit. Try reducing the number of columns or rows.",
            text.len(),
            guard::MAX_TOOL_RESULT_CHARS,
        )));
    }
    Ok(json!({
        "status": "success",
        "result": text,
        "row_count": table.len(),
        "query": sql,
    }))
}

async fn zoom_to_bounds(
    deps: &AgentDeps,
    conversation_id: i32,
    args: ZoomToBoundsArgs,
) -> anyhow::Result<JsonValue> {
    if let Err(e) = validate_wgs84_bounds(&args.bounds) {
        return Ok(error_result(e));
    }

    // Pure UI intent: the ephemeral payload carries the bounds; the pause
    // lets the client animate before the scope completes.
    let action = EphemeralAction::begin_with(
        &deps.bus,
        conversation_id,
        args.zoom_description.clone(),
        EphemeralOptions {
            bounds: Some(args.bounds.clone()),
            ..Default::default()
        },
    )
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    drop(action);

    Ok(json!({"status": "success", "bounds": args.bounds}))
}

fn validate_wgs84_bounds(bounds: &[f64]) -> Result<(), String> {
    if bounds.len() != 4 {
        return Err(
            "Invalid bounds. Must be an array of 4 numbers [west, south, east, north]".to_string(),
        );
    }
    let (west, south, east, north) = (bounds[0], bounds[1], bounds[2], bounds[3]);
    if west >= east || south >= north {
        return Err("Invalid bounds: west must be < east and south must be < north".to_string());
    }
    if !((-180.0..=180.0).contains(&west)
        && (-180.0..=180.0).contains(&east)
        && (-90.0..=90.0).contains(&south)
        && (-90.0..=90.0).contains(&north))
    {
        return Err("Bounds must be in valid WGS84 range".to_string());
    }
    Ok(())
}

async fn download_from_openstreetmap(
    deps: &AgentDeps,
    user_id: Uuid,
    map_id: &str,
    conversation_id: i32,
    args: OsmDownloadArgs,
) -> anyhow::Result<JsonValue> {
    let _action = EphemeralAction::begin(
        &deps.bus,
        conversation_id,
        format!("Downloading data from OpenStreetMap: {}", args.tags),
    )
    .await;

    let conn = deps.app_pool.acquire("download_from_openstreetmap").await?;
    match osm::download_from_openstreetmap(
        deps,
        &conn,
        user_id,
        map_id,
        &args.tags,
        &args.bbox,
        &args.new_layer_name,
    )
    .await
    {
        Ok(result) => Ok(result),
        Err(e) => Ok(error_result(format!(
            "Error downloading from OpenStreetMap: {e:#}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_validation() {
        assert!(validate_wgs84_bounds(&[-122.6, 37.6, -122.3, 37.9]).is_ok());
        // west >= east
        assert!(validate_wgs84_bounds(&[-122.3, 37.6, -122.6, 37.9]).is_err());
        // south >= north
        assert!(validate_wgs84_bounds(&[-122.6, 37.9, -122.3, 37.6]).is_err());
        // out of range
        assert!(validate_wgs84_bounds(&[-190.0, 37.6, -122.3, 37.9]).is_err());
        assert!(validate_wgs84_bounds(&[-122.6, -95.0, -122.3, 37.9]).is_err());
        // wrong arity
        assert!(validate_wgs84_bounds(&[0.0, 0.0, 1.0]).is_err());
    }

    #[test]
    fn test_json_scalar_rendering() {
        assert_eq!(json_scalar_to_string(&json!(null)), "");
        assert_eq!(json_scalar_to_string(&json!("a")), "a");
        assert_eq!(json_scalar_to_string(&json!(18)), "18");
        assert_eq!(json_scalar_to_string(&json!(2.5)), "2.5");
        assert_eq!(json_scalar_to_string(&json!(true)), "true");
        assert_eq!(json_scalar_to_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_error_result_shape() {
        let result = error_result("nope");
        assert_eq!(result["status"], "error");
        assert_eq!(result["error"], "nope");
    }
}
