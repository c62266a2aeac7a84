use agent::style;
use anyhow::Context as _;
use axum::extract::{
    Multipart,
    Path,
    State,
};
use axum::http::{
    header,
    HeaderMap,
    StatusCode,
};
use axum::response::{
    IntoResponse,
    Response,
};
use axum::Json;
use errors::ErrorMetadata;
use model::mvt::{
    build_mvt_query,
    validate_tile_coords,
};
use model::store;
use model::types::MapLayer;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::auth::UserContext;
use crate::http_error::HttpResult;
use crate::AppState;

const LAYER_EXTENSIONS: &[&str] = &[".pmtiles", ".cog.tif", ".geojson", ".laz"];

fn split_layer_filename(filename: &str) -> anyhow::Result<(&str, &str)> {
    for extension in LAYER_EXTENSIONS {
        if let Some(layer_id) = filename.strip_suffix(extension) {
            return Ok((layer_id, extension));
        }
    }
    anyhow::bail!(ErrorMetadata::not_found(
        "UnknownLayerFormat",
        format!("No layer format matches {filename}"),
    ))
}

/// `bytes=start-end` with an optional end. Anything else is ignored (full
/// response), matching the lenient behavior browsers depend on.
fn parse_range_header(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: Option<u64> = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

fn object_key_for(layer: &MapLayer, extension: &str) -> anyhow::Result<String> {
    let from_metadata = |key: &str| {
        layer
            .metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let key = match extension {
        ".pmtiles" => from_metadata("pmtiles_key"),
        ".cog.tif" => from_metadata("cog_key").or_else(|| Some(storage::cog_key(&layer.layer_id))),
        _ => layer.s3_key.clone(),
    };
    key.with_context(|| {
        ErrorMetadata::not_found(
            "LayerArtifactMissing",
            format!("Layer {} has no {extension} rendition", layer.layer_id),
        )
    })
}

/// Byte stream of a layer artifact with HTTP range support.
pub async fn layer_bytes(
    State(state): State<AppState>,
    user: UserContext,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> HttpResult<Response> {
    let (layer_id, extension) = split_layer_filename(&filename)?;
    let conn = state.deps.app_pool.acquire("layer_bytes").await?;
    let layer = store::get_layer(&conn, layer_id, user.user_id)
        .await?
        .with_context(|| {
            ErrorMetadata::not_found("LayerNotFound", format!("Layer {layer_id} not found"))
        })?;
    drop(conn);
    let key = object_key_for(&layer, extension)?;

    let response = match parse_range_header(&headers) {
        Some((start, end)) => {
            let end = match end {
                Some(end) => end,
                None => state.deps.store.object_size(&key).await?.saturating_sub(1),
            };
            let ranged = state.deps.store.get_object_range(&key, start, end).await?;
            let actual_end = start + ranged.body.len().saturating_sub(1) as u64;
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{actual_end}/{}", ranged.total_size),
                    ),
                ],
                ranged.body,
            )
                .into_response()
        },
        None => {
            let body = state.deps.store.get_object(&key).await?;
            (
                StatusCode::OK,
                [(header::ACCEPT_RANGES, "bytes".to_string())],
                body,
            )
                .into_response()
        },
    };
    Ok(response)
}

/// Vector tile for a PostGIS layer.
///
/// The tile query runs on the per-URI pooled user connection. When the
/// client disconnects mid-fetch the server drops this handler's future,
/// which cancels the in-flight query; that is the tokio counterpart of
/// racing the fetch against a disconnect watcher and discarding the loser.
pub async fn mvt_tile(
    State(state): State<AppState>,
    user: UserContext,
    Path((layer_id, z, x, y_ext)): Path<(String, u32, u32, String)>,
) -> HttpResult<Response> {
    let y: u32 = y_ext
        .strip_suffix(".mvt")
        .and_then(|y| y.parse().ok())
        .with_context(|| {
            ErrorMetadata::bad_request("InvalidTileCoordinates", "Invalid tile coordinates")
        })?;
    validate_tile_coords(z, x, y)?;

    let conn = state.deps.app_pool.acquire("mvt_tile").await?;
    let layer = store::get_layer(&conn, &layer_id, user.user_id)
        .await?
        .with_context(|| {
            ErrorMetadata::not_found("LayerNotFound", format!("Layer {layer_id} not found"))
        })?;
    let connection_id = layer.postgis_connection_id.clone().with_context(|| {
        ErrorMetadata::bad_request(
            "NotAPostgisLayer",
            "MVT tiles can only be generated from PostGIS data.",
        )
    })?;
    let owned = conn
        .query_opt(
            "SELECT id FROM project_postgres_connections WHERE id = $1 AND user_id = $2",
            &[&connection_id, &user.user_id.to_string()],
        )
        .await?;
    drop(conn);
    if owned.is_none() {
        return Err(anyhow::anyhow!(ErrorMetadata::not_found(
            "PostgresConnectionNotFound",
            "PostGIS connection not found",
        ))
        .into());
    }

    let query = build_mvt_query(&layer)?;
    let pool = state.deps.manager.pooled(&connection_id).await?;
    let tile_conn = pool.acquire("mvt_tile_fetch").await?;
    let row = tile_conn
        .query_opt(&query, &[&(z as i32), &(x as i32), &(y as i32)])
        .await?;
    let tile: Vec<u8> = row
        .and_then(|row| row.get::<_, Option<Vec<u8>>>(0))
        .unwrap_or_default();

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/vnd.mapbox-vector-tile"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        tile,
    )
        .into_response())
}

fn layer_kind_for_extension(extension: &str) -> model::LayerKind {
    match extension {
        ".tif" | ".tiff" => model::LayerKind::Raster,
        ".laz" => model::LayerKind::PointCloud,
        _ => model::LayerKind::Vector,
    }
}

#[derive(Serialize)]
pub struct UploadLayerResponse {
    pub id: String,
    pub name: String,
    pub dag_child_map_id: String,
    pub dag_parent_map_id: String,
}

/// Uploads a file-backed layer and attaches it to the map. Attachment
/// mutates the snapshot DAG: the layer lands on a fresh child map, and the
/// child's id comes back in the response.
pub async fn upload_layer(
    State(state): State<AppState>,
    user: UserContext,
    Path(map_id): Path<String>,
    mut multipart: Multipart,
) -> HttpResult<Json<UploadLayerResponse>> {
    let mut file: Option<(String, bytes::Bytes)> = None;
    let mut layer_name: Option<String> = None;
    while let Some(field) = multipart.next_field().await.map_err(anyhow::Error::from)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload.bin".to_string());
                file = Some((filename, field.bytes().await.map_err(anyhow::Error::from)?));
            },
            Some("layer_name") => {
                layer_name = Some(field.text().await.map_err(anyhow::Error::from)?);
            },
            _ => {},
        }
    }
    let (filename, contents) = file.with_context(|| {
        ErrorMetadata::bad_request("MissingFile", "Multipart upload requires a 'file' part")
    })?;
    let extension = match filename.rfind('.') {
        Some(dot) => filename[dot..].to_ascii_lowercase(),
        None => {
            return Err(anyhow::anyhow!(ErrorMetadata::bad_request(
                "MissingFileExtension",
                "Uploaded file must have a file extension",
            ))
            .into())
        },
    };
    let layer_name = layer_name.unwrap_or_else(|| filename.clone());

    let conn = state.deps.app_pool.acquire("upload_layer").await?;
    let map = store::get_map(&conn, &map_id)
        .await?
        .filter(|m| m.owner_uuid == user.user_id)
        .with_context(|| {
            ErrorMetadata::not_found("MapNotFound", format!("Map {map_id} not found"))
        })?;

    let layer_id = model::generate_id(model::IdPrefix::Layer);
    let key = storage::upload_key(
        &user.user_id.to_string(),
        &map.project_id,
        &layer_id,
        &extension,
    );
    state
        .deps
        .store
        .put_object(&key, contents, "application/octet-stream")
        .await?;

    let metadata = (extension == ".gpkg").then(|| serde_json::json!({"geopackage_key": key}));
    store::insert_file_layer(
        &conn,
        &model::store::NewFileLayer {
            layer_id: layer_id.clone(),
            owner_uuid: user.user_id,
            name: layer_name.clone(),
            kind: layer_kind_for_extension(&extension),
            s3_key: key.clone(),
            metadata,
            source_map_id: Some(map_id.clone()),
        },
    )
    .await?;

    // Attaching forks a child snapshot; the parent stays immutable.
    let child_map_id =
        model::dag::fork_map(&conn, &map_id, user.user_id, model::ForkReason::UserEdit).await?;
    store::append_layer_to_map(&conn, &child_map_id, &layer_id).await?;

    Ok(Json(UploadLayerResponse {
        id: layer_id,
        name: layer_name,
        dag_child_map_id: child_map_id,
        dag_parent_map_id: map_id,
    }))
}

#[derive(Deserialize)]
pub struct SetStyleRequest {
    pub maplibre_json_layers: Vec<JsonValue>,
    pub map_id: String,
}

#[derive(Serialize)]
pub struct SetStyleResponse {
    pub style_id: String,
    pub layer_id: String,
}

/// Replaces the active style for (map, layer) after validating the composed
/// document.
pub async fn set_layer_style(
    State(state): State<AppState>,
    user: UserContext,
    Path(layer_id): Path<String>,
    Json(body): Json<SetStyleRequest>,
) -> HttpResult<Json<SetStyleResponse>> {
    let conn = state.deps.app_pool.acquire("set_layer_style").await?;
    let layer = store::get_layer(&conn, &layer_id, user.user_id)
        .await?
        .with_context(|| {
            ErrorMetadata::not_found("LayerNotFound", format!("Layer {layer_id} not found"))
        })?;
    let map = store::get_map(&conn, &body.map_id)
        .await?
        .filter(|m| m.owner_uuid == user.user_id)
        .with_context(|| {
            ErrorMetadata::not_found("MapNotFound", format!("Map {} not found", body.map_id))
        })?;

    let mut render_layers = body.maplibre_json_layers;
    style::normalize_render_layers(&mut render_layers, &layer)
        .map_err(|e| ErrorMetadata::bad_request("InvalidStyle", e))?;

    let mut entries: Vec<(String, JsonValue)> = store::active_styles_for_map(&conn, &map).await?;
    entries.retain(|(existing, _)| existing != &layer_id);
    entries.push((layer_id.clone(), serde_json::json!(render_layers)));
    let mut composed = Vec::new();
    for (entry_layer_id, style_layers) in &entries {
        if let Some(entry_layer) = store::get_layer(&conn, entry_layer_id, user.user_id).await? {
            composed.push((entry_layer, style_layers.clone()));
        }
    }
    let entry_refs: Vec<(&MapLayer, JsonValue)> = composed
        .iter()
        .map(|(entry_layer, style_layers)| (entry_layer, style_layers.clone()))
        .collect();
    let website_domain =
        std::env::var("WEBSITE_DOMAIN").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let document = style::compose_style_document(&website_domain, map.title.as_deref(), &entry_refs);
    style::validate_style_document(&document)
        .await
        .map_err(|e| {
            anyhow::anyhow!(ErrorMetadata::bad_request(
                "InvalidStyle",
                format!("Style validation failed: {e:#}"),
            ))
        })?;

    let style_id = store::insert_style(
        &conn,
        &layer_id,
        &serde_json::json!(render_layers),
        user.user_id,
        None,
    )
    .await?;
    store::link_style(&conn, &body.map_id, &layer_id, &style_id).await?;

    Ok(Json(SetStyleResponse { style_id, layer_id }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_layer_filename() {
        assert_eq!(
            split_layer_filename("L12345678901.pmtiles").unwrap(),
            ("L12345678901", ".pmtiles")
        );
        assert_eq!(
            split_layer_filename("L12345678901.cog.tif").unwrap(),
            ("L12345678901", ".cog.tif")
        );
        assert_eq!(
            split_layer_filename("L12345678901.laz").unwrap(),
            ("L12345678901", ".laz")
        );
        assert!(split_layer_filename("L12345678901.shp").is_err());
    }

    #[test]
    fn test_parse_range_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=0-1023".parse().unwrap());
        assert_eq!(parse_range_header(&headers), Some((0, Some(1023))));

        headers.insert(header::RANGE, "bytes=512-".parse().unwrap());
        assert_eq!(parse_range_header(&headers), Some((512, None)));

        headers.insert(header::RANGE, "items=0-2".parse().unwrap());
        assert_eq!(parse_range_header(&headers), None);

        assert_eq!(parse_range_header(&HeaderMap::new()), None);
    }
}
