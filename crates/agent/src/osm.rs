//! OpenStreetMap ingest: fetch an extract by tags and bounding box, split it
//! by geometry family, and register the parts as vector layers.

use std::time::Duration;

use bytes::Bytes;
use model::ids::{
    generate_id,
    IdPrefix,
};
use model::store::{
    self,
    NewFileLayer,
};
use model::types::LayerKind;
use pg::PgConnection;
use serde_json::{
    json,
    Value as JsonValue,
};
use uuid::Uuid;

use crate::AgentDeps;

const OSM_EXTRACT_URL: &str = "https://osm.buntinglabs.com/v1/osm/extract";
const OSM_TIMEOUT: Duration = Duration::from_secs(30);

/// The OSM tool is only registered when the API key is configured.
pub fn has_api_key() -> bool {
    std::env::var("BUNTINGLABS_OSM_API_KEY").is_ok_and(|k| !k.is_empty())
}

fn geometry_family(geometry_type: &str) -> Option<&'static str> {
    match geometry_type {
        "Point" | "MultiPoint" => Some("points"),
        "LineString" | "MultiLineString" => Some("lines"),
        "Polygon" | "MultiPolygon" => Some("polygons"),
        _ => None,
    }
}

/// Splits a GeoJSON FeatureCollection into (points, lines, polygons)
/// collections, dropping features of other geometry kinds.
fn split_by_geometry(collection: &JsonValue) -> Vec<(&'static str, JsonValue)> {
    let features = collection
        .get("features")
        .and_then(|f| f.as_array())
        .cloned()
        .unwrap_or_default();
    let mut parts: Vec<(&'static str, Vec<JsonValue>)> =
        vec![("points", Vec::new()), ("lines", Vec::new()), ("polygons", Vec::new())];
    for feature in features {
        let family = feature
            .get("geometry")
            .and_then(|g| g.get("type"))
            .and_then(|t| t.as_str())
            .and_then(geometry_family);
        if let Some(family) = family {
            if let Some((_, bucket)) = parts.iter_mut().find(|(name, _)| *name == family) {
                bucket.push(feature);
            }
        }
    }
    parts
        .into_iter()
        .filter(|(_, features)| !features.is_empty())
        .map(|(name, features)| {
            (
                name,
                json!({"type": "FeatureCollection", "features": features}),
            )
        })
        .collect()
}

pub async fn download_from_openstreetmap(
    deps: &AgentDeps,
    conn: &PgConnection,
    user_id: Uuid,
    map_id: &str,
    tags: &str,
    bbox: &[f64],
    new_layer_name: &str,
) -> anyhow::Result<JsonValue> {
    let Ok(api_key) = std::env::var("BUNTINGLABS_OSM_API_KEY") else {
        anyhow::bail!("OpenStreetMap API key not configured");
    };
    if bbox.len() != 4 {
        return Ok(json!({
            "status": "error",
            "error": "bbox must be [xmin, ymin, xmax, ymax]",
        }));
    }
    let bbox_str = format!("{:.6},{:.6},{:.6},{:.6}", bbox[0], bbox[1], bbox[2], bbox[3]);

    let response = reqwest::Client::new()
        .get(OSM_EXTRACT_URL)
        .query(&[("tags", tags), ("api_key", &api_key), ("bbox", &bbox_str)])
        .timeout(OSM_TIMEOUT)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(100).collect();
        anyhow::bail!("OSM API request failed with status {status}, {snippet}");
    }
    let geojson: JsonValue = response.json().await?;

    let map = store::get_map(conn, map_id)
        .await?
        .filter(|m| m.owner_uuid == user_id)
        .ok_or_else(|| anyhow::anyhow!("Map {map_id} not found"))?;

    let mut uploaded_layers = Vec::new();
    for (family, collection) in split_by_geometry(&geojson) {
        let layer_id = generate_id(IdPrefix::Layer);
        // Stored as GeoJSON; the layer cache converts to GeoPackage on the
        // first query_duckdb_sql call against this layer.
        let key = storage::upload_key(
            &user_id.to_string(),
            &map.project_id,
            &layer_id,
            ".geojson",
        );
        deps.store
            .put_object(
                &key,
                Bytes::from(serde_json::to_vec(&collection)?),
                "application/geo+json",
            )
            .await?;
        store::insert_file_layer(
            conn,
            &NewFileLayer {
                layer_id: layer_id.clone(),
                owner_uuid: user_id,
                name: format!("{new_layer_name}_{family}"),
                kind: LayerKind::Vector,
                s3_key: key,
                metadata: Some(json!({"osm_tags": tags})),
                source_map_id: Some(map_id.to_string()),
            },
        )
        .await?;
        uploaded_layers.push(json!({"layer_id": layer_id, "geometry_type": family}));
    }

    if uploaded_layers.is_empty() {
        return Ok(json!({
            "status": "error",
            "error": format!("No OSM features matched tags '{tags}' in the given bounding box"),
        }));
    }

    let layer_names: Vec<String> = uploaded_layers
        .iter()
        .map(|l| format!("{new_layer_name}_{}", l["geometry_type"].as_str().unwrap_or("")))
        .collect();
    let layer_ids: Vec<&str> = uploaded_layers
        .iter()
        .filter_map(|l| l["layer_id"].as_str())
        .collect();
    Ok(json!({
        "status": "success",
        "uploaded_layers": uploaded_layers,
        "kue_instructions": format!(
            "New layers available: {} (IDs: {}), all currently invisible. To make any of these \
             visible to the user on their map, use \"add_layer_to_map\" with the layer_id and a \
             descriptive new_name.",
            layer_names.join(", "),
            layer_ids.join(", "),
        ),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(geometry_type: &str) -> JsonValue {
        json!({
            "type": "Feature",
            "geometry": {"type": geometry_type, "coordinates": []},
            "properties": {},
        })
    }

    #[test]
    fn test_split_by_geometry_partitions_families() {
        let collection = json!({
            "type": "FeatureCollection",
            "features": [
                feature("Point"),
                feature("MultiPoint"),
                feature("LineString"),
                feature("Polygon"),
                feature("MultiPolygon"),
                feature("GeometryCollection"),
            ],
        });
        let parts = split_by_geometry(&collection);
        let names: Vec<&str> = parts.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["points", "lines", "polygons"]);
        let points = &parts[0].1["features"];
        assert_eq!(points.as_array().unwrap().len(), 2);
        let polygons = &parts[2].1["features"];
        assert_eq!(polygons.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_split_drops_empty_families() {
        let collection = json!({
            "type": "FeatureCollection",
            "features": [feature("Point")],
        });
        let parts = split_by_geometry(&collection);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, "points");
    }
}
