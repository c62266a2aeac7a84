//! Style composition and validation.
//!
//! A layer's style is a list of MapLibre render-layer objects. Applying one
//! composes the full style document (base map + every map layer's active
//! style) and validates it with the external `gl-style-validate` subprocess
//! before anything is persisted.

use std::io::Write as _;

use model::symbology::MVT_SOURCE_LAYER;
use model::types::{
    LayerKind,
    MapLayer,
};
use serde_json::{
    json,
    Value as JsonValue,
};

/// Normalizes caller-supplied render layers for one map layer: every object
/// must name the layer as its `source`, and MVT-backed sources get the
/// tiler's fixed `source-layer`.
pub fn normalize_render_layers(
    render_layers: &mut [JsonValue],
    layer: &MapLayer,
) -> Result<(), String> {
    for render_layer in render_layers.iter_mut() {
        let source = render_layer.get("source").and_then(|s| s.as_str());
        if source != Some(layer.layer_id.as_str()) {
            return Err(format!(
                "Render layer source must be '{}', found {:?}",
                layer.layer_id, source
            ));
        }
        if layer.kind == LayerKind::Postgis {
            render_layer["source-layer"] = json!(MVT_SOURCE_LAYER);
        }
    }
    Ok(())
}

/// Source definition for one map layer, pointing at the endpoints that serve
/// its data.
fn source_for_layer(website_domain: &str, layer_id: &str, kind: LayerKind) -> JsonValue {
    match kind {
        LayerKind::Postgis => json!({
            "type": "vector",
            "tiles": [format!("{website_domain}/api/layer/{layer_id}/{{z}}/{{x}}/{{y}}.mvt")],
            "minzoom": 0,
            "maxzoom": 18,
        }),
        _ => json!({
            "type": "vector",
            "url": format!("pmtiles://{website_domain}/api/layer/{layer_id}.pmtiles"),
        }),
    }
}

/// The composed style document for a map: base map, one source per layer,
/// and each layer's active render layers in map order.
pub fn compose_style_document(
    website_domain: &str,
    map_title: Option<&str>,
    entries: &[(&MapLayer, JsonValue)],
) -> JsonValue {
    let mut sources = serde_json::Map::new();
    sources.insert(
        "basemap".to_string(),
        json!({"type": "raster", "tiles": ["https://tile.openstreetmap.org/{z}/{x}/{y}.png"], "tileSize": 256}),
    );
    let mut layers = vec![json!({
        "id": "basemap",
        "type": "raster",
        "source": "basemap",
    })];

    for (layer, style_layers) in entries {
        sources.insert(
            layer.layer_id.clone(),
            source_for_layer(website_domain, &layer.layer_id, layer.kind),
        );
        if let Some(render_layers) = style_layers.as_array() {
            layers.extend(render_layers.iter().cloned());
        }
    }

    json!({
        "version": 8,
        "name": map_title.unwrap_or("Mundi map"),
        "sources": sources,
        "layers": layers,
    })
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StyleValidationError(pub String);

/// Validates a composed style document with the `gl-style-validate`
/// subprocess. Returns the validator's output on rejection.
pub async fn validate_style_document(style: &JsonValue) -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
    file.write_all(serde_json::to_string(style)?.as_bytes())?;
    file.flush()?;

    let output = tokio::process::Command::new("gl-style-validate")
        .arg(file.path())
        .output()
        .await?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        anyhow::bail!(StyleValidationError(stdout));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn layer(kind: LayerKind) -> MapLayer {
        MapLayer {
            layer_id: "L12345678901".to_string(),
            owner_uuid: Uuid::nil(),
            name: Some("beaches".to_string()),
            kind,
            s3_key: None,
            postgis_connection_id: None,
            postgis_query: None,
            postgis_attribute_column_list: None,
            metadata: None,
            bounds: None,
            geometry_type: Some("polygon".to_string()),
            feature_count: None,
            source_map_id: None,
            created_on: Utc::now(),
            last_edited: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_rejects_wrong_source() {
        let mut render_layers = vec![json!({
            "id": "x", "type": "line", "source": "Lwrongwrongw",
        })];
        let err = normalize_render_layers(&mut render_layers, &layer(LayerKind::Postgis)).unwrap_err();
        assert!(err.contains("L12345678901"));
    }

    #[test]
    fn test_normalize_stamps_source_layer_for_postgis() {
        let mut render_layers = vec![json!({
            "id": "x", "type": "line", "source": "L12345678901",
        })];
        normalize_render_layers(&mut render_layers, &layer(LayerKind::Postgis)).unwrap();
        assert_eq!(render_layers[0]["source-layer"], MVT_SOURCE_LAYER);
    }

    #[test]
    fn test_normalize_leaves_file_layers_alone() {
        let mut render_layers = vec![json!({
            "id": "x", "type": "fill", "source": "L12345678901", "source-layer": "custom",
        })];
        normalize_render_layers(&mut render_layers, &layer(LayerKind::Vector)).unwrap();
        assert_eq!(render_layers[0]["source-layer"], "custom");
    }

    #[test]
    fn test_composed_document_includes_every_supplied_render_layer() {
        let postgis = layer(LayerKind::Postgis);
        let style_layers = json!([
            {"id": "L12345678901", "type": "fill", "source": "L12345678901"},
            {"id": "L12345678901-line", "type": "line", "source": "L12345678901"},
        ]);
        let doc = compose_style_document("https://app.mundi.ai", Some("SF"), &[(&postgis, style_layers)]);
        assert_eq!(doc["version"], 8);
        let layers = doc["layers"].as_array().unwrap();
        // basemap + the two supplied render layers
        assert_eq!(layers.len(), 3);
        assert!(doc["sources"]["L12345678901"]["tiles"][0]
            .as_str()
            .unwrap()
            .contains("/api/layer/L12345678901/"));
    }
}
