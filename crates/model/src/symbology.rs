//! Default symbology for freshly created layers.

use serde_json::{
    json,
    Value as JsonValue,
};

/// Source-layer name used by MVT-backed sources; the tiler emits a single
/// layer under this name.
pub const MVT_SOURCE_LAYER: &str = "reprojectedfgb";

const PALETTE: [&str; 20] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8",
    "#F7DC6F", "#BB8FCE", "#85C1E9", "#F8C471", "#82E0AA", "#F1948A", "#85C1E9",
    "#D7BDE2", "#A9DFBF", "#F9E79F", "#AED6F1", "#F5B7B1", "#A3E4D7",
];

/// Palette color for a layer: stable per layer id so regenerating a default
/// style never repaints the layer.
fn color_for(layer_id: &str) -> &'static str {
    let sum: u64 = layer_id.bytes().map(u64::from).sum();
    PALETTE[(sum % PALETTE.len() as u64) as usize]
}

/// Render layers for a layer's default style, conditioned on its geometry
/// kind. Point-ish geometries get circles, line-ish get lines, everything
/// else gets a fill plus an outline.
pub fn default_layers_for_geometry(layer_id: &str, geometry_type: &str) -> Vec<JsonValue> {
    let color = color_for(layer_id);

    match geometry_type.to_ascii_lowercase().as_str() {
        "point" | "multipoint" => vec![json!({
            "id": layer_id,
            "type": "circle",
            "source": layer_id,
            "source-layer": MVT_SOURCE_LAYER,
            "paint": {
                "circle-radius": 6,
                "circle-color": color,
                "circle-stroke-width": 1,
                "circle-stroke-color": [
                    "case",
                    ["boolean", ["feature-state", "selected"], false],
                    "#FF8C42",
                    "#000",
                ],
            },
            "metadata": {"layer_name": layer_id},
        })],
        "linestring" | "multilinestring" => vec![json!({
            "id": layer_id,
            "type": "line",
            "source": layer_id,
            "source-layer": MVT_SOURCE_LAYER,
            "paint": {
                "line-color": [
                    "case",
                    ["boolean", ["feature-state", "selected"], false],
                    "#FF8C42",
                    color,
                ],
                "line-width": 2,
            },
            "metadata": {"layer_name": layer_id},
        })],
        _ => vec![
            json!({
                "id": layer_id,
                "type": "fill",
                "source": layer_id,
                "source-layer": MVT_SOURCE_LAYER,
                "paint": {
                    "fill-color": color,
                    "fill-opacity": [
                        "case",
                        ["boolean", ["feature-state", "selected"], false],
                        0.9,
                        0.6,
                    ],
                    "fill-outline-color": "#000",
                },
                "metadata": {"layer_name": layer_id},
            }),
            json!({
                "id": format!("{layer_id}-line"),
                "type": "line",
                "source": layer_id,
                "source-layer": MVT_SOURCE_LAYER,
                "paint": {
                    "line-color": [
                        "case",
                        ["boolean", ["feature-state", "selected"], false],
                        "#FF8C42",
                        "#000",
                    ],
                    "line-width": 1,
                },
                "metadata": {"layer_name": layer_id},
            }),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_deterministic_and_from_palette() {
        let a = color_for("LAbCdEfGhJkM");
        let b = color_for("LAbCdEfGhJkM");
        assert_eq!(a, b);
        assert!(PALETTE.contains(&a));
    }

    #[test]
    fn test_point_gets_circle_layer() {
        let layers = default_layers_for_geometry("L12345678901", "Point");
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0]["type"], "circle");
        assert_eq!(layers[0]["source"], "L12345678901");
        assert_eq!(layers[0]["source-layer"], MVT_SOURCE_LAYER);
    }

    #[test]
    fn test_linestring_gets_line_layer() {
        let layers = default_layers_for_geometry("L12345678901", "multilinestring");
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0]["type"], "line");
    }

    #[test]
    fn test_polygon_gets_fill_plus_outline() {
        let layers = default_layers_for_geometry("L12345678901", "MultiPolygon");
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0]["type"], "fill");
        assert_eq!(layers[1]["type"], "line");
        assert_eq!(layers[1]["id"], "L12345678901-line");
    }

    #[test]
    fn test_unknown_geometry_falls_back_to_fill() {
        let layers = default_layers_for_geometry("L12345678901", "geometrycollection");
        assert_eq!(layers[0]["type"], "fill");
    }
}
