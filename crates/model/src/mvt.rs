//! Vector tile SQL for PostGIS-backed layers.

use errors::ErrorMetadata;

use crate::types::{
    LayerKind,
    MapLayer,
};

pub const MAX_TILE_ZOOM: u32 = 18;

/// Validates `z/x/y` tile coordinates: `0 <= z <= 18`, `0 <= x,y < 2^z`.
pub fn validate_tile_coords(z: u32, x: u32, y: u32) -> anyhow::Result<()> {
    if z > MAX_TILE_ZOOM || x >= (1u32 << z.min(31)) || y >= (1u32 << z.min(31)) {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidTileCoordinates",
            "Invalid tile coordinates",
        ));
    }
    Ok(())
}

/// Builds the `ST_AsMVT` query for a PostGIS layer. The layer's stored query
/// is inlined as a subquery; attribute columns ride along so the client can
/// style and inspect features. Takes `$1=z, $2=x, $3=y`.
pub fn build_mvt_query(layer: &MapLayer) -> anyhow::Result<String> {
    if layer.kind != LayerKind::Postgis {
        anyhow::bail!(ErrorMetadata::bad_request(
            "NotAPostgisLayer",
            "Layer is not a PostGIS type. MVT tiles can only be generated from PostGIS data.",
        ));
    }
    let Some(attribute_columns) = layer
        .postgis_attribute_column_list
        .as_ref()
        .filter(|cols| !cols.is_empty())
    else {
        anyhow::bail!(ErrorMetadata::bad_request(
            "PostgisLayerMissingAttributes",
            format!(
                "PostGIS layer {} has no attribute columns, you must re-create the layer.",
                layer.display_name()
            ),
        ));
    };
    let query = layer
        .postgis_query
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("postgis layer {} has no stored query", layer.layer_id))?;

    let mut columns: Vec<String> = attribute_columns.clone();
    columns.push("id".to_string());
    let prefixed = |prefix: &str| {
        columns
            .iter()
            .map(|name| format!("{prefix}.{name}"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    Ok(format!(
        "WITH
        bounds_webmerc AS (
            SELECT ST_TileEnvelope($1, $2, $3) AS wm_geom
        ),
        transformed AS (
            SELECT {t_cols}, ST_Transform(t.geom, 3857) AS geom
            FROM ({query}) t
        ),
        candidates AS (
            SELECT {t_cols}, ST_MakeValid(t.geom) AS geom
            FROM transformed t, bounds_webmerc b
            WHERE t.geom && b.wm_geom
                AND ST_Intersects(t.geom, b.wm_geom)
        ),
        mvtgeom AS (
            SELECT {c_cols}, ST_AsMVTGeom(c.geom, b.wm_geom::box2d) AS geom
            FROM candidates c, bounds_webmerc b
        )
        SELECT ST_AsMVT(mvtgeom, 'reprojectedfgb', 4096, 'geom', 'id') FROM mvtgeom",
        t_cols = prefixed("t"),
        c_cols = prefixed("c"),
    ))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn postgis_layer() -> MapLayer {
        MapLayer {
            layer_id: "L12345678901".to_string(),
            owner_uuid: Uuid::nil(),
            name: Some("parcels".to_string()),
            kind: LayerKind::Postgis,
            s3_key: None,
            postgis_connection_id: Some("C12345678901".to_string()),
            postgis_query: Some("SELECT id, owner, geom FROM parcels".to_string()),
            postgis_attribute_column_list: Some(vec!["owner".to_string()]),
            metadata: None,
            bounds: None,
            geometry_type: Some("polygon".to_string()),
            feature_count: Some(42),
            source_map_id: None,
            created_on: Utc::now(),
            last_edited: Utc::now(),
        }
    }

    #[test]
    fn test_tile_coordinate_bounds() {
        // z=0 has exactly one tile.
        assert!(validate_tile_coords(0, 0, 0).is_ok());
        assert!(validate_tile_coords(0, 1, 0).is_err());
        // Max zoom is 18.
        assert!(validate_tile_coords(18, 0, 0).is_ok());
        assert!(validate_tile_coords(19, 0, 0).is_err());
        // x and y must stay under 2^z.
        assert!(validate_tile_coords(3, 7, 7).is_ok());
        assert!(validate_tile_coords(3, 8, 0).is_err());
        assert!(validate_tile_coords(3, 0, 8).is_err());
    }

    #[test]
    fn test_mvt_query_embeds_layer_query_and_columns() {
        let sql = build_mvt_query(&postgis_layer()).unwrap();
        assert!(sql.contains("SELECT id, owner, geom FROM parcels"));
        assert!(sql.contains("t.owner"));
        assert!(sql.contains("t.id"));
        assert!(sql.contains("ST_TileEnvelope($1, $2, $3)"));
        assert!(sql.contains("'reprojectedfgb'"));
    }

    #[test]
    fn test_mvt_rejects_non_postgis_layer() {
        let mut layer = postgis_layer();
        layer.kind = LayerKind::Vector;
        assert!(build_mvt_query(&layer).is_err());
    }

    #[test]
    fn test_mvt_rejects_missing_attribute_columns() {
        let mut layer = postgis_layer();
        layer.postgis_attribute_column_list = Some(vec![]);
        assert!(build_mvt_query(&layer).is_err());
        layer.postgis_attribute_column_list = None;
        assert!(build_mvt_query(&layer).is_err());
    }
}
