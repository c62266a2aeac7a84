//! The tool registry: JSON schemas exposed to the LLM each iteration, and
//! the typed argument structs the dispatcher parses them back into.
//!
//! Schemas are rebuilt per iteration because the `add_layer_to_map` enum is
//! populated from the user's current unattached layers.

use model::store::UnattachedLayer;
use serde::Deserialize;
use serde_json::{
    json,
    Value as JsonValue,
};

pub const NEW_LAYER_FROM_POSTGIS: &str = "new_layer_from_postgis";
pub const ADD_LAYER_TO_MAP: &str = "add_layer_to_map";
pub const SET_LAYER_STYLE: &str = "set_layer_style";
pub const QUERY_DUCKDB_SQL: &str = "query_duckdb_sql";
pub const QUERY_POSTGIS_DATABASE: &str = "query_postgis_database";
pub const ZOOM_TO_BOUNDS: &str = "zoom_to_bounds";
pub const DOWNLOAD_FROM_OPENSTREETMAP: &str = "download_from_openstreetmap";

#[derive(Debug, Deserialize)]
pub struct NewLayerFromPostgisArgs {
    pub postgis_connection_id: String,
    pub query: String,
    pub layer_name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddLayerToMapArgs {
    pub layer_id: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SetLayerStyleArgs {
    pub layer_id: String,
    pub maplibre_json_layers_str: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryDuckdbArgs {
    pub layer_ids: Vec<String>,
    pub sql_query: String,
    #[serde(default = "default_head_n_rows")]
    pub head_n_rows: usize,
}

fn default_head_n_rows() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct QueryPostgisArgs {
    pub postgis_connection_id: String,
    pub sql_query: String,
}

#[derive(Debug, Deserialize)]
pub struct ZoomToBoundsArgs {
    pub bounds: Vec<f64>,
    #[serde(default)]
    pub zoom_description: String,
}

#[derive(Debug, Deserialize)]
pub struct OsmDownloadArgs {
    pub tags: String,
    pub bbox: Vec<f64>,
    pub new_layer_name: String,
}

/// Parses a tool's serialized argument string; failures become recoverable
/// tool errors so the LLM can retry with fixed arguments.
pub fn parse_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| format!("Invalid tool arguments: {e}"))
}

fn function_schema(name: &str, description: &str, parameters: JsonValue) -> JsonValue {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        },
    })
}

/// The built-in tool list for one loop iteration.
pub fn builtin_tool_schemas(unattached: &[UnattachedLayer], osm_enabled: bool) -> Vec<JsonValue> {
    let mut tools = vec![
        function_schema(
            NEW_LAYER_FROM_POSTGIS,
            "Creates a new layer from a PostGIS connection and query and adds it to the map. \
             The layer pulls data from PostGIS automatically; restyle it with set_layer_style.",
            json!({
                "type": "object",
                "properties": {
                    "postgis_connection_id": {
                        "type": "string",
                        "description": "Unique PostGIS connection ID used as source",
                    },
                    "query": {
                        "type": "string",
                        "description": "SQL query for this layer. Must project an 'id' column and alias the geometry column as 'geom'; list any attribute columns needed for symbology.",
                    },
                    "layer_name": {
                        "type": "string",
                        "description": "Human-readable name shown in the user's layer list/legend.",
                    },
                },
                "required": ["postgis_connection_id", "query", "layer_name"],
                "additionalProperties": false,
            }),
        ),
        add_layer_to_map_schema(unattached),
        function_schema(
            SET_LAYER_STYLE,
            "Creates a new style for a layer from MapLibre JSON layers and immediately applies it \
             as the active style.",
            json!({
                "type": "object",
                "properties": {
                    "layer_id": {
                        "type": "string",
                        "description": "The ID of the layer to create and apply a style for",
                    },
                    "maplibre_json_layers_str": {
                        "type": "string",
                        "description": "JSON string of MapLibre layer objects. Each object's 'source' must be the layer ID. Example: [{\"id\": \"LZJ5RmuZr6qN-line\", \"type\": \"line\", \"source\": \"LZJ5RmuZr6qN\", \"paint\": {\"line-color\": \"#1E90FF\"}}]",
                    },
                },
                "required": ["layer_id", "maplibre_json_layers_str"],
                "additionalProperties": false,
            }),
        ),
        function_schema(
            QUERY_DUCKDB_SQL,
            "Execute a SQL query against vector layer data using DuckDB. Use \
             query_postgis_database for layers created from PostGIS connections instead.",
            json!({
                "type": "object",
                "properties": {
                    "layer_ids": {
                        "type": "array",
                        "description": "Load these vector layer IDs as tables",
                        "items": {"type": "string"},
                    },
                    "sql_query": {
                        "type": "string",
                        "description": "DuckDB-flavored SELECT query; refer to the layer by its ID as the table name, e.g. SELECT name FROM LCH6Na2SBvJr ORDER BY id",
                    },
                    "head_n_rows": {
                        "type": "number",
                        "description": "Truncate result to n rows (n=20 is good; when increasing, specify the returned columns)",
                    },
                },
                "required": ["layer_ids", "sql_query", "head_n_rows"],
                "additionalProperties": false,
            }),
        ),
        function_schema(
            QUERY_POSTGIS_DATABASE,
            "Execute SQL queries on connected PostgreSQL/PostGIS databases for data analysis, \
             spatial queries and schema exploration. The query MUST include a LIMIT clause with \
             a value of at most 1000.",
            json!({
                "type": "object",
                "properties": {
                    "postgis_connection_id": {
                        "type": "string",
                        "description": "User's PostGIS connection ID to query against",
                    },
                    "sql_query": {
                        "type": "string",
                        "description": "SQL query to execute, standard syntax, e.g. 'SELECT COUNT(*) FROM table_name LIMIT 1' or 'SELECT * FROM spatial_table LIMIT 10'.",
                    },
                },
                "required": ["postgis_connection_id", "sql_query"],
                "additionalProperties": false,
            }),
        ),
        function_schema(
            ZOOM_TO_BOUNDS,
            "Zoom the user's map to a bounding box in WGS84 coordinates. The current location is \
             saved to their zoom history first.",
            json!({
                "type": "object",
                "properties": {
                    "bounds": {
                        "type": "array",
                        "description": "Bounding box in WGS84 format [xmin, ymin, xmax, ymax]",
                        "items": {"type": "number"},
                        "minItems": 4,
                        "maxItems": 4,
                    },
                    "zoom_description": {
                        "type": "string",
                        "description": "Complete message shown to the user while zooming, e.g. \"Zooming to 39 selected parcels near Ohio\"",
                    },
                },
                "required": ["bounds", "zoom_description"],
                "additionalProperties": false,
            }),
        ),
    ];

    if osm_enabled {
        tools.push(function_schema(
            DOWNLOAD_FROM_OPENSTREETMAP,
            "Download features from OpenStreetMap and add them to the project as vector layers.",
            json!({
                "type": "object",
                "properties": {
                    "tags": {
                        "type": "string",
                        "description": "Tags to filter for, e.g. leisure=park; AND tags together with &, e.g. highway=footway&name=*; no commas",
                    },
                    "bbox": {
                        "type": "array",
                        "description": "Bounding box in [xmin, ymin, xmax, ymax] format, e.g. [9.023802,39.172149,9.280779,39.275211] for Cagliari, Italy",
                        "items": {"type": "number"},
                    },
                    "new_layer_name": {
                        "type": "string",
                        "description": "Human-friendly name, e.g. Walking paths or Liquor stores in Seattle",
                    },
                },
                "required": ["tags", "bbox", "new_layer_name"],
                "additionalProperties": false,
            }),
        ));
    }

    tools
}

/// `add_layer_to_map` is special-cased: its `layer_id` enum is the user's
/// unattached layers (at most 10). With none available the enum is dropped
/// so the schema stays valid.
fn add_layer_to_map_schema(unattached: &[UnattachedLayer]) -> JsonValue {
    let mut layer_id_schema = json!({
        "type": "string",
        "description": "The ID of the layer to add to the map. Choose from available unattached layers.",
    });
    if !unattached.is_empty() {
        let ids: Vec<&str> = unattached.iter().map(|l| l.layer_id.as_str()).collect();
        layer_id_schema["enum"] = json!(ids);
        let listing = unattached
            .iter()
            .map(|l| format!("{}: {}", l.layer_id, l.describe()))
            .collect::<Vec<_>>()
            .join("; ");
        layer_id_schema["description"] =
            json!(format!("The ID of the layer to add to the map. Available: {listing}"));
    }
    function_schema(
        ADD_LAYER_TO_MAP,
        "Shows a newly created or existing unattached layer on the user's current map and layer \
         list. Use after a geoprocessing step that creates a layer, or when the user asks to see \
         an existing layer that isn't on their map.",
        json!({
            "type": "object",
            "properties": {
                "layer_id": layer_id_schema,
                "new_name": {
                    "type": "string",
                    "description": "Human-readable name shown in the user's layer list/legend.",
                },
            },
            "required": ["layer_id", "new_name"],
        }),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn unattached(layer_id: &str, name: &str) -> UnattachedLayer {
        UnattachedLayer {
            layer_id: layer_id.to_string(),
            name: Some(name.to_string()),
            kind: "vector".to_string(),
            created_on: Utc::now(),
        }
    }

    #[test]
    fn test_osm_tool_gated_on_api_key() {
        let without = builtin_tool_schemas(&[], false);
        assert!(!without
            .iter()
            .any(|t| t["function"]["name"] == DOWNLOAD_FROM_OPENSTREETMAP));
        let with = builtin_tool_schemas(&[], true);
        assert!(with
            .iter()
            .any(|t| t["function"]["name"] == DOWNLOAD_FROM_OPENSTREETMAP));
    }

    #[test]
    fn test_add_layer_enum_lists_unattached_layers() {
        let layers = vec![
            unattached("L12345678901", "Buffered Beaches"),
            unattached("L98765432109", "Parks"),
        ];
        let tools = builtin_tool_schemas(&layers, false);
        let add = tools
            .iter()
            .find(|t| t["function"]["name"] == ADD_LAYER_TO_MAP)
            .unwrap();
        let enum_values = add["function"]["parameters"]["properties"]["layer_id"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(enum_values.len(), 2);
        assert_eq!(enum_values[0], "L12345678901");
    }

    #[test]
    fn test_add_layer_enum_dropped_when_empty() {
        let tools = builtin_tool_schemas(&[], false);
        let add = tools
            .iter()
            .find(|t| t["function"]["name"] == ADD_LAYER_TO_MAP)
            .unwrap();
        assert!(add["function"]["parameters"]["properties"]["layer_id"]
            .get("enum")
            .is_none());
    }

    #[test]
    fn test_parse_args_happy_path_and_missing_field() {
        let args: QueryDuckdbArgs = parse_args(
            r#"{"layer_ids":["L12345678901"],"sql_query":"SELECT COUNT(*) as count FROM L12345678901","head_n_rows":20}"#,
        )
        .unwrap();
        assert_eq!(args.layer_ids.len(), 1);
        assert_eq!(args.head_n_rows, 20);

        let err = parse_args::<NewLayerFromPostgisArgs>(r#"{"query":"SELECT 1"}"#).unwrap_err();
        assert!(err.contains("Invalid tool arguments"));
    }

    #[test]
    fn test_zoom_args_parse() {
        let args: ZoomToBoundsArgs = parse_args(
            r#"{"bounds":[-122.6,37.6,-122.3,37.9],"zoom_description":"Zooming to SF"}"#,
        )
        .unwrap();
        assert_eq!(args.bounds.len(), 4);
    }
}
