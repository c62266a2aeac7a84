//! Geoprocessing through the remote QGIS worker.
//!
//! Each catalog entry is exposed to the LLM as a tool named after its
//! algorithm id with `:` replaced by `_`. Layer-id arguments become
//! presigned read URLs; the output is written through a presigned PUT URL
//! and ingested as a new layer.

use std::time::Duration;

use model::ids::{
    generate_id,
    is_layer_id,
    IdPrefix,
};
use model::store::{
    self,
    NewFileLayer,
};
use model::types::LayerKind;
use notifications::EphemeralAction;
use serde_json::{
    json,
    Value as JsonValue,
};
use uuid::Uuid;

use crate::AgentDeps;

pub const QGIS_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct QgisAlgorithm {
    /// Tool name exposed to the LLM, e.g. `native_buffer`.
    pub tool_name: &'static str,
    pub description: &'static str,
    /// Names of parameters besides INPUT/OUTPUT, passed through as strings.
    pub extra_params: &'static [(&'static str, &'static str)],
}

/// Supported algorithms. The dispatch path is generic over this table.
pub fn catalog() -> &'static [QgisAlgorithm] {
    &[
        QgisAlgorithm {
            tool_name: "native_buffer",
            description: "Buffers a vector layer by a fixed distance, producing a new vector \
                          polygon layer. Distance is in the layer's CRS units.",
            extra_params: &[("DISTANCE", "Buffer distance in layer CRS units, e.g. 100")],
        },
        QgisAlgorithm {
            tool_name: "native_centroids",
            description: "Computes the centroid of each feature in a vector layer, producing a \
                          new vector point layer.",
            extra_params: &[],
        },
        QgisAlgorithm {
            tool_name: "native_dissolve",
            description: "Dissolves a vector layer's features into single combined geometries, \
                          producing a new vector layer.",
            extra_params: &[],
        },
        QgisAlgorithm {
            tool_name: "native_simplifygeometries",
            description: "Simplifies the geometries in a vector layer, producing a new vector \
                          layer with fewer vertices.",
            extra_params: &[("TOLERANCE", "Simplification tolerance in layer CRS units")],
        },
    ]
}

pub fn is_geoprocessing_tool(name: &str) -> bool {
    catalog().iter().any(|alg| alg.tool_name == name)
}

/// `native_buffer` -> `native:buffer`.
pub fn algorithm_id(tool_name: &str) -> String {
    tool_name.replace('_', ":")
}

pub fn tool_schemas() -> Vec<JsonValue> {
    catalog()
        .iter()
        .map(|alg| {
            let mut properties = serde_json::Map::new();
            properties.insert(
                "INPUT".to_string(),
                json!({"type": "string", "description": "Layer ID of the input vector layer"}),
            );
            let mut required = vec!["INPUT".to_string()];
            for (name, description) in alg.extra_params {
                properties.insert(
                    name.to_string(),
                    json!({"type": "string", "description": description}),
                );
                required.push(name.to_string());
            }
            json!({
                "type": "function",
                "function": {
                    "name": alg.tool_name,
                    "description": alg.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                        "additionalProperties": false,
                    },
                },
            })
        })
        .collect()
}

/// Output planning: tools describing vector work emit FlatGeobuf, raster
/// work emits GeoTIFF. Decided by which word the description uses more.
fn output_kind(description: &str) -> (&'static str, LayerKind) {
    let lowered = description.to_ascii_lowercase();
    let vector_count = lowered.matches("vector").count();
    let raster_count = lowered.matches("raster").count();
    if vector_count > raster_count {
        (".fgb", LayerKind::Vector)
    } else {
        (".tif", LayerKind::Raster)
    }
}

/// Runs one geoprocessing tool call end to end. All failures return an
/// error-status result object so the conversation can continue.
pub async fn run_geoprocessing_tool(
    deps: &AgentDeps,
    user_id: Uuid,
    map_id: &str,
    conversation_id: i32,
    tool_name: &str,
    args: &JsonValue,
) -> anyhow::Result<JsonValue> {
    let Some(algorithm) = catalog().iter().find(|alg| alg.tool_name == tool_name) else {
        return Ok(json!({
            "status": "error",
            "error": format!("Unsupported algorithm: {tool_name}"),
        }));
    };
    let algorithm_id = algorithm_id(tool_name);

    let conn = deps.app_pool.acquire("run_geoprocessing_tool").await?;

    // Marshal inputs: layer ids become presigned read URLs, everything else
    // passes through as a string.
    let mut qgis_inputs = serde_json::Map::new();
    let mut input_urls = serde_json::Map::new();
    let Some(args_object) = args.as_object() else {
        return Ok(json!({
            "status": "error",
            "error": "Tool arguments must be an object",
        }));
    };
    for (key, value) in args_object {
        if key == "OUTPUT" {
            continue;
        }
        let as_layer_id = value.as_str().filter(|s| is_layer_id(s));
        match as_layer_id {
            Some(layer_id) => {
                let layer = store::get_layer(&conn, layer_id, user_id).await?;
                let Some(s3_key) = layer.and_then(|l| l.s3_key) else {
                    return Ok(json!({
                        "status": "error",
                        "error": format!("Layer {layer_id} not found or has no S3 key"),
                    }));
                };
                input_urls.insert(key.clone(), json!(deps.store.presign_get(&s3_key).await?));
            },
            None => {
                let rendered = match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                qgis_inputs.insert(key.clone(), json!(rendered));
            },
        }
    }

    let map = store::get_map(&conn, map_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("map {map_id} vanished mid-tool-call"))?;

    // Output planning: fresh layer id, object key, presigned PUT.
    let (extension, layer_kind) = output_kind(algorithm.description);
    let output_layer_id = generate_id(IdPrefix::Layer);
    let output_key = storage::upload_key(
        &user_id.to_string(),
        &map.project_id,
        &output_layer_id,
        extension,
    );
    let output_put_url = deps
        .store
        .presign_put(&output_key, "application/x-www-form-urlencoded")
        .await?;

    let request_body = json!({
        "algorithm_id": algorithm_id,
        "qgis_inputs": qgis_inputs,
        "input_urls": input_urls,
        "output_presigned_put_urls": {"OUTPUT": output_put_url},
    });
    let worker_url = match std::env::var("QGIS_PROCESSING_URL") {
        Ok(url) => url,
        Err(_) => {
            return Ok(json!({
                "status": "error",
                "error": "QGIS processing is not configured on this server",
            }))
        },
    };

    let _action = EphemeralAction::begin(
        &deps.bus,
        conversation_id,
        format!("QGIS running {algorithm_id}..."),
    )
    .await;

    let response = reqwest::Client::new()
        .post(format!("{worker_url}/run_qgis_process"))
        .timeout(QGIS_WORKER_TIMEOUT)
        .json(&request_body)
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            return Ok(json!({
                "status": "error",
                "error": format!("QGIS processing failed: {e}"),
                "algorithm_id": algorithm_id,
            }))
        },
    };
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Ok(json!({
            "status": "error",
            "error": format!("QGIS processing failed: {status} - {text}"),
            "algorithm_id": algorithm_id,
        }));
    }
    let qgis_result: JsonValue = response.json().await.unwrap_or(JsonValue::Null);

    // Every requested output must come back uploaded.
    let uploaded = qgis_result
        .get("upload_results")
        .and_then(|r| r.get("OUTPUT"))
        .and_then(|r| r.get("uploaded"))
        .and_then(|u| u.as_bool())
        .unwrap_or(false);
    if !uploaded {
        return Ok(json!({
            "status": "error",
            "error": "QGIS processing completed but output file OUTPUT was not uploaded successfully",
            "qgis_result": qgis_result,
        }));
    }

    // Ingest: the worker wrote the object; register it as a layer, give
    // vector outputs a default style, and attach to the map.
    let layer_name = format!("{output_layer_id}{extension}");
    store::insert_file_layer(
        &conn,
        &NewFileLayer {
            layer_id: output_layer_id.clone(),
            owner_uuid: user_id,
            name: layer_name.clone(),
            kind: layer_kind,
            s3_key: output_key.clone(),
            metadata: None,
            source_map_id: Some(map_id.to_string()),
        },
    )
    .await?;
    if layer_kind == LayerKind::Vector {
        let style_layers =
            model::symbology::default_layers_for_geometry(&output_layer_id, "unknown");
        let style_id =
            store::insert_style(&conn, &output_layer_id, &json!(style_layers), user_id, None)
                .await?;
        store::link_style(&conn, map_id, &output_layer_id, &style_id).await?;
    }
    store::append_layer_to_map(&conn, map_id, &output_layer_id).await?;

    Ok(json!({
        "status": "success",
        "message": format!("{tool_name} completed successfully"),
        "algorithm_id": algorithm_id,
        "qgis_result": qgis_result,
        "created_layers": [{
            "param_name": "OUTPUT",
            "layer_id": output_layer_id,
            "layer_name": layer_name,
            "layer_type": layer_kind.as_str(),
        }],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_id_mapping() {
        assert_eq!(algorithm_id("native_buffer"), "native:buffer");
        assert_eq!(algorithm_id("native_simplifygeometries"), "native:simplifygeometries");
    }

    #[test]
    fn test_catalog_tools_are_geoprocessing() {
        assert!(is_geoprocessing_tool("native_buffer"));
        assert!(!is_geoprocessing_tool("zoom_to_bounds"));
    }

    #[test]
    fn test_output_kind_counts_description_words() {
        let (ext, kind) = output_kind("produces a new vector layer from a vector input");
        assert_eq!(ext, ".fgb");
        assert_eq!(kind, LayerKind::Vector);
        let (ext, kind) = output_kind("computes a raster surface");
        assert_eq!(ext, ".tif");
        assert_eq!(kind, LayerKind::Raster);
        // Ties fall to raster, matching the comparison direction.
        let (ext, _) = output_kind("does something else entirely");
        assert_eq!(ext, ".tif");
    }

    #[test]
    fn test_schemas_include_input_and_extras() {
        let schemas = tool_schemas();
        let buffer = schemas
            .iter()
            .find(|t| t["function"]["name"] == "native_buffer")
            .unwrap();
        let properties = &buffer["function"]["parameters"]["properties"];
        assert!(properties.get("INPUT").is_some());
        assert!(properties.get("DISTANCE").is_some());
    }
}
