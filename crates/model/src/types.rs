//! Entity types mapped from application-database rows.

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio_postgres::Row;
use uuid::Uuid;

/// Why a map snapshot was forked from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkReason {
    UserEdit,
    AiEdit,
}

impl ForkReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForkReason::UserEdit => "user_edit",
            ForkReason::AiEdit => "ai_edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_edit" => Some(ForkReason::UserEdit),
            "ai_edit" => Some(ForkReason::AiEdit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Vector,
    Raster,
    Postgis,
    PointCloud,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Vector => "vector",
            LayerKind::Raster => "raster",
            LayerKind::Postgis => "postgis",
            LayerKind::PointCloud => "point_cloud",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(LayerKind::Vector),
            "raster" => Some(LayerKind::Raster),
            "postgis" => Some(LayerKind::Postgis),
            "point_cloud" => Some(LayerKind::PointCloud),
            _ => None,
        }
    }
}

/// A map snapshot. Mutations fork a child snapshot rather than editing in
/// place, so snapshots form a parent-linked DAG.
#[derive(Debug, Clone)]
pub struct MundiMap {
    pub id: String,
    pub project_id: String,
    pub owner_uuid: Uuid,
    pub title: Option<String>,
    pub description: Option<String>,
    pub layers: Option<Vec<String>>,
    pub parent_map_id: Option<String>,
    pub fork_reason: Option<ForkReason>,
    pub created_on: DateTime<Utc>,
    pub last_edited: DateTime<Utc>,
}

impl MundiMap {
    pub fn from_row(row: &Row) -> Self {
        let fork_reason: Option<String> = row.get("fork_reason");
        Self {
            id: row.get("id"),
            project_id: row.get("project_id"),
            owner_uuid: row.get("owner_uuid"),
            title: row.get("title"),
            description: row.get("description"),
            layers: row.get("layers"),
            parent_map_id: row.get("parent_map_id"),
            fork_reason: fork_reason.as_deref().and_then(ForkReason::parse),
            created_on: row.get("created_on"),
            last_edited: row.get("last_edited"),
        }
    }

    pub fn layer_ids(&self) -> &[String] {
        self.layers.as_deref().unwrap_or(&[])
    }
}

/// A typed data source. Which attributes are populated depends on `kind`:
/// file-backed layers carry an object-store key, PostGIS layers carry a
/// connection reference plus the parameterized query.
#[derive(Debug, Clone)]
pub struct MapLayer {
    pub layer_id: String,
    pub owner_uuid: Uuid,
    pub name: Option<String>,
    pub kind: LayerKind,
    pub s3_key: Option<String>,
    pub postgis_connection_id: Option<String>,
    pub postgis_query: Option<String>,
    pub postgis_attribute_column_list: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
    pub bounds: Option<Vec<f64>>,
    pub geometry_type: Option<String>,
    pub feature_count: Option<i32>,
    pub source_map_id: Option<String>,
    pub created_on: DateTime<Utc>,
    pub last_edited: DateTime<Utc>,
}

impl MapLayer {
    pub fn from_row(row: &Row) -> anyhow::Result<Self> {
        let kind: String = row.get("type");
        let kind = LayerKind::parse(&kind)
            .ok_or_else(|| anyhow::anyhow!("unknown layer kind {kind:?} in map_layers"))?;
        Ok(Self {
            layer_id: row.get("layer_id"),
            owner_uuid: row.get("owner_uuid"),
            name: row.get("name"),
            kind,
            s3_key: row.get("s3_key"),
            postgis_connection_id: row.get("postgis_connection_id"),
            postgis_query: row.get("postgis_query"),
            postgis_attribute_column_list: row.get("postgis_attribute_column_list"),
            metadata: row.get("metadata"),
            bounds: row.get("bounds"),
            geometry_type: row.get("geometry_type"),
            feature_count: row.get("feature_count"),
            source_map_id: row.get("source_map_id"),
            created_on: row.get("created_on"),
            last_edited: row.get("last_edited"),
        })
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("Unnamed Layer ({})", &self.layer_id[..8.min(self.layer_id.len())]),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i32,
    pub project_id: String,
    pub owner_uuid: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            project_id: row.get("project_id"),
            owner_uuid: row.get("owner_uuid"),
            title: row.get("title"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_kind_round_trip() {
        for kind in [
            LayerKind::Vector,
            LayerKind::Raster,
            LayerKind::Postgis,
            LayerKind::PointCloud,
        ] {
            assert_eq!(LayerKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LayerKind::parse("shapefile"), None);
    }

    #[test]
    fn test_fork_reason_round_trip() {
        assert_eq!(ForkReason::parse("user_edit"), Some(ForkReason::UserEdit));
        assert_eq!(ForkReason::parse("ai_edit"), Some(ForkReason::AiEdit));
        assert_eq!(ForkReason::parse(""), None);
    }
}
