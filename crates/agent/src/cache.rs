//! Filesystem LRU cache that materializes layer data for the DuckDB engine.
//!
//! Acquiring a layer file pins it, preventing eviction while the path is in
//! use on a blocking thread; the pin drops with the guard.

use std::collections::HashMap;
use std::path::{
    Path,
    PathBuf,
};
use std::sync::Arc;

use anyhow::Context as _;
use errors::ErrorMetadata;
use model::types::{
    LayerKind,
    MapLayer,
};
use parking_lot::Mutex;
use storage::ObjectStore;

const DEFAULT_MAX_SIZE: u64 = 128 * 1024 * 1024;

struct FileCacheInner {
    /// key -> size, oldest first. Touch moves a key to the back.
    order: Vec<String>,
    sizes: HashMap<String, u64>,
    pins: HashMap<String, usize>,
    total: u64,
}

impl FileCacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }
}

/// Size-bounded file cache. Not generic over contents: keys map 1:1 to files
/// in `cache_dir`.
pub struct FileCache {
    cache_dir: PathBuf,
    max_size: u64,
    inner: Mutex<FileCacheInner>,
}

impl FileCache {
    pub fn new(cache_dir: impl Into<PathBuf>, max_size: u64) -> anyhow::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let mut order = Vec::new();
        let mut sizes = HashMap::new();
        let mut total = 0;
        for entry in std::fs::read_dir(&cache_dir)? {
            let entry = entry?;
            let size = entry.metadata()?.len();
            let name = entry.file_name().to_string_lossy().to_string();
            order.push(name.clone());
            sizes.insert(name, size);
            total += size;
        }
        Ok(Self {
            cache_dir,
            max_size,
            inner: Mutex::new(FileCacheInner {
                order,
                sizes,
                pins: HashMap::new(),
                total,
            }),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().sizes.contains_key(key)
    }

    pub fn set(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(key);
        std::fs::write(&path, data)?;
        let size = data.len() as u64;
        let mut inner = self.inner.lock();
        if let Some(old) = inner.sizes.remove(key) {
            inner.total -= old;
            inner.order.retain(|k| k != key);
        }
        inner.order.push(key.to_string());
        inner.sizes.insert(key.to_string(), size);
        inner.total += size;
        self.evict_locked(&mut inner);
        Ok(())
    }

    /// Path for a cached key, refreshing its recency. The caller should pin
    /// before using the path.
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        let mut inner = self.inner.lock();
        if !inner.sizes.contains_key(key) {
            return None;
        }
        inner.touch(key);
        Some(self.path_for(key))
    }

    pub fn pin(&self, key: &str) {
        *self.inner.lock().pins.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn unpin(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                inner.pins.remove(key);
            }
        }
    }

    fn evict_locked(&self, inner: &mut FileCacheInner) {
        while inner.total > self.max_size {
            let victim = inner
                .order
                .iter()
                .position(|key| !inner.pins.contains_key(key));
            let Some(pos) = victim else {
                // Everything left is pinned; over-budget until pins drop.
                break;
            };
            let key = inner.order.remove(pos);
            if let Some(size) = inner.sizes.remove(&key) {
                inner.total -= size;
            }
            _ = std::fs::remove_file(self.path_for(&key));
        }
    }

    #[cfg(test)]
    fn total(&self) -> u64 {
        self.inner.lock().total
    }
}

/// Materializes a layer's cached geopackage on disk for the query engine.
pub struct LayerCache {
    file_cache: FileCache,
}

/// Pinned path to a cached layer file; eviction is blocked until dropped.
pub struct LayerFileGuard<'a> {
    cache: &'a LayerCache,
    key: String,
    path: PathBuf,
}

impl LayerFileGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LayerFileGuard<'_> {
    fn drop(&mut self) {
        self.cache.file_cache.unpin(&self.key);
    }
}

impl LayerCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            file_cache: FileCache::new(cache_dir, DEFAULT_MAX_SIZE)?,
        }))
    }

    /// Object-store key of the layer's source file: a recorded geopackage
    /// rendition when one exists, otherwise the upload itself (converted to
    /// GeoPackage at cache-fill time).
    fn source_object_key(layer: &MapLayer) -> anyhow::Result<String> {
        if layer.kind == LayerKind::Postgis {
            anyhow::bail!(ErrorMetadata::bad_request(
                "PostgisLayerNotCacheable",
                format!(
                    "PostGIS layer {} cannot be pulled as individual vector file",
                    layer.layer_id
                ),
            ));
        }
        if let Some(key) = layer
            .metadata
            .as_ref()
            .and_then(|m| m.get("geopackage_key"))
            .and_then(|k| k.as_str())
        {
            return Ok(key.to_string());
        }
        if let Some(key) = layer.s3_key.as_deref() {
            return Ok(key.to_string());
        }
        anyhow::bail!(ErrorMetadata::bad_request(
            "LayerNotQueryable",
            format!("Layer {} has no source file to query", layer.layer_id),
        ))
    }

    /// Returns a pinned path to the layer's geopackage, downloading it into
    /// the cache on miss. Non-geopackage sources (GeoJSON, FlatGeobuf, ...)
    /// are converted with ogr2ogr before caching, so every vector layer is
    /// queryable regardless of its upload format.
    pub async fn layer_file(
        &self,
        store: &ObjectStore,
        layer: &MapLayer,
    ) -> anyhow::Result<LayerFileGuard<'_>> {
        let cache_key = format!("{}.gpkg", layer.layer_id);
        if !self.file_cache.has(&cache_key) {
            let object_key = Self::source_object_key(layer)?;
            let bytes = store
                .get_object(&object_key)
                .await
                .with_context(|| format!("fetching {object_key} for layer cache"))?;
            if object_key.ends_with(".gpkg") {
                self.file_cache.set(&cache_key, &bytes)?;
            } else {
                let converted = convert_to_geopackage(&object_key, &bytes).await?;
                self.file_cache.set(&cache_key, &converted)?;
            }
        }
        self.file_cache.pin(&cache_key);
        let path = match self.file_cache.get_path(&cache_key) {
            Some(path) => path,
            None => {
                self.file_cache.unpin(&cache_key);
                anyhow::bail!("layer file evicted between set and pin");
            },
        };
        Ok(LayerFileGuard {
            cache: self,
            key: cache_key,
            path,
        })
    }
}

/// Converts a downloaded source file to GeoPackage with `ogr2ogr -f GPKG`.
/// The input keeps its original extension so the driver is detected.
async fn convert_to_geopackage(source_key: &str, contents: &[u8]) -> anyhow::Result<Vec<u8>> {
    let extension = source_key.rfind('.').map(|dot| &source_key[dot..]).ok_or_else(|| {
        ErrorMetadata::bad_request(
            "LayerNotQueryable",
            format!("Source file {source_key} has no extension to detect a format from"),
        )
    })?;

    let dir = tempfile::tempdir()?;
    let input_path = dir.path().join(format!("source{extension}"));
    let output_path = dir.path().join("converted.gpkg");
    tokio::fs::write(&input_path, contents).await?;

    let output = tokio::process::Command::new("ogr2ogr")
        .arg("-f")
        .arg("GPKG")
        .arg(&output_path)
        .arg(&input_path)
        .output()
        .await
        .context("spawning ogr2ogr")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(ErrorMetadata::bad_request(
            "LayerConversionFailed",
            format!("Converting {source_key} to GeoPackage failed: {stderr}"),
        ));
    }
    Ok(tokio::fs::read(&output_path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &Path, max_size: u64) -> FileCache {
        FileCache::new(dir, max_size).unwrap()
    }

    #[test]
    fn test_set_get_and_touch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024);
        cache.set("a.gpkg", b"aaaa").unwrap();
        assert!(cache.has("a.gpkg"));
        let path = cache.get_path("a.gpkg").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"aaaa");
        assert_eq!(cache.total(), 4);
    }

    #[test]
    fn test_eviction_drops_least_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 10);
        cache.set("a", &[0u8; 4]).unwrap();
        cache.set("b", &[0u8; 4]).unwrap();
        // Touch `a` so `b` is now least recent.
        cache.get_path("a").unwrap();
        cache.set("c", &[0u8; 4]).unwrap();
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
    }

    #[test]
    fn test_pinned_files_survive_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 10);
        cache.set("pinned", &[0u8; 8]).unwrap();
        cache.pin("pinned");
        // Over budget, but the pinned file is never the victim.
        cache.set("other", &[0u8; 8]).unwrap();
        assert!(cache.has("pinned"));
        // Once unpinned, the next oversized insert can evict it.
        cache.unpin("pinned");
        cache.set("third", &[0u8; 8]).unwrap();
        assert!(!cache.has("pinned"));
        assert!(cache.has("third"));
    }

    #[test]
    fn test_overwrite_updates_size_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024);
        cache.set("a", &[0u8; 100]).unwrap();
        cache.set("a", &[0u8; 10]).unwrap();
        assert_eq!(cache.total(), 10);
    }

    fn layer(kind: LayerKind, s3_key: Option<&str>, metadata: Option<serde_json::Value>) -> MapLayer {
        MapLayer {
            layer_id: "L12345678901".to_string(),
            owner_uuid: uuid::Uuid::nil(),
            name: None,
            kind,
            s3_key: s3_key.map(str::to_string),
            postgis_connection_id: None,
            postgis_query: None,
            postgis_attribute_column_list: None,
            metadata,
            bounds: None,
            geometry_type: None,
            feature_count: None,
            source_map_id: None,
            created_on: chrono::Utc::now(),
            last_edited: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_source_key_prefers_recorded_geopackage() {
        let layer = layer(
            LayerKind::Vector,
            Some("uploads/u/P/L12345678901.geojson"),
            Some(serde_json::json!({"geopackage_key": "derived/L12345678901.gpkg"})),
        );
        assert_eq!(
            LayerCache::source_object_key(&layer).unwrap(),
            "derived/L12345678901.gpkg"
        );
    }

    #[test]
    fn test_source_key_falls_back_to_upload_for_conversion() {
        // GeoJSON uploads have no recorded rendition; the upload itself is
        // the source and gets converted at cache-fill time.
        let layer = layer(
            LayerKind::Vector,
            Some("uploads/u/P/L12345678901.geojson"),
            None,
        );
        assert_eq!(
            LayerCache::source_object_key(&layer).unwrap(),
            "uploads/u/P/L12345678901.geojson"
        );
    }

    #[test]
    fn test_source_key_rejects_postgis_and_keyless_layers() {
        let postgis = layer(LayerKind::Postgis, None, None);
        assert!(LayerCache::source_object_key(&postgis).is_err());
        let keyless = layer(LayerKind::Vector, None, None);
        assert!(LayerCache::source_object_key(&keyless).is_err());
    }
}
