//! Object store access. One bucket holds every layer artifact; keys are laid
//! out by artifact kind:
//!
//! - `uploads/{user}/{project}/{layer}{ext}` - original uploads and
//!   geoprocessing outputs
//! - `pmtiles/{user}/{project}/{layer}.pmtiles` - tiled vector variant
//! - `cog/layer/{layer}.cog.tif` - cloud-optimized raster variant
//! - `social_previews/map_{map}.webp` - static previews

use std::time::Duration;

use anyhow::Context as _;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use errors::ErrorMetadata;

pub const PRESIGNED_URL_EXPIRY: Duration = Duration::from_secs(3600);

pub fn upload_key(user_id: &str, project_id: &str, layer_id: &str, extension: &str) -> String {
    format!("uploads/{user_id}/{project_id}/{layer_id}{extension}")
}

pub fn pmtiles_key(user_id: &str, project_id: &str, layer_id: &str) -> String {
    format!("pmtiles/{user_id}/{project_id}/{layer_id}.pmtiles")
}

pub fn cog_key(layer_id: &str) -> String {
    format!("cog/layer/{layer_id}.cog.tif")
}

pub fn social_preview_key(map_id: &str) -> String {
    format!("social_previews/map_{map_id}.webp")
}

/// A byte range from an object, plus the object's total size for
/// `Content-Range` headers.
pub struct RangedObject {
    pub body: Bytes,
    pub total_size: u64,
}

#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
}

impl ObjectStore {
    /// Builds the client from the `S3_*` environment: custom endpoint,
    /// static credentials, path-style addressing (MinIO-compatible).
    pub async fn from_env() -> anyhow::Result<Self> {
        let bucket = std::env::var("S3_BUCKET").context("S3_BUCKET is not set")?;
        let region = std::env::var("S3_DEFAULT_REGION").unwrap_or_else(|_| "us-east-1".to_string());

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let (Ok(access_key), Ok(secret_key)) = (
            std::env::var("S3_ACCESS_KEY_ID"),
            std::env::var("S3_SECRET_ACCESS_KEY"),
        ) {
            loader = loader.credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "env",
            ));
        }
        if let Ok(endpoint) = std::env::var("S3_ENDPOINT_URL") {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn get_object(&self, key: &str) -> anyhow::Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| {
                ErrorMetadata::not_found("ObjectNotFound", format!("No object at {key}"))
            })?;
        Ok(response.body.collect().await?.into_bytes())
    }

    /// Fetches `bytes=start-end` (inclusive) of an object.
    pub async fn get_object_range(
        &self,
        key: &str,
        start: u64,
        end: u64,
    ) -> anyhow::Result<RangedObject> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={start}-{end}"))
            .send()
            .await
            .with_context(|| {
                ErrorMetadata::not_found("ObjectNotFound", format!("No object at {key}"))
            })?;
        // "bytes s-e/total"
        let total_size = response
            .content_range()
            .and_then(|range| range.rsplit('/').next())
            .and_then(|total| total.parse().ok())
            .unwrap_or(0);
        Ok(RangedObject {
            body: response.body.collect().await?.into_bytes(),
            total_size,
        })
    }

    pub async fn object_size(&self, key: &str) -> anyhow::Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| {
                ErrorMetadata::not_found("ObjectNotFound", format!("No object at {key}"))
            })?;
        Ok(head.content_length().unwrap_or(0).max(0) as u64)
    }

    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await?;
        Ok(())
    }

    /// Short-lived URL for reading an object, e.g. QGIS worker inputs.
    pub async fn presign_get(&self, key: &str) -> anyhow::Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(PRESIGNED_URL_EXPIRY)?)
            .await?;
        Ok(presigned.uri().to_string())
    }

    /// Short-lived URL for writing an object, e.g. QGIS worker outputs.
    pub async fn presign_put(&self, key: &str, content_type: &str) -> anyhow::Result<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(PresigningConfig::expires_in(PRESIGNED_URL_EXPIRY)?)
            .await?;
        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            upload_key("u-1", "P12345678901", "L12345678901", ".fgb"),
            "uploads/u-1/P12345678901/L12345678901.fgb"
        );
        assert_eq!(
            pmtiles_key("u-1", "P12345678901", "L12345678901"),
            "pmtiles/u-1/P12345678901/L12345678901.pmtiles"
        );
        assert_eq!(cog_key("L12345678901"), "cog/layer/L12345678901.cog.tif");
        assert_eq!(
            social_preview_key("M12345678901"),
            "social_previews/map_M12345678901.webp"
        );
    }
}
