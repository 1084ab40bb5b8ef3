//! Object-store gateway: put text/binary objects, issue time-limited read URLs.
//!
//! Grounded on the `aws-sdk-s3` usage in PostHog's `batch-import-worker`, which
//! depends on the same crate for S3-compatible object storage.

use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("failed to put object {key}: {source}")]
    Put {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to presign {key}: {source}")]
    Presign {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

/// Gateway over an S3-compatible object store. No retry inside this layer;
/// callers decide whether a failed put is fatal or best-effort.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
}

impl ObjectStore {
    pub async fn new(config: ObjectStoreConfig) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.access_key,
            config.secret_key,
            None,
            None,
            "influencerai-worker",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .region(aws_sdk_s3::config::Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        Self {
            client,
            bucket: config.bucket,
        }
    }

    pub async fn put_text(&self, key: &str, text: &str) -> Result<(), ObjectStoreError> {
        self.put_binary(key, text.as_bytes().to_vec(), "text/plain").await
    }

    pub async fn put_binary(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| ObjectStoreError::Put {
                key: key.to_string(),
                source: Box::new(err),
            })?;
        Ok(())
    }

    pub async fn signed_get_url(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(|err| ObjectStoreError::Presign {
            key: key.to_string(),
            source: Box::new(err),
        })?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| ObjectStoreError::Presign {
                key: key.to_string(),
                source: Box::new(err),
            })?;

        Ok(presigned.uri().to_string())
    }
}

/// 24 hours, the TTL used for text-asset read URLs (caption/script uploads).
pub const TEXT_ASSET_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// 7 days, the TTL used for binary-asset read URLs (video/image/safetensors uploads).
pub const BINARY_ASSET_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ObjectStore {
        ObjectStore::new(ObjectStoreConfig {
            endpoint: Some("http://127.0.0.1:9".to_string()),
            region: "us-east-1".to_string(),
            access_key: "test-key".to_string(),
            secret_key: "test-secret".to_string(),
            bucket: "test-bucket".to_string(),
        })
        .await
    }

    #[tokio::test]
    async fn signed_url_includes_bucket_and_key_without_network_call() {
        let store = test_store().await;
        let url = store
            .signed_get_url("content-generation/job-1/caption.txt", TEXT_ASSET_TTL)
            .await
            .unwrap();

        assert!(url.contains("test-bucket"));
        assert!(url.contains("content-generation/job-1/caption.txt"));
        assert!(url.contains("X-Amz-Expires"));
    }

    #[test]
    fn ttls_match_the_text_and_binary_contract() {
        assert_eq!(TEXT_ASSET_TTL, Duration::from_secs(86_400));
        assert_eq!(BINARY_ASSET_TTL, Duration::from_secs(604_800));
    }
}
