//! S3-compatible object storage for archived attachments

use crate::ingest::ObjectStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

pub mod config;

pub use config::StorageConfig;

#[derive(Clone)]
pub struct Storage {
    client: Client,
    default_bucket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub bucket: String,
    pub key: String,
    pub checksum: String,
    pub size: i64,
}

impl UploadResult {
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

impl Storage {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.path_style);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials =
                Credentials::new(access_key, secret_key, None, None, "featurepipe-storage");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        }

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            default_bucket = config.default_bucket.as_deref().unwrap_or("-"),
            "Storage client initialized"
        );

        Ok(Self {
            client,
            default_bucket: config.default_bucket,
        })
    }

    pub fn default_bucket(&self) -> Option<&str> {
        self.default_bucket.as_deref()
    }

    /// Overwrites any existing object under `key`
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResult> {
        let checksum = calculate_sha256(&data);
        let size = data.len() as i64;

        debug!("Uploading {} bytes to s3://{}/{}", size, bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .metadata("sha256", &checksum);

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to upload s3://{}/{}", bucket, key))?;

        debug!("Uploaded s3://{}/{}", bucket, key);

        Ok(UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            checksum,
            size,
        })
    }
}

#[async_trait]
impl ObjectStore for Storage {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<String> {
        Ok(self.upload(bucket, key, data, content_type).await?.uri())
    }
}

pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
