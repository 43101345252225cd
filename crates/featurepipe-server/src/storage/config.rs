use serde::{Deserialize, Serialize};
use std::env;

/// Default region for S3-compatible endpoints
pub const DEFAULT_S3_REGION: &str = "us-east-1";

#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    /// Used when a job names no bucket of its own
    pub default_bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("default_bucket", &self.default_bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

impl StorageConfig {
    /// `None` unless `S3_ENDPOINT` or `S3_BUCKET` is set, or `S3_ENABLED` is
    /// true for plain AWS with per-job buckets
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let enabled = env::var("S3_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);
        let configured = ["S3_ENDPOINT", "S3_BUCKET"]
            .iter()
            .any(|key| env::var(key).is_ok_and(|v| !v.is_empty()));
        if !enabled && !configured {
            return Ok(None);
        }

        Ok(Some(Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|v| !v.is_empty()),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_S3_REGION.to_string()),
            default_bucket: env::var("S3_BUCKET").ok().filter(|v| !v.is_empty()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }))
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            default_bucket: Some(bucket.into()),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    /// Static keys were given; otherwise the AWS default provider chain is used
    pub fn has_static_credentials(&self) -> bool {
        self.access_key.is_some() && self.secret_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "attachments");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert_eq!(config.default_bucket.as_deref(), Some("attachments"));
        assert!(config.path_style);
        assert!(config.has_static_credentials());
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = StorageConfig::for_minio("http://localhost:9000", "attachments");
        let debug = format!("{:?}", config);
        assert_eq!(debug.matches("minioadmin").count(), 1);
        assert!(debug.contains("***"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("S3_ENDPOINT", "http://minio:9000");
        std::env::set_var("S3_PATH_STYLE", "true");
        std::env::set_var("S3_ACCESS_KEY", "key");
        std::env::set_var("S3_SECRET_KEY", "secret");
        std::env::remove_var("S3_BUCKET");

        let config = StorageConfig::from_env().unwrap().unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(config.region, DEFAULT_S3_REGION);
        assert!(config.default_bucket.is_none());
        assert!(config.path_style);
        assert_eq!(config.access_key.as_deref(), Some("key"));

        for key in ["S3_ENDPOINT", "S3_PATH_STYLE", "S3_ACCESS_KEY", "S3_SECRET_KEY"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_without_storage() {
        for key in ["S3_ENDPOINT", "S3_BUCKET", "S3_ENABLED"] {
            std::env::remove_var(key);
        }
        assert!(StorageConfig::from_env().unwrap().is_none());

        std::env::set_var("S3_ENABLED", "true");
        let config = StorageConfig::from_env().unwrap().unwrap();
        assert!(config.endpoint.is_none());
        assert!(config.default_bucket.is_none());

        std::env::remove_var("S3_ENABLED");
        std::env::set_var("S3_BUCKET", "tree-photos");
        let config = StorageConfig::from_env().unwrap().unwrap();
        assert_eq!(config.default_bucket.as_deref(), Some("tree-photos"));
        std::env::remove_var("S3_BUCKET");
    }
}
