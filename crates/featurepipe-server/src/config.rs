//! Configuration management

use crate::ingest::settings::{
    DEFAULT_ATTACHMENT_CONCURRENCY, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX,
    DEFAULT_FETCH_ATTEMPTS, DEFAULT_MAX_IN_FLIGHT,
};
use crate::ingest::source::token::{PortalCredentials, DEFAULT_TOKEN_EXPIRATION_MINS};
use crate::ingest::{Crs, PipelineSettings, RetryPolicy};
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/featurepipe";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default timeout for one feature-service request.
pub const DEFAULT_ARCGIS_TIMEOUT_SECS: u64 = 60;

/// CRS assumed for layers that declare none.
pub const DEFAULT_EPSG: u32 = 4326;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub arcgis: ArcGisConfig,
    pub pipeline: PipelineConfig,
    /// Absent when no S3 settings are given; attachments are then refused
    pub storage: Option<StorageConfig>,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Job request authentication
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_key: String,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig").field("api_key", &"***").finish()
    }
}

/// Feature-service access
#[derive(Clone, Serialize, Deserialize)]
pub struct ArcGisConfig {
    /// Portal used to generate tokens, e.g. `https://www.arcgis.com`
    pub portal_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub token_expiration_mins: u32,
}

impl std::fmt::Debug for ArcGisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcGisConfig")
            .field("portal_url", &self.portal_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .field("token_expiration_mins", &self.token_expiration_mins)
            .finish()
    }
}

impl ArcGisConfig {
    /// Portal account, when all three of url, username and password are set
    pub fn credentials(&self) -> anyhow::Result<Option<PortalCredentials>> {
        let (Some(portal), Some(username), Some(password)) =
            (&self.portal_url, &self.username, &self.password)
        else {
            return Ok(None);
        };

        let portal_url = Url::parse(portal)
            .map_err(|e| anyhow::anyhow!("Invalid ARCGIS_PORTAL_URL `{}`: {}", portal, e))?;

        Ok(Some(PortalCredentials {
            portal_url,
            username: username.clone(),
            password: password.clone(),
            expiration_minutes: self.token_expiration_mins,
        }))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Server-wide pipeline defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub default_epsg: u32,
    pub fetch_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_in_flight: usize,
    pub attachment_concurrency: usize,
    /// 0 disables the job timeout
    pub job_timeout_secs: u64,
    /// Default for jobs that do not set `partial_success`
    pub partial_success: bool,
}

impl PipelineConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            default_crs: Crs::from_epsg(self.default_epsg),
            retry: RetryPolicy {
                max_attempts: self.fetch_attempts,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
            max_in_flight: self.max_in_flight,
            attachment_concurrency: self.attachment_concurrency,
            job_timeout: (self.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.job_timeout_secs)),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: std::env::var("FEATUREPIPE_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("FEATUREPIPE_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "FEATUREPIPE_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            api: ApiConfig {
                api_key: std::env::var("API_KEY").unwrap_or_default(),
            },
            arcgis: ArcGisConfig {
                portal_url: env_opt("ARCGIS_PORTAL_URL"),
                username: env_opt("ARCGIS_USERNAME"),
                password: env_opt("ARCGIS_PASSWORD"),
                timeout_secs: env_or("ARCGIS_TIMEOUT", DEFAULT_ARCGIS_TIMEOUT_SECS),
                token_expiration_mins: env_or(
                    "ARCGIS_TOKEN_EXPIRATION",
                    DEFAULT_TOKEN_EXPIRATION_MINS,
                ),
            },
            pipeline: PipelineConfig {
                default_epsg: env_or("DEFAULT_EPSG", DEFAULT_EPSG),
                fetch_attempts: env_or("PIPELINE_FETCH_ATTEMPTS", DEFAULT_FETCH_ATTEMPTS),
                backoff_base_ms: env_or(
                    "PIPELINE_BACKOFF_BASE_MS",
                    DEFAULT_BACKOFF_BASE.as_millis() as u64,
                ),
                backoff_max_ms: env_or(
                    "PIPELINE_BACKOFF_MAX_MS",
                    DEFAULT_BACKOFF_MAX.as_millis() as u64,
                ),
                max_in_flight: env_or("PIPELINE_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT),
                attachment_concurrency: env_or(
                    "PIPELINE_ATTACHMENT_CONCURRENCY",
                    DEFAULT_ATTACHMENT_CONCURRENCY,
                ),
                job_timeout_secs: env_or("PIPELINE_JOB_TIMEOUT", 0),
                partial_success: env_or("PIPELINE_PARTIAL_SUCCESS", false),
            },
            storage: StorageConfig::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate port
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        // Validate database URL
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        // Validate connection pool settings
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.api.api_key.is_empty() {
            anyhow::bail!("API_KEY must be set");
        }

        let portal_parts = [
            self.arcgis.portal_url.is_some(),
            self.arcgis.username.is_some(),
            self.arcgis.password.is_some(),
        ];
        if portal_parts.contains(&true) && portal_parts.contains(&false) {
            anyhow::bail!(
                "ARCGIS_PORTAL_URL, ARCGIS_USERNAME and ARCGIS_PASSWORD must be set together"
            );
        }
        self.arcgis.credentials()?;

        if self.arcgis.timeout_secs == 0 {
            anyhow::bail!("ARCGIS_TIMEOUT must be greater than 0");
        }

        if self.pipeline.default_epsg == 0 {
            anyhow::bail!("DEFAULT_EPSG must be a positive EPSG code");
        }

        if self.pipeline.fetch_attempts == 0 {
            anyhow::bail!("PIPELINE_FETCH_ATTEMPTS must be at least 1");
        }

        if self.pipeline.backoff_base_ms > self.pipeline.backoff_max_ms {
            anyhow::bail!(
                "PIPELINE_BACKOFF_BASE_MS ({}) cannot be greater than PIPELINE_BACKOFF_MAX_MS ({})",
                self.pipeline.backoff_base_ms,
                self.pipeline.backoff_max_ms
            );
        }

        if self.pipeline.max_in_flight == 0 || self.pipeline.attachment_concurrency == 0 {
            anyhow::bail!(
                "PIPELINE_MAX_IN_FLIGHT and PIPELINE_ATTACHMENT_CONCURRENCY must be greater than 0"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            api: ApiConfig {
                api_key: String::new(),
            },
            arcgis: ArcGisConfig {
                portal_url: None,
                username: None,
                password: None,
                timeout_secs: DEFAULT_ARCGIS_TIMEOUT_SECS,
                token_expiration_mins: DEFAULT_TOKEN_EXPIRATION_MINS,
            },
            pipeline: PipelineConfig {
                default_epsg: DEFAULT_EPSG,
                fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
                backoff_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
                backoff_max_ms: DEFAULT_BACKOFF_MAX.as_millis() as u64,
                max_in_flight: DEFAULT_MAX_IN_FLIGHT,
                attachment_concurrency: DEFAULT_ATTACHMENT_CONCURRENCY,
                job_timeout_secs: 0,
                partial_success: false,
            },
            storage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn valid() -> Config {
        let mut config = Config::default();
        config.api.api_key = "secret".to_string();
        config
    }

    #[test]
    fn test_default_needs_api_key() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_pool_bounds() {
        let mut config = valid();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_portal_rejected() {
        let mut config = valid();
        config.arcgis.username = Some("gis".into());
        assert!(config.validate().is_err());

        config.arcgis.portal_url = Some("https://www.arcgis.com".into());
        config.arcgis.password = Some("pw".into());
        assert!(config.validate().is_ok());
        assert!(config.arcgis.credentials().unwrap().is_some());
    }

    #[test]
    fn test_pipeline_settings() {
        let mut config = valid();
        config.pipeline.default_epsg = 3857;
        config.pipeline.job_timeout_secs = 90;

        let settings = config.pipeline.settings();
        assert_eq!(settings.default_crs, Crs::WEB_MERCATOR);
        assert_eq!(settings.max_in_flight, 2);
        assert_eq!(settings.job_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.retry, RetryPolicy::default());

        config.pipeline.job_timeout_secs = 0;
        assert!(config.pipeline.settings().job_timeout.is_none());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let mut config = valid();
        config.arcgis.password = Some("hunter2".into());
        config.api.api_key = "k3y-value".into();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("k3y-value"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        std::env::set_var("API_KEY", "from-env");
        std::env::set_var("FEATUREPIPE_PORT", "9100");
        std::env::set_var("DEFAULT_EPSG", "2263");
        std::env::set_var("PIPELINE_PARTIAL_SUCCESS", "true");

        let config = Config::load().unwrap();
        assert_eq!(config.api.api_key, "from-env");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.pipeline.default_epsg, 2263);
        assert!(config.pipeline.partial_success);

        for key in ["API_KEY", "FEATUREPIPE_PORT", "DEFAULT_EPSG", "PIPELINE_PARTIAL_SUCCESS"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_storage_only_when_configured() {
        std::env::set_var("API_KEY", "from-env");
        for key in ["S3_ENDPOINT", "S3_BUCKET", "S3_ENABLED"] {
            std::env::remove_var(key);
        }
        assert!(Config::load().unwrap().storage.is_none());

        std::env::set_var("S3_ENDPOINT", "http://minio:9000");
        let storage = Config::load().unwrap().storage.unwrap();
        assert_eq!(storage.endpoint.as_deref(), Some("http://minio:9000"));

        for key in ["API_KEY", "S3_ENDPOINT"] {
            std::env::remove_var(key);
        }
    }
}
