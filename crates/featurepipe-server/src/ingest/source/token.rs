//! ArcGIS portal tokens
//!
//! Secured layers need a `token` parameter. A job may bring its own; otherwise
//! one is generated from the configured portal account and shared by every
//! job until shortly before it expires.

use crate::ingest::error::SourceError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use url::Url;

/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN_SECS: i64 = 60;

/// Default lifetime requested for generated tokens
pub const DEFAULT_TOKEN_EXPIRATION_MINS: u32 = 60;

#[derive(Clone)]
pub struct PortalCredentials {
    /// Portal root, e.g. `https://www.arcgis.com`
    pub portal_url: Url,
    pub username: String,
    pub password: String,
    pub expiration_minutes: u32,
}

impl std::fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("portal_url", &self.portal_url.as_str())
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl PortalCredentials {
    fn generate_token_url(&self) -> Result<Url, SourceError> {
        let mut url = self.portal_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Auth(format!("invalid portal url {}", self.portal_url)))?
            .pop_if_empty()
            .extend(["sharing", "rest", "generateToken"]);
        Ok(url)
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    /// Epoch milliseconds
    expires: Option<i64>,
    error: Option<TokenError>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<String>,
}

pub struct TokenProvider {
    http: Client,
    credentials: Option<PortalCredentials>,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Provider that never authenticates
    pub fn anonymous(http: Client) -> Self {
        Self {
            http,
            credentials: None,
            cached: Mutex::new(None),
        }
    }

    pub fn portal(http: Client, credentials: PortalCredentials) -> Self {
        Self {
            http,
            credentials: Some(credentials),
            cached: Mutex::new(None),
        }
    }

    /// Drop the cached token if it is still `rejected`, so the next call
    /// generates a new one. `false` when there is nothing to refresh.
    pub async fn invalidate(&self, rejected: &str) -> bool {
        if self.credentials.is_none() {
            return false;
        }
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|t| t.token == rejected) {
            info!("Portal token rejected by the service, discarding it");
            *cached = None;
        }
        true
    }

    /// Current token, generating a new one when none is cached or the cached
    /// one is about to expire. `None` for anonymous access.
    pub async fn token(&self) -> Result<Option<String>, SourceError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };

        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - ChronoDuration::seconds(REFRESH_MARGIN_SECS) > now {
                return Ok(Some(token.token.clone()));
            }
            debug!("Cached portal token expiring, refreshing");
        }

        let fresh = self.generate(credentials).await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(Some(token))
    }

    #[instrument(skip_all, fields(username = %credentials.username))]
    async fn generate(&self, credentials: &PortalCredentials) -> Result<CachedToken, SourceError> {
        let url = credentials.generate_token_url()?;
        let expiration = credentials.expiration_minutes.to_string();
        let form = [
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("client", "requestip"),
            ("expiration", expiration.as_str()),
            ("f", "json"),
        ];

        let response = self.http.post(url).form(&form).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(SourceError::Auth(format!("generateToken returned HTTP {}", status)));
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| SourceError::Auth(format!("unreadable generateToken response: {}", e)))?;

        if let Some(err) = parsed.error {
            let mut message = err.message;
            if !err.details.is_empty() {
                message = format!("{} ({})", message, err.details.join("; "));
            }
            return Err(SourceError::Auth(message));
        }

        let token = parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SourceError::Auth("generateToken returned no token".to_string()))?;

        let expires_at = parsed
            .expires
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| {
                Utc::now() + ChronoDuration::minutes(i64::from(credentials.expiration_minutes))
            });

        info!(%expires_at, "Generated portal token");

        Ok(CachedToken { token, expires_at })
    }
}
