//! ArcGIS REST feature layer client

use super::{
    AttachmentGroup, AttachmentInfo, FeaturePage, FeatureSource, LayerMetadata, PageRequest,
    RawRecord,
};
use crate::ingest::error::SourceError;
use crate::ingest::source::token::TokenProvider;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Error bodies are cut to this many bytes
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    features: Vec<RawRecord>,
    #[serde(default)]
    exceeded_transfer_limit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentsResponse {
    #[serde(default)]
    attachment_groups: Vec<AttachmentGroup>,
}

/// Client for one feature layer, e.g. `.../FeatureServer/0`
#[derive(Clone)]
pub struct ArcGisClient {
    http: Client,
    layer_url: Url,
    /// Token supplied with the job; wins over the provider
    token: Option<String>,
    tokens: Option<Arc<TokenProvider>>,
}

impl ArcGisClient {
    pub fn new(http: Client, layer_url: Url) -> Self {
        Self {
            http,
            layer_url,
            token: None,
            tokens: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into()).filter(|t: &String| !t.is_empty());
        self
    }

    pub fn with_token_provider(mut self, tokens: Arc<TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Shared HTTP client for feature services
    pub fn http_client(timeout: Duration) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(timeout)
            .user_agent(concat!("featurepipe/", env!("CARGO_PKG_VERSION")))
            .build()
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.layer_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Decode(format!("{} is not a layer url", self.layer_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn token(&self) -> Result<Option<String>, SourceError> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        match &self.tokens {
            Some(tokens) => tokens.token().await,
            None => Ok(None),
        }
    }

    /// After `err`, a new portal token to retry with. A rejected job token
    /// or anonymous access gets `err` back.
    async fn refreshed_token(
        &self,
        used: Option<String>,
        err: SourceError,
    ) -> Result<Option<String>, SourceError> {
        if !err.is_token_rejected() || self.token.is_some() {
            return Err(err);
        }
        match (used, &self.tokens) {
            (Some(used), Some(tokens)) if tokens.invalidate(&used).await => {
                debug!("Portal token rejected, retrying with a new one");
                self.token().await
            },
            _ => Err(err),
        }
    }

    async fn send(
        &self,
        url: Url,
        params: &[(&str, String)],
        token: Option<&str>,
    ) -> Result<Response, SourceError> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        if let Some(token) = token {
            query.push(("token", token.to_string()));
        }

        let response = self.http.get(url).query(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body: truncate(body),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        params: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let mut query = vec![("f", "json".to_string())];
        query.extend_from_slice(params);

        let token = self.token().await?;
        match self.try_get_json(url.clone(), &query, token.as_deref()).await {
            Err(err) => {
                let fresh = self.refreshed_token(token, err).await?;
                self.try_get_json(url, &query, fresh.as_deref()).await
            },
            ok => ok,
        }
    }

    async fn try_get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
        token: Option<&str>,
    ) -> Result<T, SourceError> {
        let body = self.send(url, query, token).await?.bytes().await?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| SourceError::Decode(format!("response is not JSON: {}", e)))?;

        if let Some(err) = service_error(&value) {
            return Err(err);
        }

        serde_json::from_value(value).map_err(|e| SourceError::Decode(e.to_string()))
    }

    async fn try_fetch_bytes(&self, url: Url, token: Option<&str>) -> Result<Bytes, SourceError> {
        let response = self.send(url, &[], token).await?;
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        let body = response.bytes().await?;

        // Missing attachments come back as a 200 with an error document
        if is_json {
            if let Some(err) = serde_json::from_slice::<Value>(&body)
                .ok()
                .as_ref()
                .and_then(service_error)
            {
                return Err(err);
            }
        }

        debug!(bytes = body.len(), "Downloaded attachment");
        Ok(body)
    }
}

#[async_trait]
impl FeatureSource for ArcGisClient {
    #[instrument(skip(self), fields(url = %self.layer_url))]
    async fn describe(&self) -> Result<LayerMetadata, SourceError> {
        let meta: LayerMetadata = self.get_json(self.layer_url.clone(), &[]).await?;
        debug!(fields = meta.fields.len(), geometry = ?meta.geometry_type, "Layer metadata");
        Ok(meta)
    }

    #[instrument(skip(self), fields(offset = request.offset, limit = request.limit))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeaturePage, SourceError> {
        let mut params = vec![
            ("where", "1=1".to_string()),
            ("outFields", "*".to_string()),
            ("resultOffset", request.offset.to_string()),
            ("resultRecordCount", request.limit.to_string()),
            ("returnGeometry", request.return_geometry.to_string()),
        ];
        if !request.order_by.is_empty() {
            params.push(("orderByFields", format!("{} ASC", request.order_by)));
        }

        let response: QueryResponse = self.get_json(self.endpoint(&["query"])?, &params).await?;
        debug!(
            records = response.features.len(),
            exceeded = response.exceeded_transfer_limit,
            "Fetched page"
        );

        Ok(FeaturePage {
            records: response.features,
            exceeded_transfer_limit: response.exceeded_transfer_limit,
        })
    }

    #[instrument(skip_all, fields(features = object_ids.len()))]
    async fn query_attachments(
        &self,
        object_ids: &[i64],
    ) -> Result<Vec<AttachmentGroup>, SourceError> {
        if object_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids = object_ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let params = [("objectIds", ids), ("returnUrl", "true".to_string())];

        let response: AttachmentsResponse = self
            .get_json(self.endpoint(&["queryAttachments"])?, &params)
            .await?;
        Ok(response.attachment_groups)
    }

    #[instrument(skip(self, attachment), fields(attachment_id = attachment.id))]
    async fn fetch_attachment(
        &self,
        feature_id: i64,
        attachment: &AttachmentInfo,
    ) -> Result<Bytes, SourceError> {
        let url = match attachment.url.as_deref().map(Url::parse) {
            Some(Ok(url)) => url,
            _ => {
                let feature = feature_id.to_string();
                let id = attachment.id.to_string();
                self.endpoint(&[feature.as_str(), "attachments", id.as_str()])?
            },
        };

        let token = self.token().await?;
        match self.try_fetch_bytes(url.clone(), token.as_deref()).await {
            Err(err) => {
                let fresh = self.refreshed_token(token, err).await?;
                self.try_fetch_bytes(url, fresh.as_deref()).await
            },
            ok => ok,
        }
    }
}

/// `{"error": {"code": 400, "message": "...", "details": [...]}}`
fn service_error(value: &Value) -> Option<SourceError> {
    let error = value.get("error")?;
    let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
    let mut message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    let details: Vec<&str> = error
        .get("details")
        .and_then(Value::as_array)
        .map(|d| d.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !details.is_empty() {
        message = format!("{} ({})", message, details.join("; "));
    }

    Some(SourceError::Service { code, message })
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
