//! Collector contracts plus the HTML, JSON-API and simulated implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopscout_core::{CanonicalProductRecord, CollectionRequest, ProviderId, SourceRole};
use shopscout_storage::{redact_query, sha256_hex, ArtifactStore, FetchError, HttpFetcher};
use thiserror::Error;
use tracing::warn;

mod extract;
mod html;
mod json;
mod simulated;

pub use extract::{Extracted, ExtractionMode, ExtractionScope};
pub use html::{extract_html, HtmlProfile, HtmlSearchCollector};
pub use json::{extract_json, JsonApiCollector, JsonFieldMap, JsonProfile};
pub use simulated::{category_for_keyword, SimulatedCollector, SIMULATION_GENERATOR};

pub const CRATE_NAME: &str = "shopscout-collectors";

pub const OFFICIAL_API_HINT: &str = "try an official API provider instead";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("provider {provider} has no credential configured")]
    ConfigMissing { provider: ProviderId },
    #[error("provider {provider} timed out")]
    ProviderTimeout { provider: ProviderId },
    #[error("provider {provider} request failed: {message}")]
    ProviderHttp {
        provider: ProviderId,
        status: Option<u16>,
        message: String,
    },
    #[error("unexpected response structure from {provider}: {detail}")]
    ParseStructureChanged { provider: ProviderId, detail: String },
    #[error("no product data extracted from {provider}")]
    NoDataExtracted { provider: ProviderId, hint: String },
    #[error("invalid extraction profile: {0}")]
    InvalidProfile(String),
    #[error("invalid collection request: {0}")]
    InvalidRequest(String),
}

impl CollectorError {
    /// Failures that justify trying the next provider in cost order.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::ConfigMissing { .. }
                | Self::ProviderTimeout { .. }
                | Self::ProviderHttp { .. }
                | Self::NoDataExtracted { .. }
                | Self::ParseStructureChanged { .. }
        )
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::NoDataExtracted { hint, .. } => Some(hint),
            _ => None,
        }
    }

    fn from_fetch(provider: &ProviderId, err: FetchError) -> Self {
        match err {
            FetchError::Timeout { .. } => Self::ProviderTimeout {
                provider: provider.clone(),
            },
            FetchError::HttpStatus { status, url } => Self::ProviderHttp {
                provider: provider.clone(),
                status: Some(status),
                message: format!("status {status} from {url}"),
            },
            FetchError::Request(err) => Self::ProviderHttp {
                provider: provider.clone(),
                status: err.status().map(|s| s.as_u16()),
                message: redact_query(&err.without_url().to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    Html,
    Json,
}

/// Everything one provider needs at construction time. Credentials are
/// resolved by the caller; nothing here reads the environment.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub provider: ProviderId,
    pub role: SourceRole,
    /// Request URL with `{keyword}`, `{country}`, `{limit}`, `{api_key}` and
    /// `{target}` placeholders. Values are percent-encoded on substitution.
    pub url_template: String,
    /// Page a scraping proxy should fetch, substituted into `{target}`.
    pub target_template: Option<String>,
    pub credential: Option<String>,
    /// When set the credential travels in this header instead of `{api_key}`.
    pub credential_header: Option<String>,
    pub headers: Vec<(String, String)>,
    pub extractor_version: String,
}

impl CollectorConfig {
    pub fn new(provider: impl Into<ProviderId>, role: SourceRole, url_template: &str) -> Self {
        Self {
            provider: provider.into(),
            role,
            url_template: url_template.to_string(),
            target_template: None,
            credential: None,
            credential_header: None,
            headers: Vec::new(),
            extractor_version: format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn needs_credential(&self) -> bool {
        self.url_template.contains("{api_key}") || self.credential_header.is_some()
    }

    pub fn is_ready(&self) -> bool {
        !self.needs_credential() || self.credential.is_some()
    }

    pub fn request_url(&self, request: &CollectionRequest) -> Result<String, CollectorError> {
        if self.needs_credential() && self.credential.is_none() {
            return Err(CollectorError::ConfigMissing {
                provider: self.provider.clone(),
            });
        }
        let target = self
            .target_template
            .as_deref()
            .map(|t| render_template(t, request, None, None));
        Ok(render_template(
            &self.url_template,
            request,
            self.credential.as_deref(),
            target.as_deref(),
        ))
    }

    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        if let (Some(name), Some(key)) = (&self.credential_header, &self.credential) {
            headers.push((name.clone(), key.clone()));
        }
        headers
    }
}

fn render_template(
    template: &str,
    request: &CollectionRequest,
    api_key: Option<&str>,
    target: Option<&str>,
) -> String {
    template
        .replace("{keyword}", &urlencoding::encode(request.keyword()))
        .replace("{country}", request.country.as_str())
        .replace("{limit}", &request.effective_limit().to_string())
        .replace("{api_key}", &urlencoding::encode(api_key.unwrap_or_default()))
        .replace("{target}", &urlencoding::encode(target.unwrap_or_default()))
}

/// Shared I/O handles injected into every network collector.
#[derive(Debug)]
pub struct SourceContext {
    pub http: HttpFetcher,
    pub artifacts: Option<ArtifactStore>,
}

impl SourceContext {
    pub fn new(http: HttpFetcher, artifacts: Option<ArtifactStore>) -> Self {
        Self { http, artifacts }
    }
}

/// One provider response, hashed and optionally archived.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub source_url: String,
    pub text: String,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawResponse {
    pub fn scope(&self, config: &CollectorConfig, request: &CollectionRequest) -> ExtractionScope {
        ExtractionScope::for_request(
            config.provider.clone(),
            config.role,
            request,
            self.source_url.clone(),
            self.sha256.clone(),
            self.fetched_at,
            config.extractor_version.clone(),
        )
    }
}

pub(crate) async fn fetch_raw(
    source: &SourceContext,
    config: &CollectorConfig,
    request: &CollectionRequest,
    extension: &str,
) -> Result<RawResponse, CollectorError> {
    request
        .validate()
        .map_err(|e| CollectorError::InvalidRequest(e.to_string()))?;
    let url = config.request_url(request)?;
    let response = source
        .http
        .fetch(config.provider.as_str(), &url, &config.request_headers())
        .await
        .map_err(|e| CollectorError::from_fetch(&config.provider, e))?;

    let sha256 = sha256_hex(&response.body);
    if let Some(store) = &source.artifacts {
        if let Err(err) = store
            .store_bytes(
                response.fetched_at,
                config.provider.as_str(),
                extension,
                &response.body,
            )
            .await
        {
            warn!(provider = %config.provider, error = %err, "raw response not archived");
        }
    }

    Ok(RawResponse {
        source_url: redact_query(&response.final_url),
        text: response.text(),
        sha256,
        fetched_at: response.fetched_at,
    })
}

/// Provider role and behavior as seen by the engine.
#[async_trait]
pub trait Collector: Send + Sync {
    fn provider(&self) -> &ProviderId;
    fn role(&self) -> SourceRole;

    /// Simulated collectors never touch the network and are never billed.
    fn is_simulated(&self) -> bool {
        false
    }

    /// False when a required credential is missing. The router skips such
    /// providers.
    fn is_configured(&self) -> bool {
        true
    }

    /// Fetches and normalizes records for one keyword/market pair,
    /// truncated to the request limit.
    async fn collect(
        &self,
        request: &CollectionRequest,
    ) -> Result<Vec<CanonicalProductRecord>, CollectorError>;
}

/// How to parse a provider's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionProfile {
    Html(HtmlProfile),
    Json(JsonProfile),
}

impl ExtractionProfile {
    pub fn kind(&self) -> CollectorKind {
        match self {
            Self::Html(_) => CollectorKind::Html,
            Self::Json(_) => CollectorKind::Json,
        }
    }
}

/// Picks the collector for a provider: the real one when it can run, the
/// simulated one only when the credential is missing and simulation is allowed.
pub fn build_collector(
    config: CollectorConfig,
    profile: ExtractionProfile,
    source: Arc<SourceContext>,
    allow_simulated: bool,
) -> Result<Arc<dyn Collector>, CollectorError> {
    if config.needs_credential() && config.credential.is_none() && allow_simulated {
        return Ok(Arc::new(SimulatedCollector::new(config.provider, config.role)));
    }
    Ok(match profile {
        ExtractionProfile::Html(profile) => {
            Arc::new(HtmlSearchCollector::new(config, profile, source))
        }
        ExtractionProfile::Json(profile) => {
            Arc::new(JsonApiCollector::new(config, profile, source)?)
        }
    })
}
