//! Environment configuration and the provider registry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shopscout_collectors::{
    build_collector, CollectorConfig, ExtractionProfile, HtmlProfile, JsonProfile, SourceContext,
};
use shopscout_core::{ProviderId, SourceRole};
use shopscout_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, JsonFileCatalogStore, JsonFileTaskStore,
    JsonlUsageLog,
};
use tracing::info;

use crate::pipeline::{CollectorSet, Engine, EngineStores};
use crate::quota::ProviderLimits;

const DEFAULT_REGISTRY: &str = include_str!("../../../providers.yaml");

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub allow_simulated: bool,
    pub providers_path: PathBuf,
    pub bind: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup("SHOPSCOUT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            artifacts_dir: match lookup("SHOPSCOUT_ARTIFACTS_DIR") {
                Some(v) if v.trim().is_empty() || v == "off" => None,
                Some(v) => Some(PathBuf::from(v)),
                None => Some(PathBuf::from("./artifacts")),
            },
            http_timeout_secs: lookup("SHOPSCOUT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(25),
            user_agent: lookup("SHOPSCOUT_USER_AGENT")
                .unwrap_or_else(|| "shopscout-bot/0.1".to_string()),
            allow_simulated: lookup("SHOPSCOUT_ALLOW_SIMULATED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(true),
            providers_path: lookup("SHOPSCOUT_PROVIDERS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./providers.yaml")),
            bind: lookup("SHOPSCOUT_BIND").unwrap_or_else(|| "127.0.0.1:3000".to_string()),
        }
    }

    pub fn usage_log_path(&self) -> PathBuf {
        self.data_dir.join("usage.jsonl")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }
}

/// Built-in profile name or an inline profile definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSpec {
    Named(String),
    Inline(ExtractionProfile),
}

impl ProfileSpec {
    pub fn resolve(&self) -> Result<ExtractionProfile> {
        match self {
            Self::Inline(profile) => Ok(profile.clone()),
            Self::Named(name) => Ok(match name.as_str() {
                "tiktok_search" => ExtractionProfile::Html(HtmlProfile::tiktok_search()),
                "fastmoss" => ExtractionProfile::Json(JsonProfile::fastmoss()),
                "echotik" => ExtractionProfile::Json(JsonProfile::echotik()),
                "google_shopping" => ExtractionProfile::Json(JsonProfile::google_shopping()),
                other => bail!("unknown extraction profile `{other}`"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: ProviderId,
    pub role: SourceRole,
    #[serde(default)]
    pub monthly_cap: u64,
    #[serde(default)]
    pub unit_cost: f64,
    pub url_template: String,
    #[serde(default)]
    pub target_template: Option<String>,
    /// Environment variable holding the credential.
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub credential_header: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub profile: ProfileSpec,
}

impl ProviderSpec {
    pub fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            monthly_cap: self.monthly_cap,
            unit_cost: self.unit_cost,
        }
    }

    fn collector_config(&self, credential: Option<String>) -> CollectorConfig {
        let mut config = CollectorConfig::new(self.id.clone(), self.role, &self.url_template);
        config.target_template = self.target_template.clone();
        config.credential_header = self.credential_header.clone();
        config.credential = credential;
        config.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        config
    }
}

/// One fusion input. Without `provider` the role is served by the routing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionSourceSpec {
    pub role: SourceRole,
    #[serde(default)]
    pub provider: Option<ProviderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRegistry {
    pub routing: Vec<ProviderId>,
    #[serde(default)]
    pub fusion: Vec<FusionSourceSpec>,
    pub providers: Vec<ProviderSpec>,
}

impl ProviderRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(DEFAULT_REGISTRY).context("parsing built-in provider registry")
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing provider registry")?;
        registry.validate()?;
        Ok(registry)
    }

    /// Reads `path`, or falls back to the built-in registry when it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml(&text)
                .with_context(|| format!("loading provider registry {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "provider registry not found, using built-in");
                Self::builtin()
            }
            Err(err) => {
                Err(err).with_context(|| format!("reading provider registry {}", path.display()))
            }
        }
    }

    pub fn provider(&self, id: &ProviderId) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| &p.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        for provider in &self.providers {
            if !ids.insert(&provider.id) {
                bail!("provider `{}` is declared twice", provider.id);
            }
            if provider.unit_cost < 0.0 {
                bail!("provider `{}` has a negative unit cost", provider.id);
            }
            provider
                .profile
                .resolve()
                .with_context(|| format!("provider `{}`", provider.id))?;
        }
        for id in &self.routing {
            if !ids.contains(id) {
                bail!("routing references unknown provider `{id}`");
            }
        }
        let mut roles = BTreeSet::new();
        for source in &self.fusion {
            if !roles.insert(source.role) {
                bail!("fusion role `{}` is configured twice", source.role);
            }
            match &source.provider {
                Some(id) if !ids.contains(id) => {
                    bail!("fusion references unknown provider `{id}`")
                }
                None if self.routing.is_empty() => {
                    bail!("fusion role `{}` needs the routing chain but it is empty", source.role)
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl CollectorSet {
    /// Builds every configured collector. Credentials come from `lookup`, keyed by
    /// each provider's `credential_env`.
    pub fn from_registry(
        registry: &ProviderRegistry,
        source: Arc<SourceContext>,
        allow_simulated: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut set = CollectorSet::default();
        for spec in &registry.providers {
            let credential = spec
                .credential_env
                .as_deref()
                .and_then(&lookup)
                .filter(|v| !v.trim().is_empty());
            let has_credential = credential.is_some();
            let collector = build_collector(
                spec.collector_config(credential),
                spec.profile.resolve()?,
                source.clone(),
                allow_simulated,
            )
            .with_context(|| format!("building collector for `{}`", spec.id))?;
            info!(
                provider = %spec.id,
                credential = has_credential,
                simulated = collector.is_simulated(),
                "collector ready"
            );
            set.insert(collector, spec.limits());
        }
        for id in &registry.routing {
            set.route(id.clone());
        }
        for source in &registry.fusion {
            set.add_fusion_source(source.role, source.provider.clone());
        }
        Ok(set)
    }
}

/// Wires the file-backed stores, HTTP client and collectors from configuration.
pub async fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let registry = ProviderRegistry::load(&config.providers_path).await?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let artifacts = config.artifacts_dir.clone().map(ArtifactStore::new);
    let source = Arc::new(SourceContext::new(http, artifacts));
    let collectors = CollectorSet::from_registry(
        &registry,
        source,
        config.allow_simulated,
        |key| std::env::var(key).ok(),
    )?;

    let stores = EngineStores {
        usage: Arc::new(JsonlUsageLog::new(config.usage_log_path())),
        catalog: Arc::new(JsonFileCatalogStore::new(config.catalog_path())),
        tasks: Arc::new(JsonFileTaskStore::new(config.tasks_path())),
    };
    Ok(Engine::new(collectors, stores))
}
