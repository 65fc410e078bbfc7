//! Quota tracking, provider routing, fusion and recommendation on top of the collectors.

use shopscout_collectors::CollectorError;
use shopscout_storage::StorageError;
use thiserror::Error;

pub mod config;
pub mod fusion;
pub mod pipeline;
pub mod quota;
pub mod recommend;
pub mod report;
pub mod router;

pub use config::{build_engine, EngineConfig, ProviderRegistry};
pub use fusion::{composite_score, FusionConfig, FusionEngine, FusionWeights, ScoreInputs};
pub use pipeline::{
    CollectionResponse, CollectorSet, Engine, EngineStores, FusionRequest, FusionResponse,
};
pub use quota::{ProviderLimits, QuotaTracker};
pub use recommend::{blended_score, rank, BlendedInputs, DEFAULT_TOP_N};
pub use router::{ProviderPlan, RouteDecision, RouterError};

pub const CRATE_NAME: &str = "shopscout-engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no providers configured for routing")]
    NoProviders,
    #[error("no product data extracted: {detail}")]
    NoDataExtracted { hint: String, detail: String },
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::NoDataExtracted { hint, .. } => Some(hint),
            Self::Collector(err) => err.hint(),
            _ => None,
        }
    }
}

impl From<RouterError> for EngineError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::NoProviders => Self::NoProviders,
        }
    }
}
