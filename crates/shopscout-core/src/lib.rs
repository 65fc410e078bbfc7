//! Core domain model and provenance types for product opportunity scouting.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopscout-core";

/// Default number of products a collection call returns.
pub const DEFAULT_LIMIT: u32 = 20;
/// Upper bound on a single collection call.
pub const MAX_LIMIT: u32 = 50;

/// Supported target markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CountryCode {
    VN,
    TH,
    MY,
    SG,
}

impl CountryCode {
    pub const ALL: [CountryCode; 4] = [Self::VN, Self::TH, Self::MY, Self::SG];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VN => "VN",
            Self::TH => "TH",
            Self::MY => "MY",
            Self::SG => "SG",
        }
    }

    pub fn currency(&self) -> &'static str {
        match self {
            Self::VN => "VND",
            Self::TH => "THB",
            Self::MY => "MYR",
            Self::SG => "SGD",
        }
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported country code `{0}` (expected one of VN, TH, MY, SG)")]
pub struct UnknownCountry(pub String);

impl FromStr for CountryCode {
    type Err = UnknownCountry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VN" => Ok(Self::VN),
            "TH" => Ok(Self::TH),
            "MY" => Ok(Self::MY),
            "SG" => Ok(Self::SG),
            other => Err(UnknownCountry(other.to_string())),
        }
    }
}

/// Identifier of an external data provider (`scraperapi`, `fastmoss`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Role a provider plays when its records are fused with others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    /// Local marketplace listing: local price, sales.
    Marketplace,
    /// Sales analytics: sales volume, rating, trend tags.
    Analytics,
    /// Reference market: reference price used for the arbitrage signal.
    ReferenceMarket,
}

impl SourceRole {
    /// Fusion processing order.
    pub const ALL: [SourceRole; 3] = [Self::Marketplace, Self::Analytics, Self::ReferenceMarket];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Marketplace => "marketplace",
            Self::Analytics => "analytics",
            Self::ReferenceMarket => "reference_market",
        }
    }
}

impl fmt::Display for SourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance pointer attached to observed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub raw_artifact_sha256: String,
    pub source_url: String,
    pub selector_or_pointer: String,
    pub snippet: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
}

/// Canonical field wrapper. The variant is the provenance: a simulated value
/// can never be read back as an observed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provenance", rename_all = "snake_case")]
pub enum Field<T> {
    Observed {
        value: T,
        evidence: EvidenceRef,
    },
    Simulated {
        value: T,
        generator: String,
    },
    Absent,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<T> Field<T> {
    pub fn observed(value: T, evidence: EvidenceRef) -> Self {
        Self::Observed { value, evidence }
    }

    pub fn simulated(value: T, generator: impl Into<String>) -> Self {
        Self::Simulated {
            value,
            generator: generator.into(),
        }
    }

    pub fn absent() -> Self {
        Self::Absent
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Observed { value, .. } | Self::Simulated { value, .. } => Some(value),
            Self::Absent => None,
        }
    }

    /// Value only when it was parsed from provider output.
    pub fn observed_value(&self) -> Option<&T> {
        match self {
            Self::Observed { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn evidence(&self) -> Option<&EvidenceRef> {
        match self {
            Self::Observed { evidence, .. } => Some(evidence),
            _ => None,
        }
    }

    pub fn provenance(&self) -> Provenance {
        match self {
            Self::Observed { .. } => Provenance::Real,
            Self::Simulated { .. } => Provenance::Simulated,
            Self::Absent => Provenance::Absent,
        }
    }

    pub fn is_observed(&self) -> bool {
        matches!(self, Self::Observed { .. })
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, Self::Simulated { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Real,
    Simulated,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    Title,
    Images,
    Price,
    Sales,
    Growth,
    Competition,
    Category,
    Rating,
    ProfitMargin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub value: f64,
    pub currency: String,
}

/// Sales counts as the provider reported them. A window the source did not
/// state stays `None`; nothing is derived from another window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Sales {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub daily: Option<u64>,
    #[serde(default)]
    pub weekly: Option<u64>,
    #[serde(default)]
    pub monthly: Option<u64>,
}

impl Sales {
    pub fn from_monthly(monthly: u64) -> Self {
        Self {
            monthly: Some(monthly),
            ..Self::default()
        }
    }

    /// Cumulative count with no time window, e.g. `1.2k sold`.
    pub fn from_total(total: u64) -> Self {
        Self {
            total: Some(total),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total.is_none() && self.daily.is_none() && self.weekly.is_none() && self.monthly.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    /// Same bucketing the growth rate uses everywhere: >0 up, < -5 down.
    pub fn from_rate(rate: f64) -> Self {
        if rate > 0.0 {
            Self::Up
        } else if rate < -5.0 {
            Self::Down
        } else {
            Self::Stable
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "up" | "rising" => Some(Self::Up),
            "down" | "falling" => Some(Self::Down),
            "stable" | "flat" => Some(Self::Stable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Growth {
    pub rate: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionLevel {
    Low,
    Medium,
    High,
}

impl CompetitionLevel {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "mid" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn from_score(score: u8) -> Self {
        match score {
            0..=33 => Self::Low,
            34..=66 => Self::Medium,
            _ => Self::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    pub level: CompetitionLevel,
    pub score: u8,
    pub competitors: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub primary: String,
    pub secondary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Normalized, cross-provider representation of one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProductRecord {
    pub id: Uuid,
    pub provider: ProviderId,
    pub role: SourceRole,
    pub keyword: String,
    pub fetched_at: DateTime<Utc>,
    pub countries: Vec<CountryCode>,
    pub title: Field<String>,
    pub images: Field<Vec<String>>,
    pub price: Field<Price>,
    pub sales: Field<Sales>,
    pub growth: Field<Growth>,
    pub competition: Field<Competition>,
    pub category: Field<Category>,
    pub rating: Field<f64>,
    pub profit_margin: Field<f64>,
}

impl CanonicalProductRecord {
    /// Empty record shell; collectors fill in the field groups they can observe.
    pub fn new(
        provider: ProviderId,
        role: SourceRole,
        keyword: &str,
        country: CountryCode,
        title_for_id: &str,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: synthetic_id(&provider, country, title_for_id),
            provider,
            role,
            keyword: keyword.to_string(),
            fetched_at,
            countries: vec![country],
            title: Field::Absent,
            images: Field::Absent,
            price: Field::Absent,
            sales: Field::Absent,
            growth: Field::Absent,
            competition: Field::Absent,
            category: Field::Absent,
            rating: Field::Absent,
            profit_margin: Field::Absent,
        }
    }

    /// Per field-group provenance, derived from the field variants.
    pub fn provenance(&self) -> BTreeMap<FieldGroup, Provenance> {
        BTreeMap::from([
            (FieldGroup::Title, self.title.provenance()),
            (FieldGroup::Images, self.images.provenance()),
            (FieldGroup::Price, self.price.provenance()),
            (FieldGroup::Sales, self.sales.provenance()),
            (FieldGroup::Growth, self.growth.provenance()),
            (FieldGroup::Competition, self.competition.provenance()),
            (FieldGroup::Category, self.category.provenance()),
            (FieldGroup::Rating, self.rating.provenance()),
            (FieldGroup::ProfitMargin, self.profit_margin.provenance()),
        ])
    }

    /// True when at least one field group was observed from a live provider.
    pub fn has_real_data(&self) -> bool {
        self.provenance().values().any(|p| *p == Provenance::Real)
    }

    pub fn is_simulated(&self) -> bool {
        let provenance = self.provenance();
        provenance.values().any(|p| *p == Provenance::Simulated)
            && !provenance.values().any(|p| *p == Provenance::Real)
    }

    pub fn title_text(&self) -> &str {
        self.title.value().map(String::as_str).unwrap_or_default()
    }

    pub fn primary_category(&self) -> Option<&str> {
        self.category.value().map(|c| c.primary.as_str())
    }

    pub fn tags(&self) -> &[String] {
        self.category.value().map(|c| c.tags.as_slice()).unwrap_or(&[])
    }

    pub fn monthly_sales(&self) -> Option<u64> {
        self.sales.value().and_then(|s| s.monthly)
    }

    pub fn price_value(&self) -> Option<f64> {
        self.price.value().map(|p| p.value)
    }

    pub fn growth_rate(&self) -> Option<f64> {
        self.growth.value().map(|g| g.rate)
    }

    pub fn competition_level(&self) -> Option<CompetitionLevel> {
        self.competition.value().map(|c| c.level)
    }
}

/// Lower-cases, maps non-alphanumerics to spaces and collapses whitespace.
pub fn normalize_title(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable id for a product: same provider, market and title upsert onto the same row.
pub fn synthetic_id(provider: &ProviderId, country: CountryCode, title: &str) -> Uuid {
    let key = format!("{}:{}:{}", provider, country, normalize_title(title));
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub keyword: String,
    pub country: CountryCode,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("keyword must not be empty")]
    EmptyKeyword,
    #[error("limit must be a positive integer")]
    ZeroLimit,
    #[error("at least one country is required")]
    NoCountries,
}

impl CollectionRequest {
    pub fn new(keyword: impl Into<String>, country: CountryCode, limit: Option<u32>) -> Self {
        Self {
            keyword: keyword.into(),
            country,
            limit,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.keyword.trim().is_empty() {
            return Err(RequestError::EmptyKeyword);
        }
        if self.limit == Some(0) {
            return Err(RequestError::ZeroLimit);
        }
        Ok(())
    }

    pub fn keyword(&self) -> &str {
        self.keyword.trim()
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize
    }
}

/// Monthly free-quota state for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQuota {
    pub provider: ProviderId,
    pub monthly_cap: u64,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
    pub unit_cost: f64,
}

impl ProviderQuota {
    pub fn remaining(&self) -> u64 {
        self.monthly_cap.saturating_sub(self.used)
    }
}

/// One append-only usage log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub provider: ProviderId,
    pub count: u64,
    pub cost: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionTask {
    pub id: Uuid,
    pub keyword: String,
    pub country: CountryCode,
    pub provider: Option<ProviderId>,
    pub status: TaskStatus,
    pub progress: u8,
    pub items_collected: u32,
    pub items_total: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CollectionTask {
    pub fn pending(request: &CollectionRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            keyword: request.keyword().to_string(),
            country: request.country,
            provider: None,
            status: TaskStatus::Pending,
            progress: 0,
            items_collected: 0,
            items_total: 0,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
    }

    pub fn record_progress(&mut self, collected: u32, total: u32) {
        self.items_collected = collected;
        self.items_total = total;
        self.progress = if total == 0 {
            0
        } else {
            ((u64::from(collected) * 100) / u64::from(total)).min(100) as u8
        };
    }

    pub fn complete(&mut self, collected: u32, total: u32, now: DateTime<Utc>) {
        self.record_progress(collected, total);
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(message.into());
        self.completed_at = Some(now);
    }
}

/// Result of persisting one record of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    Ok { id: Uuid },
    Error { id: Uuid, message: String },
}

impl SaveOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Ok { id } | Self::Error { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

/// Several canonical records judged to describe the same item, scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedOpportunity {
    pub key: String,
    pub title: String,
    pub contributors: BTreeMap<SourceRole, CanonicalProductRecord>,
    pub composite_score: f64,
    pub local_price: Option<f64>,
    pub reference_price: Option<f64>,
    pub arbitrage_margin: Option<f64>,
    pub margin_ratio: Option<f64>,
    pub matched_trend_tags: u32,
    pub is_opportunity: bool,
    pub confidence: Confidence,
    pub real_sources: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lens {
    Profit,
    LowCompetition,
    Trending,
    Blended,
}

impl FromStr for Lens {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "profit" => Ok(Self::Profit),
            "low_competition" | "competition" => Ok(Self::LowCompetition),
            "trending" | "growth" => Ok(Self::Trending),
            "blended" | "best" | "best_pick" => Ok(Self::Blended),
            other => Err(format!("unknown lens `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Strong,
    Recommend,
    Consider,
}

impl Tier {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Strong
        } else if score >= 60.0 {
            Self::Recommend
        } else {
            Self::Consider
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LensScores {
    pub profit: f64,
    pub growth: f64,
    pub low_competition: f64,
    pub blended: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationScore {
    pub product_id: Uuid,
    pub title: String,
    pub lens: Lens,
    pub score: f64,
    pub scores: LensScores,
    pub justifications: Vec<String>,
    pub tier: Tier,
    pub estimated_monthly_profit: Option<f64>,
    /// True when any value behind the score was generated rather than
    /// extracted.
    pub simulated: bool,
    /// Field groups of the record backed by provider output.
    pub real_fields: u32,
}
