//! Collection and fusion runs: routing, fallback, usage accounting, persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shopscout_collectors::{Collector, CollectorError, OFFICIAL_API_HINT};
use shopscout_core::{
    CanonicalProductRecord, CollectionRequest, CollectionTask, CountryCode, FusedOpportunity,
    Lens, ProviderId, ProviderQuota, RecommendationScore, RequestError, SaveOutcome, SourceRole,
};
use shopscout_storage::{
    CatalogStore, MemoryCatalogStore, MemoryTaskStore, MemoryUsageLog, TaskStore, UsageLog,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::fusion::{FusionConfig, FusionEngine};
use crate::quota::{ProviderLimits, QuotaTracker};
use crate::recommend::rank;
use crate::router::{self, ProviderPlan, RouteDecision};
use crate::EngineError;

/// Records written per catalog batch; task progress is persisted between batches.
pub const SAVE_CHUNK: usize = 10;

/// Collectors by provider plus the routing chain and fusion slots.
#[derive(Clone, Default)]
pub struct CollectorSet {
    collectors: BTreeMap<ProviderId, Arc<dyn Collector>>,
    limits: BTreeMap<ProviderId, ProviderLimits>,
    routing: Vec<ProviderId>,
    fusion: Vec<(SourceRole, Option<ProviderId>)>,
}

impl CollectorSet {
    pub fn insert(&mut self, collector: Arc<dyn Collector>, limits: ProviderLimits) {
        let id = collector.provider().clone();
        self.limits.insert(id.clone(), limits);
        self.collectors.insert(id, collector);
    }

    /// Appends a provider to the cost-ordered routing chain.
    pub fn route(&mut self, provider: ProviderId) {
        self.routing.push(provider);
    }

    /// Adds a fusion source; `None` means the routing chain serves the role.
    pub fn add_fusion_source(&mut self, role: SourceRole, provider: Option<ProviderId>) {
        self.fusion.push((role, provider));
    }

    pub fn get(&self, provider: &ProviderId) -> Option<&Arc<dyn Collector>> {
        self.collectors.get(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.collectors.keys()
    }

    pub fn routing(&self) -> &[ProviderId] {
        &self.routing
    }

    pub fn fusion_sources(&self) -> &[(SourceRole, Option<ProviderId>)] {
        &self.fusion
    }

    pub fn limits(&self) -> &BTreeMap<ProviderId, ProviderLimits> {
        &self.limits
    }
}

pub struct EngineStores {
    pub usage: Arc<dyn UsageLog>,
    pub catalog: Arc<dyn CatalogStore>,
    pub tasks: Arc<dyn TaskStore>,
}

impl EngineStores {
    pub fn in_memory() -> Self {
        Self {
            usage: Arc::new(MemoryUsageLog::new()),
            catalog: Arc::new(MemoryCatalogStore::new()),
            tasks: Arc::new(MemoryTaskStore::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResponse {
    pub success: bool,
    pub task_id: Uuid,
    pub count: usize,
    pub data_source: ProviderId,
    pub simulated: bool,
    pub paid: bool,
    pub cost: f64,
    pub quota: BTreeMap<ProviderId, u64>,
    pub products: Vec<CanonicalProductRecord>,
    pub saved: Vec<SaveOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionRequest {
    pub keyword: String,
    pub countries: Vec<CountryCode>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl FusionRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.countries.is_empty() {
            return Err(RequestError::NoCountries);
        }
        self.requests().try_for_each(|r| r.validate())
    }

    fn requests(&self) -> impl Iterator<Item = CollectionRequest> + '_ {
        self.countries
            .iter()
            .map(|country| CollectionRequest::new(self.keyword.clone(), *country, self.limit))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionResponse {
    pub success: bool,
    pub keyword: String,
    pub per_source_counts: BTreeMap<SourceRole, usize>,
    pub fused_count: usize,
    pub avg_fusion_score: f64,
    pub opportunities: Vec<FusedOpportunity>,
    pub cost: f64,
    pub quota: BTreeMap<ProviderId, u64>,
    pub saved: Vec<SaveOutcome>,
}

struct Routed {
    decision: RouteDecision,
    records: Vec<CanonicalProductRecord>,
    simulated: bool,
    cost: f64,
}

pub struct Engine {
    collectors: CollectorSet,
    quota: QuotaTracker,
    catalog: Arc<dyn CatalogStore>,
    tasks: Arc<dyn TaskStore>,
    fusion: FusionEngine,
}

impl Engine {
    pub fn new(collectors: CollectorSet, stores: EngineStores) -> Self {
        let roles: Vec<SourceRole> = collectors.fusion_sources().iter().map(|(r, _)| *r).collect();
        let fusion = if roles.is_empty() {
            FusionEngine::default()
        } else {
            FusionEngine::new(FusionConfig::for_roles(&roles))
        };
        Self {
            quota: QuotaTracker::new(stores.usage, collectors.limits().clone()),
            collectors,
            catalog: stores.catalog,
            tasks: stores.tasks,
            fusion,
        }
    }

    pub fn with_fusion_engine(mut self, fusion: FusionEngine) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn quota_tracker(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn collectors(&self) -> &CollectorSet {
        &self.collectors
    }

    /// Runs one routed collection and persists its records.
    pub async fn collect(
        &self,
        request: CollectionRequest,
    ) -> Result<CollectionResponse, EngineError> {
        request
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

        let mut task = CollectionTask::pending(&request, Utc::now());
        self.tasks.put(&task).await?;
        task.start(Utc::now());
        if let Err(err) = self.tasks.put(&task).await {
            task.fail(err.to_string(), Utc::now());
            self.store_task(&task).await;
            return Err(err.into());
        }

        let span = info_span!(
            "collect",
            task_id = %task.id,
            keyword = request.keyword(),
            country = %request.country
        );
        async move {
            let routed = match self.run_routed(&request).await {
                Ok(routed) => routed,
                Err(err) => {
                    task.fail(err.to_string(), Utc::now());
                    self.store_task(&task).await;
                    warn!(error = %err, "collection failed");
                    return Err(err);
                }
            };

            task.provider = Some(routed.decision.provider.clone());
            let saved = self.save_with_progress(&routed.records, &mut task).await;
            let count = saved.iter().filter(|s| s.is_ok()).count();
            task.complete(count as u32, routed.records.len() as u32, Utc::now());
            self.store_task(&task).await;
            info!(
                provider = %routed.decision.provider,
                count,
                paid = routed.decision.paid,
                "collection completed"
            );

            Ok(CollectionResponse {
                success: true,
                task_id: task.id,
                count,
                data_source: routed.decision.provider,
                simulated: routed.simulated,
                paid: routed.decision.paid,
                cost: routed.cost,
                quota: self.quota_snapshot().await,
                products: routed.records,
                saved,
            })
        }
        .instrument(span)
        .await
    }

    /// Collects every fusion role for each country and fuses per country.
    pub async fn fuse(&self, request: FusionRequest) -> Result<FusionResponse, EngineError> {
        request
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

        let span = info_span!("fuse", keyword = request.keyword.trim());
        async move {
            let mut per_source_counts: BTreeMap<SourceRole, usize> = BTreeMap::new();
            let mut opportunities = Vec::new();
            let mut collected = Vec::new();
            let mut cost = 0.0;

            for collection in request.requests() {
                let mut by_role: BTreeMap<SourceRole, Vec<CanonicalProductRecord>> =
                    BTreeMap::new();
                for (role, provider) in self.collectors.fusion_sources() {
                    let result = match provider {
                        Some(provider) => self.run_fixed(provider, &collection).await,
                        None => self.run_routed(&collection).await,
                    };
                    match result {
                        Ok(routed) => {
                            cost += routed.cost;
                            *per_source_counts.entry(*role).or_default() += routed.records.len();
                            collected.extend(routed.records.iter().cloned());
                            by_role.entry(*role).or_default().extend(routed.records);
                        }
                        Err(err) => {
                            warn!(
                                role = %role,
                                country = %collection.country,
                                error = %err,
                                "fusion source failed, continuing without it"
                            );
                        }
                    }
                }
                opportunities.extend(self.fusion.fuse(&by_role));
            }

            if collected.is_empty() {
                return Err(EngineError::NoDataExtracted {
                    hint: OFFICIAL_API_HINT.to_string(),
                    detail: "no fusion source returned records".to_string(),
                });
            }

            let saved = self.save_records(&collected).await;
            opportunities.sort_by(|a, b| b.composite_score.total_cmp(&a.composite_score));
            let fused_count = opportunities.len();
            let avg_fusion_score = if fused_count == 0 {
                0.0
            } else {
                opportunities.iter().map(|o| o.composite_score).sum::<f64>() / fused_count as f64
            };
            info!(
                fused_count,
                flagged = opportunities.iter().filter(|o| o.is_opportunity).count(),
                "fusion completed"
            );

            Ok(FusionResponse {
                success: true,
                keyword: request.keyword.trim().to_string(),
                per_source_counts,
                fused_count,
                avg_fusion_score,
                opportunities,
                cost,
                quota: self.quota_snapshot().await,
                saved,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn recommend(
        &self,
        lens: Lens,
        top_n: Option<usize>,
    ) -> Result<Vec<RecommendationScore>, EngineError> {
        let catalog = self.catalog.list().await?;
        Ok(rank(&catalog, lens, top_n))
    }

    pub async fn catalog(&self) -> Result<Vec<CanonicalProductRecord>, EngineError> {
        Ok(self.catalog.list().await?)
    }

    pub async fn task(&self, id: Uuid) -> Result<Option<CollectionTask>, EngineError> {
        Ok(self.tasks.get(id).await?)
    }

    /// Remaining free quota for every configured provider.
    pub async fn quota_snapshot(&self) -> BTreeMap<ProviderId, u64> {
        self.quota.snapshot(self.collectors.providers()).await
    }

    pub async fn quotas(&self) -> Vec<ProviderQuota> {
        let mut out = Vec::new();
        for provider in self.collectors.providers() {
            out.push(self.quota.quota(provider).await);
        }
        out
    }

    async fn plans(&self, providers: &[ProviderId]) -> Vec<ProviderPlan> {
        let mut plans = Vec::with_capacity(providers.len());
        for provider in providers {
            plans.push(ProviderPlan {
                provider: provider.clone(),
                remaining: self.quota.remaining(provider).await,
                unit_cost: self.quota.limits(provider).unit_cost,
            });
        }
        plans
    }

    /// Routing chain with unconfigured providers dropped. Simulated collectors
    /// serve only when no real provider is left.
    fn route_chain(&self) -> Result<Vec<ProviderId>, EngineError> {
        let routing = self.collectors.routing();
        if routing.is_empty() {
            return Err(EngineError::NoProviders);
        }
        let usable = |simulated: bool| -> Vec<ProviderId> {
            routing
                .iter()
                .filter(|id| {
                    self.collectors
                        .get(id)
                        .is_some_and(|c| c.is_configured() && c.is_simulated() == simulated)
                })
                .cloned()
                .collect()
        };
        let real = usable(false);
        if !real.is_empty() {
            return Ok(real);
        }
        let simulated = usable(true);
        if !simulated.is_empty() {
            return Ok(simulated);
        }
        Err(EngineError::NoDataExtracted {
            hint: OFFICIAL_API_HINT.to_string(),
            detail: "no provider in the routing chain has a credential configured".to_string(),
        })
    }

    async fn run_routed(&self, request: &CollectionRequest) -> Result<Routed, EngineError> {
        let chain = self.route_chain()?;
        let plans = self.plans(&chain).await;
        let mut decision = router::select(&plans)?;
        let mut cost = 0.0;
        let mut hopped = false;
        loop {
            let (result, spent) = self.attempt(&decision, request).await;
            cost += spent;
            match result {
                Ok((records, simulated)) => {
                    return Ok(Routed {
                        decision,
                        records,
                        simulated,
                        cost,
                    })
                }
                Err(err) if err.triggers_fallback() && !hopped => {
                    match router::fallback(&plans, &decision.provider) {
                        Some(next) => {
                            warn!(
                                failed = %decision.provider,
                                next = %next.provider,
                                error = %err,
                                "provider failed, falling back"
                            );
                            decision = next;
                            hopped = true;
                        }
                        None => return Err(exhausted(err)),
                    }
                }
                Err(err) if err.triggers_fallback() => return Err(exhausted(err)),
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn run_fixed(
        &self,
        provider: &ProviderId,
        request: &CollectionRequest,
    ) -> Result<Routed, EngineError> {
        let plans = self.plans(std::slice::from_ref(provider)).await;
        let decision = router::select(&plans)?;
        let (result, cost) = self.attempt(&decision, request).await;
        match result {
            Ok((records, simulated)) => Ok(Routed {
                decision,
                records,
                simulated,
                cost,
            }),
            Err(err) if err.triggers_fallback() => Err(exhausted(err)),
            Err(err) => Err(err.into()),
        }
    }

    /// One provider call. Returns what was billed alongside the outcome.
    async fn attempt(
        &self,
        decision: &RouteDecision,
        request: &CollectionRequest,
    ) -> (Result<(Vec<CanonicalProductRecord>, bool), CollectorError>, f64) {
        let Some(collector) = self.collectors.get(&decision.provider) else {
            return (
                Err(CollectorError::ConfigMissing {
                    provider: decision.provider.clone(),
                }),
                0.0,
            );
        };
        let simulated = collector.is_simulated();
        let result = collector.collect(request).await;

        let reached_provider = !matches!(
            result,
            Err(CollectorError::ConfigMissing { .. }
                | CollectorError::InvalidProfile(_)
                | CollectorError::InvalidRequest(_))
        );
        let mut spent = 0.0;
        if !simulated && reached_provider {
            spent = decision.unit_cost;
            if let Err(err) = self
                .quota
                .record_usage(&decision.provider, 1, decision.unit_cost)
                .await
            {
                warn!(provider = %decision.provider, error = %err, "usage not recorded");
            }
        }

        let result = result.and_then(|records| {
            if records.is_empty() {
                Err(CollectorError::NoDataExtracted {
                    provider: decision.provider.clone(),
                    hint: OFFICIAL_API_HINT.to_string(),
                })
            } else {
                Ok((records, simulated))
            }
        });
        (result, spent)
    }

    async fn save_records(&self, records: &[CanonicalProductRecord]) -> Vec<SaveOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for chunk in records.chunks(SAVE_CHUNK) {
            outcomes.extend(self.save_chunk(chunk).await);
        }
        outcomes
    }

    /// Saves chunk by chunk, persisting the task's progress after each one.
    async fn save_with_progress(
        &self,
        records: &[CanonicalProductRecord],
        task: &mut CollectionTask,
    ) -> Vec<SaveOutcome> {
        let total = records.len() as u32;
        let mut outcomes = Vec::with_capacity(records.len());
        for chunk in records.chunks(SAVE_CHUNK) {
            outcomes.extend(self.save_chunk(chunk).await);
            let saved = outcomes.iter().filter(|s| s.is_ok()).count() as u32;
            task.record_progress(saved, total);
            self.store_task(task).await;
        }
        outcomes
    }

    async fn save_chunk(&self, chunk: &[CanonicalProductRecord]) -> Vec<SaveOutcome> {
        let results = self.catalog.upsert_many(chunk).await;
        chunk
            .iter()
            .zip(results)
            .map(|(record, result)| match result {
                Ok(()) => SaveOutcome::Ok { id: record.id },
                Err(err) => {
                    warn!(id = %record.id, error = %err, "record not saved");
                    SaveOutcome::Error {
                        id: record.id,
                        message: err.to_string(),
                    }
                }
            })
            .collect()
    }

    async fn store_task(&self, task: &CollectionTask) {
        if let Err(err) = self.tasks.put(task).await {
            warn!(task_id = %task.id, error = %err, "task state not persisted");
        }
    }
}

fn exhausted(err: CollectorError) -> EngineError {
    EngineError::NoDataExtracted {
        hint: err
            .hint()
            .map(str::to_string)
            .unwrap_or_else(|| OFFICIAL_API_HINT.to_string()),
        detail: err.to_string(),
    }
}
