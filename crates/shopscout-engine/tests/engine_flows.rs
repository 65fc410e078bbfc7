use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shopscout_collectors::{Collector, CollectorError, SimulatedCollector};
use shopscout_core::{
    CanonicalProductRecord, Category, CollectionRequest, CollectionTask, CompetitionLevel,
    CountryCode, Field, Lens, Price, ProviderId, Sales, SaveOutcome, SourceRole, TaskStatus,
};
use shopscout_engine::recommend::competition_bonus;
use shopscout_engine::report::{export_opportunities, read_row_count};
use shopscout_engine::{
    blended_score, BlendedInputs, CollectorSet, Engine, EngineError, EngineStores, FusionRequest,
    ProviderLimits,
};
use shopscout_storage::{
    CatalogStore, MemoryCatalogStore, MemoryUsageLog, StorageError, TaskStore, UsageLog,
};
use uuid::Uuid;

enum Reply {
    Records(Vec<CanonicalProductRecord>),
    Empty,
    Timeout,
    Missing,
}

struct Stub {
    provider: ProviderId,
    role: SourceRole,
    reply: Reply,
    calls: AtomicUsize,
}

impl Stub {
    fn new(provider: &str, role: SourceRole, reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            provider: ProviderId::new(provider),
            role,
            reply,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for Stub {
    fn provider(&self) -> &ProviderId {
        &self.provider
    }

    fn role(&self) -> SourceRole {
        self.role
    }

    async fn collect(
        &self,
        request: &CollectionRequest,
    ) -> Result<Vec<CanonicalProductRecord>, CollectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Reply::Records(records) => Ok(records
                .iter()
                .take(request.effective_limit())
                .cloned()
                .collect()),
            Reply::Empty => Ok(Vec::new()),
            Reply::Timeout => Err(CollectorError::ProviderTimeout {
                provider: self.provider.clone(),
            }),
            Reply::Missing => Err(CollectorError::ConfigMissing {
                provider: self.provider.clone(),
            }),
        }
    }
}

/// Task store that keeps every state it was handed.
#[derive(Default)]
struct RecordingTasks {
    history: Mutex<Vec<CollectionTask>>,
}

impl RecordingTasks {
    fn last(&self) -> Option<CollectionTask> {
        self.history.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TaskStore for RecordingTasks {
    async fn put(&self, task: &CollectionTask) -> Result<(), StorageError> {
        self.history.lock().unwrap().push(task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CollectionTask>, StorageError> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.id == id)
            .cloned())
    }
}

/// Task store that refuses its second write and records the rest.
#[derive(Default)]
struct SecondWriteFails {
    writes: AtomicUsize,
    inner: RecordingTasks,
}

#[async_trait]
impl TaskStore for SecondWriteFails {
    async fn put(&self, task: &CollectionTask) -> Result<(), StorageError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(StorageError::Rejected("disk full".into()));
        }
        self.inner.put(task).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<CollectionTask>, StorageError> {
        self.inner.get(id).await
    }
}

/// Catalog that refuses records whose title mentions "reject".
#[derive(Default)]
struct PickyCatalog {
    inner: MemoryCatalogStore,
}

#[async_trait]
impl CatalogStore for PickyCatalog {
    async fn upsert(&self, record: &CanonicalProductRecord) -> Result<(), StorageError> {
        if record.title_text().contains("reject") {
            return Err(StorageError::Rejected(format!("record {}", record.id)));
        }
        self.inner.upsert(record).await
    }

    async fn list(&self) -> Result<Vec<CanonicalProductRecord>, StorageError> {
        self.inner.list().await
    }
}

fn item(
    provider: &str,
    role: SourceRole,
    title: &str,
    price: Option<f64>,
    monthly: Option<u64>,
    rating: Option<f64>,
    tags: &[&str],
) -> CanonicalProductRecord {
    let mut record = CanonicalProductRecord::new(
        ProviderId::new(provider),
        role,
        "hair clip",
        CountryCode::VN,
        title,
        Utc::now(),
    );
    record.title = Field::simulated(title.to_string(), "stub");
    if let Some(value) = price {
        record.price = Field::simulated(
            Price {
                value,
                currency: "USD".into(),
            },
            "stub",
        );
    }
    if let Some(monthly) = monthly {
        record.sales = Field::simulated(Sales::from_monthly(monthly), "stub");
    }
    if let Some(rating) = rating {
        record.rating = Field::simulated(rating, "stub");
    }
    record.category = Field::simulated(
        Category {
            primary: "hair".into(),
            secondary: "clips".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        },
        "stub",
    );
    record
}

fn listing(provider: &str, titles: &[&str]) -> Vec<CanonicalProductRecord> {
    titles
        .iter()
        .map(|t| item(provider, SourceRole::Marketplace, t, Some(9.9), Some(100), None, &[]))
        .collect()
}

struct Setup {
    collectors: CollectorSet,
}

impl Setup {
    fn new() -> Self {
        Self {
            collectors: CollectorSet::default(),
        }
    }

    fn provider(mut self, collector: Arc<dyn Collector>, cap: u64, unit_cost: f64) -> Self {
        let id = collector.provider().clone();
        self.collectors.insert(
            collector,
            ProviderLimits {
                monthly_cap: cap,
                unit_cost,
            },
        );
        self.collectors.route(id);
        self
    }

    fn fixed(mut self, collector: Arc<dyn Collector>) -> Self {
        let id = collector.provider().clone();
        let role = collector.role();
        self.collectors.insert(
            collector,
            ProviderLimits {
                monthly_cap: 100,
                unit_cost: 0.0,
            },
        );
        self.collectors.add_fusion_source(role, Some(id));
        self
    }

    fn routed_fusion(mut self, role: SourceRole) -> Self {
        self.collectors.add_fusion_source(role, None);
        self
    }

    fn build(self, stores: EngineStores) -> Engine {
        Engine::new(self.collectors, stores)
    }
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
}

#[tokio::test]
async fn remaining_quota_tracks_usage_and_resets_next_month() {
    let engine = Setup::new()
        .provider(
            Stub::new("free1", SourceRole::Marketplace, Reply::Records(listing("free1", &["A"]))),
            10,
            0.0,
        )
        .build(EngineStores::in_memory());
    let provider = ProviderId::new("free1");

    for _ in 0..4 {
        engine
            .collect(CollectionRequest::new("hair clip", CountryCode::VN, None))
            .await
            .unwrap();
    }
    assert_eq!(engine.quota_tracker().remaining(&provider).await, 6);

    let tracker = engine.quota_tracker();
    for _ in 0..20 {
        tracker
            .record_usage_at(&provider, 1, 0.0, ts("2026-01-10T00:00:00Z"))
            .await
            .unwrap();
    }
    assert_eq!(
        tracker.remaining_at(&provider, ts("2026-01-31T23:00:00Z")).await,
        0,
        "never negative"
    );
    assert_eq!(
        tracker.remaining_at(&provider, ts("2026-02-01T00:00:00Z")).await,
        10
    );
}

#[tokio::test]
async fn exhausted_free_tier_routes_to_next_free_provider() {
    let free1 = Stub::new("free1", SourceRole::Marketplace, Reply::Records(listing("free1", &["A"])));
    let free2 = Stub::new("free2", SourceRole::Marketplace, Reply::Records(listing("free2", &["B"])));
    let paid = Stub::new("paid", SourceRole::Marketplace, Reply::Records(listing("paid", &["C"])));
    let engine = Setup::new()
        .provider(free1.clone(), 0, 0.0)
        .provider(free2.clone(), 500, 0.0)
        .provider(paid.clone(), 0, 0.01)
        .build(EngineStores::in_memory());

    let response = engine
        .collect(CollectionRequest::new("hair clip", CountryCode::TH, Some(5)))
        .await
        .unwrap();
    assert_eq!(response.data_source.as_str(), "free2");
    assert!(!response.paid);
    assert_eq!(response.cost, 0.0);
    assert_eq!(response.quota[&ProviderId::new("free2")], 499);
    assert_eq!((free1.calls(), free2.calls(), paid.calls()), (0, 1, 0));
}

#[tokio::test]
async fn all_free_tiers_exhausted_uses_paid_provider_at_unit_cost() {
    let paid = Stub::new("paid", SourceRole::Marketplace, Reply::Records(listing("paid", &["C"])));
    let engine = Setup::new()
        .provider(
            Stub::new("free1", SourceRole::Marketplace, Reply::Empty),
            0,
            0.0,
        )
        .provider(
            Stub::new("free2", SourceRole::Marketplace, Reply::Empty),
            0,
            0.0,
        )
        .provider(paid.clone(), 0, 0.01)
        .build(EngineStores::in_memory());

    let response = engine
        .collect(CollectionRequest::new("hair clip", CountryCode::TH, None))
        .await
        .unwrap();
    assert_eq!(response.data_source.as_str(), "paid");
    assert!(response.paid);
    assert_eq!(response.cost, 0.01);
    assert_eq!(paid.calls(), 1);
}

#[tokio::test]
async fn a_failing_provider_gets_exactly_one_fallback_hop() {
    let first = Stub::new("first", SourceRole::Marketplace, Reply::Timeout);
    let second = Stub::new("second", SourceRole::Marketplace, Reply::Timeout);
    let third = Stub::new("third", SourceRole::Marketplace, Reply::Records(listing("third", &["X"])));
    let usage = Arc::new(MemoryUsageLog::new());
    let engine = Setup::new()
        .provider(first.clone(), 10, 0.0)
        .provider(second.clone(), 10, 0.0)
        .provider(third.clone(), 10, 0.0)
        .build(EngineStores {
            usage: usage.clone(),
            ..EngineStores::in_memory()
        });

    let err = engine
        .collect(CollectionRequest::new("wig", CountryCode::MY, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoDataExtracted { .. }), "{err:?}");
    assert_eq!(err.hint(), Some(shopscout_collectors::OFFICIAL_API_HINT));
    assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));

    let since = ts("2000-01-01T00:00:00Z");
    assert_eq!(usage.events_since(&ProviderId::new("first"), since).await.unwrap().len(), 1);
    assert_eq!(usage.events_since(&ProviderId::new("second"), since).await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_output_fails_the_task_without_catalog_writes() {
    let tasks = Arc::new(RecordingTasks::default());
    let catalog = Arc::new(MemoryCatalogStore::new());
    let engine = Setup::new()
        .provider(
            Stub::new("only", SourceRole::Marketplace, Reply::Empty),
            100,
            0.0,
        )
        .build(EngineStores {
            usage: Arc::new(MemoryUsageLog::new()),
            catalog: catalog.clone(),
            tasks: tasks.clone(),
        });

    let err = engine
        .collect(CollectionRequest::new("sunglasses", CountryCode::SG, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoDataExtracted { .. }));

    let task = tasks.last().expect("task stored");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(task.completed_at.is_some());
    let statuses: Vec<_> = tasks.history.lock().unwrap().iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Failed]
    );
    assert!(catalog.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn keyless_provider_hands_over_to_the_next_credentialed_one() {
    let backup = Stub::new("backup", SourceRole::Marketplace, Reply::Records(listing("backup", &["B"])));
    let usage = Arc::new(MemoryUsageLog::new());
    let engine = Setup::new()
        .provider(Stub::new("keyless", SourceRole::Marketplace, Reply::Missing), 10, 0.0)
        .provider(backup.clone(), 10, 0.0)
        .build(EngineStores {
            usage: usage.clone(),
            ..EngineStores::in_memory()
        });

    let response = engine
        .collect(CollectionRequest::new("wig", CountryCode::VN, None))
        .await
        .unwrap();
    assert_eq!(response.data_source.as_str(), "backup");
    assert_eq!(backup.calls(), 1);
    assert!(usage
        .events_since(&ProviderId::new("keyless"), ts("2000-01-01T00:00:00Z"))
        .await
        .unwrap()
        .is_empty());

    let lonely = Setup::new()
        .provider(Stub::new("keyless", SourceRole::Marketplace, Reply::Missing), 10, 0.0)
        .build(EngineStores::in_memory());
    let err = lonely
        .collect(CollectionRequest::new("wig", CountryCode::VN, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoDataExtracted { .. }), "{err:?}");
}

#[tokio::test]
async fn simulated_providers_never_shadow_real_ones() {
    let real = Stub::new("rapidapi", SourceRole::Marketplace, Reply::Records(listing("rapidapi", &["R"])));
    let engine = Setup::new()
        .provider(
            Arc::new(SimulatedCollector::new(
                ProviderId::new("scraperapi"),
                SourceRole::Marketplace,
            )),
            1000,
            0.0,
        )
        .provider(real.clone(), 500, 0.0)
        .build(EngineStores::in_memory());

    let response = engine
        .collect(CollectionRequest::new("wig", CountryCode::TH, None))
        .await
        .unwrap();
    assert_eq!(response.data_source.as_str(), "rapidapi");
    assert!(!response.simulated);
    assert_eq!(real.calls(), 1);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_task_exists() {
    let tasks = Arc::new(RecordingTasks::default());
    let engine = Setup::new()
        .provider(
            Stub::new("free1", SourceRole::Marketplace, Reply::Records(listing("free1", &["A"]))),
            10,
            0.0,
        )
        .build(EngineStores {
            tasks: tasks.clone(),
            ..EngineStores::in_memory()
        });
    let err = engine
        .collect(CollectionRequest::new("   ", CountryCode::VN, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert!(tasks.last().is_none());

    let empty = Setup::new().build(EngineStores::in_memory());
    let err = empty
        .collect(CollectionRequest::new("wig", CountryCode::VN, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoProviders));
}

#[tokio::test]
async fn per_record_save_failures_are_reported_and_the_batch_continues() {
    let records = listing("free1", &["Pearl Clip", "reject me", "Velvet Bow"]);
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();
    let tasks = Arc::new(RecordingTasks::default());
    let catalog = Arc::new(PickyCatalog::default());
    let engine = Setup::new()
        .provider(
            Stub::new("free1", SourceRole::Marketplace, Reply::Records(records)),
            10,
            0.0,
        )
        .build(EngineStores {
            usage: Arc::new(MemoryUsageLog::new()),
            catalog: catalog.clone(),
            tasks: tasks.clone(),
        });

    let response = engine
        .collect(CollectionRequest::new("hair clip", CountryCode::VN, None))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.count, 2);
    assert_eq!(response.products.len(), 3);
    assert_eq!(response.saved[0], SaveOutcome::Ok { id: ids[0] });
    assert!(matches!(&response.saved[1], SaveOutcome::Error { id, .. } if *id == ids[1]));
    assert_eq!(response.saved[2], SaveOutcome::Ok { id: ids[2] });
    assert_eq!(catalog.list().await.unwrap().len(), 2);

    let task = engine.task(response.task_id).await.unwrap().expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.items_collected, 2);
    assert_eq!(task.items_total, 3);
    assert_eq!(task.provider, Some(ProviderId::new("free1")));
}

#[tokio::test]
async fn task_progress_is_persisted_between_save_batches() {
    let titles: Vec<String> = (0..25).map(|i| format!("Claw Clip {i}")).collect();
    let titles: Vec<&str> = titles.iter().map(String::as_str).collect();
    let tasks = Arc::new(RecordingTasks::default());
    let engine = Setup::new()
        .provider(
            Stub::new("free1", SourceRole::Marketplace, Reply::Records(listing("free1", &titles))),
            100,
            0.0,
        )
        .build(EngineStores {
            tasks: tasks.clone(),
            ..EngineStores::in_memory()
        });

    let response = engine
        .collect(CollectionRequest::new("hair clip", CountryCode::VN, Some(25)))
        .await
        .unwrap();
    assert_eq!(response.count, 25);

    let running: Vec<(u8, u32)> = tasks
        .history
        .lock()
        .unwrap()
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .map(|t| (t.progress, t.items_collected))
        .collect();
    assert_eq!(running, [(0, 0), (40, 10), (80, 20), (100, 25)]);
    let last = tasks.last().expect("task");
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(last.items_collected, 25);
}

#[tokio::test]
async fn task_is_failed_when_its_running_state_cannot_be_stored() {
    let tasks = Arc::new(SecondWriteFails::default());
    let records = Stub::new("free1", SourceRole::Marketplace, Reply::Records(listing("free1", &["A"])));
    let engine = Setup::new()
        .provider(records.clone(), 10, 0.0)
        .build(EngineStores {
            tasks: tasks.clone(),
            ..EngineStores::in_memory()
        });

    let err = engine
        .collect(CollectionRequest::new("wig", CountryCode::VN, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)), "{err:?}");
    assert_eq!(records.calls(), 0);

    let task = tasks.inner.last().expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().is_some_and(|e| e.contains("disk full")));
}

#[tokio::test]
async fn simulated_collectors_are_never_billed() {
    let usage = Arc::new(MemoryUsageLog::new());
    let engine = Setup::new()
        .provider(
            Arc::new(SimulatedCollector::new(
                ProviderId::new("scraperapi"),
                SourceRole::Marketplace,
            )),
            1000,
            0.0,
        )
        .build(EngineStores {
            usage: usage.clone(),
            ..EngineStores::in_memory()
        });
    let response = engine
        .collect(CollectionRequest::new("watch", CountryCode::SG, Some(4)))
        .await
        .unwrap();
    assert!(response.simulated);
    assert_eq!(response.count, 4);
    assert!(response.products.iter().all(|p| p.is_simulated()));
    assert_eq!(response.quota[&ProviderId::new("scraperapi")], 1000);
}

fn fusion_engine(stores: EngineStores) -> Engine {
    let tags = ["pearl", "korean style", "claw clip"];
    let market = vec![
        item("shop", SourceRole::Marketplace, "Pearl Claw Hair Clip", Some(30.0), Some(800), None, &tags),
        item("shop", SourceRole::Marketplace, "Leather Watch Strap", Some(12.0), Some(50), None, &[]),
    ];
    let analytics = vec![item(
        "moss",
        SourceRole::Analytics,
        "pearl claw hair clips",
        None,
        Some(5000),
        Some(4.5),
        &tags,
    )];
    let reference = vec![item(
        "shopping",
        SourceRole::ReferenceMarket,
        "Pearl Claw Hair Clip",
        Some(50.0),
        None,
        None,
        &tags,
    )];
    Setup::new()
        .provider(
            Stub::new("shop", SourceRole::Marketplace, Reply::Records(market)),
            100,
            0.0,
        )
        .routed_fusion(SourceRole::Marketplace)
        .fixed(Stub::new("moss", SourceRole::Analytics, Reply::Records(analytics)))
        .fixed(Stub::new("shopping", SourceRole::ReferenceMarket, Reply::Records(reference)))
        .build(stores)
}

#[tokio::test]
async fn matching_titles_fuse_into_one_scored_opportunity() {
    let engine = fusion_engine(EngineStores::in_memory());
    let response = engine
        .fuse(FusionRequest {
            keyword: "hair clip".into(),
            countries: vec![CountryCode::VN],
            limit: None,
        })
        .await
        .unwrap();

    assert_eq!(response.fused_count, 2);
    assert_eq!(response.per_source_counts[&SourceRole::Marketplace], 2);
    assert_eq!(response.per_source_counts[&SourceRole::Analytics], 1);
    assert_eq!(response.per_source_counts[&SourceRole::ReferenceMarket], 1);

    let top = &response.opportunities[0];
    assert_eq!(top.contributors.len(), 3);
    assert_eq!(top.matched_trend_tags, 3);
    assert_eq!(top.local_price, Some(30.0));
    assert_eq!(top.reference_price, Some(50.0));
    assert_eq!(top.arbitrage_margin, Some(20.0));
    // 25 sales + 15 rating + 30 trend + 10 arbitrage
    assert!((top.composite_score - 80.0).abs() < 1e-9, "{}", top.composite_score);
    assert!(top.is_opportunity);
    assert_eq!(top.key, top.contributors[&SourceRole::Marketplace].id.to_string());

    let strap = &response.opportunities[1];
    assert_eq!(strap.contributors.len(), 1);
    assert!(!strap.is_opportunity);
    assert!(strap.composite_score >= 0.0);

    let expected_avg = (top.composite_score + strap.composite_score) / 2.0;
    assert!((response.avg_fusion_score - expected_avg).abs() < 1e-9);
    assert_eq!(response.saved.len(), 4);
    assert!(response.saved.iter().all(SaveOutcome::is_ok));
}

#[tokio::test]
async fn fusion_survives_a_failing_source_and_exports_parquet() {
    let engine = Setup::new()
        .provider(
            Stub::new(
                "shop",
                SourceRole::Marketplace,
                Reply::Records(listing("shop", &["Pearl Clip", "Velvet Bow", "Silk Scrunchie"])),
            ),
            100,
            0.0,
        )
        .routed_fusion(SourceRole::Marketplace)
        .fixed(Stub::new("moss", SourceRole::Analytics, Reply::Timeout))
        .build(EngineStores::in_memory());

    let response = engine
        .fuse(FusionRequest {
            keyword: "hair clip".into(),
            countries: vec![CountryCode::VN, CountryCode::TH],
            limit: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(response.per_source_counts[&SourceRole::Marketplace], 4);
    assert!(!response.per_source_counts.contains_key(&SourceRole::Analytics));
    assert_eq!(response.fused_count, 4);

    let dir = tempfile::tempdir().expect("tempdir");
    export_opportunities(dir.path(), &response.opportunities).unwrap();
    assert_eq!(
        read_row_count(&dir.path().join("opportunities.parquet")).unwrap(),
        response.fused_count as i64
    );
    assert_eq!(
        read_row_count(&dir.path().join("contributors.parquet")).unwrap(),
        4
    );
}

#[tokio::test]
async fn fusion_with_no_records_anywhere_is_no_data() {
    let engine = Setup::new()
        .provider(Stub::new("shop", SourceRole::Marketplace, Reply::Empty), 100, 0.0)
        .routed_fusion(SourceRole::Marketplace)
        .build(EngineStores::in_memory());
    let err = engine
        .fuse(FusionRequest {
            keyword: "hair clip".into(),
            countries: vec![CountryCode::VN],
            limit: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoDataExtracted { .. }));

    let err = engine
        .fuse(FusionRequest {
            keyword: "hair clip".into(),
            countries: vec![],
            limit: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

#[tokio::test]
async fn recommendations_read_the_persisted_catalog() {
    let engine = fusion_engine(EngineStores::in_memory());
    engine
        .fuse(FusionRequest {
            keyword: "hair clip".into(),
            countries: vec![CountryCode::VN],
            limit: None,
        })
        .await
        .unwrap();
    let ranked = engine.recommend(Lens::Blended, Some(2)).await.unwrap();
    assert_eq!(ranked.len(), 2);
    assert!(ranked[0].score >= ranked[1].score);
    assert!(ranked.iter().all(|r| !r.justifications.is_empty()));
}

#[test]
fn blended_score_is_monotone_in_each_driver() {
    let margins = [None, Some(0.0), Some(20.0), Some(45.0), Some(90.0)];
    let sales = [None, Some(0), Some(400), Some(1000), Some(7000)];
    let growth = [Some(-10.0), None, Some(0.0), Some(50.0), Some(150.0)];
    let levels = [
        Some(CompetitionLevel::Low),
        Some(CompetitionLevel::Medium),
        Some(CompetitionLevel::High),
    ];

    let score = |m, s, g, c| {
        blended_score(&BlendedInputs {
            profit_margin: m,
            monthly_sales: s,
            growth_rate: g,
            competition: c,
        })
    };

    for m in 0..margins.len() {
        for s in 0..sales.len() {
            for g in 0..growth.len() {
                for c in 0..levels.len() {
                    let base = score(margins[m], sales[s], growth[g], levels[c]);
                    if m + 1 < margins.len() {
                        assert!(score(margins[m + 1], sales[s], growth[g], levels[c]) >= base);
                    }
                    if s + 1 < sales.len() {
                        assert!(score(margins[m], sales[s + 1], growth[g], levels[c]) >= base);
                    }
                    if g + 1 < growth.len() {
                        assert!(score(margins[m], sales[s], growth[g + 1], levels[c]) >= base);
                    }
                    if c + 1 < levels.len() {
                        assert!(score(margins[m], sales[s], growth[g], levels[c + 1]) <= base);
                    }
                }
            }
        }
    }
    assert!(competition_bonus(None) == 0.0);
}
