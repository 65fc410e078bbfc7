//! Monthly free-tier accounting derived from the usage log.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use shopscout_core::{ProviderId, ProviderQuota, UsageEvent};
use shopscout_storage::{StorageError, UsageLog};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderLimits {
    pub monthly_cap: u64,
    /// Price of one request once the free tier is spent.
    pub unit_cost: f64,
}

/// First instant of the UTC month containing `now`.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Stateless view over the usage log: every call re-reads the current month.
#[derive(Clone)]
pub struct QuotaTracker {
    log: Arc<dyn UsageLog>,
    limits: BTreeMap<ProviderId, ProviderLimits>,
}

impl QuotaTracker {
    pub fn new(log: Arc<dyn UsageLog>, limits: BTreeMap<ProviderId, ProviderLimits>) -> Self {
        Self { log, limits }
    }

    pub fn limits(&self, provider: &ProviderId) -> ProviderLimits {
        self.limits.get(provider).copied().unwrap_or(ProviderLimits {
            monthly_cap: 0,
            unit_cost: 0.0,
        })
    }

    pub async fn remaining(&self, provider: &ProviderId) -> u64 {
        self.remaining_at(provider, Utc::now()).await
    }

    pub async fn remaining_at(&self, provider: &ProviderId, now: DateTime<Utc>) -> u64 {
        self.quota_at(provider, now).await.remaining()
    }

    pub async fn quota(&self, provider: &ProviderId) -> ProviderQuota {
        self.quota_at(provider, Utc::now()).await
    }

    /// Reports the full cap when the log cannot be read.
    pub async fn quota_at(&self, provider: &ProviderId, now: DateTime<Utc>) -> ProviderQuota {
        let limits = self.limits(provider);
        let start = month_start(now);
        let reset_at = next_month_start(now);
        let used = match self.log.events_since(provider, start).await {
            Ok(events) => events
                .iter()
                .filter(|e| e.recorded_at >= start && e.recorded_at < reset_at)
                .map(|e| e.count)
                .sum(),
            Err(err) => {
                warn!(provider = %provider, error = %err, "usage log unreadable, failing open");
                0
            }
        };
        ProviderQuota {
            provider: provider.clone(),
            monthly_cap: limits.monthly_cap,
            used,
            reset_at,
            unit_cost: limits.unit_cost,
        }
    }

    pub async fn record_usage(
        &self,
        provider: &ProviderId,
        count: u64,
        cost: f64,
    ) -> Result<(), StorageError> {
        self.record_usage_at(provider, count, cost, Utc::now()).await
    }

    pub async fn record_usage_at(
        &self,
        provider: &ProviderId,
        count: u64,
        cost: f64,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.log
            .append(UsageEvent {
                provider: provider.clone(),
                count,
                cost,
                recorded_at,
            })
            .await
    }

    pub async fn snapshot<'a>(
        &self,
        providers: impl IntoIterator<Item = &'a ProviderId>,
    ) -> BTreeMap<ProviderId, u64> {
        let mut out = BTreeMap::new();
        for provider in providers {
            out.insert(provider.clone(), self.remaining(provider).await);
        }
        out
    }
}
