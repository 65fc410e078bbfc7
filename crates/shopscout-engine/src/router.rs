//! Cost-ordered provider selection.

use serde::Serialize;
use shopscout_core::ProviderId;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("no providers configured for routing")]
    NoProviders,
}

/// Routing candidate with its current free-tier headroom.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPlan {
    pub provider: ProviderId,
    pub remaining: u64,
    pub unit_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub provider: ProviderId,
    pub paid: bool,
    /// Marginal cost of this call; zero on a free route.
    pub unit_cost: f64,
    pub remaining: u64,
    /// Index of the chosen provider in the plan list.
    #[serde(skip)]
    pub position: usize,
}

/// Plans must be in ascending marginal-cost order. The first provider with
/// free quota wins; otherwise the last provider is used as the paid route.
pub fn select(plans: &[ProviderPlan]) -> Result<RouteDecision, RouterError> {
    select_from(plans, 0).ok_or(RouterError::NoProviders)
}

/// Next route after `failed`, considering only providers later in the order.
pub fn fallback(plans: &[ProviderPlan], failed: &ProviderId) -> Option<RouteDecision> {
    let index = plans.iter().position(|p| &p.provider == failed)?;
    select_from(plans, index + 1)
}

fn select_from(plans: &[ProviderPlan], offset: usize) -> Option<RouteDecision> {
    let candidates = plans.get(offset..)?;
    if let Some((i, plan)) = candidates.iter().enumerate().find(|(_, p)| p.remaining > 0) {
        return Some(RouteDecision {
            provider: plan.provider.clone(),
            paid: false,
            unit_cost: 0.0,
            remaining: plan.remaining,
            position: offset + i,
        });
    }
    let last = candidates.last()?;
    Some(RouteDecision {
        provider: last.provider.clone(),
        paid: true,
        unit_cost: last.unit_cost,
        remaining: 0,
        position: plans.len() - 1,
    })
}
