//! Cross-source matching and composite opportunity scoring.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use shopscout_core::{
    normalize_title, CanonicalProductRecord, Confidence, FusedOpportunity, SourceRole,
};
use strsim::jaro_winkler;
use uuid::Uuid;

pub const SALES_CAP: f64 = 5000.0;
pub const MIN_RATING: f64 = 3.0;
pub const MAX_RATING: f64 = 5.0;
pub const MAX_TREND_TAGS: f64 = 3.0;

/// Opportunity flag thresholds.
pub const OPPORTUNITY_SCORE: f64 = 70.0;
pub const OPPORTUNITY_MARGIN_RATIO: f64 = 0.2;
pub const OPPORTUNITY_TAGS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub sales: f64,
    pub rating: f64,
    pub trend: f64,
    pub arbitrage: f64,
}

impl FusionWeights {
    pub const TWO_SOURCE: Self = Self {
        sales: 40.0,
        rating: 20.0,
        trend: 30.0,
        arbitrage: 10.0,
    };

    pub const THREE_SOURCE: Self = Self {
        sales: 25.0,
        rating: 20.0,
        trend: 30.0,
        arbitrage: 25.0,
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub match_threshold: f64,
    /// Jaro-Winkler floor for two title tokens to count as the same word.
    pub token_similarity: f64,
    pub expected_sources: u32,
    pub reference_configured: bool,
}

impl FusionConfig {
    pub fn for_roles(roles: &[SourceRole]) -> Self {
        let distinct: BTreeSet<_> = roles.iter().copied().collect();
        Self {
            match_threshold: 0.6,
            token_similarity: 0.92,
            expected_sources: distinct.len() as u32,
            reference_configured: distinct.contains(&SourceRole::ReferenceMarket),
        }
    }

    pub fn weights(&self) -> FusionWeights {
        if self.reference_configured {
            FusionWeights::THREE_SOURCE
        } else {
            FusionWeights::TWO_SOURCE
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self::for_roles(&SourceRole::ALL)
    }
}

/// Numeric drivers of the composite score, already resolved across roles.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreInputs {
    pub sales_volume: Option<u64>,
    pub rating: Option<f64>,
    pub matched_trend_tags: u32,
    pub local_price: Option<f64>,
    pub reference_price: Option<f64>,
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Weighted sum of the four signals, clamped to `[0, 100]`. Absent inputs
/// contribute nothing; the arbitrage term needs a positive reference price.
pub fn composite_score(inputs: &ScoreInputs, weights: &FusionWeights) -> f64 {
    let sales = inputs
        .sales_volume
        .map(|s| (s as f64 / SALES_CAP).min(1.0))
        .unwrap_or(0.0);
    let rating = inputs
        .rating
        .map(|r| unit((r - MIN_RATING) / (MAX_RATING - MIN_RATING)))
        .unwrap_or(0.0);
    let trend = unit(f64::from(inputs.matched_trend_tags) / MAX_TREND_TAGS);
    let arbitrage = match (inputs.reference_price, inputs.local_price) {
        (Some(reference), Some(local)) if reference > 0.0 => unit((reference - local) / reference),
        _ => 0.0,
    };

    let score = weights.sales * sales
        + weights.rating * rating
        + weights.trend * trend
        + weights.arbitrage * arbitrage;
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn tokens(title: &str) -> Vec<String> {
    normalize_title(title)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Dice-style overlap where each token of `a` may claim one token of `b`.
pub fn token_overlap(a: &str, b: &str, token_similarity: f64) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut used = vec![false; b.len()];
    let mut matched = 0usize;
    for token in &a {
        let exact = b
            .iter()
            .enumerate()
            .position(|(i, other)| !used[i] && other == token);
        let candidate = exact.or_else(|| {
            b.iter()
                .enumerate()
                .filter(|(i, _)| !used[*i])
                .map(|(i, other)| (i, jaro_winkler(token, other)))
                .filter(|(_, sim)| *sim >= token_similarity)
                .max_by(|x, y| x.1.total_cmp(&y.1))
                .map(|(i, _)| i)
        });
        if let Some(i) = candidate {
            used[i] = true;
            matched += 1;
        }
    }
    (2 * matched) as f64 / (a.len() + b.len()) as f64
}

fn known_category(record: &CanonicalProductRecord) -> Option<String> {
    record
        .primary_category()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty() && c != "unknown")
}

pub fn categories_compatible(a: &CanonicalProductRecord, b: &CanonicalProductRecord) -> bool {
    match (known_category(a), known_category(b)) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

struct Group {
    members: BTreeMap<SourceRole, CanonicalProductRecord>,
    /// Role of the record that opened the group.
    anchor: SourceRole,
}

#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    config: FusionConfig,
    links: HashSet<(Uuid, Uuid)>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            links: HashSet::new(),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Forces two records from different sources into the same group.
    pub fn with_link(mut self, a: Uuid, b: Uuid) -> Self {
        self.links.insert((a, b));
        self.links.insert((b, a));
        self
    }

    fn linked(&self, a: &CanonicalProductRecord, b: &CanonicalProductRecord) -> bool {
        self.links.contains(&(a.id, b.id))
    }

    /// Similarity of two records, or `None` when they may not share a group.
    pub fn match_score(
        &self,
        a: &CanonicalProductRecord,
        b: &CanonicalProductRecord,
    ) -> Option<f64> {
        if self.linked(a, b) {
            return Some(f64::INFINITY);
        }
        if !categories_compatible(a, b) {
            return None;
        }
        let overlap = token_overlap(a.title_text(), b.title_text(), self.config.token_similarity);
        (overlap >= self.config.match_threshold).then_some(overlap)
    }

    pub fn fuse(
        &self,
        records_by_source: &BTreeMap<SourceRole, Vec<CanonicalProductRecord>>,
    ) -> Vec<FusedOpportunity> {
        let mut groups: Vec<Group> = Vec::new();
        for role in SourceRole::ALL {
            let Some(records) = records_by_source.get(&role) else {
                continue;
            };
            for record in records {
                let best = groups
                    .iter()
                    .enumerate()
                    .filter(|(_, g)| !g.members.contains_key(&role))
                    .filter_map(|(i, g)| {
                        g.members
                            .values()
                            .filter_map(|member| self.match_score(member, record))
                            .max_by(f64::total_cmp)
                            .map(|score| (i, score))
                    })
                    // first group wins ties
                    .fold(None::<(usize, f64)>, |best, (i, score)| match best {
                        Some((_, top)) if top >= score => best,
                        _ => Some((i, score)),
                    });

                match best {
                    Some((i, _)) => {
                        groups[i].members.insert(role, record.clone());
                    }
                    None => groups.push(Group {
                        members: BTreeMap::from([(role, record.clone())]),
                        anchor: role,
                    }),
                }
            }
        }
        groups.into_iter().map(|g| self.score_group(g)).collect()
    }

    fn score_group(&self, group: Group) -> FusedOpportunity {
        let members = &group.members;
        let sales_volume = [SourceRole::Analytics, SourceRole::Marketplace]
            .iter()
            .filter_map(|r| members.get(r))
            .find_map(|record| record.monthly_sales());
        let rating = pick(
            members,
            &[
                SourceRole::Analytics,
                SourceRole::Marketplace,
                SourceRole::ReferenceMarket,
            ],
            |r| r.rating.value().copied(),
        );
        let local = pick_price(members, &[SourceRole::Marketplace, SourceRole::Analytics]);
        let reference = pick_price(members, &[SourceRole::ReferenceMarket]);
        let local_price = local.map(|(value, _)| value);
        let reference_price = reference.map(|(value, _)| value);
        // Prices in different currencies are never subtracted.
        let currency_mismatch = matches!(
            (local, reference),
            (Some((_, a)), Some((_, b))) if !a.eq_ignore_ascii_case(b)
        );
        let comparable_reference = reference_price.filter(|_| !currency_mismatch);
        let matched_trend_tags = matched_tags(members.values());

        let inputs = ScoreInputs {
            sales_volume,
            rating,
            matched_trend_tags,
            local_price,
            reference_price: comparable_reference,
        };
        let composite_score = composite_score(&inputs, &self.config.weights());

        let arbitrage_margin = match (comparable_reference, local_price) {
            (Some(reference), Some(local)) => Some(reference - local),
            _ => None,
        };
        let margin_ratio = match (arbitrage_margin, comparable_reference) {
            (Some(margin), Some(reference)) if reference > 0.0 => Some(margin / reference),
            _ => None,
        };
        let is_opportunity = composite_score >= OPPORTUNITY_SCORE
            && margin_ratio.is_some_and(|r| r >= OPPORTUNITY_MARGIN_RATIO)
            && matched_trend_tags >= OPPORTUNITY_TAGS;

        let real_sources = members.values().filter(|r| r.has_real_data()).count() as u32;
        let confidence = if currency_mismatch || real_sources < self.config.expected_sources {
            Confidence::Low
        } else {
            Confidence::High
        };

        let (key, title) = members
            .get(&group.anchor)
            .map(|r| (r.id.to_string(), r.title_text().to_string()))
            .unwrap_or_default();

        FusedOpportunity {
            key,
            title,
            contributors: group.members,
            composite_score,
            local_price,
            reference_price,
            arbitrage_margin,
            margin_ratio,
            matched_trend_tags,
            is_opportunity,
            confidence,
            real_sources,
        }
    }
}

/// First finite value in role preference order.
fn pick(
    members: &BTreeMap<SourceRole, CanonicalProductRecord>,
    roles: &[SourceRole],
    f: impl Fn(&CanonicalProductRecord) -> Option<f64>,
) -> Option<f64> {
    roles
        .iter()
        .filter_map(|r| members.get(r))
        .find_map(|record| f(record).filter(|v| v.is_finite()))
}

/// First finite price in role preference order, with its currency.
fn pick_price<'a>(
    members: &'a BTreeMap<SourceRole, CanonicalProductRecord>,
    roles: &[SourceRole],
) -> Option<(f64, &'a str)> {
    roles
        .iter()
        .filter_map(|r| members.get(r))
        .filter_map(|record| record.price.value())
        .find(|price| price.value.is_finite())
        .map(|price| (price.value, price.currency.trim()))
}

/// Distinct normalized tags carried by at least two contributors.
fn matched_tags<'a>(records: impl Iterator<Item = &'a CanonicalProductRecord>) -> u32 {
    let mut seen: BTreeMap<String, u32> = BTreeMap::new();
    for record in records {
        let tags: BTreeSet<String> = record
            .tags()
            .iter()
            .map(|t| normalize_title(t))
            .filter(|t| !t.is_empty())
            .collect();
        for tag in tags {
            *seen.entry(tag).or_default() += 1;
        }
    }
    seen.values().filter(|n| **n >= 2).count() as u32
}
