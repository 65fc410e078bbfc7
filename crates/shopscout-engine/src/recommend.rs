//! Lens-based ranking of catalog records.

use std::cmp::Ordering;

use shopscout_core::{
    CanonicalProductRecord, CompetitionLevel, Lens, LensScores, Provenance, RecommendationScore,
    Tier, Trend,
};

pub const DEFAULT_TOP_N: usize = 10;
pub const PROFIT_MARGIN_FLOOR: f64 = 30.0;
pub const TRENDING_GROWTH_FLOOR: f64 = 30.0;

const MARGIN_WEIGHT: f64 = 0.30;
const SALES_WEIGHT: f64 = 0.25;
const GROWTH_WEIGHT: f64 = 0.25;
const COMPETITION_WEIGHT: f64 = 0.20;
const SALES_SATURATION: f64 = 1000.0;

const MAX_JUSTIFICATIONS: usize = 3;

pub fn competition_bonus(level: Option<CompetitionLevel>) -> f64 {
    match level {
        Some(CompetitionLevel::Low) => 1.0,
        Some(CompetitionLevel::Medium) => 0.5,
        Some(CompetitionLevel::High) | None => 0.0,
    }
}

/// Inputs of the blended lens. Missing numbers count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlendedInputs {
    pub profit_margin: Option<f64>,
    pub monthly_sales: Option<u64>,
    pub growth_rate: Option<f64>,
    pub competition: Option<CompetitionLevel>,
}

impl BlendedInputs {
    pub fn from_record(record: &CanonicalProductRecord) -> Self {
        Self {
            profit_margin: record.profit_margin.value().copied().filter(|v| v.is_finite()),
            monthly_sales: record.monthly_sales(),
            growth_rate: record.growth_rate().filter(|v| v.is_finite()),
            competition: record.competition_level(),
        }
    }

    /// Weighted terms in margin, sales, growth, competition order.
    fn terms(&self) -> [f64; 4] {
        [
            MARGIN_WEIGHT * self.profit_margin.unwrap_or(0.0) / 100.0,
            SALES_WEIGHT * (self.monthly_sales.unwrap_or(0) as f64 / SALES_SATURATION).min(1.0),
            GROWTH_WEIGHT * (self.growth_rate.unwrap_or(0.0) / 100.0).min(1.0),
            COMPETITION_WEIGHT * competition_bonus(self.competition),
        ]
    }
}

/// Blended score clamped to `[0, 100]`. Margins above 100% or negative
/// growth cannot push it out of range.
pub fn blended_score(inputs: &BlendedInputs) -> f64 {
    let score = inputs.terms().iter().sum::<f64>() * 100.0;
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

pub fn lens_scores(record: &CanonicalProductRecord) -> LensScores {
    let inputs = BlendedInputs::from_record(record);
    LensScores {
        profit: inputs.profit_margin.unwrap_or(0.0).clamp(0.0, 100.0),
        growth: inputs.growth_rate.unwrap_or(0.0).clamp(0.0, 100.0),
        low_competition: record
            .competition
            .value()
            .map(|c| 100.0 - f64::from(c.score.min(100)))
            .unwrap_or(0.0),
        blended: blended_score(&inputs),
    }
}

fn primary_score(lens: Lens, scores: &LensScores) -> f64 {
    match lens {
        Lens::Profit => scores.profit,
        Lens::LowCompetition => scores.growth,
        Lens::Trending => scores.growth,
        Lens::Blended => scores.blended,
    }
}

/// Lens filter plus sort key; `None` excludes the record from the lens.
fn lens_key(lens: Lens, record: &CanonicalProductRecord) -> Option<f64> {
    let inputs = BlendedInputs::from_record(record);
    match lens {
        Lens::Profit => inputs.profit_margin.filter(|m| *m > PROFIT_MARGIN_FLOOR),
        Lens::LowCompetition => match inputs.competition {
            Some(CompetitionLevel::Low | CompetitionLevel::Medium) => {
                Some(inputs.growth_rate.unwrap_or(f64::NEG_INFINITY))
            }
            _ => None,
        },
        Lens::Trending => {
            let growth = record.growth.value()?;
            (growth.trend == Trend::Up && growth.rate > TRENDING_GROWTH_FLOOR).then(|| {
                inputs
                    .monthly_sales
                    .map(|s| s as f64)
                    .unwrap_or(f64::NEG_INFINITY)
            })
        }
        Lens::Blended => Some(blended_score(&inputs)),
    }
}

fn marked(text: String, simulated: bool) -> String {
    if simulated {
        format!("{text} (simulated)")
    } else {
        text
    }
}

fn justifications(record: &CanonicalProductRecord) -> Vec<String> {
    let inputs = BlendedInputs::from_record(record);
    let [margin, sales, growth, competition] = inputs.terms();
    let mut drivers: Vec<(f64, String)> = Vec::new();
    if let Some(m) = inputs.profit_margin {
        let text = format!("profit margin of {m:.0}%");
        drivers.push((margin, marked(text, record.profit_margin.is_simulated())));
    }
    if let Some(s) = inputs.monthly_sales {
        let text = format!("{s} units sold per month");
        drivers.push((sales, marked(text, record.sales.is_simulated())));
    }
    if let Some(g) = inputs.growth_rate {
        let text = format!("sales growing {g:.0}% month over month");
        drivers.push((growth, marked(text, record.growth.is_simulated())));
    }
    let level = match inputs.competition {
        Some(CompetitionLevel::Low) => Some("low competition"),
        Some(CompetitionLevel::Medium) => Some("moderate competition"),
        _ => None,
    };
    if let Some(text) = level {
        drivers.push((
            competition,
            marked(text.to_string(), record.competition.is_simulated()),
        ));
    }

    drivers.retain(|(weight, _)| *weight > 0.0);
    drivers.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut out: Vec<String> = drivers
        .into_iter()
        .take(MAX_JUSTIFICATIONS)
        .map(|(_, text)| text)
        .collect();
    if out.is_empty() {
        out.push(match record.primary_category() {
            Some(category) => format!("listed under {category} for \"{}\"", record.keyword),
            None => format!("matches the search for \"{}\"", record.keyword),
        });
    }
    out
}

/// Whether any field feeding the scores was generated.
fn scored_from_simulation(record: &CanonicalProductRecord) -> bool {
    record.price.is_simulated()
        || record.sales.is_simulated()
        || record.growth.is_simulated()
        || record.competition.is_simulated()
        || record.profit_margin.is_simulated()
}

fn estimated_monthly_profit(record: &CanonicalProductRecord) -> Option<f64> {
    let price = record.price_value()?;
    let margin = *record.profit_margin.value()?;
    let monthly = record.monthly_sales()?;
    let profit = price * margin / 100.0 * monthly as f64;
    profit.is_finite().then_some(profit)
}

/// Ranks `catalog` under `lens`, keeping catalog order among equal keys.
pub fn rank(
    catalog: &[CanonicalProductRecord],
    lens: Lens,
    top_n: Option<usize>,
) -> Vec<RecommendationScore> {
    let mut keyed: Vec<(f64, &CanonicalProductRecord)> = catalog
        .iter()
        .filter_map(|record| lens_key(lens, record).map(|key| (key, record)))
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    keyed.truncate(top_n.unwrap_or(DEFAULT_TOP_N));

    keyed
        .into_iter()
        .map(|(_, record)| {
            let scores = lens_scores(record);
            let score = primary_score(lens, &scores);
            RecommendationScore {
                product_id: record.id,
                title: record.title_text().to_string(),
                lens,
                score,
                scores,
                justifications: justifications(record),
                tier: Tier::from_score(score),
                estimated_monthly_profit: estimated_monthly_profit(record),
                simulated: scored_from_simulation(record),
                real_fields: record
                    .provenance()
                    .values()
                    .filter(|p| **p == Provenance::Real)
                    .count() as u32,
            }
        })
        .collect()
}
