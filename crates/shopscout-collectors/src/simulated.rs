//! Deterministic stand-in for providers without credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shopscout_core::{
    normalize_title, CanonicalProductRecord, Category, CollectionRequest, Competition,
    CompetitionLevel, Field, Growth, Price, ProviderId, Sales, SourceRole, Trend,
};
use tracing::info;

use crate::{Collector, CollectorError};

pub const SIMULATION_GENERATOR: &str = "sim-sha256-v1";

const VARIANTS: [&str; 12] = [
    "Classic", "Premium", "Mini", "Deluxe", "Vintage", "Minimalist", "Luxury", "Everyday",
    "Travel", "Korean Style", "Handmade", "Oversized",
];

const CATEGORIES: [(&str, &[&str]); 6] = [
    ("hair", &["hair", "clip", "scrunchie", "headband", "comb"]),
    ("jewelry", &["jewelry", "ring", "necklace", "earring", "bracelet", "pearl"]),
    ("watches", &["watch", "watches", "strap"]),
    ("eyewear", &["glasses", "sunglasses", "eyewear", "frame"]),
    ("wigs", &["wig", "wigs", "extension"]),
    ("accessories", &[]),
];

/// Byte stream derived from SHA-256, re-hashed when exhausted.
struct SeededStream {
    block: [u8; 32],
    pos: usize,
}

impl SeededStream {
    fn new(seed: &str) -> Self {
        Self {
            block: Sha256::digest(seed.as_bytes()).into(),
            pos: 0,
        }
    }

    fn next_unit(&mut self) -> f64 {
        if self.pos + 4 > self.block.len() {
            self.block = Sha256::digest(self.block).into();
            self.pos = 0;
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.block[self.pos..self.pos + 4]);
        self.pos += 4;
        f64::from(u32::from_be_bytes(bytes)) / f64::from(u32::MAX)
    }

    fn range(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_unit()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Maps a keyword onto one of the known product categories.
pub fn category_for_keyword(keyword: &str) -> &'static str {
    let normalized = normalize_title(keyword);
    CATEGORIES
        .iter()
        .find(|(_, words)| normalized.split(' ').any(|token| words.contains(&token)))
        .map(|(name, _)| *name)
        .unwrap_or("accessories")
}

/// Generates plausible records; every field group is marked `Simulated`.
#[derive(Debug, Clone)]
pub struct SimulatedCollector {
    provider: ProviderId,
    role: SourceRole,
}

impl SimulatedCollector {
    pub fn new(provider: ProviderId, role: SourceRole) -> Self {
        Self { provider, role }
    }

    pub fn generate(
        &self,
        request: &CollectionRequest,
        fetched_at: DateTime<Utc>,
    ) -> Vec<CanonicalProductRecord> {
        let keyword = request.keyword();
        let category = category_for_keyword(keyword);
        let country = request.country;

        (0..request.effective_limit())
            .map(|index| {
                // seeded without provider or role so every role describes the same items
                let mut rng = SeededStream::new(&format!(
                    "{}:{}:{}",
                    normalize_title(keyword),
                    country,
                    index
                ));
                let variant = VARIANTS[index % VARIANTS.len()];
                let title = if index < VARIANTS.len() {
                    format!("{variant} {keyword}")
                } else {
                    format!("{variant} {keyword} {}", index / VARIANTS.len() + 1)
                };

                let mut record = CanonicalProductRecord::new(
                    self.provider.clone(),
                    self.role,
                    keyword,
                    country,
                    &title,
                    fetched_at,
                );
                let sim = |value| Field::simulated(value, SIMULATION_GENERATOR);

                let base_price = rng.range(3.0, 53.0);
                let price = match self.role {
                    SourceRole::ReferenceMarket => base_price * rng.range(1.1, 2.2),
                    _ => base_price,
                };
                let monthly = rng.range(1000.0, 16000.0).round() as u64;
                let rate = round2(rng.range(-10.0, 70.0));
                let score = rng.range(0.0, 100.0).round() as u8;

                record.title = Field::simulated(title.clone(), SIMULATION_GENERATOR);
                record.images = Field::simulated(
                    vec![format!(
                        "https://picsum.photos/seed/{}/400/400",
                        record.id.simple()
                    )],
                    SIMULATION_GENERATOR,
                );
                record.price = Field::simulated(
                    Price {
                        value: round2(price),
                        currency: "USD".to_string(),
                    },
                    SIMULATION_GENERATOR,
                );
                record.sales = Field::simulated(
                    Sales {
                        total: Some(monthly * (rng.range(2.0, 12.0).round() as u64)),
                        daily: Some(monthly / 30),
                        weekly: Some(monthly / 4),
                        monthly: Some(monthly),
                    },
                    SIMULATION_GENERATOR,
                );
                record.growth = Field::simulated(
                    Growth {
                        rate,
                        trend: Trend::from_rate(rate),
                    },
                    SIMULATION_GENERATOR,
                );
                record.competition = Field::simulated(
                    Competition {
                        level: CompetitionLevel::from_score(score),
                        score,
                        competitors: rng.range(5.0, 500.0).round() as u32,
                    },
                    SIMULATION_GENERATOR,
                );
                record.category = Field::simulated(
                    Category {
                        primary: category.to_string(),
                        secondary: normalize_title(keyword),
                        tags: vec![
                            normalize_title(keyword),
                            category.to_string(),
                            variant.to_ascii_lowercase(),
                        ],
                    },
                    SIMULATION_GENERATOR,
                );
                record.rating = sim(round2(rng.range(3.5, 5.0)));
                record.profit_margin = sim(round2(rng.range(30.0, 80.0)));
                record
            })
            .collect()
    }
}

#[async_trait]
impl Collector for SimulatedCollector {
    fn provider(&self) -> &ProviderId {
        &self.provider
    }

    fn role(&self) -> SourceRole {
        self.role
    }

    fn is_simulated(&self) -> bool {
        true
    }

    async fn collect(
        &self,
        request: &CollectionRequest,
    ) -> Result<Vec<CanonicalProductRecord>, CollectorError> {
        let records = self.generate(request, Utc::now());
        info!(provider = %self.provider, count = records.len(), "simulated records generated");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopscout_core::{CountryCode, Provenance};

    #[test]
    fn generation_is_deterministic_and_fully_simulated() {
        let collector = SimulatedCollector::new(ProviderId::new("fastmoss"), SourceRole::Analytics);
        let request = CollectionRequest::new("hair clip", CountryCode::VN, Some(5));
        let now = Utc::now();
        let first = collector.generate(&request, now);
        let second = collector.generate(&request, now);

        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        for record in &first {
            assert!(record.is_simulated());
            assert!(record
                .provenance()
                .values()
                .all(|p| *p == Provenance::Simulated));
            let price = record.price_value().unwrap();
            assert!((3.0..=53.0).contains(&price));
            let margin = *record.profit_margin.value().unwrap();
            assert!((30.0..=80.0).contains(&margin));
            let rating = *record.rating.value().unwrap();
            assert!((3.5..=5.0).contains(&rating));
        }
        assert_eq!(first[0].primary_category(), Some("hair"));
    }

    #[test]
    fn roles_share_titles_for_the_same_keyword() {
        let request = CollectionRequest::new("watch", CountryCode::SG, Some(3));
        let now = Utc::now();
        let local = SimulatedCollector::new(ProviderId::new("a"), SourceRole::Marketplace)
            .generate(&request, now);
        let reference = SimulatedCollector::new(ProviderId::new("b"), SourceRole::ReferenceMarket)
            .generate(&request, now);
        for (l, r) in local.iter().zip(&reference) {
            assert_eq!(l.title_text(), r.title_text());
            assert!(r.price_value().unwrap() > l.price_value().unwrap());
        }
    }

    #[test]
    fn unknown_keywords_fall_back_to_accessories() {
        assert_eq!(category_for_keyword("Pearl Necklace"), "jewelry");
        assert_eq!(category_for_keyword("tote"), "accessories");
    }
}
