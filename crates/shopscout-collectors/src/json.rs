//! Official, analytics and reference-market JSON APIs.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shopscout_core::{
    CanonicalProductRecord, Category, CollectionRequest, Competition, CompetitionLevel, Field,
    Growth, Price, ProviderId, Sales, SourceRole, Trend,
};
use tracing::{debug, info};

use crate::extract::{
    json_count, json_number, json_string_list, json_text, Extracted, ExtractionMode,
    ExtractionScope,
};
use crate::{fetch_raw, Collector, CollectorConfig, CollectorError, SourceContext};

const IMAGE_KEYS: [&str; 6] = ["image", "images", "image_url", "imageUrl", "cover", "thumbnail"];
const NAME_KEYS: [&str; 3] = ["title", "name", "product_name"];

/// Where product fields live inside one item object, as ordered JSON pointer candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFieldMap {
    pub title: Vec<String>,
    pub images: Vec<String>,
    pub price: Vec<String>,
    pub currency: Vec<String>,
    pub total_sales: Vec<String>,
    pub monthly_sales: Vec<String>,
    pub daily_sales: Vec<String>,
    pub growth_rate: Vec<String>,
    pub trend: Vec<String>,
    pub competition_level: Vec<String>,
    pub competition_score: Vec<String>,
    pub competitors: Vec<String>,
    pub category: Vec<String>,
    pub sub_category: Vec<String>,
    pub tags: Vec<String>,
    pub rating: Vec<String>,
    pub profit_margin: Vec<String>,
}

impl JsonFieldMap {
    fn all_pointers(&self) -> impl Iterator<Item = &String> {
        [
            &self.title,
            &self.images,
            &self.price,
            &self.currency,
            &self.total_sales,
            &self.monthly_sales,
            &self.daily_sales,
            &self.growth_rate,
            &self.trend,
            &self.competition_level,
            &self.competition_score,
            &self.competitors,
            &self.category,
            &self.sub_category,
            &self.tags,
            &self.rating,
            &self.profit_margin,
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonProfile {
    /// Candidate locations of the item array; the first non-empty one wins.
    pub item_pointers: Vec<String>,
    pub fields: JsonFieldMap,
}

fn pointers(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl JsonProfile {
    /// FastMoss product analytics.
    pub fn fastmoss() -> Self {
        Self {
            item_pointers: pointers(&["/data/list", "/data/products", "/products", "/data"]),
            fields: JsonFieldMap {
                title: pointers(&["/title", "/name"]),
                images: pointers(&["/images", "/cover"]),
                price: pointers(&["/price"]),
                currency: pointers(&["/currency"]),
                total_sales: pointers(&["/total_sales"]),
                monthly_sales: pointers(&["/monthly_sales"]),
                daily_sales: pointers(&["/daily_sales"]),
                growth_rate: pointers(&["/growth_rate"]),
                trend: pointers(&["/trend"]),
                competition_level: pointers(&["/competition_level"]),
                competition_score: pointers(&["/competition_score"]),
                competitors: pointers(&["/competitors"]),
                category: pointers(&["/category"]),
                sub_category: pointers(&["/sub_category"]),
                tags: pointers(&["/tags", "/hashtags"]),
                rating: pointers(&["/rating"]),
                profit_margin: pointers(&["/profit_margin"]),
            },
        }
    }

    /// EchoTik shop analytics.
    pub fn echotik() -> Self {
        Self {
            item_pointers: pointers(&["/data/list", "/data"]),
            fields: JsonFieldMap {
                title: pointers(&["/product_name", "/title"]),
                images: pointers(&["/cover_url", "/images"]),
                price: pointers(&["/avg_price", "/price"]),
                total_sales: pointers(&["/total_sale_cnt"]),
                monthly_sales: pointers(&["/sale_cnt_30d"]),
                daily_sales: pointers(&["/sale_cnt_1d"]),
                growth_rate: pointers(&["/sale_growth_rate"]),
                category: pointers(&["/category_name"]),
                tags: pointers(&["/tags"]),
                rating: pointers(&["/product_rating"]),
                ..JsonFieldMap::default()
            },
        }
    }

    /// Google Shopping style results used as the reference market.
    pub fn google_shopping() -> Self {
        Self {
            item_pointers: pointers(&["/shopping_results", "/results"]),
            fields: JsonFieldMap {
                title: pointers(&["/title"]),
                images: pointers(&["/thumbnail"]),
                price: pointers(&["/extracted_price", "/price"]),
                currency: pointers(&["/currency"]),
                category: pointers(&["/category"]),
                tags: pointers(&["/extensions"]),
                rating: pointers(&["/rating"]),
                ..JsonFieldMap::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.item_pointers.is_empty() {
            return Err(CollectorError::InvalidProfile(
                "json profile has no item pointers".into(),
            ));
        }
        if self.fields.title.is_empty() {
            return Err(CollectorError::InvalidProfile(
                "json profile has no title pointer".into(),
            ));
        }
        if let Some(bad) = self
            .item_pointers
            .iter()
            .chain(self.fields.all_pointers())
            .find(|p| !p.is_empty() && !p.starts_with('/'))
        {
            return Err(CollectorError::InvalidProfile(format!(
                "`{bad}` is not a JSON pointer"
            )));
        }
        Ok(())
    }
}

/// Parses one JSON API response into canonical records.
pub fn extract_json(
    profile: &JsonProfile,
    body: &str,
    scope: &ExtractionScope,
) -> Result<Extracted, CollectorError> {
    profile.validate()?;
    let document: JsonValue =
        serde_json::from_str(body).map_err(|e| CollectorError::ParseStructureChanged {
            provider: scope.provider.clone(),
            detail: format!("response is not JSON: {e}"),
        })?;

    match structural_items(profile, &document) {
        Some((base, items)) => {
            let records = extract_items(profile, &base, items, scope);
            if !records.is_empty() {
                return Ok(Extracted {
                    mode: ExtractionMode::Structural,
                    records,
                });
            }
            debug!(provider = %scope.provider, pointer = %base, "items carried no titles");
        }
        None => debug!(provider = %scope.provider, "no item pointer matched, walking document"),
    }

    let mut found = Vec::new();
    walk_for_products(&document, String::new(), &mut found);
    let mut seen = HashSet::new();
    let records: Vec<_> = found
        .into_iter()
        .filter(|(_, title, _)| seen.insert(title.to_lowercase()))
        .map(|(pointer, title, images)| {
            let mut record = scope.new_record(&title);
            record.title = Field::observed(title.clone(), scope.evidence(pointer.clone(), &title));
            let snippet = images.join(" ");
            record.images = Field::observed(images, scope.evidence(pointer, &snippet));
            record
        })
        .collect();

    if records.is_empty() {
        return Err(CollectorError::NoDataExtracted {
            provider: scope.provider.clone(),
            hint: crate::OFFICIAL_API_HINT.to_string(),
        });
    }
    Ok(Extracted {
        mode: ExtractionMode::Heuristic,
        records,
    })
}

fn structural_items<'a>(
    profile: &JsonProfile,
    document: &'a JsonValue,
) -> Option<(String, &'a Vec<JsonValue>)> {
    profile.item_pointers.iter().find_map(|pointer| {
        document
            .pointer(pointer)
            .and_then(JsonValue::as_array)
            .filter(|items| !items.is_empty())
            .map(|items| (pointer.clone(), items))
    })
}

/// First candidate pointer with a usable value, with its absolute pointer.
fn lookup<'a, T>(
    item: &'a JsonValue,
    base: &str,
    candidates: &[String],
    parse: impl Fn(&'a JsonValue) -> Option<T>,
) -> Option<(T, String, String)> {
    candidates.iter().find_map(|candidate| {
        let raw = item.pointer(candidate)?;
        let value = parse(raw)?;
        let snippet = match raw {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some((value, format!("{base}{candidate}"), snippet))
    })
}

fn extract_items(
    profile: &JsonProfile,
    items_pointer: &str,
    items: &[JsonValue],
    scope: &ExtractionScope,
) -> Vec<CanonicalProductRecord> {
    let fields = &profile.fields;
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let base = format!("{items_pointer}/{index}");
        let Some((title, title_ptr, _)) = lookup(item, &base, &fields.title, json_text) else {
            continue;
        };
        if !seen.insert(title.to_lowercase()) {
            continue;
        }
        let mut record = scope.new_record(&title);
        record.title = Field::observed(title.clone(), scope.evidence(title_ptr, &title));

        if let Some((images, ptr, snippet)) = lookup(item, &base, &fields.images, json_string_list)
        {
            record.images = Field::observed(images, scope.evidence(ptr, &snippet));
        }

        if let Some((value, ptr, snippet)) =
            lookup(item, &base, &fields.price, json_number).filter(|(v, _, _)| *v >= 0.0)
        {
            let currency = lookup(item, &base, &fields.currency, json_text)
                .map(|(c, _, _)| c)
                .unwrap_or_else(|| scope.default_currency().to_string());
            record.price = Field::observed(Price { value, currency }, scope.evidence(ptr, &snippet));
        }

        let monthly = lookup(item, &base, &fields.monthly_sales, json_count);
        let total = lookup(item, &base, &fields.total_sales, json_count);
        let daily = lookup(item, &base, &fields.daily_sales, json_count);
        if let Some((_, ptr, snippet)) = monthly.clone().or(total.clone()).or(daily.clone()) {
            let sales = Sales {
                total: total.map(|(v, _, _)| v),
                daily: daily.map(|(v, _, _)| v),
                weekly: None,
                monthly: monthly.map(|(v, _, _)| v),
            };
            record.sales = Field::observed(sales, scope.evidence(ptr, &snippet));
        }

        let trend = lookup(item, &base, &fields.trend, |v| json_text(v).and_then(|t| Trend::parse(&t)));
        if let Some((rate, ptr, snippet)) = lookup(item, &base, &fields.growth_rate, json_number) {
            let trend = match trend {
                Some((stated, _, _)) if trend_agrees(stated, rate) => stated,
                _ => Trend::from_rate(rate),
            };
            record.growth = Field::observed(Growth { rate, trend }, scope.evidence(ptr, &snippet));
        }

        let score = lookup(item, &base, &fields.competition_score, json_number)
            .map(|(v, p, s)| (v.clamp(0.0, 100.0).round() as u8, p, s));
        let level = lookup(item, &base, &fields.competition_level, |v| {
            json_text(v).and_then(|t| CompetitionLevel::parse(&t))
        });
        let competitors = lookup(item, &base, &fields.competitors, json_count)
            .map(|(v, _, _)| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0);
        let competition = match (level, score) {
            (Some((level, ptr, snippet)), score) => Some((
                Competition {
                    level,
                    score: score.map(|(s, _, _)| s).unwrap_or_else(|| level_midpoint(level)),
                    competitors,
                },
                ptr,
                snippet,
            )),
            (None, Some((score, ptr, snippet))) => Some((
                Competition {
                    level: CompetitionLevel::from_score(score),
                    score,
                    competitors,
                },
                ptr,
                snippet,
            )),
            (None, None) => None,
        };
        if let Some((competition, ptr, snippet)) = competition {
            record.competition = Field::observed(competition, scope.evidence(ptr, &snippet));
        }

        let tags = lookup(item, &base, &fields.tags, json_string_list)
            .map(|(t, _, _)| t)
            .unwrap_or_default();
        if let Some((primary, ptr, snippet)) = lookup(item, &base, &fields.category, json_text) {
            let secondary = lookup(item, &base, &fields.sub_category, json_text)
                .map(|(s, _, _)| s)
                .unwrap_or_else(|| primary.clone());
            let category = Category {
                primary,
                secondary,
                tags,
            };
            record.category = Field::observed(category, scope.evidence(ptr, &snippet));
        } else if let Some((tags, ptr, snippet)) = lookup(item, &base, &fields.tags, json_string_list)
        {
            let category = Category {
                primary: String::new(),
                secondary: String::new(),
                tags,
            };
            record.category = Field::observed(category, scope.evidence(ptr, &snippet));
        }

        if let Some((rating, ptr, snippet)) = lookup(item, &base, &fields.rating, json_number)
            .filter(|(r, _, _)| (0.0..=5.0).contains(r))
        {
            record.rating = Field::observed(rating, scope.evidence(ptr, &snippet));
        }

        if let Some((margin, ptr, snippet)) = lookup(item, &base, &fields.profit_margin, json_number)
        {
            record.profit_margin = Field::observed(margin, scope.evidence(ptr, &snippet));
        }

        records.push(record);
    }
    records
}

/// A stated trend is kept unless the signed rate contradicts it.
fn trend_agrees(stated: Trend, rate: f64) -> bool {
    match stated {
        Trend::Up => rate > 0.0,
        Trend::Down => rate < 0.0,
        Trend::Stable => true,
    }
}

fn level_midpoint(level: CompetitionLevel) -> u8 {
    match level {
        CompetitionLevel::Low => 20,
        CompetitionLevel::Medium => 50,
        CompetitionLevel::High => 80,
    }
}

/// Depth-first search for objects that carry both a name and an image URL.
fn walk_for_products(value: &JsonValue, pointer: String, out: &mut Vec<(String, String, Vec<String>)>) {
    match value {
        JsonValue::Object(map) => {
            let title = NAME_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(json_text));
            let images = IMAGE_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(json_string_list))
                .map(|urls| {
                    urls.into_iter()
                        .filter(|u| u.starts_with("http"))
                        .collect::<Vec<_>>()
                })
                .filter(|urls| !urls.is_empty());
            if let (Some(title), Some(images)) = (title, images) {
                out.push((pointer.clone(), title, images));
                return;
            }
            for (key, child) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                walk_for_products(child, format!("{pointer}/{escaped}"), out);
            }
        }
        JsonValue::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                walk_for_products(child, format!("{pointer}/{index}"), out);
            }
        }
        _ => {}
    }
}

/// JSON API collector driven by a [`JsonProfile`].
pub struct JsonApiCollector {
    config: CollectorConfig,
    profile: JsonProfile,
    source: Arc<SourceContext>,
}

impl JsonApiCollector {
    pub fn new(
        config: CollectorConfig,
        profile: JsonProfile,
        source: Arc<SourceContext>,
    ) -> Result<Self, CollectorError> {
        profile.validate()?;
        Ok(Self {
            config,
            profile,
            source,
        })
    }
}

#[async_trait]
impl Collector for JsonApiCollector {
    fn provider(&self) -> &ProviderId {
        &self.config.provider
    }

    fn role(&self) -> SourceRole {
        self.config.role
    }

    fn is_configured(&self) -> bool {
        self.config.is_ready()
    }

    async fn collect(
        &self,
        request: &CollectionRequest,
    ) -> Result<Vec<CanonicalProductRecord>, CollectorError> {
        let raw = fetch_raw(&self.source, &self.config, request, "json").await?;
        let scope = raw.scope(&self.config, request);
        let mut extracted = extract_json(&self.profile, &raw.text, &scope)?;
        extracted.records.truncate(request.effective_limit());
        info!(
            provider = %self.config.provider,
            mode = ?extracted.mode,
            count = extracted.records.len(),
            "json api collected"
        );
        Ok(extracted.records)
    }
}
