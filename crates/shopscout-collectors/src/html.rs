//! Marketplace search pages fetched through a scraping proxy.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use shopscout_core::{
    CanonicalProductRecord, CollectionRequest, Field, Price, ProviderId, Sales, SourceRole,
};
use tracing::{debug, info};

use crate::extract::{
    element_text, extract_numbers, parse_count, parse_selector, select_first_attr,
    select_first_text, text_or_none, Extracted, ExtractionMode, ExtractionScope,
};
use crate::{fetch_raw, Collector, CollectorConfig, CollectorError, SourceContext};

/// Ordered selector candidates for one marketplace's search results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlProfile {
    pub container_selectors: Vec<String>,
    pub title_selectors: Vec<String>,
    #[serde(default = "default_image_selector")]
    pub image_selector: String,
    #[serde(default = "default_image_attrs")]
    pub image_attrs: Vec<String>,
    #[serde(default)]
    pub price_selectors: Vec<String>,
    #[serde(default)]
    pub sales_selectors: Vec<String>,
    #[serde(default)]
    pub rating_selectors: Vec<String>,
    /// Bodies shorter than this are treated as a blocked or empty page.
    #[serde(default = "default_min_body_bytes")]
    pub min_body_bytes: usize,
}

fn default_image_selector() -> String {
    "img".to_string()
}

fn default_image_attrs() -> Vec<String> {
    vec!["src".to_string(), "data-src".to_string()]
}

fn default_min_body_bytes() -> usize {
    1000
}

impl HtmlProfile {
    /// TikTok Shop search results as rendered by the proxy.
    pub fn tiktok_search() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            container_selectors: strings(&[
                ".tiktok-oj4b9z",
                ".tiktok-x6y88p-DivItemContainerV2",
                ".tiktok-13u1lq-DivItemContainer",
                ".tiktok-1soki6-DivItemContainer",
                ".tiktok-1g8490c-DivItemContainer",
                ".tiktok-19k4p9p-DivItemContainer",
                ".tiktok-1cw07i1-DivItemContainer",
                "div[class*=\"ItemContainer\"]",
                "div[class*=\"Product\"]",
                "div[class*=\"product\"]",
                "article",
                "div[role=\"article\"]",
            ]),
            title_selectors: strings(&[
                ".tiktok-1w0mp4t",
                ".tiktok-1u95gsw-DivContainer",
                ".tiktok-1al0ylh-TextName",
            ]),
            image_selector: default_image_selector(),
            image_attrs: default_image_attrs(),
            price_selectors: strings(&[
                "[data-e2e=\"product-price\"]",
                "span[class*=\"Price\"]",
                ".price",
            ]),
            sales_selectors: strings(&[
                "[data-e2e=\"product-sold\"]",
                "span[class*=\"Sold\"]",
                ".sold",
            ]),
            rating_selectors: strings(&["span[class*=\"Rating\"]", ".rating"]),
            min_body_bytes: default_min_body_bytes(),
        }
    }

    fn compile(&self) -> Result<CompiledProfile, CollectorError> {
        let compile_all = |items: &[String]| -> Result<Vec<Selector>, CollectorError> {
            items.iter().map(|s| parse_selector(s)).collect()
        };
        if self.container_selectors.is_empty() {
            return Err(CollectorError::InvalidProfile(
                "html profile has no container selectors".into(),
            ));
        }
        Ok(CompiledProfile {
            containers: compile_all(&self.container_selectors)?,
            titles: compile_all(&self.title_selectors)?,
            image: parse_selector(&self.image_selector)?,
            prices: compile_all(&self.price_selectors)?,
            sales: compile_all(&self.sales_selectors)?,
            ratings: compile_all(&self.rating_selectors)?,
        })
    }
}

struct CompiledProfile {
    containers: Vec<Selector>,
    titles: Vec<Selector>,
    image: Selector,
    prices: Vec<Selector>,
    sales: Vec<Selector>,
    ratings: Vec<Selector>,
}

/// Parses a search results page. Structural selectors first, then the
/// image-anchored heuristic when no container selector matches.
pub fn extract_html(
    profile: &HtmlProfile,
    body: &str,
    scope: &ExtractionScope,
) -> Result<Extracted, CollectorError> {
    if body.len() < profile.min_body_bytes {
        return Err(no_data(&scope.provider));
    }
    let compiled = profile.compile()?;
    let document = Html::parse_document(body);

    match extract_structural(profile, &compiled, &document, scope) {
        Ok(records) if !records.is_empty() => {
            return Ok(Extracted {
                mode: ExtractionMode::Structural,
                records,
            })
        }
        Ok(_) => debug!(provider = %scope.provider, "containers matched but held no titles"),
        Err(err) => debug!(error = %err, "falling back to heuristic extraction"),
    }

    let records = extract_heuristic(profile, &compiled, &document, scope);
    if records.is_empty() {
        return Err(no_data(&scope.provider));
    }
    Ok(Extracted {
        mode: ExtractionMode::Heuristic,
        records,
    })
}

fn no_data(provider: &ProviderId) -> CollectorError {
    CollectorError::NoDataExtracted {
        provider: provider.clone(),
        hint: crate::OFFICIAL_API_HINT.to_string(),
    }
}

fn extract_structural(
    profile: &HtmlProfile,
    compiled: &CompiledProfile,
    document: &Html,
    scope: &ExtractionScope,
) -> Result<Vec<CanonicalProductRecord>, CollectorError> {
    let Some((container_name, items)) = compiled
        .containers
        .iter()
        .zip(&profile.container_selectors)
        .map(|(sel, name)| (name, document.select(sel).collect::<Vec<_>>()))
        .find(|(_, items)| !items.is_empty())
    else {
        return Err(CollectorError::ParseStructureChanged {
            provider: scope.provider.clone(),
            detail: "no container selector matched".into(),
        });
    };

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let title = select_first_text(item, &compiled.titles, &profile.title_selectors)
            .or_else(|| element_text(item).map(|t| (t, container_name.clone())));
        let Some((title, title_selector)) = title else {
            continue;
        };
        if !seen.insert(title.to_lowercase()) {
            continue;
        }

        let at = |selector: &str| format!("{container_name}[{index}] {selector}");
        let mut record = scope.new_record(&title);
        record.title = Field::observed(title.clone(), scope.evidence(at(&title_selector), &title));

        if let Some((src, attr)) = select_first_attr(item, &compiled.image, &profile.image_attrs) {
            let pointer = at(&format!("{}@{attr}", profile.image_selector));
            record.images = Field::observed(vec![src.clone()], scope.evidence(pointer, &src));
        }

        if let Some((text, selector)) =
            select_first_text(item, &compiled.prices, &profile.price_selectors)
        {
            if let Some(value) = extract_numbers(&text).into_iter().find(|v| *v >= 0.0) {
                let price = Price {
                    value,
                    currency: scope.default_currency().to_string(),
                };
                record.price = Field::observed(price, scope.evidence(at(&selector), &text));
            }
        }

        if let Some((text, selector)) =
            select_first_text(item, &compiled.sales, &profile.sales_selectors)
        {
            if let Some(count) = parse_count(&text) {
                let sales = if states_monthly_window(&text) {
                    Sales::from_monthly(count)
                } else {
                    Sales::from_total(count)
                };
                record.sales = Field::observed(sales, scope.evidence(at(&selector), &text));
            }
        }

        if let Some((text, selector)) =
            select_first_text(item, &compiled.ratings, &profile.rating_selectors)
        {
            if let Some(rating) = extract_numbers(&text)
                .into_iter()
                .find(|v| (0.0..=5.0).contains(v))
            {
                record.rating = Field::observed(rating, scope.evidence(at(&selector), &text));
            }
        }

        records.push(record);
    }
    Ok(records)
}

/// `2.1k sold/month`, `1,204 sold in 30 days`, `月销 3000`.
fn states_monthly_window(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["month", "30 days", "30d", "/mo", "月"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn extract_heuristic(
    profile: &HtmlProfile,
    compiled: &CompiledProfile,
    document: &Html,
    scope: &ExtractionScope,
) -> Vec<CanonicalProductRecord> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for (index, img) in document.select(&compiled.image).enumerate() {
        let Some((src, attr)) = profile
            .image_attrs
            .iter()
            .find_map(|attr| img.value().attr(attr).and_then(text_or_none).map(|v| (v, attr)))
        else {
            continue;
        };
        let Some(title) = nearest_text(img) else {
            continue;
        };
        if !seen.insert(title.to_lowercase()) {
            continue;
        }

        let pointer = format!("{}[{index}]", profile.image_selector);
        let mut record = scope.new_record(&title);
        record.title = Field::observed(
            title.clone(),
            scope.evidence(format!("{pointer} parent text"), &title),
        );
        record.images = Field::observed(
            vec![src.clone()],
            scope.evidence(format!("{pointer}@{attr}"), &src),
        );
        records.push(record);
    }
    records
}

fn nearest_text(element: ElementRef<'_>) -> Option<String> {
    (*element)
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|el| !matches!(el.value().name(), "body" | "html"))
        .find_map(element_text)
}

/// Marketplace search through a scraping proxy (ScraperAPI / RapidAPI style).
pub struct HtmlSearchCollector {
    config: CollectorConfig,
    profile: HtmlProfile,
    source: Arc<SourceContext>,
}

impl HtmlSearchCollector {
    pub fn new(config: CollectorConfig, profile: HtmlProfile, source: Arc<SourceContext>) -> Self {
        Self {
            config,
            profile,
            source,
        }
    }
}

#[async_trait]
impl Collector for HtmlSearchCollector {
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
        let raw = fetch_raw(&self.source, &self.config, request, "html").await?;
        let scope = raw.scope(&self.config, request);
        let mut extracted = extract_html(&self.profile, &raw.text, &scope)?;
        extracted.records.truncate(request.effective_limit());
        info!(
            provider = %self.config.provider,
            mode = ?extracted.mode,
            count = extracted.records.len(),
            "html search collected"
        );
        Ok(extracted.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shopscout_core::{CountryCode, FieldGroup, Provenance};

    fn scope() -> ExtractionScope {
        ExtractionScope {
            provider: ProviderId::new("scraperapi"),
            role: SourceRole::Marketplace,
            keyword: "hair clip".into(),
            country: CountryCode::TH,
            source_url: "https://www.tiktok.com/search?q=hair+clip".into(),
            raw_sha256: "deadbeef".into(),
            fetched_at: Utc::now(),
            extractor_version: "test".into(),
        }
    }

    fn padded(body: &str) -> String {
        format!("<html><head><!-- {} --></head><body>{body}</body></html>", "x".repeat(1200))
    }

    #[test]
    fn short_bodies_count_as_empty() {
        let err = extract_html(&HtmlProfile::tiktok_search(), "<html></html>", &scope()).unwrap_err();
        assert!(matches!(err, CollectorError::NoDataExtracted { .. }));
    }

    #[test]
    fn first_matching_container_selector_wins() {
        let body = padded(
            r#"<article><h3>Article Hit</h3></article>
               <div class="tiktok-oj4b9z"><span class="tiktok-1w0mp4t">Pearl Claw Clip</span>
                 <span class="price">฿89</span><span class="sold">1.2k sold</span></div>"#,
        );
        let extracted = extract_html(&HtmlProfile::tiktok_search(), &body, &scope()).unwrap();
        assert_eq!(extracted.mode, ExtractionMode::Structural);
        assert_eq!(extracted.records.len(), 1);
        let record = &extracted.records[0];
        assert_eq!(record.title_text(), "Pearl Claw Clip");
        assert_eq!(record.price_value(), Some(89.0));
        assert_eq!(record.sales.value().unwrap().total, Some(1200));
        assert_eq!(record.monthly_sales(), None, "a running count is not monthly");
        assert_eq!(record.price.value().unwrap().currency, "THB");
        let evidence = record.title.evidence().unwrap();
        assert_eq!(evidence.raw_artifact_sha256, "deadbeef");
        assert!(evidence.selector_or_pointer.starts_with(".tiktok-oj4b9z[0]"));
    }

    #[test]
    fn sales_are_monthly_only_when_the_page_says_so() {
        let body = padded(
            r#"<div class="tiktok-oj4b9z"><span class="tiktok-1w0mp4t">Velvet Bow</span>
                 <span class="sold">2.1k sold/month</span></div>"#,
        );
        let extracted = extract_html(&HtmlProfile::tiktok_search(), &body, &scope()).unwrap();
        let sales = extracted.records[0].sales.value().unwrap();
        assert_eq!(sales.monthly, Some(2100));
        assert_eq!(sales.total, None);
        assert_eq!(sales.daily, None);
        assert!(states_monthly_window("月销 3000"));
        assert!(!states_monthly_window("356 sold"));
    }

    #[test]
    fn heuristic_records_carry_no_price_or_sales() {
        let body = padded(
            r#"<section><figure><img data-src="https://cdn.test/a.jpg"><figcaption>Silk Scrunchie Set</figcaption></figure></section>"#,
        );
        let extracted = extract_html(&HtmlProfile::tiktok_search(), &body, &scope()).unwrap();
        assert_eq!(extracted.mode, ExtractionMode::Heuristic);
        let record = &extracted.records[0];
        assert_eq!(record.title_text(), "Silk Scrunchie Set");
        let provenance = record.provenance();
        assert_eq!(provenance[&FieldGroup::Images], Provenance::Real);
        assert_eq!(provenance[&FieldGroup::Price], Provenance::Absent);
        assert_eq!(provenance[&FieldGroup::Sales], Provenance::Absent);
        assert_eq!(provenance[&FieldGroup::Growth], Provenance::Absent);
    }

    #[test]
    fn invalid_selector_is_a_profile_error() {
        let mut profile = HtmlProfile::tiktok_search();
        profile.container_selectors = vec!["div[".into()];
        let err = extract_html(&profile, &padded("<p>x</p>"), &scope()).unwrap_err();
        assert!(matches!(err, CollectorError::InvalidProfile(_)));
    }
}
