use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use shopscout_collectors::{
    extract_html, extract_json, ExtractionMode, ExtractionScope, HtmlProfile, JsonProfile,
};
use shopscout_core::{
    CompetitionLevel, CountryCode, FieldGroup, ProviderId, Provenance, SourceRole, Trend,
};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(rel: &str) -> String {
    let path = workspace_root().join("fixtures").join(rel);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn fetched_at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T09:30:00Z")
        .expect("ts")
        .with_timezone(&Utc)
}

fn scope(provider: &str, role: SourceRole, keyword: &str, country: CountryCode) -> ExtractionScope {
    ExtractionScope {
        provider: ProviderId::new(provider),
        role,
        keyword: keyword.into(),
        country,
        source_url: format!("https://{provider}.test/search"),
        raw_sha256: shopscout_storage::sha256_hex(provider.as_bytes()),
        fetched_at: fetched_at(),
        extractor_version: "fixture".into(),
    }
}

#[test]
fn tiktok_structured_page_yields_observed_listing_fields() {
    let body = fixture("tiktok-search/structured.html");
    let extracted = extract_html(
        &HtmlProfile::tiktok_search(),
        &body,
        &scope("scraperapi", SourceRole::Marketplace, "hair clip", CountryCode::TH),
    )
    .unwrap();

    assert_eq!(extracted.mode, ExtractionMode::Structural);
    let titles: Vec<_> = extracted.records.iter().map(|r| r.title_text()).collect();
    assert_eq!(
        titles,
        vec![
            "Pearl Claw Hair Clip Set 6pcs",
            "Matte Acrylic Claw Clip",
            "Velvet Bow Barrette"
        ]
    );

    let first = &extracted.records[0];
    assert_eq!(first.price_value(), Some(89.0));
    assert_eq!(first.sales.value().unwrap().total, Some(1200));
    assert_eq!(first.monthly_sales(), None);
    assert_eq!(first.rating.value(), Some(&4.8));
    assert_eq!(
        first.images.value().unwrap()[0],
        "https://p16-oec-va.ibyteimg.com/tos-maliva-i-o3syd03w52-us/pearl-claw.jpeg"
    );

    let second = &extracted.records[1];
    assert_eq!(second.price_value(), Some(1250.0));
    assert!(second.images.value().unwrap()[0].ends_with("matte-claw.jpeg"));
    assert!(second.rating.is_absent());

    let third = &extracted.records[2];
    assert!(third.price.is_absent());
    assert!(third.sales.is_absent());

    for record in &extracted.records {
        for (group, provenance) in record.provenance() {
            assert_ne!(provenance, Provenance::Simulated, "{group:?} simulated");
        }
        let evidence = record.title.evidence().expect("title evidence");
        assert_eq!(evidence.fetched_at, fetched_at());
        assert!(!evidence.raw_artifact_sha256.is_empty());
    }
}

#[test]
fn tiktok_media_only_page_falls_back_to_image_captions() {
    let body = fixture("tiktok-search/media_only.html");
    let extracted = extract_html(
        &HtmlProfile::tiktok_search(),
        &body,
        &scope("rapidapi", SourceRole::Marketplace, "sunglasses", CountryCode::SG),
    )
    .unwrap();

    assert_eq!(extracted.mode, ExtractionMode::Heuristic);
    let titles: Vec<_> = extracted.records.iter().map(|r| r.title_text()).collect();
    assert_eq!(
        titles,
        vec!["Retro Cat Eye Sunglasses", "Polarized Aviator Sunglasses"]
    );
    for record in &extracted.records {
        let provenance = record.provenance();
        assert_eq!(provenance[&FieldGroup::Title], Provenance::Real);
        assert_eq!(provenance[&FieldGroup::Images], Provenance::Real);
        assert_eq!(provenance[&FieldGroup::Price], Provenance::Absent);
        assert_eq!(provenance[&FieldGroup::Sales], Provenance::Absent);
        assert_eq!(provenance[&FieldGroup::Growth], Provenance::Absent);
    }
}

#[test]
fn fastmoss_analytics_fields_map_onto_canonical_groups() {
    let body = fixture("fastmoss/products.json");
    let extracted = extract_json(
        &JsonProfile::fastmoss(),
        &body,
        &scope("fastmoss", SourceRole::Analytics, "hair clip", CountryCode::VN),
    )
    .unwrap();

    assert_eq!(extracted.records.len(), 2, "blank titles are skipped");
    let pearl = &extracted.records[0];
    assert_eq!(pearl.price.value().unwrap().currency, "USD");
    let sales = pearl.sales.value().unwrap();
    assert_eq!(sales.total, Some(48210));
    assert_eq!(sales.monthly, Some(5200));
    assert_eq!(sales.daily, Some(173));
    assert_eq!(sales.weekly, None);
    assert_eq!(pearl.growth.value().unwrap().trend, Trend::Up);
    let competition = pearl.competition.value().unwrap();
    assert_eq!(competition.level, CompetitionLevel::Low);
    assert_eq!(competition.score, 22);
    assert_eq!(competition.competitors, 41);
    assert_eq!(pearl.tags(), ["hair clip", "pearl", "korean style"]);
    assert_eq!(pearl.profit_margin.value(), Some(&58.0));
    assert_eq!(
        pearl.sales.evidence().unwrap().selector_or_pointer,
        "/data/list/0/monthly_sales"
    );

    let bow = &extracted.records[1];
    assert_eq!(bow.title_text(), "Velvet Bow Barrette");
    assert_eq!(bow.price.value().unwrap().currency, "VND");
    assert_eq!(bow.monthly_sales(), Some(1100));
    assert_eq!(bow.growth.value().unwrap().trend, Trend::Down);
    assert_eq!(bow.competition_level(), Some(CompetitionLevel::High));
    assert_eq!(bow.images.value().unwrap().len(), 1);
}

#[test]
fn reference_market_results_carry_prices_and_tags() {
    let body = fixture("google-shopping/shopping.json");
    let extracted = extract_json(
        &JsonProfile::google_shopping(),
        &body,
        &scope("google-shopping", SourceRole::ReferenceMarket, "hair clip", CountryCode::MY),
    )
    .unwrap();

    assert_eq!(extracted.records.len(), 2);
    let first = &extracted.records[0];
    assert_eq!(first.price_value(), Some(14.99));
    assert_eq!(first.tags(), ["pearl", "korean style"]);
    assert_eq!(first.role, SourceRole::ReferenceMarket);
    assert!(extracted.records[1].category.is_absent());
}

#[test]
fn echotik_rows_resolve_from_a_top_level_array() {
    let body = fixture("echotik/products.json");
    let extracted = extract_json(
        &JsonProfile::echotik(),
        &body,
        &scope("echotik", SourceRole::Marketplace, "hair clip", CountryCode::TH),
    )
    .unwrap();

    assert_eq!(extracted.mode, ExtractionMode::Structural);
    let record = &extracted.records[0];
    assert_eq!(record.price_value(), Some(89.0));
    assert_eq!(record.monthly_sales(), Some(2400));
    assert_eq!(record.primary_category(), Some("hair"));
    assert_eq!(
        record.title.evidence().unwrap().selector_or_pointer,
        "/data/0/product_name"
    );
}
