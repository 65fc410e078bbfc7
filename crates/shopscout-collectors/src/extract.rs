//! Shared extraction helpers for HTML and JSON provider payloads.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Selector};
use serde_json::Value as JsonValue;
use shopscout_core::{
    CanonicalProductRecord, CollectionRequest, CountryCode, EvidenceRef, ProviderId, SourceRole,
};

use crate::CollectorError;

const SNIPPET_MAX_CHARS: usize = 160;

/// Everything a parser needs to stamp records and evidence for one response.
#[derive(Debug, Clone)]
pub struct ExtractionScope {
    pub provider: ProviderId,
    pub role: SourceRole,
    pub keyword: String,
    pub country: CountryCode,
    pub source_url: String,
    pub raw_sha256: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
}

impl ExtractionScope {
    pub fn for_request(
        provider: ProviderId,
        role: SourceRole,
        request: &CollectionRequest,
        source_url: impl Into<String>,
        raw_sha256: impl Into<String>,
        fetched_at: DateTime<Utc>,
        extractor_version: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            role,
            keyword: request.keyword().to_string(),
            country: request.country,
            source_url: source_url.into(),
            raw_sha256: raw_sha256.into(),
            fetched_at,
            extractor_version: extractor_version.into(),
        }
    }

    /// Currency assumed when the payload names none. Reference markets
    /// price outside the requested country, so they get no assumption and
    /// the price carries an empty currency.
    pub fn default_currency(&self) -> &'static str {
        match self.role {
            SourceRole::ReferenceMarket => "",
            _ => self.country.currency(),
        }
    }

    pub fn evidence(&self, pointer: impl Into<String>, snippet: &str) -> EvidenceRef {
        EvidenceRef {
            raw_artifact_sha256: self.raw_sha256.clone(),
            source_url: self.source_url.clone(),
            selector_or_pointer: pointer.into(),
            snippet: truncate_snippet(snippet),
            fetched_at: self.fetched_at,
            extractor_version: self.extractor_version.clone(),
        }
    }

    pub fn new_record(&self, title: &str) -> CanonicalProductRecord {
        CanonicalProductRecord::new(
            self.provider.clone(),
            self.role,
            &self.keyword,
            self.country,
            title,
            self.fetched_at,
        )
    }
}

/// How the records of one response were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Structural,
    Heuristic,
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub mode: ExtractionMode,
    pub records: Vec<CanonicalProductRecord>,
}

fn truncate_snippet(text: &str) -> String {
    let collapsed = collapse_whitespace(text);
    if collapsed.chars().count() <= SNIPPET_MAX_CHARS {
        collapsed
    } else {
        collapsed.chars().take(SNIPPET_MAX_CHARS).collect()
    }
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, CollectorError> {
    Selector::parse(selector)
        .map_err(|e| CollectorError::InvalidProfile(format!("selector `{selector}`: {e}")))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

/// First non-empty text among `selectors`, with the selector that produced it.
pub(crate) fn select_first_text(
    element: ElementRef<'_>,
    selectors: &[Selector],
    names: &[String],
) -> Option<(String, String)> {
    selectors.iter().zip(names).find_map(|(sel, name)| {
        element
            .select(sel)
            .find_map(element_text)
            .map(|text| (text, name.clone()))
    })
}

pub(crate) fn select_first_attr(
    element: ElementRef<'_>,
    selector: &Selector,
    attrs: &[String],
) -> Option<(String, String)> {
    element.select(selector).find_map(|node| {
        attrs.iter().find_map(|attr| {
            node.value()
                .attr(attr)
                .and_then(text_or_none)
                .map(|v| (v, attr.clone()))
        })
    })
}

/// Every number in `text`. A `-` counts as a sign only when it sits directly
/// before a digit and does not follow one, so ranges like `1,299-1,499` stay
/// positive.
pub(crate) fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let mut prev: Option<char> = None;
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        let sign = matches!(ch, '-' | '\u{2212}')
            && current.is_empty()
            && chars.peek().is_some_and(|c| c.is_ascii_digit())
            && !prev.is_some_and(|p| p.is_alphanumeric());
        prev = Some(ch);
        if sign {
            current.push('-');
            continue;
        }
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && current.chars().any(|c| c.is_ascii_digit()) {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        // thousands separators inside a number
        if ch == ',' && !current.is_empty() && !seen_dot {
            continue;
        }
        flush_number(&mut current, &mut out);
        seen_dot = false;
    }
    flush_number(&mut current, &mut out);
    out
}

fn flush_number(current: &mut String, out: &mut Vec<f64>) {
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            out.push(v);
        }
        current.clear();
    }
}

/// Parses counts like `1,204 sold`, `3.2k` or `1.5M`.
pub(crate) fn parse_count(text: &str) -> Option<u64> {
    let number = extract_numbers(text).into_iter().next()?;
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = text[start..]
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ',')
        .trim_start();
    let mut chars = rest.chars();
    let suffix = chars.next();
    // `3 months` is not three million
    let standalone = !chars.next().is_some_and(|c| c.is_alphabetic());
    let multiplier = match suffix {
        Some('k' | 'K') if standalone => 1_000.0,
        Some('m' | 'M') if standalone => 1_000_000.0,
        Some('万') => 10_000.0,
        _ => 1.0,
    };
    let value = number * multiplier;
    if value.is_finite() && value >= 0.0 {
        Some(value.round() as u64)
    } else {
        None
    }
}

pub(crate) fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => extract_numbers(s).into_iter().next(),
        _ => None,
    }
}

pub(crate) fn json_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u64)),
        JsonValue::String(s) => parse_count(s),
        _ => None,
    }
}

pub(crate) fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn json_string_list(value: &JsonValue) -> Option<Vec<String>> {
    let values: Vec<String> = match value {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::Object(_) => ["/url", "/src", "/name"]
                    .iter()
                    .find_map(|p| item.pointer(p).and_then(json_text)),
                other => json_text(other),
            })
            .collect(),
        JsonValue::String(s) => text_or_none(s).into_iter().collect(),
        _ => Vec::new(),
    };
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}
