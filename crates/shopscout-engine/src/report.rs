//! Parquet export of fused opportunities.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shopscout_core::{Confidence, FusedOpportunity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ReportFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `opportunities.parquet`, `contributors.parquet` and `manifest.json`
/// under `dir`. Returns the manifest path.
pub fn export_opportunities(dir: &Path, opportunities: &[FusedOpportunity]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let opportunities_path = dir.join("opportunities.parquet");
    let contributors_path = dir.join("contributors.parquet");
    let opportunity_rows = write_opportunities_parquet(&opportunities_path, opportunities)?;
    let contributor_rows = write_contributors_parquet(&contributors_path, opportunities)?;

    let manifest = ReportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        files: vec![
            manifest_entry("opportunities", dir, &opportunities_path, opportunity_rows)?,
            manifest_entry("contributors", dir, &contributors_path, contributor_rows)?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Row count from the parquet footer.
pub fn read_row_count(path: &Path) -> Result<i64> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("reading parquet footer {}", path.display()))?;
    Ok(reader.metadata().file_metadata().num_rows())
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_opportunities_parquet(path: &Path, items: &[FusedOpportunity]) -> Result<usize> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("composite_score", DataType::Float64, false),
        ArrowField::new("local_price", DataType::Float64, true),
        ArrowField::new("reference_price", DataType::Float64, true),
        ArrowField::new("arbitrage_margin", DataType::Float64, true),
        ArrowField::new("margin_ratio", DataType::Float64, true),
        ArrowField::new("matched_trend_tags", DataType::UInt32, false),
        ArrowField::new("is_opportunity", DataType::Boolean, false),
        ArrowField::new("confidence", DataType::Utf8, false),
        ArrowField::new("real_sources", DataType::UInt32, false),
        ArrowField::new("roles", DataType::Utf8, false),
    ]));

    let keys = StringArray::from(items.iter().map(|o| Some(o.key.as_str())).collect::<Vec<_>>());
    let titles = StringArray::from(items.iter().map(|o| Some(o.title.as_str())).collect::<Vec<_>>());
    let scores = Float64Array::from(items.iter().map(|o| o.composite_score).collect::<Vec<_>>());
    let local = Float64Array::from(items.iter().map(|o| o.local_price).collect::<Vec<_>>());
    let reference = Float64Array::from(items.iter().map(|o| o.reference_price).collect::<Vec<_>>());
    let margins = Float64Array::from(items.iter().map(|o| o.arbitrage_margin).collect::<Vec<_>>());
    let ratios = Float64Array::from(items.iter().map(|o| o.margin_ratio).collect::<Vec<_>>());
    let tags = UInt32Array::from(items.iter().map(|o| o.matched_trend_tags).collect::<Vec<_>>());
    let flags = BooleanArray::from(items.iter().map(|o| o.is_opportunity).collect::<Vec<_>>());
    let confidence = StringArray::from(
        items
            .iter()
            .map(|o| {
                Some(match o.confidence {
                    Confidence::High => "high",
                    Confidence::Low => "low",
                })
            })
            .collect::<Vec<_>>(),
    );
    let real = UInt32Array::from(items.iter().map(|o| o.real_sources).collect::<Vec<_>>());
    let roles = StringArray::from(
        items
            .iter()
            .map(|o| {
                Some(
                    o.contributors
                        .keys()
                        .map(|r| r.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                )
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(titles),
            Arc::new(scores),
            Arc::new(local),
            Arc::new(reference),
            Arc::new(margins),
            Arc::new(ratios),
            Arc::new(tags),
            Arc::new(flags),
            Arc::new(confidence),
            Arc::new(real),
            Arc::new(roles),
        ],
    )
    .context("building opportunities record batch")?;
    let rows = batch.num_rows();
    write_parquet(path, batch)?;
    Ok(rows)
}

fn write_contributors_parquet(path: &Path, items: &[FusedOpportunity]) -> Result<usize> {
    let rows = items
        .iter()
        .flat_map(|o| o.contributors.iter().map(move |(role, record)| (o, role, record)))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("role", DataType::Utf8, false),
        ArrowField::new("provider", DataType::Utf8, false),
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("monthly_sales", DataType::UInt64, true),
        ArrowField::new("simulated", DataType::Boolean, false),
    ]));

    let keys = StringArray::from(rows.iter().map(|(o, _, _)| Some(o.key.as_str())).collect::<Vec<_>>());
    let roles = StringArray::from(rows.iter().map(|(_, r, _)| Some(r.as_str())).collect::<Vec<_>>());
    let providers = StringArray::from(
        rows.iter()
            .map(|(_, _, rec)| Some(rec.provider.as_str()))
            .collect::<Vec<_>>(),
    );
    let ids = StringArray::from(
        rows.iter()
            .map(|(_, _, rec)| Some(rec.id.to_string()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        rows.iter()
            .map(|(_, _, rec)| Some(rec.title_text()))
            .collect::<Vec<_>>(),
    );
    let prices = Float64Array::from(rows.iter().map(|(_, _, rec)| rec.price_value()).collect::<Vec<_>>());
    let sales = UInt64Array::from(rows.iter().map(|(_, _, rec)| rec.monthly_sales()).collect::<Vec<_>>());
    let simulated = BooleanArray::from(rows.iter().map(|(_, _, rec)| rec.is_simulated()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(roles),
            Arc::new(providers),
            Arc::new(ids),
            Arc::new(titles),
            Arc::new(prices),
            Arc::new(sales),
            Arc::new(simulated),
        ],
    )
    .context("building contributors record batch")?;
    let count = batch.num_rows();
    write_parquet(path, batch)?;
    Ok(count)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ReportFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ReportFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
