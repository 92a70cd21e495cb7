//! Run reports: JSON summary, markdown brief, Parquet snapshots with a hashed manifest,
//! and migration result tables.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use calsync_storage::{sha256_hex, write_atomic};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::migrate::MigrationSummary;
use crate::orchestrator::ExtractOutcome;
use crate::PipelineRunSummary;

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const RUN_BRIEF_FILE: &str = "run_brief.md";
pub const MIGRATION_JSON_FILE: &str = "migration_results.json";
pub const MIGRATION_CSV_FILE: &str = "migration_results.csv";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write every report for a pipeline run under `<reports_root>/<run_id>/`.
pub async fn write_run_reports(reports_root: &Path, summary: &PipelineRunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    write_atomic(&run_dir.join(RUN_SUMMARY_FILE), &json).await?;
    write_atomic(&run_dir.join(RUN_BRIEF_FILE), render_run_brief(summary).as_bytes()).await?;

    let snapshot_dir = run_dir.join("snapshots");
    tokio::fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let outcomes: Vec<&ExtractOutcome> = summary
        .tables
        .iter()
        .flat_map(|run| run.outcomes.iter())
        .collect();
    let outcomes_path = snapshot_dir.join("extract_outcomes.parquet");
    let coercion_path = snapshot_dir.join("coercion_reports.parquet");
    write_extract_outcomes_parquet(&outcomes_path, summary, &outcomes)?;
    write_coercion_reports_parquet(&coercion_path, &outcomes)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("extract_outcomes", &run_dir, &outcomes_path)?,
            manifest_entry("coercion_reports", &run_dir, &coercion_path)?,
        ],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_atomic(&snapshot_dir.join("manifest.json"), &bytes).await?;

    info!(dir = %run_dir.display(), "wrote run reports");
    Ok(run_dir)
}

pub fn render_run_brief(summary: &PipelineRunSummary) -> String {
    let mut lines = vec![
        "# CAL-ACCESS Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Run date: {}", summary.run_date),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Dry run: {}", summary.dry_run),
        format!(
            "- Extracts: {} uploaded, {} skipped, {} failed",
            summary.uploaded(),
            summary.skipped(),
            summary.failed()
        ),
        format!("- Rows written: {}", summary.rows_written()),
        String::new(),
        "## Tables".to_string(),
    ];
    if summary.tables.is_empty() && summary.table_failures.is_empty() {
        lines.push("- no extracts discovered".to_string());
    }
    for run in &summary.tables {
        lines.push(format!(
            "- {}: {} uploaded, {} skipped, {} failed, {} rows",
            run.table,
            run.uploaded(),
            run.skipped(),
            run.failed(),
            run.rows_written()
        ));
        for outcome in &run.outcomes {
            if let Some(error) = &outcome.error {
                lines.push(format!("  - `{}` failed: {}", outcome.origin, error));
            }
            for report in outcome.coercion_reports.iter().filter(|r| r.has_loss()) {
                lines.push(format!(
                    "  - `{}` {} ({}): {} of {} values nulled ({:.1}%)",
                    outcome.origin,
                    report.column,
                    report.logical_type,
                    report.loss_count,
                    report.original_non_null_count,
                    report.loss_percent
                ));
            }
        }
    }
    for failure in &summary.table_failures {
        lines.push(format!("- {}: not synced, {}", failure.table, failure.error));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[derive(Debug, Serialize)]
struct MigrationCsvRow<'a> {
    table: &'a str,
    source_column: &'a str,
    derived_column: &'a str,
    status: &'static str,
    add_outcome: String,
    rows_updated: u64,
    distinct_values: usize,
    unparsable_values: usize,
    error: &'a str,
}

pub fn migration_results_csv(summary: &MigrationSummary) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for result in &summary.results {
        writer
            .serialize(MigrationCsvRow {
                table: &result.table,
                source_column: &result.source_column,
                derived_column: &result.derived_column,
                status: if result.ok { "success" } else { "failed" },
                add_outcome: result
                    .add_outcome
                    .map(|o| format!("{o:?}"))
                    .unwrap_or_default(),
                rows_updated: result.rows_updated,
                distinct_values: result.distinct_values,
                unparsable_values: result.unparsable_values.len(),
                error: result.error.as_deref().unwrap_or_default(),
            })
            .context("writing migration csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing migration csv: {}", err.error()))
}

/// Write migration results under `<reports_root>/migrations/<run_id>/`.
pub async fn write_migration_reports(reports_root: &Path, summary: &MigrationSummary) -> Result<PathBuf> {
    let dir = reports_root
        .join("migrations")
        .join(summary.run_id.to_string());
    let json = serde_json::to_vec_pretty(summary).context("serializing migration summary")?;
    write_atomic(&dir.join(MIGRATION_JSON_FILE), &json).await?;
    write_atomic(&dir.join(MIGRATION_CSV_FILE), &migration_results_csv(summary)?).await?;
    info!(dir = %dir.display(), "wrote migration reports");
    Ok(dir)
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

fn write_extract_outcomes_parquet(
    path: &Path,
    summary: &PipelineRunSummary,
    outcomes: &[&ExtractOutcome],
) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("run_id", DataType::Utf8, false),
        ArrowField::new("extract_id", DataType::Utf8, false),
        ArrowField::new("table", DataType::Utf8, false),
        ArrowField::new("origin", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("reached", DataType::Utf8, false),
        ArrowField::new("rows_in", DataType::UInt64, false),
        ArrowField::new("rows_written", DataType::UInt64, false),
        ArrowField::new("sidecar", DataType::Utf8, true),
        ArrowField::new("error", DataType::Utf8, true),
    ]));

    let run_ids = StringArray::from(vec![summary.run_id.to_string(); outcomes.len()]);
    let extract_ids = StringArray::from(
        outcomes
            .iter()
            .map(|o| o.extract_id.to_string())
            .collect::<Vec<_>>(),
    );
    let tables = StringArray::from(outcomes.iter().map(|o| o.table.as_str()).collect::<Vec<_>>());
    let origins = StringArray::from(outcomes.iter().map(|o| o.origin.as_str()).collect::<Vec<_>>());
    let states = StringArray::from(outcomes.iter().map(|o| o.state.as_str()).collect::<Vec<_>>());
    let reached = StringArray::from(outcomes.iter().map(|o| o.reached.as_str()).collect::<Vec<_>>());
    let rows_in = UInt64Array::from(outcomes.iter().map(|o| o.rows_in as u64).collect::<Vec<_>>());
    let rows_written = UInt64Array::from(outcomes.iter().map(|o| o.rows_written).collect::<Vec<_>>());
    let sidecars = StringArray::from(
        outcomes
            .iter()
            .map(|o| o.sidecar.as_ref().map(|p| p.display().to_string()))
            .collect::<Vec<_>>(),
    );
    let errors = StringArray::from(outcomes.iter().map(|o| o.error.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(run_ids),
            Arc::new(extract_ids),
            Arc::new(tables),
            Arc::new(origins),
            Arc::new(states),
            Arc::new(reached),
            Arc::new(rows_in),
            Arc::new(rows_written),
            Arc::new(sidecars),
            Arc::new(errors),
        ],
    )
    .context("building extract_outcomes record batch")?;
    write_parquet(path, batch)
}

fn write_coercion_reports_parquet(path: &Path, outcomes: &[&ExtractOutcome]) -> Result<()> {
    let rows = outcomes
        .iter()
        .flat_map(|o| o.coercion_reports.iter().map(move |r| (*o, r)))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("table", DataType::Utf8, false),
        ArrowField::new("origin", DataType::Utf8, false),
        ArrowField::new("column", DataType::Utf8, false),
        ArrowField::new("logical_type", DataType::Utf8, false),
        ArrowField::new("original_non_null_count", DataType::UInt64, false),
        ArrowField::new("coerced_non_null_count", DataType::UInt64, false),
        ArrowField::new("loss_count", DataType::UInt64, false),
        ArrowField::new("loss_percent", DataType::Float64, false),
    ]));

    let tables = StringArray::from(rows.iter().map(|(o, _)| o.table.as_str()).collect::<Vec<_>>());
    let origins = StringArray::from(rows.iter().map(|(o, _)| o.origin.as_str()).collect::<Vec<_>>());
    let columns = StringArray::from(rows.iter().map(|(_, r)| r.column.as_str()).collect::<Vec<_>>());
    let types = StringArray::from(
        rows.iter()
            .map(|(_, r)| r.logical_type.as_str())
            .collect::<Vec<_>>(),
    );
    let original = UInt64Array::from(
        rows.iter()
            .map(|(_, r)| r.original_non_null_count as u64)
            .collect::<Vec<_>>(),
    );
    let coerced = UInt64Array::from(
        rows.iter()
            .map(|(_, r)| r.coerced_non_null_count as u64)
            .collect::<Vec<_>>(),
    );
    let losses = UInt64Array::from(rows.iter().map(|(_, r)| r.loss_count as u64).collect::<Vec<_>>());
    let percents = Float64Array::from(rows.iter().map(|(_, r)| r.loss_percent).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(tables),
            Arc::new(origins),
            Arc::new(columns),
            Arc::new(types),
            Arc::new(original),
            Arc::new(coerced),
            Arc::new(losses),
            Arc::new(percents),
        ],
    )
    .context("building coercion_reports record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
