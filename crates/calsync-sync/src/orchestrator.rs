//! Per-extract driver: coerce, validate, upload, one extract at a time.
//!
//! Only a missing destination schema aborts a run. Every other problem is recorded on the
//! extract's outcome and the run moves on to the next extract.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use calsync_core::{ExtractPayload, SourceExtract, TableRef, TableSchema, TypedRecordBatch};
use calsync_sources::{load_extract, sidecar_path_for};
use calsync_storage::{write_atomic, Warehouse};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::coerce::{coerce, CoercionReport};
use crate::error::{ExtractError, SyncError};
use crate::upload::{UploadResult, Uploader};
use crate::validate::{validate, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractState {
    Discovered,
    Coerced,
    Validated,
    Uploaded,
    Skipped,
    Failed,
}

impl ExtractState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractState::Discovered => "DISCOVERED",
            ExtractState::Coerced => "COERCED",
            ExtractState::Validated => "VALIDATED",
            ExtractState::Uploaded => "UPLOADED",
            ExtractState::Skipped => "SKIPPED",
            ExtractState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExtractState::Uploaded | ExtractState::Skipped | ExtractState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DryRun,
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractOutcome {
    pub extract_id: Uuid,
    pub origin: String,
    pub table: String,
    pub created_on: NaiveDate,
    pub state: ExtractState,
    /// Furthest pipeline stage completed; for failures, the stage the extract failed after.
    pub reached: ExtractState,
    pub skip_reason: Option<SkipReason>,
    pub rows_in: usize,
    pub rows_written: u64,
    /// Rows a dry run would have appended.
    pub would_write: Option<usize>,
    pub coercion_reports: Vec<CoercionReport>,
    pub validation: Option<ValidationResult>,
    pub upload: Option<UploadResult>,
    pub sidecar: Option<PathBuf>,
    pub error: Option<String>,
}

impl ExtractOutcome {
    fn discovered(extract: &SourceExtract) -> Self {
        Self {
            extract_id: extract.id,
            origin: extract.origin.clone(),
            table: extract.table.clone(),
            created_on: extract.created_on,
            state: ExtractState::Discovered,
            reached: ExtractState::Discovered,
            skip_reason: None,
            rows_in: 0,
            rows_written: 0,
            would_write: None,
            coercion_reports: Vec::new(),
            validation: None,
            upload: None,
            sidecar: None,
            error: None,
        }
    }

    fn advance(&mut self, state: ExtractState) {
        self.state = state;
        if !state.is_terminal() {
            self.reached = state;
        }
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        self.skip_reason = Some(reason);
        self.advance(ExtractState::Skipped);
        self
    }

    fn fail(mut self, err: ExtractError) -> Self {
        error!(
            origin = %self.origin,
            after = self.reached.as_str(),
            error = %err,
            "extract failed"
        );
        self.error = Some(err.to_string());
        self.advance(ExtractState::Failed);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub outcomes: Vec<ExtractOutcome>,
}

impl RunSummary {
    pub fn count(&self, state: ExtractState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn uploaded(&self) -> usize {
        self.count(ExtractState::Uploaded)
    }

    pub fn skipped(&self) -> usize {
        self.count(ExtractState::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(ExtractState::Failed)
    }

    pub fn rows_written(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows_written).sum()
    }
}

/// CSV rendering of a coerced batch, written next to its input for audit.
fn sidecar_bytes(batch: &TypedRecordBatch) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(batch.column_names())
        .context("writing sidecar header")?;
    for row in 0..batch.row_count() {
        writer
            .write_record(batch.columns().iter().map(|c| c.values[row].render()))
            .context("writing sidecar row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing sidecar: {}", err.error()))
}

async fn write_sidecar(input: &Path, batch: &TypedRecordBatch) -> Option<PathBuf> {
    let path = sidecar_path_for(input);
    let written = match sidecar_bytes(batch) {
        Ok(bytes) => write_atomic(&path, &bytes).await,
        Err(err) => Err(err),
    };
    match written {
        Ok(file) => {
            debug!(path = %file.path.display(), sha256 = %file.sha256, "wrote cleaned sidecar");
            Some(file.path)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not write cleaned sidecar");
            None
        }
    }
}

pub struct SyncOrchestrator {
    warehouse: Arc<dyn Warehouse>,
    uploader: Uploader,
    run_id: Option<Uuid>,
}

impl SyncOrchestrator {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            uploader: Uploader::new(warehouse.clone()),
            warehouse,
            run_id: None,
        }
    }

    /// Tag every summary with a caller-chosen run id instead of a fresh one.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub async fn run(
        &self,
        table: &TableRef,
        extracts: Vec<SourceExtract>,
        dry_run: bool,
    ) -> Result<RunSummary, SyncError> {
        let run_id = self.run_id.unwrap_or_else(Uuid::new_v4);
        let started_at = Utc::now();

        let schema = self
            .warehouse
            .table_schema(table)
            .await
            .map_err(|source| SyncError::Discovery {
                table: table.to_string(),
                source,
            })?;
        info!(
            table = %table,
            columns = schema.fields.len(),
            extracts = extracts.len(),
            dry_run,
            "starting sync run"
        );

        let mut outcomes = Vec::with_capacity(extracts.len());
        for extract in extracts {
            let span = info_span!("extract", run_id = %run_id, origin = %extract.origin);
            let outcome = self
                .process(table, &schema, extract, dry_run)
                .instrument(span)
                .await;
            outcomes.push(outcome);
        }

        let summary = RunSummary {
            run_id,
            table: table.to_string(),
            started_at,
            finished_at: Utc::now(),
            dry_run,
            outcomes,
        };
        info!(
            table = %table,
            uploaded = summary.uploaded(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            rows_written = summary.rows_written(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn process(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        extract: SourceExtract,
        dry_run: bool,
    ) -> ExtractOutcome {
        let mut outcome = ExtractOutcome::discovered(&extract);
        if extract.already_processed {
            info!("cleaned sidecar present, skipping");
            return outcome.skip(SkipReason::AlreadyProcessed);
        }

        let raw = match load_extract(&extract) {
            Ok(raw) => raw,
            Err(err) => return outcome.fail(err.into()),
        };
        outcome.rows_in = raw.row_count();

        let (typed, reports) = match coerce(&raw, schema) {
            Ok(coerced) => coerced,
            Err(err) => return outcome.fail(err.into()),
        };
        drop(raw);
        outcome.coercion_reports = reports;
        outcome.advance(ExtractState::Coerced);

        let validation = validate(&typed, schema);
        let missing = validation.missing_columns.clone();
        let passed = validation.ok;
        outcome.validation = Some(validation);
        if !passed {
            return outcome.fail(ExtractError::Validation(missing));
        }
        outcome.advance(ExtractState::Validated);

        if dry_run {
            info!(rows = typed.row_count(), "dry run, skipping upload");
            outcome.would_write = Some(typed.row_count());
            return outcome.skip(SkipReason::DryRun);
        }

        let upload = self.uploader.upload(&typed, table).await;
        let upload_error = upload.error.clone();
        outcome.rows_written = upload.rows_written;
        let uploaded = upload.ok;
        outcome.upload = Some(upload);
        if !uploaded {
            return outcome.fail(ExtractError::Upload(upload_error.unwrap_or_default()));
        }
        outcome.advance(ExtractState::Uploaded);

        // The sidecar marks its input as processed; only uploaded extracts get one.
        if let ExtractPayload::Csv(path) = &extract.payload {
            outcome.sidecar = write_sidecar(path, &typed).await;
        }
        outcome
    }
}
