//! Additive column migrations: derive a typed column from a legacy text column and
//! backfill it, leaving the source column untouched.
//!
//! Both steps are idempotent. Re-adding an existing column is reported as
//! `AlreadyExists`, and re-running the backfill rewrites the same values.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use calsync_core::{FieldSchema, LogicalType, ParseRule, RawValue, TableRef, TableSchema};
use calsync_storage::{AddColumnOutcome, DerivedColumnUpdate, Warehouse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::MigrationError;

pub const PLAN_VERSION: u32 = 1;

/// Suffix appended to a source column to name its derived column.
pub const DERIVED_SUFFIX: &str = "_DATE";

/// How many unparsable values to echo in a single log line.
const LOGGED_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub table: TableRef,
    pub source_column: String,
    pub derived_column: String,
    pub parse_rule: ParseRule,
}

impl MigrationStep {
    /// Step with the default derived name and the legacy US date rule.
    pub fn new(table: TableRef, source_column: impl Into<String>) -> Self {
        let source_column = source_column.into();
        Self {
            table,
            derived_column: format!("{source_column}{DERIVED_SUFFIX}"),
            source_column,
            parse_rule: ParseRule::legacy_us_date(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub table: String,
    pub source_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_rule: Option<ParseRule>,
}

/// YAML migration plan, e.g. `migrations.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub version: u32,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl MigrationPlan {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let plan: MigrationPlan = serde_yaml::from_str(text).context("parsing migration plan")?;
        if plan.version != PLAN_VERSION {
            bail!(
                "unsupported migration plan version {}, expected {PLAN_VERSION}",
                plan.version
            );
        }
        Ok(plan)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_steps(steps: &[MigrationStep]) -> Self {
        let default_rule = ParseRule::legacy_us_date();
        Self {
            version: PLAN_VERSION,
            steps: steps
                .iter()
                .map(|step| PlanStep {
                    table: step.table.table.clone(),
                    source_column: step.source_column.clone(),
                    derived_column: Some(step.derived_column.clone()),
                    parse_rule: (step.parse_rule != default_rule).then(|| step.parse_rule.clone()),
                })
                .collect(),
        }
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("serializing migration plan")
    }

    /// Resolve plan entries against a destination project and dataset, filling defaults.
    pub fn steps(&self, project: &str, dataset: &str) -> Vec<MigrationStep> {
        self.steps
            .iter()
            .map(|entry| {
                let mut step =
                    MigrationStep::new(TableRef::new(project, dataset, &entry.table), &entry.source_column);
                if let Some(derived) = &entry.derived_column {
                    step.derived_column = derived.clone();
                }
                if let Some(rule) = &entry.parse_rule {
                    step.parse_rule = rule.clone();
                }
                step
            })
            .collect()
    }
}

pub fn looks_like_date_column(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.contains("DATE") || upper.ends_with("_DT") || upper.ends_with("_DTE") || upper.starts_with("DT_")
}

/// Propose date migrations for STRING columns whose names look like dates and that
/// have no typed `<name>_DATE` sibling yet.
pub fn plan_date_migrations(schema: &TableSchema) -> Vec<MigrationStep> {
    schema
        .fields
        .iter()
        .filter(|field| field.logical_type == LogicalType::String)
        .filter(|field| looks_like_date_column(&field.name))
        .filter(|field| {
            let sibling = format!("{}{DERIVED_SUFFIX}", field.name);
            !schema
                .field(&sibling)
                .map(|f| f.logical_type != LogicalType::String)
                .unwrap_or(false)
        })
        .map(|field| MigrationStep::new(schema.table.clone(), &field.name))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub table: String,
    pub source_column: String,
    pub derived_column: String,
    pub ok: bool,
    pub add_outcome: Option<AddColumnOutcome>,
    pub rows_updated: u64,
    pub distinct_values: usize,
    pub unparsable_values: Vec<String>,
    pub error: Option<String>,
}

impl MigrationResult {
    fn pending(table: &TableRef, source_column: &str, derived_column: &str) -> Self {
        Self {
            table: table.to_string(),
            source_column: source_column.to_string(),
            derived_column: derived_column.to_string(),
            ok: false,
            add_outcome: None,
            rows_updated: 0,
            distinct_values: 0,
            unparsable_values: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<MigrationResult>,
}

impl MigrationSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

pub struct SchemaMigrator {
    warehouse: Arc<dyn Warehouse>,
}

impl SchemaMigrator {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub async fn migrate(
        &self,
        table: &TableRef,
        source_column: &str,
        derived_column: &str,
        rule: &ParseRule,
    ) -> MigrationResult {
        let mut result = MigrationResult::pending(table, source_column, derived_column);
        match self
            .add_and_backfill(&mut result, table, source_column, derived_column, rule)
            .await
        {
            Ok(()) => result.ok = true,
            Err(err) => {
                warn!(
                    table = %table,
                    column = source_column,
                    error = %err,
                    "column migration failed"
                );
                result.error = Some(err.to_string());
            }
        }
        result
    }

    pub async fn apply(&self, step: &MigrationStep) -> MigrationResult {
        self.migrate(
            &step.table,
            &step.source_column,
            &step.derived_column,
            &step.parse_rule,
        )
        .await
    }

    /// Apply every step in order. A failing column never stops the others.
    pub async fn migrate_all(&self, steps: &[MigrationStep]) -> MigrationSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let span = info_span!("migration", run_id = %run_id, table = %step.table, column = %step.source_column);
            results.push(self.apply(step).instrument(span).await);
        }
        let summary = MigrationSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "migration run finished"
        );
        summary
    }

    async fn add_and_backfill(
        &self,
        result: &mut MigrationResult,
        table: &TableRef,
        source_column: &str,
        derived_column: &str,
        rule: &ParseRule,
    ) -> Result<(), MigrationError> {
        let compiled = rule.compile()?;
        let target = compiled.target();

        let schema = self.warehouse.table_schema(table).await?;
        let source = schema
            .field(source_column)
            .ok_or_else(|| MigrationError::SourceColumnMissing {
                table: table.to_string(),
                column: source_column.to_string(),
            })?;
        if source.logical_type == target {
            return Err(MigrationError::AlreadyTyped {
                column: source_column.to_string(),
                logical_type: target,
            });
        }
        if let Some(existing) = schema.field(derived_column) {
            if existing.logical_type != target {
                return Err(MigrationError::DerivedTypeMismatch {
                    column: derived_column.to_string(),
                    found: existing.logical_type,
                    expected: target,
                });
            }
        }

        let outcome = self
            .warehouse
            .add_column(table, &FieldSchema::new(derived_column, target))
            .await?;
        result.add_outcome = Some(outcome);
        info!(column = derived_column, outcome = ?outcome, "derived column ready");

        let distinct = self
            .warehouse
            .distinct_text_values(table, source_column)
            .await?;
        let mut values = Vec::with_capacity(distinct.len());
        for text in distinct {
            if RawValue::text(text.as_str()).is_missing() {
                continue;
            }
            result.distinct_values += 1;
            match compiled.parse(&text) {
                Some(parsed) => values.push((text, parsed)),
                None => result.unparsable_values.push(text),
            }
        }
        if !result.unparsable_values.is_empty() {
            warn!(
                column = source_column,
                unparsable = result.unparsable_values.len(),
                samples = ?&result.unparsable_values[..result.unparsable_values.len().min(LOGGED_SAMPLES)],
                "legacy values left null"
            );
        }

        result.rows_updated = self
            .warehouse
            .update_derived_column(
                table,
                &DerivedColumnUpdate {
                    source_column: source_column.to_string(),
                    derived_column: derived_column.to_string(),
                    target,
                    values,
                },
            )
            .await?;
        info!(
            column = source_column,
            rows_updated = result.rows_updated,
            distinct_values = result.distinct_values,
            "backfill complete"
        );
        Ok(())
    }
}
