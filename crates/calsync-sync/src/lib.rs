//! Sync pipeline: discover dated extracts, run the orchestrator per destination table and
//! write run reports. Also hosts the column migration entry points and the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use calsync_core::{SourceExtract, TableRef};
use calsync_sources::{DatedDirectoryDiscovery, ExtractDiscovery};
use calsync_storage::{PgWarehouse, Warehouse};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod coerce;
pub mod config;
pub mod error;
pub mod migrate;
pub mod orchestrator;
pub mod report;
pub mod upload;
pub mod validate;

pub use coerce::{coerce, coerce_column, CoercionCounts, CoercionReport};
pub use config::SyncConfig;
pub use error::{ExtractError, MigrationError, SyncError};
pub use migrate::{
    plan_date_migrations, MigrationPlan, MigrationResult, MigrationStep, MigrationSummary,
    SchemaMigrator,
};
pub use orchestrator::{ExtractOutcome, ExtractState, RunSummary, SkipReason, SyncOrchestrator};
pub use upload::{UploadResult, Uploader};
pub use validate::{validate, validate_against_destination, ValidationResult};

pub const CRATE_NAME: &str = "calsync-sync";

/// A table whose run never started because its schema could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub tables: Vec<RunSummary>,
    pub table_failures: Vec<TableFailure>,
    pub reports_dir: Option<PathBuf>,
}

impl PipelineRunSummary {
    pub fn uploaded(&self) -> usize {
        self.tables.iter().map(RunSummary::uploaded).sum()
    }

    pub fn skipped(&self) -> usize {
        self.tables.iter().map(RunSummary::skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.tables.iter().map(RunSummary::failed).sum()
    }

    pub fn rows_written(&self) -> u64 {
        self.tables.iter().map(RunSummary::rows_written).sum()
    }
}

/// Split discovered extracts per destination table, keeping discovery order.
fn group_by_table(extracts: Vec<SourceExtract>) -> Vec<(String, Vec<SourceExtract>)> {
    let mut groups: Vec<(String, Vec<SourceExtract>)> = Vec::new();
    for extract in extracts {
        match groups.iter_mut().find(|(table, _)| *table == extract.table) {
            Some((_, members)) => members.push(extract),
            None => groups.push((extract.table.clone(), vec![extract])),
        }
    }
    groups
}

pub struct SyncPipeline {
    config: SyncConfig,
    warehouse: Arc<dyn Warehouse>,
    discovery: Option<Box<dyn ExtractDiscovery>>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            config,
            warehouse,
            discovery: None,
            run_lock: Mutex::new(()),
        }
    }

    /// Replace the dated download-directory scan.
    pub fn with_discovery(mut self, discovery: Box<dyn ExtractDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn table_ref(&self, table: &str) -> TableRef {
        TableRef::new(&self.config.project_id, &self.config.dataset, table)
    }

    async fn discover(&self, run_date: NaiveDate) -> Result<Vec<SourceExtract>, SyncError> {
        let extracts = match &self.discovery {
            Some(discovery) => discovery.discover().await?,
            None => {
                DatedDirectoryDiscovery::new(&self.config.download_dir, run_date)
                    .discover()
                    .await?
            }
        };
        Ok(extracts)
    }

    /// One full pass. Runs never overlap; a second caller waits for the first to finish.
    pub async fn run_once(&self, dry_run: bool) -> Result<PipelineRunSummary> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let run_date = self.config.effective_run_date();

        let extracts = self.discover(run_date).await?;
        info!(run_id = %run_id, %run_date, extracts = extracts.len(), dry_run, "sync pass starting");

        let orchestrator = SyncOrchestrator::new(self.warehouse.clone()).with_run_id(run_id);
        let mut tables = Vec::new();
        let mut table_failures = Vec::new();
        for (table_name, members) in group_by_table(extracts) {
            let table = self.table_ref(&table_name);
            match orchestrator.run(&table, members, dry_run).await {
                Ok(summary) => tables.push(summary),
                Err(err) => {
                    error!(table = %table, error = %err, "table skipped for this run");
                    table_failures.push(TableFailure {
                        table: table.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let summary = PipelineRunSummary {
            run_id,
            run_date,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            tables,
            table_failures,
            reports_dir: Some(self.config.reports_dir.join(run_id.to_string())),
        };
        report::write_run_reports(&self.config.reports_dir, &summary).await?;
        info!(
            run_id = %run_id,
            uploaded = summary.uploaded(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "sync pass finished"
        );
        Ok(summary)
    }

    pub async fn run_migrations(&self, plan_path: &Path) -> Result<MigrationSummary> {
        let plan = MigrationPlan::load(plan_path)?;
        let steps = plan.steps(&self.config.project_id, &self.config.dataset);
        info!(plan = %plan_path.display(), steps = steps.len(), "applying migration plan");
        let summary = SchemaMigrator::new(self.warehouse.clone())
            .migrate_all(&steps)
            .await;
        report::write_migration_reports(&self.config.reports_dir, &summary).await?;
        Ok(summary)
    }

    /// Propose a migration plan for the date-like text columns of `table`.
    pub async fn analyze(&self, table: &str) -> Result<MigrationPlan> {
        let table = self.table_ref(table);
        let schema = self
            .warehouse
            .table_schema(&table)
            .await
            .with_context(|| format!("reading schema of {table}"))?;
        Ok(MigrationPlan::from_steps(&plan_date_migrations(&schema)))
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(false).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        uploaded = summary.uploaded(),
                        failed = summary.failed(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn connect_warehouse(config: &SyncConfig) -> Result<Arc<dyn Warehouse>> {
    let warehouse = PgWarehouse::connect(&config.database_url)
        .await
        .context("connecting to warehouse")?;
    warehouse.ping().await.context("pinging warehouse")?;
    Ok(Arc::new(warehouse))
}

pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env()?;
    let warehouse = connect_warehouse(&config).await?;
    Ok(SyncPipeline::new(config, warehouse))
}

pub async fn run_sync_once_from_env(dry_run: bool) -> Result<PipelineRunSummary> {
    pipeline_from_env().await?.run_once(dry_run).await
}

pub async fn run_migrations_from_env(plan: Option<PathBuf>) -> Result<MigrationSummary> {
    let pipeline = pipeline_from_env().await?;
    let plan = plan.unwrap_or_else(|| pipeline.config().migration_plan.clone());
    pipeline.run_migrations(&plan).await
}

pub async fn analyze_from_env(table: &str) -> Result<MigrationPlan> {
    pipeline_from_env().await?.analyze(table).await
}

pub async fn run_scheduler_from_env() -> Result<()> {
    let pipeline = Arc::new(pipeline_from_env().await?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        bail!("scheduler disabled, set CALSYNC_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config().sync_cron, "scheduler running, ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{FieldSchema, LogicalType, RawRecordBatch, RawValue};
    use calsync_sources::StaticDiscovery;
    use calsync_storage::MemoryWarehouse;

    fn config(reports_dir: PathBuf) -> SyncConfig {
        SyncConfig {
            database_url: "postgres://unused".into(),
            project_id: "ca-lobby".into(),
            dataset: "ca_lobby".into(),
            download_dir: PathBuf::from("./unused"),
            run_date: NaiveDate::from_ymd_opt(2025, 5, 14),
            reports_dir,
            migration_plan: PathBuf::from("./migrations.yaml"),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".into(),
        }
    }

    fn extract(table: &str, origin: &str) -> SourceExtract {
        let batch = RawRecordBatch::from_rows(
            vec!["FILING_ID".into()],
            vec![vec![RawValue::text("1")], vec![RawValue::text("2")]],
        )
        .unwrap();
        SourceExtract::from_rows(origin, table, NaiveDate::from_ymd_opt(2025, 5, 14).unwrap(), batch)
    }

    #[test]
    fn grouping_keeps_first_seen_table_order() {
        let groups = group_by_table(vec![
            extract("lexp_cd", "a"),
            extract("filername_cd", "b"),
            extract("lexp_cd", "c"),
        ]);
        let shape: Vec<_> = groups
            .iter()
            .map(|(t, members)| (t.as_str(), members.len()))
            .collect();
        assert_eq!(shape, vec![("lexp_cd", 2), ("filername_cd", 1)]);
    }

    #[tokio::test]
    async fn unknown_table_does_not_block_the_others() {
        let reports = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let known = TableRef::new("ca-lobby", "ca_lobby", "lexp_cd");
        warehouse.create_table(known.clone(), vec![FieldSchema::new("FILING_ID", LogicalType::Integer)]);

        let pipeline = SyncPipeline::new(config(reports.path().to_path_buf()), warehouse.clone())
            .with_discovery(Box::new(StaticDiscovery::new(vec![
                extract("missing_cd", "a"),
                extract("lexp_cd", "b"),
            ])));
        let summary = pipeline.run_once(false).await.unwrap();

        assert_eq!(summary.table_failures.len(), 1);
        assert_eq!(summary.table_failures[0].table, "ca-lobby.ca_lobby.missing_cd");
        assert_eq!(summary.uploaded(), 1);
        assert_eq!(warehouse.row_count(&known), 2);

        let run_dir = reports.path().join(summary.run_id.to_string());
        assert_eq!(summary.reports_dir.as_deref(), Some(run_dir.as_path()));
        for file in [
            "run_summary.json",
            "run_brief.md",
            "snapshots/extract_outcomes.parquet",
            "snapshots/coercion_reports.parquet",
            "snapshots/manifest.json",
        ] {
            assert!(run_dir.join(file).exists(), "{file}");
        }
    }

    #[tokio::test]
    async fn analyze_proposes_plan_for_date_like_text() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.create_table(
            TableRef::new("ca-lobby", "ca_lobby", "filername_cd"),
            vec![
                FieldSchema::new("FILER_ID", LogicalType::Integer),
                FieldSchema::new("EFFECT_DT", LogicalType::String),
            ],
        );
        let pipeline = SyncPipeline::new(config(PathBuf::from("./unused")), warehouse);

        let plan = pipeline.analyze("filername_cd").await.unwrap();
        let yaml = plan.to_yaml().unwrap();

        assert_eq!(plan.steps.len(), 1);
        assert!(yaml.contains("source_column: EFFECT_DT"));
        assert!(yaml.contains("derived_column: EFFECT_DT_DATE"));
        assert!(!yaml.contains("parse_rule"));
    }
}
