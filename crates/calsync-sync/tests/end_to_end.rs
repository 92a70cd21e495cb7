use std::fs;
use std::path::Path;
use std::sync::Arc;

use calsync_core::{FieldSchema, LogicalType, TableRef, TypedValue};
use calsync_storage::{AddColumnOutcome, MemoryRow, MemoryWarehouse};
use calsync_sync::{ExtractState, SkipReason, SyncConfig, SyncPipeline};
use chrono::NaiveDate;
use tempfile::TempDir;

const RUN_DATE: &str = "2025-05-14";

fn registrations() -> TableRef {
    TableRef::new("ca-lobby", "ca_lobby", "cvr_registration_cd")
}

fn warehouse() -> Arc<MemoryWarehouse> {
    let wh = Arc::new(MemoryWarehouse::new());
    wh.create_table(
        registrations(),
        vec![
            FieldSchema::new("FILING_ID", LogicalType::Integer).required(),
            FieldSchema::new("AMEND_ID", LogicalType::Integer),
            FieldSchema::new("FILER_NAML", LogicalType::String),
            FieldSchema::new("RPT_DATE", LogicalType::Date),
            FieldSchema::new("AMOUNT", LogicalType::Float),
        ],
    );
    wh
}

struct Workspace {
    root: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(root.path().join("downloads").join(RUN_DATE)).unwrap();
        Self { root }
    }

    fn dated(&self) -> std::path::PathBuf {
        self.root.path().join("downloads").join(RUN_DATE)
    }

    fn write_extract(&self, name: &str, body: &str) {
        fs::write(self.dated().join(name), body).unwrap();
    }

    fn config(&self) -> SyncConfig {
        SyncConfig {
            database_url: "postgres://unused".into(),
            project_id: "ca-lobby".into(),
            dataset: "ca_lobby".into(),
            download_dir: self.root.path().join("downloads"),
            run_date: NaiveDate::parse_from_str(RUN_DATE, "%Y-%m-%d").ok(),
            reports_dir: self.root.path().join("reports"),
            migration_plan: self.root.path().join("migrations.yaml"),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".into(),
        }
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn one_bad_extract_does_not_stop_the_others() {
    let ws = Workspace::new();
    ws.write_extract(
        "2025-05-14_cvr_registration_cd.csv",
        "FILING_ID,AMEND_ID,FILER_NAML,RPT_DATE,AMOUNT\n1,0,Smith,1/5/2024 12:00:00 AM,10.5\n",
    );
    // Missing RPT_DATE and AMOUNT: fails validation.
    ws.write_extract(
        "2025-05-15_cvr_registration_cd.csv",
        "FILING_ID,AMEND_ID,FILER_NAML\n2,0,Jones\n",
    );
    ws.write_extract(
        "2025-05-16_cvr_registration_cd.csv",
        "FILING_ID,AMEND_ID,FILER_NAML,RPT_DATE,AMOUNT,EXTRA_COL\n3,1,Lee,2/1/2024 12:00:00 AM,nan,x\n",
    );
    let wh = warehouse();

    let summary = SyncPipeline::new(ws.config(), wh.clone())
        .run_once(false)
        .await
        .expect("run");

    let run = &summary.tables[0];
    let states: Vec<_> = run.outcomes.iter().map(|o| o.state).collect();
    assert_eq!(
        states,
        vec![ExtractState::Uploaded, ExtractState::Failed, ExtractState::Uploaded]
    );
    let failed = &run.outcomes[1];
    assert_eq!(failed.reached, ExtractState::Coerced);
    assert_eq!(
        failed.validation.as_ref().unwrap().missing_columns,
        vec!["RPT_DATE", "AMOUNT"]
    );
    assert_eq!(wh.row_count(&registrations()), 2);
    assert!(failed.sidecar.is_none());
    assert!(!ws.dated().join("cleaned_2025-05-15_cvr_registration_cd.csv").exists());

    let rows = wh.rows(&registrations());
    assert_eq!(rows[1].get("AMOUNT"), Some(&TypedValue::Null));
    assert!(!rows[1].contains_key("EXTRA_COL"));
    assert!(read(&summary.reports_dir.unwrap().join("run_brief.md")).contains("1 failed"));
}

#[tokio::test]
async fn legacy_dates_are_coerced_reported_and_written_to_the_sidecar() {
    let ws = Workspace::new();
    ws.write_extract(
        "2025-05-14_cvr_registration_cd.csv",
        "FILING_ID,AMEND_ID,FILER_NAML,RPT_DATE,AMOUNT\n\
         1,0,Smith,1/5/2024 12:00:00 AM,1\n\
         2,0,Jones,nan,2\n\
         3,0,Lee,13/99/2024,3\n",
    );
    let wh = warehouse();

    let summary = SyncPipeline::new(ws.config(), wh.clone())
        .run_once(false)
        .await
        .expect("run");

    let outcome = &summary.tables[0].outcomes[0];
    assert_eq!(outcome.state, ExtractState::Uploaded);
    assert_eq!(outcome.rows_written, 3);
    let report = outcome
        .coercion_reports
        .iter()
        .find(|r| r.column == "RPT_DATE")
        .expect("RPT_DATE report");
    assert_eq!(report.original_non_null_count, 2);
    assert_eq!(report.coerced_non_null_count, 1);
    assert_eq!(report.loss_count, 1);
    assert_eq!(format!("{:.1}", report.loss_percent), "50.0");

    let dates: Vec<_> = wh
        .rows(&registrations())
        .iter()
        .map(|row| row.get("RPT_DATE").cloned())
        .collect();
    assert_eq!(
        dates,
        vec![
            Some(TypedValue::Date("2024-01-05".into())),
            Some(TypedValue::Null),
            Some(TypedValue::Null),
        ]
    );

    let sidecar = ws.dated().join("cleaned_2025-05-14_cvr_registration_cd.csv");
    assert_eq!(outcome.sidecar.as_deref(), Some(sidecar.as_path()));
    let cleaned = read(&sidecar);
    assert!(cleaned.starts_with("FILING_ID,AMEND_ID,FILER_NAML,RPT_DATE,AMOUNT\n"));
    assert!(cleaned.contains("1,0,Smith,2024-01-05,1\n"));

    // The sidecar marks the input as handled: a rerun appends nothing.
    let rerun = SyncPipeline::new(ws.config(), wh.clone())
        .run_once(false)
        .await
        .expect("rerun");
    let again = &rerun.tables[0].outcomes[0];
    assert_eq!(again.state, ExtractState::Skipped);
    assert_eq!(again.skip_reason, Some(SkipReason::AlreadyProcessed));
    assert_eq!(wh.row_count(&registrations()), 3);
}

#[tokio::test]
async fn failed_upload_is_retried_on_the_next_run() {
    let ws = Workspace::new();
    ws.write_extract(
        "2025-05-14_cvr_registration_cd.csv",
        "FILING_ID,AMEND_ID,FILER_NAML,RPT_DATE,AMOUNT\n1,0,Smith,1/5/2024,1\n2,0,Jones,1/6/2024,2\n",
    );
    let broken = warehouse();
    broken.fail_appends_to(&registrations(), "network down");

    let first = SyncPipeline::new(ws.config(), broken.clone())
        .run_once(false)
        .await
        .expect("first run");
    let outcome = &first.tables[0].outcomes[0];
    assert_eq!(outcome.state, ExtractState::Failed);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("network down"));
    assert!(outcome.sidecar.is_none());
    assert!(!ws.dated().join("cleaned_2025-05-14_cvr_registration_cd.csv").exists());

    let healthy = warehouse();
    let second = SyncPipeline::new(ws.config(), healthy.clone())
        .run_once(false)
        .await
        .expect("second run");
    let outcome = &second.tables[0].outcomes[0];
    assert_eq!(outcome.state, ExtractState::Uploaded);
    assert_eq!(outcome.rows_written, 2);
    assert_eq!(healthy.row_count(&registrations()), 2);
    assert!(ws.dated().join("cleaned_2025-05-14_cvr_registration_cd.csv").exists());
}

#[tokio::test]
async fn dry_run_never_uploads() {
    let ws = Workspace::new();
    ws.write_extract(
        "2025-05-14_cvr_registration_cd.csv",
        "FILING_ID,AMEND_ID,FILER_NAML,RPT_DATE,AMOUNT\n1,0,Smith,1/5/2024,1\n2,0,Jones,1/6/2024,2\n",
    );
    ws.write_extract("cleaned_old.csv", "FILING_ID\n99\n");
    ws.write_extract("project_notes.csv", "FILING_ID\n98\n");
    let wh = warehouse();

    let summary = SyncPipeline::new(ws.config(), wh.clone())
        .run_once(true)
        .await
        .expect("dry run");

    assert!(summary.dry_run);
    assert_eq!(summary.tables.len(), 1);
    let outcome = &summary.tables[0].outcomes[0];
    assert_eq!(outcome.state, ExtractState::Skipped);
    assert_eq!(outcome.skip_reason, Some(SkipReason::DryRun));
    assert_eq!(outcome.would_write, Some(2));
    assert!(outcome.upload.is_none());
    assert!(outcome.sidecar.is_none());
    assert!(!ws.dated().join("cleaned_2025-05-14_cvr_registration_cd.csv").exists());
    assert_eq!(wh.row_count(&registrations()), 0);
}

#[tokio::test]
async fn missing_download_directory_is_an_empty_run() {
    let ws = Workspace::new();
    let mut config = ws.config();
    config.run_date = NaiveDate::from_ymd_opt(2031, 1, 1);

    let summary = SyncPipeline::new(config, warehouse())
        .run_once(false)
        .await
        .expect("run");

    assert!(summary.tables.is_empty());
    assert!(summary.table_failures.is_empty());
}

#[tokio::test]
async fn migration_plan_runs_twice_without_harm() {
    let ws = Workspace::new();
    let wh = Arc::new(MemoryWarehouse::new());
    let filers = TableRef::new("ca-lobby", "ca_lobby", "filername_cd");
    wh.create_table(
        filers.clone(),
        vec![
            FieldSchema::new("FILER_ID", LogicalType::Integer),
            FieldSchema::new("EFFECT_DT", LogicalType::String),
        ],
    );
    let seed = |id: i64, effect: &str| {
        MemoryRow::from([
            ("FILER_ID".to_string(), TypedValue::Integer(id)),
            ("EFFECT_DT".to_string(), TypedValue::String(effect.to_string())),
        ])
    };
    wh.seed_rows(
        &filers,
        vec![seed(1, "3/15/2019 12:00:00 AM"), seed(2, ""), seed(3, "someday")],
    )
    .unwrap();
    let plan = ws.root.path().join("migrations.yaml");
    fs::write(
        &plan,
        "version: 1\nsteps:\n  - table: filername_cd\n    source_column: EFFECT_DT\n  - table: filername_cd\n    source_column: NOPE\n",
    )
    .unwrap();
    let pipeline = SyncPipeline::new(ws.config(), wh.clone());

    let first = pipeline.run_migrations(&plan).await.expect("first");
    let second = pipeline.run_migrations(&plan).await.expect("second");

    assert!(first.results[0].ok && second.results[0].ok);
    assert!(!first.results[1].ok, "missing source column fails only its own step");
    assert_eq!(first.results[0].add_outcome, Some(AddColumnOutcome::Added));
    assert_eq!(second.results[0].add_outcome, Some(AddColumnOutcome::AlreadyExists));
    assert_eq!(second.results[0].unparsable_values, vec!["someday".to_string()]);

    let rows = wh.rows(&filers);
    assert_eq!(rows[0].get("EFFECT_DT_DATE"), Some(&TypedValue::Date("2019-03-15".into())));
    assert_eq!(rows[0].get("EFFECT_DT"), Some(&TypedValue::String("3/15/2019 12:00:00 AM".into())));

    let csv = read(
        &ws.root
            .path()
            .join("reports/migrations")
            .join(second.run_id.to_string())
            .join("migration_results.csv"),
    );
    assert!(csv.contains("EFFECT_DT,EFFECT_DT_DATE,success,AlreadyExists,1,2,1,"));
}
