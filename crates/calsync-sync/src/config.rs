use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

/// Credentials file referenced by `CREDENTIALS_LOCATION`. Values only fill settings the
/// environment leaves unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl CredentialsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing credentials {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub project_id: String,
    pub dataset: String,
    pub download_dir: PathBuf,
    /// Pinned run date. Unset means "today" at the time each run starts.
    pub run_date: Option<NaiveDate>,
    pub reports_dir: PathBuf,
    pub migration_plan: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let credentials = match var("CREDENTIALS_LOCATION") {
            Some(path) => CredentialsFile::load(Path::new(&path))?,
            None => CredentialsFile::default(),
        };

        let Some(database_url) = var("DATABASE_URL").or(credentials.database_url) else {
            bail!("DATABASE_URL is not set and no credentials file provides one");
        };

        let run_date = var("CALSYNC_RUN_DATE")
            .map(|raw| {
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .with_context(|| format!("CALSYNC_RUN_DATE `{raw}` is not YYYY-MM-DD"))
            })
            .transpose()?;

        Ok(Self {
            database_url,
            project_id: var("CALSYNC_PROJECT_ID")
                .or(credentials.project_id)
                .unwrap_or_else(|| "ca-lobby".to_string()),
            dataset: var("CALSYNC_DATASET").unwrap_or_else(|| "ca_lobby".to_string()),
            download_dir: var("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./downloaded_files")),
            run_date,
            reports_dir: var("CALSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            migration_plan: var("CALSYNC_MIGRATION_PLAN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./migrations.yaml")),
            scheduler_enabled: var("CALSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("CALSYNC_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        })
    }

    pub fn effective_run_date(&self) -> NaiveDate {
        self.run_date.unwrap_or_else(|| Utc::now().date_naive())
    }
}
