//! Extract discovery and CSV loading.
//!
//! Downloads land in `<download_dir>/<YYYY-MM-DD>/<YYYY-MM-DD>_<table>.csv`. Each processed
//! input gets a `cleaned_<file>` sidecar next to it, and the sidecar's presence is the only
//! record that the input was handled.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use calsync_core::{CoreError, ExtractPayload, RawRecordBatch, RawValue, SourceExtract};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "calsync-sources";

pub const SIDECAR_PREFIX: &str = "cleaned_";

/// File-name prefixes that mark derived files rather than downloads.
const IGNORED_PREFIXES: &[&str] = &["clean", "project"];

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported extract {0}, only .csv files are accepted")]
    UnsupportedFormat(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing csv {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed extract {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: CoreError,
    },
}

/// `2025-01-01_cvr_lobby_disclosure_cd.csv` -> `cvr_lobby_disclosure_cd`.
pub fn extract_table_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.split_once('_') {
        Some((_, rest)) if !rest.is_empty() => rest.to_string(),
        _ => stem,
    }
}

pub fn sidecar_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{SIDECAR_PREFIX}{name}"))
}

pub fn is_ignored_file(file_name: &str) -> bool {
    IGNORED_PREFIXES
        .iter()
        .any(|prefix| file_name.starts_with(prefix))
}

pub fn deterministic_extract_id(table: &str, origin: &str, created_on: NaiveDate) -> Uuid {
    let key = format!("calsync:{table}:{origin}:{created_on}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// Give repeated header names pandas-style suffixes (`NAME`, `NAME.1`, ...). A suffix
/// never collides with a name already present in the header.
fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let reserved: HashSet<String> = headers.iter().cloned().collect();
    let mut emitted: HashSet<String> = HashSet::with_capacity(headers.len());
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(headers.len());
    for name in headers {
        if !emitted.contains(&name) {
            emitted.insert(name.clone());
            out.push(name);
            continue;
        }
        let suffix = next_suffix.entry(name.clone()).or_insert(1);
        let candidate = loop {
            let candidate = format!("{name}.{suffix}");
            *suffix += 1;
            if !reserved.contains(&candidate) && !emitted.contains(&candidate) {
                break candidate;
            }
        };
        emitted.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

/// Load a header-first CSV file. Cells stay text so codes with leading zeros survive;
/// empty cells become nulls.
pub fn read_csv_batch(path: &Path) -> Result<RawRecordBatch, SourceError> {
    if !is_csv(path) {
        return Err(SourceError::UnsupportedFormat(path.to_path_buf()));
    }
    let file = fs::File::open(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let csv_err = |source| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(file);
    let headers = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .enumerate()
        .map(|(idx, h)| {
            let h = if idx == 0 { h.trim_start_matches(UTF8_BOM) } else { h };
            h.trim().to_string()
        })
        .collect::<Vec<_>>();
    let headers = dedupe_headers(headers);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(
            record
                .iter()
                .map(|cell| {
                    if cell.is_empty() {
                        RawValue::Null
                    } else {
                        RawValue::text(cell)
                    }
                })
                .collect(),
        );
    }

    RawRecordBatch::from_rows(headers, rows).map_err(|source| SourceError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Materialize an extract's rows. CSV payloads are read from disk here, one extract at a time.
pub fn load_extract(extract: &SourceExtract) -> Result<RawRecordBatch, SourceError> {
    match &extract.payload {
        ExtractPayload::Rows(batch) => Ok(batch.clone()),
        ExtractPayload::Csv(path) => read_csv_batch(path),
    }
}

/// Produces the extracts a sync run should consider, in processing order.
#[async_trait]
pub trait ExtractDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<SourceExtract>, SourceError>;
}

/// Scans one dated subdirectory of the download directory.
#[derive(Debug, Clone)]
pub struct DatedDirectoryDiscovery {
    pub download_dir: PathBuf,
    pub run_date: NaiveDate,
}

impl DatedDirectoryDiscovery {
    pub fn new(download_dir: impl Into<PathBuf>, run_date: NaiveDate) -> Self {
        Self {
            download_dir: download_dir.into(),
            run_date,
        }
    }

    pub fn dated_dir(&self) -> PathBuf {
        self.download_dir
            .join(self.run_date.format("%Y-%m-%d").to_string())
    }

    /// Sorted CSV inputs of the dated directory, derived files excluded.
    pub fn candidate_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let dir = self.dated_dir();
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "no download directory for run date");
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| SourceError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() || !is_csv(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_ignored_file(&name) {
                debug!(file = %name, "skipping derived file");
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }

    fn extract_for(&self, path: PathBuf) -> SourceExtract {
        let origin = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let table = extract_table_name(&path);
        SourceExtract {
            id: deterministic_extract_id(&table, &origin, self.run_date),
            already_processed: sidecar_path_for(&path).exists(),
            origin,
            table,
            created_on: self.run_date,
            payload: ExtractPayload::Csv(path),
        }
    }
}

#[async_trait]
impl ExtractDiscovery for DatedDirectoryDiscovery {
    async fn discover(&self) -> Result<Vec<SourceExtract>, SourceError> {
        let files = self.candidate_files()?;
        debug!(count = files.len(), dir = %self.dated_dir().display(), "discovered extracts");
        Ok(files.into_iter().map(|path| self.extract_for(path)).collect())
    }
}

/// Fixed list of in-memory extracts.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    extracts: Vec<SourceExtract>,
}

impl StaticDiscovery {
    pub fn new(extracts: Vec<SourceExtract>) -> Self {
        Self { extracts }
    }
}

#[async_trait]
impl ExtractDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<SourceExtract>, SourceError> {
        Ok(self.extracts.clone())
    }
}
