//! Destination warehouse boundary plus atomic file writes for sidecars and reports.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use calsync_core::{FieldSchema, LogicalType, TableRef, TableSchema, TypedRecordBatch, TypedValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{MemoryRow, MemoryWarehouse};
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "calsync-storage";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("column `{column}` not found in {table}")]
    ColumnNotFound { table: String, column: String },
    #[error("column `{column}` has unsupported destination type `{data_type}`")]
    UnsupportedType { column: String, data_type: String },
    #[error("null value for required column `{column}` in {table}")]
    NullViolation { table: String, column: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

impl WarehouseError {
    pub fn is_table_not_found(&self) -> bool {
        matches!(self, WarehouseError::TableNotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddColumnOutcome {
    Added,
    AlreadyExists,
}

/// Parsed values to write into a derived column, keyed by the legacy source text.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedColumnUpdate {
    pub source_column: String,
    pub derived_column: String,
    pub target: LogicalType,
    pub values: Vec<(String, TypedValue)>,
}

/// The analytical store rows are synced into. Writes are append-only except for the
/// additive column migration (`add_column` + `update_derived_column`).
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Round trip used to fail fast on bad credentials.
    async fn ping(&self) -> Result<(), WarehouseError>;

    async fn table_schema(&self, table: &TableRef) -> Result<TableSchema, WarehouseError>;

    /// Append every schema-typed column of `batch`; extra columns are ignored.
    async fn append_rows(
        &self,
        table: &TableRef,
        batch: &TypedRecordBatch,
    ) -> Result<u64, WarehouseError>;

    async fn add_column(
        &self,
        table: &TableRef,
        field: &FieldSchema,
    ) -> Result<AddColumnOutcome, WarehouseError>;

    /// Distinct non-null values of `column`, rendered as text.
    async fn distinct_text_values(
        &self,
        table: &TableRef,
        column: &str,
    ) -> Result<Vec<String>, WarehouseError>;

    /// Set the derived column on every row whose source text has a parsed value.
    async fn update_derived_column(
        &self,
        table: &TableRef,
        update: &DerivedColumnUpdate,
    ) -> Result<u64, WarehouseError>;
}

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a temp file and rename, replacing any previous file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<WrittenFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_previous_content_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("2025-05-14").join("cleaned_filers.csv");

        let first = write_atomic(&path, b"A\n1\n").await.expect("first write");
        let second = write_atomic(&path, b"A\n2\n").await.expect("second write");

        assert_ne!(first.sha256, second.sha256);
        assert_eq!(std::fs::read(&path).unwrap(), b"A\n2\n");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
