use calsync_core::{CoreError, LogicalType};
use calsync_sources::SourceError;
use calsync_storage::WarehouseError;
use thiserror::Error;

/// Run-level failures. Everything that goes wrong inside a single extract is recorded
/// on its outcome instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot resolve destination schema for {table}: {source}")]
    Discovery {
        table: String,
        #[source]
        source: WarehouseError,
    },
    #[error("cannot list extracts: {0}")]
    ExtractListing(#[from] SourceError),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("loading extract: {0}")]
    Load(#[from] SourceError),
    #[error("coercing extract: {0}")]
    Coercion(#[from] CoreError),
    #[error("missing required columns: {}", .0.join(", "))]
    Validation(Vec<String>),
    #[error("upload failed: {0}")]
    Upload(String),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("source column `{column}` not found in {table}")]
    SourceColumnMissing { table: String, column: String },
    #[error("column `{column}` is already {logical_type}")]
    AlreadyTyped {
        column: String,
        logical_type: LogicalType,
    },
    #[error("derived column `{column}` exists as {found}, expected {expected}")]
    DerivedTypeMismatch {
        column: String,
        found: LogicalType,
        expected: LogicalType,
    },
    #[error("invalid parse rule: {0}")]
    InvalidRule(#[from] CoreError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}
