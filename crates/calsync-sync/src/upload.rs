use std::sync::Arc;

use calsync_core::{TableRef, TypedRecordBatch};
use calsync_storage::Warehouse;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadResult {
    pub ok: bool,
    pub rows_written: u64,
    pub error: Option<String>,
}

/// Append-only writer. One call per extract, no retries.
#[derive(Clone)]
pub struct Uploader {
    warehouse: Arc<dyn Warehouse>,
}

impl Uploader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub async fn upload(&self, batch: &TypedRecordBatch, table: &TableRef) -> UploadResult {
        match self.warehouse.append_rows(table, batch).await {
            Ok(rows_written) => {
                info!(table = %table, rows_written, "appended batch");
                UploadResult {
                    ok: true,
                    rows_written,
                    error: None,
                }
            }
            Err(err) => {
                error!(table = %table, error = %err, "upload failed");
                UploadResult {
                    ok: false,
                    rows_written: 0,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
