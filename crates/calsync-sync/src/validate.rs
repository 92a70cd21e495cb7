use std::collections::{BTreeMap, BTreeSet};

use calsync_core::{TableRef, TableSchema, TypedRecordBatch};
use calsync_storage::Warehouse;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{info, warn};

/// Minimum similarity for suggesting an extra column as the likely rename of a missing one.
const SUGGESTION_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub table_not_found: bool,
    pub missing_columns: Vec<String>,
    pub extra_columns: Vec<String>,
    /// Missing column -> closest extra column. Diagnostic only.
    pub suggestions: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl ValidationResult {
    fn lookup_failed(table_not_found: bool, error: String) -> Self {
        Self {
            ok: false,
            table_not_found,
            error: Some(error),
            ..Self::default()
        }
    }
}

fn suggest(missing: &[String], extra: &[String]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for name in missing {
        let best = extra
            .iter()
            .map(|candidate| {
                let score = jaro_winkler(&name.to_ascii_uppercase(), &candidate.to_ascii_uppercase());
                (candidate, score)
            })
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((candidate, _)) = best {
            out.insert(name.clone(), candidate.clone());
        }
    }
    out
}

/// Compare a coerced batch's columns with the schema. Extras are tolerated; any missing
/// schema column fails the batch.
pub fn validate(batch: &TypedRecordBatch, schema: &TableSchema) -> ValidationResult {
    let present: BTreeSet<&str> = batch.column_names().collect();
    let expected = schema.name_set();

    let missing_columns: Vec<String> = schema
        .names()
        .filter(|name| !present.contains(name))
        .map(str::to_string)
        .collect();
    let extra_columns: Vec<String> = batch
        .column_names()
        .filter(|name| !expected.contains(*name))
        .map(str::to_string)
        .collect();

    if !extra_columns.is_empty() {
        info!(table = %schema.table, extra = ?extra_columns, "batch carries columns unknown to destination");
    }
    if !missing_columns.is_empty() {
        warn!(table = %schema.table, missing = ?missing_columns, "batch lacks destination columns");
    }

    ValidationResult {
        ok: missing_columns.is_empty(),
        table_not_found: false,
        suggestions: suggest(&missing_columns, &extra_columns),
        missing_columns,
        extra_columns,
        error: None,
    }
}

/// Look the table up in the warehouse first, then validate against what it reports.
pub async fn validate_against_destination(
    warehouse: &dyn Warehouse,
    batch: &TypedRecordBatch,
    table: &TableRef,
) -> ValidationResult {
    match warehouse.table_schema(table).await {
        Ok(schema) => validate(batch, &schema),
        Err(err) if err.is_table_not_found() => {
            warn!(table = %table, "destination table not found");
            ValidationResult::lookup_failed(true, err.to_string())
        }
        Err(err) => {
            warn!(table = %table, error = %err, "destination schema lookup failed");
            ValidationResult::lookup_failed(false, err.to_string())
        }
    }
}
