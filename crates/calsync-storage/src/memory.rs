//! In-process warehouse used by tests and local dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use calsync_core::{FieldSchema, TableRef, TableSchema, TypedRecordBatch, TypedValue};

use crate::{AddColumnOutcome, DerivedColumnUpdate, Warehouse, WarehouseError};

pub type MemoryRow = BTreeMap<String, TypedValue>;

#[derive(Debug, Default)]
struct MemoryTable {
    fields: Vec<FieldSchema>,
    rows: Vec<MemoryRow>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<BTreeMap<TableRef, MemoryTable>>,
    append_failures: Mutex<HashMap<TableRef, String>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<TableRef, MemoryTable>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_table(&self, table: TableRef, fields: Vec<FieldSchema>) {
        self.tables().insert(
            table,
            MemoryTable {
                fields,
                rows: Vec::new(),
            },
        );
    }

    /// Insert rows as-is, bypassing append checks. Used to stage legacy data.
    pub fn seed_rows(&self, table: &TableRef, rows: Vec<MemoryRow>) -> Result<(), WarehouseError> {
        let mut tables = self.tables();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        entry.rows.extend(rows);
        Ok(())
    }

    pub fn rows(&self, table: &TableRef) -> Vec<MemoryRow> {
        self.tables()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &TableRef) -> usize {
        self.tables().get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Make every later append to `table` fail with `message`.
    pub fn fail_appends_to(&self, table: &TableRef, message: impl Into<String>) {
        self.append_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(table.clone(), message.into());
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ping(&self) -> Result<(), WarehouseError> {
        Ok(())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<TableSchema, WarehouseError> {
        self.tables()
            .get(table)
            .map(|t| TableSchema::new(table.clone(), t.fields.clone()))
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))
    }

    async fn append_rows(
        &self,
        table: &TableRef,
        batch: &TypedRecordBatch,
    ) -> Result<u64, WarehouseError> {
        if let Some(message) = self
            .append_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(table)
        {
            return Err(WarehouseError::Message(message.clone()));
        }

        let mut tables = self.tables();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;

        let mut staged = Vec::with_capacity(batch.row_count());
        for row_idx in 0..batch.row_count() {
            let mut row = MemoryRow::new();
            for field in &entry.fields {
                let value = batch
                    .column(&field.name)
                    .filter(|c| matches!(c.kind, calsync_core::ColumnKind::Typed(_)))
                    .map(|c| c.values[row_idx].clone())
                    .unwrap_or(TypedValue::Null);
                if value.is_null() && !field.nullable {
                    return Err(WarehouseError::NullViolation {
                        table: table.to_string(),
                        column: field.name.clone(),
                    });
                }
                row.insert(field.name.clone(), value);
            }
            staged.push(row);
        }

        // All-or-nothing, like a load job.
        let written = staged.len() as u64;
        entry.rows.extend(staged);
        Ok(written)
    }

    async fn add_column(
        &self,
        table: &TableRef,
        field: &FieldSchema,
    ) -> Result<AddColumnOutcome, WarehouseError> {
        let mut tables = self.tables();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        if entry.fields.iter().any(|f| f.name == field.name) {
            return Ok(AddColumnOutcome::AlreadyExists);
        }
        entry.fields.push(FieldSchema {
            nullable: true,
            ..field.clone()
        });
        for row in &mut entry.rows {
            row.insert(field.name.clone(), TypedValue::Null);
        }
        Ok(AddColumnOutcome::Added)
    }

    async fn distinct_text_values(
        &self,
        table: &TableRef,
        column: &str,
    ) -> Result<Vec<String>, WarehouseError> {
        let tables = self.tables();
        let entry = tables
            .get(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        if !entry.fields.iter().any(|f| f.name == column) {
            return Err(WarehouseError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        let mut values: Vec<String> = entry
            .rows
            .iter()
            .filter_map(|row| row.get(column))
            .filter(|v| !v.is_null())
            .map(TypedValue::render)
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn update_derived_column(
        &self,
        table: &TableRef,
        update: &DerivedColumnUpdate,
    ) -> Result<u64, WarehouseError> {
        let mut tables = self.tables();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        for column in [&update.source_column, &update.derived_column] {
            if !entry.fields.iter().any(|f| &f.name == column) {
                return Err(WarehouseError::ColumnNotFound {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }

        let parsed: HashMap<&str, &TypedValue> = update
            .values
            .iter()
            .map(|(source, value)| (source.as_str(), value))
            .collect();
        let mut updated = 0u64;
        for row in &mut entry.rows {
            let Some(source) = row.get(&update.source_column).filter(|v| !v.is_null()) else {
                continue;
            };
            if let Some(value) = parsed.get(source.render().as_str()) {
                row.insert(update.derived_column.clone(), (*value).clone());
                updated += 1;
            }
        }
        Ok(updated)
    }
}
