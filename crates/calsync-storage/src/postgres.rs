//! Postgres-backed warehouse. A `TableRef`'s dataset maps to a schema; the connection
//! string selects the database, so the project part is informational only.

use async_trait::async_trait;
use calsync_core::{FieldSchema, LogicalType, TableRef, TableSchema, TypedRecordBatch, TypedValue};
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{AddColumnOutcome, DerivedColumnUpdate, Warehouse, WarehouseError};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

const DUPLICATE_COLUMN: &str = "42701";

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn pg_type(ty: LogicalType) -> &'static str {
    match ty {
        LogicalType::String => "text",
        LogicalType::Integer => "bigint",
        LogicalType::Float => "double precision",
        LogicalType::Boolean => "boolean",
        LogicalType::Timestamp => "timestamptz",
        LogicalType::Date => "date",
        LogicalType::DateTime => "timestamp",
        LogicalType::Time => "time",
        LogicalType::Bytes => "bytea",
    }
}

/// Map `information_schema.columns.data_type` onto a logical type.
pub(crate) fn logical_type_from_pg(data_type: &str) -> Option<LogicalType> {
    let ty = match data_type {
        "text" | "character varying" | "character" | "name" => LogicalType::String,
        "bigint" | "integer" | "smallint" => LogicalType::Integer,
        "double precision" | "real" | "numeric" => LogicalType::Float,
        "boolean" => LogicalType::Boolean,
        "timestamp with time zone" => LogicalType::Timestamp,
        "timestamp without time zone" => LogicalType::DateTime,
        "date" => LogicalType::Date,
        "time without time zone" => LogicalType::Time,
        "bytea" => LogicalType::Bytes,
        _ => return None,
    };
    Some(ty)
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.dataset), quote_ident(&table.table))
}

fn push_typed(row: &mut Separated<'_, '_, Postgres, &'static str>, value: &TypedValue, ty: LogicalType) {
    match value {
        TypedValue::Null => row.push_bind(None::<String>),
        TypedValue::String(s) | TypedValue::Date(s) => row.push_bind(s.clone()),
        TypedValue::Integer(i) => row.push_bind(*i),
        TypedValue::Float(f) => row.push_bind(*f),
        TypedValue::Boolean(b) => row.push_bind(*b),
        TypedValue::Timestamp(ts) => row.push_bind(*ts),
        TypedValue::DateTime(dt) => row.push_bind(*dt),
        TypedValue::Time(t) => row.push_bind(*t),
        TypedValue::Bytes(bytes) => row.push_bind(bytes.clone()),
    };
    row.push_unseparated(format!("::{}", pg_type(ty)));
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ping(&self) -> Result<(), WarehouseError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<TableSchema, WarehouseError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name,
                   data_type::text AS data_type,
                   is_nullable::text AS is_nullable
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(WarehouseError::TableNotFound(table.to_string()));
        }

        let mut fields = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            let is_nullable: String = row.try_get("is_nullable")?;
            let logical_type =
                logical_type_from_pg(&data_type).ok_or_else(|| WarehouseError::UnsupportedType {
                    column: name.clone(),
                    data_type: data_type.clone(),
                })?;
            fields.push(FieldSchema {
                name,
                logical_type,
                nullable: is_nullable == "YES",
            });
        }
        debug!(table = %table, columns = fields.len(), "fetched destination schema");
        Ok(TableSchema::new(table.clone(), fields))
    }

    async fn append_rows(
        &self,
        table: &TableRef,
        batch: &TypedRecordBatch,
    ) -> Result<u64, WarehouseError> {
        let columns: Vec<_> = batch.typed_columns().collect();
        if columns.is_empty() || batch.row_count() == 0 {
            return Ok(0);
        }

        let chunk_rows = (MAX_BIND_PARAMS / columns.len()).max(1);
        let column_list = columns
            .iter()
            .map(|(c, _)| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        let mut start = 0usize;
        while start < batch.row_count() {
            let end = (start + chunk_rows).min(batch.row_count());
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", qualified(table), column_list));
            qb.push_values(start..end, |mut row, idx| {
                for (column, ty) in &columns {
                    push_typed(&mut row, &column.values[idx], *ty);
                }
            });
            let result = qb.build().execute(&mut *tx).await?;
            written += result.rows_affected();
            start = end;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn add_column(
        &self,
        table: &TableRef,
        field: &FieldSchema,
    ) -> Result<AddColumnOutcome, WarehouseError> {
        let schema = self.table_schema(table).await?;
        if schema.field(&field.name).is_some() {
            return Ok(AddColumnOutcome::AlreadyExists);
        }

        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            qualified(table),
            quote_ident(&field.name),
            pg_type(field.logical_type)
        );
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => {
                info!(table = %table, column = %field.name, "added column");
                Ok(AddColumnOutcome::Added)
            }
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(DUPLICATE_COLUMN) => {
                Ok(AddColumnOutcome::AlreadyExists)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn distinct_text_values(
        &self,
        table: &TableRef,
        column: &str,
    ) -> Result<Vec<String>, WarehouseError> {
        let col = quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT {col}::text AS value FROM {} WHERE {col} IS NOT NULL",
            qualified(table)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("value").map_err(WarehouseError::from))
            .collect()
    }

    async fn update_derived_column(
        &self,
        table: &TableRef,
        update: &DerivedColumnUpdate,
    ) -> Result<u64, WarehouseError> {
        if update.values.is_empty() {
            return Ok(0);
        }
        let (sources, parsed): (Vec<String>, Vec<String>) = update
            .values
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(source, value)| (source.clone(), value.render()))
            .unzip();

        let sql = format!(
            "UPDATE {} AS t SET {derived} = m.parsed::{ty} \
             FROM UNNEST($1::text[], $2::text[]) AS m(source_value, parsed) \
             WHERE t.{source}::text = m.source_value",
            qualified(table),
            derived = quote_ident(&update.derived_column),
            ty = pg_type(update.target),
            source = quote_ident(&update.source_column),
        );
        let result = sqlx::query(&sql)
            .bind(sources)
            .bind(parsed)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_logical_type_survives_the_pg_round_trip() {
        for ty in LogicalType::ALL {
            let pg = pg_type(ty);
            let back = match pg {
                "timestamptz" => logical_type_from_pg("timestamp with time zone"),
                "timestamp" => logical_type_from_pg("timestamp without time zone"),
                "time" => logical_type_from_pg("time without time zone"),
                other => logical_type_from_pg(other),
            };
            assert_eq!(back, Some(ty), "{pg}");
        }
        assert_eq!(logical_type_from_pg("jsonb"), None);
    }

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("RPT_DATE"), "\"RPT_DATE\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        let table = TableRef::new("ca-lobby", "ca_lobby", "lexp_cd");
        assert_eq!(qualified(&table), "\"ca_lobby\".\"lexp_cd\"");
    }
}
