//! Core domain model for calsync: destination schemas, loosely-typed source extracts,
//! typed record batches and the legacy parse rules used by column migrations.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod temporal;

pub use temporal::{parse_date, parse_datetime, parse_time, parse_timestamp};

pub const CRATE_NAME: &str = "calsync-core";

/// Placeholder text upstream serialization writes for a missing value.
pub const MISSING_SENTINEL: &str = "nan";

/// Canonical text layout for DATE values.
pub const DATE_TEXT_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown logical type `{0}`")]
    UnknownLogicalType(String),
    #[error("invalid table reference `{0}`, expected project.dataset.table")]
    InvalidTableRef(String),
    #[error("column `{column}` has {found} values, expected {expected}")]
    RaggedBatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid parse rule pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("parse rule target {0} is not a temporal type")]
    UnsupportedTarget(LogicalType),
}

/// Column types declared by the destination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    DateTime,
    Time,
    Bytes,
}

impl LogicalType {
    pub const ALL: [LogicalType; 9] = [
        LogicalType::String,
        LogicalType::Integer,
        LogicalType::Float,
        LogicalType::Boolean,
        LogicalType::Timestamp,
        LogicalType::Date,
        LogicalType::DateTime,
        LogicalType::Time,
        LogicalType::Bytes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogicalType::String => "STRING",
            LogicalType::Integer => "INTEGER",
            LogicalType::Float => "FLOAT",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::Date => "DATE",
            LogicalType::DateTime => "DATETIME",
            LogicalType::Time => "TIME",
            LogicalType::Bytes => "BYTES",
        }
    }

    /// Types whose coercion can turn a present value into null.
    pub fn can_lose_values(self) -> bool {
        matches!(
            self,
            LogicalType::Integer
                | LogicalType::Float
                | LogicalType::Timestamp
                | LogicalType::Date
                | LogicalType::DateTime
                | LogicalType::Time
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            LogicalType::Timestamp | LogicalType::Date | LogicalType::DateTime | LogicalType::Time
        )
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s.trim().to_ascii_uppercase().as_str() {
            "STRING" => LogicalType::String,
            "INTEGER" | "INT64" => LogicalType::Integer,
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => LogicalType::Float,
            "BOOLEAN" | "BOOL" => LogicalType::Boolean,
            "TIMESTAMP" => LogicalType::Timestamp,
            "DATE" => LogicalType::Date,
            "DATETIME" => LogicalType::DateTime,
            "TIME" => LogicalType::Time,
            "BYTES" => LogicalType::Bytes,
            _ => return Err(CoreError::UnknownLogicalType(s.to_string())),
        };
        Ok(ty)
    }
}

/// One destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Fully-qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl FromStr for TableRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        match parts.as_slice() {
            [project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(TableRef::new(*project, *dataset, *table))
            }
            _ => Err(CoreError::InvalidTableRef(s.to_string())),
        }
    }
}

/// Authoritative column list of a destination table, fetched once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableRef,
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(table: TableRef, fields: Vec<FieldSchema>) -> Self {
        Self { table, fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn name_set(&self) -> BTreeSet<String> {
        self.names().map(str::to_string).collect()
    }
}

/// An unparsed scalar as read from an extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        RawValue::Text(value.into())
    }

    /// Null, blank, NaN and the `"nan"` sentinel all count as absent.
    pub fn is_missing(&self) -> bool {
        match self {
            RawValue::Null => true,
            RawValue::Text(s) => {
                let trimmed = s.trim();
                trimmed.is_empty() || trimmed == MISSING_SENTINEL
            }
            RawValue::Int(_) => false,
            RawValue::Float(f) => f.is_nan(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub values: Vec<RawValue>,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, values: Vec<RawValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Column-major batch of loosely-typed rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecordBatch {
    columns: Vec<RawColumn>,
    row_count: usize,
}

impl RawRecordBatch {
    pub fn new(columns: Vec<RawColumn>) -> Result<Self, CoreError> {
        let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
        if let Some(ragged) = columns.iter().find(|c| c.values.len() != row_count) {
            return Err(CoreError::RaggedBatch {
                column: ragged.name.clone(),
                expected: row_count,
                found: ragged.values.len(),
            });
        }
        Ok(Self { columns, row_count })
    }

    /// Build from a header row plus row-major values.
    pub fn from_rows(headers: Vec<String>, rows: Vec<Vec<RawValue>>) -> Result<Self, CoreError> {
        let mut columns: Vec<RawColumn> = headers
            .into_iter()
            .map(|name| RawColumn::new(name, Vec::with_capacity(rows.len())))
            .collect();
        for row in rows {
            if row.len() != columns.len() {
                return Err(CoreError::RaggedBatch {
                    column: "<row>".to_string(),
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value);
            }
        }
        Self::new(columns)
    }

    pub fn columns(&self) -> &[RawColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&RawColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }
}

/// A value coerced to its destination logical type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    DateTime(NaiveDateTime),
    /// Always `YYYY-MM-DD`.
    Date(String),
    Time(NaiveTime),
    Bytes(Vec<u8>),
}

impl TypedValue {
    pub fn date(date: NaiveDate) -> Self {
        TypedValue::Date(date.format(DATE_TEXT_FORMAT).to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    /// Text form used by the cleaned sidecar; null renders empty.
    pub fn render(&self) -> String {
        match self {
            TypedValue::Null => String::new(),
            TypedValue::String(s) | TypedValue::Date(s) => s.clone(),
            TypedValue::Integer(i) => i.to_string(),
            TypedValue::Float(f) => f.to_string(),
            TypedValue::Boolean(b) => (if *b { "True" } else { "False" }).to_string(),
            TypedValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            TypedValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            TypedValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            TypedValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl From<RawValue> for TypedValue {
    fn from(value: RawValue) -> Self {
        match value {
            RawValue::Null => TypedValue::Null,
            RawValue::Text(s) => TypedValue::String(s),
            RawValue::Int(i) => TypedValue::Integer(i),
            RawValue::Float(f) => TypedValue::Float(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Declared by the destination schema and coerced to this type.
    Typed(LogicalType),
    /// Unknown to the destination; carried through unchanged.
    Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub values: Vec<TypedValue>,
}

impl TypedColumn {
    pub fn non_null_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_null()).count()
    }
}

/// Coerced batch. Built once by the coercion engine and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRecordBatch {
    columns: Vec<TypedColumn>,
    missing_columns: Vec<String>,
    row_count: usize,
}

impl TypedRecordBatch {
    pub fn new(
        columns: Vec<TypedColumn>,
        missing_columns: Vec<String>,
        row_count: usize,
    ) -> Result<Self, CoreError> {
        if let Some(ragged) = columns.iter().find(|c| c.values.len() != row_count) {
            return Err(CoreError::RaggedBatch {
                column: ragged.name.clone(),
                expected: row_count,
                found: ragged.values.len(),
            });
        }
        Ok(Self {
            columns,
            missing_columns,
            row_count,
        })
    }

    pub fn columns(&self) -> &[TypedColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&TypedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Columns coerced to a destination type, in source order.
    pub fn typed_columns(&self) -> impl Iterator<Item = (&TypedColumn, LogicalType)> {
        self.columns.iter().filter_map(|c| match c.kind {
            ColumnKind::Typed(ty) => Some((c, ty)),
            ColumnKind::Extra => None,
        })
    }

    pub fn extra_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Extra)
            .map(|c| c.name.as_str())
    }

    pub fn missing_columns(&self) -> &[String] {
        &self.missing_columns
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }
}

/// Where an extract's rows come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractPayload {
    Rows(RawRecordBatch),
    /// Loaded only when the orchestrator reaches this extract.
    Csv(PathBuf),
}

/// One discovered batch of source rows (normally one downloaded file).
#[derive(Debug, Clone, PartialEq)]
pub struct SourceExtract {
    pub id: Uuid,
    pub origin: String,
    pub table: String,
    pub created_on: NaiveDate,
    pub already_processed: bool,
    pub payload: ExtractPayload,
}

impl SourceExtract {
    pub fn from_rows(
        origin: impl Into<String>,
        table: impl Into<String>,
        created_on: NaiveDate,
        batch: RawRecordBatch,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            table: table.into(),
            created_on,
            already_processed: false,
            payload: ExtractPayload::Rows(batch),
        }
    }
}

/// Textual layout of a legacy-encoded column: a regex whose first capture group (or whole
/// match) is handed to a chrono format string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseRule {
    pub pattern: String,
    pub format: String,
    pub target: LogicalType,
}

impl ParseRule {
    /// `M/D/YYYY` prefix of strings like `1/5/2024 12:00:00 AM`.
    pub fn legacy_us_date() -> Self {
        Self {
            pattern: r"^(\d+/\d+/\d+)".to_string(),
            format: "%m/%d/%Y".to_string(),
            target: LogicalType::Date,
        }
    }

    pub fn compile(&self) -> Result<CompiledParseRule, CoreError> {
        if !self.target.is_temporal() {
            return Err(CoreError::UnsupportedTarget(self.target));
        }
        let regex = Regex::new(&self.pattern).map_err(|source| CoreError::InvalidPattern {
            pattern: self.pattern.clone(),
            source,
        })?;
        Ok(CompiledParseRule {
            regex,
            format: self.format.clone(),
            target: self.target,
        })
    }
}

impl Default for ParseRule {
    fn default() -> Self {
        Self::legacy_us_date()
    }
}

#[derive(Debug, Clone)]
pub struct CompiledParseRule {
    regex: Regex,
    format: String,
    target: LogicalType,
}

impl CompiledParseRule {
    pub fn target(&self) -> LogicalType {
        self.target
    }

    pub fn parse(&self, text: &str) -> Option<TypedValue> {
        let caps = self.regex.captures(text.trim())?;
        let fragment = caps.get(1).or_else(|| caps.get(0))?.as_str();
        match self.target {
            LogicalType::Date => NaiveDate::parse_from_str(fragment, &self.format)
                .ok()
                .map(TypedValue::date),
            LogicalType::DateTime => NaiveDateTime::parse_from_str(fragment, &self.format)
                .ok()
                .map(TypedValue::DateTime),
            LogicalType::Timestamp => NaiveDateTime::parse_from_str(fragment, &self.format)
                .ok()
                .map(|dt| TypedValue::Timestamp(dt.and_utc())),
            LogicalType::Time => NaiveTime::parse_from_str(fragment, &self.format)
                .ok()
                .map(TypedValue::Time),
            _ => None,
        }
    }
}
