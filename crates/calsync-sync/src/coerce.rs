//! Schema coercion: turn loosely-typed extract columns into the destination's types.
//!
//! Unparsable values become nulls. Loss is measured per column by comparing non-null
//! counts before and after, and is only ever reported, never raised.

use calsync_core::{
    parse_date, parse_datetime, parse_time, parse_timestamp, ColumnKind, CoreError, LogicalType,
    RawRecordBatch, RawValue, TableSchema, TypedColumn, TypedRecordBatch, TypedValue,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const TRUTHY: &[&str] = &["true", "t", "yes", "y", "1"];
const FALSY: &[&str] = &["false", "f", "no", "n", "0", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoercionCounts {
    pub original_non_null: usize,
    pub coerced_non_null: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoercionReport {
    pub column: String,
    pub logical_type: LogicalType,
    pub original_non_null_count: usize,
    pub coerced_non_null_count: usize,
    pub loss_count: usize,
    pub loss_percent: f64,
}

impl CoercionReport {
    pub fn new(column: impl Into<String>, logical_type: LogicalType, counts: CoercionCounts) -> Self {
        let loss_count = counts
            .original_non_null
            .saturating_sub(counts.coerced_non_null);
        let loss_percent = if counts.original_non_null == 0 {
            0.0
        } else {
            loss_count as f64 / counts.original_non_null as f64 * 100.0
        };
        Self {
            column: column.into(),
            logical_type,
            original_non_null_count: counts.original_non_null,
            coerced_non_null_count: counts.coerced_non_null,
            loss_count,
            loss_percent,
        }
    }

    pub fn has_loss(&self) -> bool {
        self.loss_count > 0
    }
}

fn present_text(value: &RawValue) -> Option<String> {
    if value.is_missing() {
        return None;
    }
    match value {
        RawValue::Text(s) => Some(s.trim().to_string()),
        RawValue::Int(i) => Some(i.to_string()),
        RawValue::Float(f) => Some(f.to_string()),
        RawValue::Null => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    // i64::MAX is not representable as f64; compare against 2^63 instead.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && f >= -LIMIT && f < LIMIT).then_some(f as i64)
}

fn to_integer(value: &RawValue) -> Option<i64> {
    match value {
        RawValue::Int(i) => Some(*i),
        RawValue::Float(f) => integral(*f),
        RawValue::Text(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        RawValue::Null => None,
    }
}

fn to_float(value: &RawValue) -> Option<f64> {
    let f = match value {
        RawValue::Int(i) => *i as f64,
        RawValue::Float(f) => *f,
        RawValue::Text(s) => s.trim().parse::<f64>().ok()?,
        RawValue::Null => return None,
    };
    f.is_finite().then_some(f)
}

fn to_boolean(value: &RawValue) -> Option<bool> {
    match value {
        RawValue::Null => None,
        RawValue::Int(i) => Some(*i != 0),
        RawValue::Float(f) if f.is_nan() => None,
        RawValue::Float(f) => Some(*f != 0.0),
        RawValue::Text(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            if lowered == calsync_core::MISSING_SENTINEL {
                None
            } else if TRUTHY.contains(&lowered.as_str()) {
                Some(true)
            } else if FALSY.contains(&lowered.as_str()) {
                Some(false)
            } else {
                Some(true)
            }
        }
    }
}

fn coerce_value(value: &RawValue, logical_type: LogicalType) -> TypedValue {
    let coerced = match logical_type {
        LogicalType::String => {
            return TypedValue::String(present_text(value).unwrap_or_default());
        }
        LogicalType::Boolean => to_boolean(value).map(TypedValue::Boolean),
        LogicalType::Bytes => match value {
            RawValue::Text(s) if !value.is_missing() => Some(TypedValue::Bytes(s.as_bytes().to_vec())),
            RawValue::Int(_) | RawValue::Float(_) if !value.is_missing() => {
                Some(TypedValue::from(value.clone()))
            }
            _ => None,
        },
        LogicalType::Integer => to_integer(value).map(TypedValue::Integer),
        LogicalType::Float => to_float(value).map(TypedValue::Float),
        LogicalType::Timestamp => present_text(value)
            .and_then(|s| parse_timestamp(&s))
            .map(TypedValue::Timestamp),
        LogicalType::DateTime => present_text(value)
            .and_then(|s| parse_datetime(&s))
            .map(TypedValue::DateTime),
        LogicalType::Date => present_text(value)
            .and_then(|s| parse_date(&s))
            .map(TypedValue::date),
        LogicalType::Time => present_text(value)
            .and_then(|s| parse_time(&s))
            .map(TypedValue::Time),
    };
    coerced.unwrap_or(TypedValue::Null)
}

/// Coerce one column to `logical_type`. Pure; the input is left untouched.
pub fn coerce_column(values: &[RawValue], logical_type: LogicalType) -> (Vec<TypedValue>, CoercionCounts) {
    let original_non_null = values.iter().filter(|v| !v.is_missing()).count();
    let typed: Vec<TypedValue> = values
        .iter()
        .map(|value| {
            if value.is_missing() && logical_type != LogicalType::String && logical_type != LogicalType::Boolean {
                TypedValue::Null
            } else {
                coerce_value(value, logical_type)
            }
        })
        .collect();
    let coerced_non_null = typed.iter().filter(|v| !v.is_null()).count();
    (
        typed,
        CoercionCounts {
            original_non_null,
            coerced_non_null,
        },
    )
}

/// Coerce every column the schema knows about, carry the rest through as extras and
/// note which schema columns the batch lacks.
pub fn coerce(
    batch: &RawRecordBatch,
    schema: &TableSchema,
) -> Result<(TypedRecordBatch, Vec<CoercionReport>), CoreError> {
    let mut columns = Vec::with_capacity(batch.columns().len());
    let mut reports = Vec::new();

    for raw in batch.columns() {
        let Some(field) = schema.field(&raw.name) else {
            columns.push(TypedColumn {
                name: raw.name.clone(),
                kind: ColumnKind::Extra,
                values: raw.values.iter().cloned().map(TypedValue::from).collect(),
            });
            continue;
        };

        let (values, counts) = coerce_column(&raw.values, field.logical_type);
        if field.logical_type.can_lose_values() {
            let report = CoercionReport::new(&raw.name, field.logical_type, counts);
            if report.has_loss() {
                warn!(
                    column = %report.column,
                    logical_type = %report.logical_type,
                    loss_count = report.loss_count,
                    loss_percent = %format!("{:.1}", report.loss_percent),
                    "coercion nulled unparsable values"
                );
            }
            reports.push(report);
        }
        columns.push(TypedColumn {
            name: raw.name.clone(),
            kind: ColumnKind::Typed(field.logical_type),
            values,
        });
    }

    let missing: Vec<String> = schema
        .names()
        .filter(|name| batch.column(name).is_none())
        .map(str::to_string)
        .collect();
    debug!(
        columns = columns.len(),
        missing = missing.len(),
        rows = batch.row_count(),
        "coerced batch"
    );

    let typed = TypedRecordBatch::new(columns, missing, batch.row_count())?;
    Ok((typed, reports))
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{FieldSchema, RawColumn, TableRef};

    fn texts(values: &[&str]) -> Vec<RawValue> {
        values.iter().map(|v| RawValue::text(*v)).collect()
    }

    #[test]
    fn integer_loss_is_counted_against_well_formed_values() {
        let values = texts(&["1", "2.0", "x", "nan", "", " 42 "]);
        let (typed, counts) = coerce_column(&values, LogicalType::Integer);
        assert_eq!(
            typed,
            vec![
                TypedValue::Integer(1),
                TypedValue::Integer(2),
                TypedValue::Null,
                TypedValue::Null,
                TypedValue::Null,
                TypedValue::Integer(42),
            ]
        );
        assert_eq!(counts.original_non_null, 4);
        assert_eq!(counts.coerced_non_null, 3);
        let report = CoercionReport::new("FILING_ID", LogicalType::Integer, counts);
        assert_eq!(report.loss_count, 1);
        assert_eq!(report.loss_percent, 25.0);
    }

    #[test]
    fn string_sentinel_collapses_to_empty() {
        let (typed, _) = coerce_column(&texts(&["nan"]), LogicalType::String);
        assert_eq!(typed, vec![TypedValue::String(String::new())]);
    }

    #[test]
    fn string_blank_and_null_collapse_to_empty() {
        let (typed, _) = coerce_column(
            &[RawValue::text(""), RawValue::Null, RawValue::Int(7), RawValue::text(" Acme ")],
            LogicalType::String,
        );
        assert_eq!(
            typed,
            vec![
                TypedValue::String(String::new()),
                TypedValue::String(String::new()),
                TypedValue::String("7".into()),
                TypedValue::String("Acme".into()),
            ]
        );
    }

    #[test]
    fn float_rejects_non_finite_values() {
        let (typed, counts) = coerce_column(&texts(&["1.5", "inf", "-3"]), LogicalType::Float);
        assert_eq!(typed, vec![TypedValue::Float(1.5), TypedValue::Null, TypedValue::Float(-3.0)]);
        assert_eq!(counts.coerced_non_null, 2);
    }

    #[test]
    fn boolean_never_nulls_present_values() {
        let (typed, _) = coerce_column(
            &[
                RawValue::text("Y"),
                RawValue::text("no"),
                RawValue::text(""),
                RawValue::text("maybe"),
                RawValue::Int(0),
                RawValue::Null,
            ],
            LogicalType::Boolean,
        );
        assert_eq!(
            typed,
            vec![
                TypedValue::Boolean(true),
                TypedValue::Boolean(false),
                TypedValue::Boolean(false),
                TypedValue::Boolean(true),
                TypedValue::Boolean(false),
                TypedValue::Null,
            ]
        );
    }

    #[test]
    fn temporal_types_parse_legacy_and_iso_layouts() {
        let (dates, _) = coerce_column(&texts(&["1/5/2024 12:00:00 AM", "2024-02-29"]), LogicalType::Date);
        assert_eq!(
            dates,
            vec![TypedValue::Date("2024-01-05".into()), TypedValue::Date("2024-02-29".into())]
        );

        let (stamps, _) = coerce_column(&texts(&["2024-01-05T08:00:00-08:00"]), LogicalType::Timestamp);
        assert_eq!(stamps[0].render(), "2024-01-05T16:00:00Z");

        let (times, _) = coerce_column(&texts(&["7:30 PM", "bogus"]), LogicalType::Time);
        assert_eq!(times[0].render(), "19:30:00");
        assert!(times[1].is_null());
    }

    #[test]
    fn datetime_keeps_wall_clock_and_counts_loss() {
        let (typed, counts) = coerce_column(
            &texts(&["2024-03-01T10:00:00-08:00", "1/5/2024 12:00:00 AM", "yesterday", "nan"]),
            LogicalType::DateTime,
        );
        let at = |y, m, d, h| {
            chrono::NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap()
        };
        assert_eq!(
            typed,
            vec![
                TypedValue::DateTime(at(2024, 3, 1, 10)),
                TypedValue::DateTime(at(2024, 1, 5, 0)),
                TypedValue::Null,
                TypedValue::Null,
            ]
        );
        let report = CoercionReport::new("FILED_AT", LogicalType::DateTime, counts);
        assert_eq!(report.original_non_null_count, 3);
        assert_eq!(report.coerced_non_null_count, 2);
        assert_eq!(report.loss_count, 1);
    }

    #[test]
    fn bytes_keep_text_as_utf8() {
        let (typed, _) = coerce_column(&[RawValue::text("ab"), RawValue::Int(3)], LogicalType::Bytes);
        assert_eq!(typed, vec![TypedValue::Bytes(b"ab".to_vec()), TypedValue::Integer(3)]);
    }

    #[test]
    fn coerce_flags_extra_and_missing_columns_without_touching_input() {
        let table = TableRef::new("ca-lobby", "ca_lobby", "cvr_registration_cd");
        let schema = TableSchema::new(
            table,
            vec![
                FieldSchema::new("FILING_ID", LogicalType::Integer),
                FieldSchema::new("FILER_NAML", LogicalType::String),
                FieldSchema::new("RPT_DATE", LogicalType::Date),
            ],
        );
        let batch = RawRecordBatch::new(vec![
            RawColumn::new("FILING_ID", texts(&["1", "two"])),
            RawColumn::new("NOTES", texts(&["a", "b"])),
            RawColumn::new("FILER_NAML", texts(&["Smith", "nan"])),
        ])
        .unwrap();
        let before = batch.clone();

        let (typed, reports) = coerce(&batch, &schema).unwrap();

        assert_eq!(batch, before);
        assert_eq!(typed.extra_columns().collect::<Vec<_>>(), vec!["NOTES"]);
        assert_eq!(typed.missing_columns(), &["RPT_DATE".to_string()]);
        assert_eq!(reports.len(), 1, "only lossy types are reported");
        assert_eq!(reports[0].column, "FILING_ID");
        assert_eq!(reports[0].loss_count, 1);
        assert_eq!(
            typed.column("FILER_NAML").unwrap().values[1],
            TypedValue::String(String::new())
        );
    }
}
