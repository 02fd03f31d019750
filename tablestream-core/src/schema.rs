//! Schema evolution support: working out which columns a rejected batch needs.
//!
//! The ingestion service reports, per refused row, the columns that the table lacks and the
//! non-nullable columns the row did not fill. The types of the missing columns are inferred from
//! the JSON values of the batch itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;

use crate::ingest::InsertError;
use crate::record::Record;

/// Column type of the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Varchar,
    Number,
    Float,
    Boolean,
    Array,
    Object,
    /// Semi-structured value of unknown shape, used when only nulls were seen.
    Variant,
}

impl ColumnType {
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Null => ColumnType::Variant,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Number,
            Value::Number(_) => ColumnType::Float,
            Value::String(_) => ColumnType::Varchar,
            Value::Array(_) => ColumnType::Array,
            Value::Object(_) => ColumnType::Object,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Varchar => write!(f, "VARCHAR"),
            ColumnType::Number => write!(f, "NUMBER"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::Array => write!(f, "ARRAY"),
            ColumnType::Object => write!(f, "OBJECT"),
            ColumnType::Variant => write!(f, "VARIANT"),
        }
    }
}

/// A column to add to the destination table. New columns are always nullable, rows written
/// before the change have no value for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: ColumnType,
}

/// Changes that would let the refused rows in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SchemaChange {
    pub(crate) columns_to_add: Vec<ColumnSpec>,
    pub(crate) columns_to_relax: Vec<String>,
}

impl SchemaChange {
    pub(crate) fn is_empty(&self) -> bool {
        self.columns_to_add.is_empty() && self.columns_to_relax.is_empty()
    }

    /// Collects the schema changes requested by the `errors` of a batch made of `records`.
    pub(crate) fn from_errors(records: &[Record], errors: &[InsertError]) -> Self {
        let mut to_add: BTreeMap<String, ColumnType> = BTreeMap::new();
        let mut to_relax: BTreeSet<String> = BTreeSet::new();

        for error in errors {
            for column in &error.extra_col_names {
                if to_add.contains_key(column) {
                    continue;
                }
                let data_type = infer_column_type(records, error.row_index, column);
                to_add.insert(column.clone(), data_type);
            }
            to_relax.extend(error.missing_not_null_col_names.iter().cloned());
        }

        SchemaChange {
            columns_to_add: to_add
                .into_iter()
                .map(|(name, data_type)| ColumnSpec { name, data_type })
                .collect(),
            columns_to_relax: to_relax.into_iter().collect(),
        }
    }
}

/// Type of `column` as seen in the refused row, or in the first other row of the batch that has a
/// non-null value for it.
fn infer_column_type(records: &[Record], row_index: usize, column: &str) -> ColumnType {
    let refused = records.get(row_index).into_iter();
    refused
        .chain(records.iter())
        .filter_map(|record| lookup(record, column))
        .find(|value| !value.is_null())
        .map_or(ColumnType::Variant, ColumnType::infer)
}

/// Column names reported by the service may differ in case from the JSON keys.
fn lookup<'a>(record: &'a Record, column: &str) -> Option<&'a Value> {
    record.value.get(column).or_else(|| {
        record
            .value
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Row;
    use serde_json::json;

    fn record(offset: i64, value: Value) -> Record {
        let row: Row = match value {
            Value::Object(map) => map,
            _ => panic!("rows are objects"),
        };
        Record {
            topic: "topic".to_string(),
            partition: 0,
            offset,
            key: None,
            value: row,
            timestamp: None,
        }
    }

    #[test]
    fn test_infer_types() {
        assert_eq!(ColumnType::infer(&json!("A")), ColumnType::Varchar);
        assert_eq!(ColumnType::infer(&json!(100)), ColumnType::Number);
        assert_eq!(ColumnType::infer(&json!(0.99)), ColumnType::Float);
        assert_eq!(ColumnType::infer(&json!(true)), ColumnType::Boolean);
        assert_eq!(ColumnType::infer(&json!([1, 2])), ColumnType::Array);
        assert_eq!(ColumnType::infer(&json!({"a": 1})), ColumnType::Object);
        assert_eq!(ColumnType::infer(&Value::Null), ColumnType::Variant);
        assert_eq!(ColumnType::Float.to_string(), "FLOAT");
    }

    #[test]
    fn test_schema_change_from_errors() {
        let records = vec![
            record(0, json!({"PERFORMANCE_STRING": "Excellent", "rating_int": null})),
            record(
                1,
                json!({"PERFORMANCE_STRING": "Excellent", "PERFORMANCE_CHAR": "A", "RATING_INT": 100}),
            ),
        ];
        let errors = vec![
            InsertError::new(1, "extra columns")
                .with_extra_columns(vec!["PERFORMANCE_CHAR".to_string(), "RATING_INT".to_string()]),
            InsertError::new(0, "extra columns")
                .with_extra_columns(vec!["RATING_INT".to_string()])
                .with_missing_not_null_columns(vec!["ID".to_string()]),
        ];

        let change = SchemaChange::from_errors(&records, &errors);
        assert!(!change.is_empty());
        assert_eq!(
            change.columns_to_add,
            vec![
                ColumnSpec {
                    name: "PERFORMANCE_CHAR".to_string(),
                    data_type: ColumnType::Varchar
                },
                ColumnSpec {
                    name: "RATING_INT".to_string(),
                    data_type: ColumnType::Number
                },
            ]
        );
        assert_eq!(change.columns_to_relax, vec!["ID".to_string()]);
    }

    #[test]
    fn test_null_only_column_is_variant() {
        let records = vec![record(0, json!({"EXTRA": null}))];
        let errors =
            vec![InsertError::new(0, "extra").with_extra_columns(vec!["EXTRA".to_string()])];
        let change = SchemaChange::from_errors(&records, &errors);
        assert_eq!(change.columns_to_add[0].data_type, ColumnType::Variant);
    }

    #[test]
    fn test_plain_errors_request_nothing() {
        let records = vec![record(0, json!({"A": 1}))];
        let errors = vec![InsertError::new(0, "bad value")];
        assert!(SchemaChange::from_errors(&records, &errors).is_empty());
    }
}
