//! Column-like schema inference for document collections.
//!
//! Documents arrive as relaxed extended JSON (see the MongoDB driver), so
//! BSON-specific types show up as single-key wrapper objects such as
//! `{"$oid": ...}` or `{"$date": ...}` and are classified accordingly.
//!
//! Two modes are supported:
//!
//! - [`InferenceMode::FirstDocument`] takes the field list and types from
//!   the first sampled document only. Fields that first appear in later
//!   documents are absent from the result. This is a cheap approximation.
//! - [`InferenceMode::Union`] walks the whole sample. Each field is typed
//!   from the first document that carries it, and is marked nullable when
//!   any document lacks it or holds `null`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::ColumnDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    #[default]
    FirstDocument,
    Union,
}

impl FromStr for InferenceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "first_document" => Ok(InferenceMode::FirstDocument),
            "union" => Ok(InferenceMode::Union),
            other => anyhow::bail!(
                "Unknown inference mode: '{}'. Must be first_document or union.",
                other
            ),
        }
    }
}

/// Classify a single value by its runtime shape.
pub fn classify(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "double",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(key) = map.keys().next() {
                    match key.as_str() {
                        "$oid" => return "objectId",
                        "$date" => return "date",
                        "$binary" => return "binary",
                        "$numberDecimal" => return "decimal",
                        "$numberLong" | "$numberInt" => return "integer",
                        "$numberDouble" => return "double",
                        "$timestamp" => return "timestamp",
                        "$regularExpression" => return "regex",
                        _ => {}
                    }
                }
            }
            "object"
        }
    }
}

/// Infer columns for a collection from sampled documents.
pub fn infer_columns(documents: &[Value], mode: InferenceMode) -> Vec<ColumnDescriptor> {
    match mode {
        InferenceMode::FirstDocument => documents
            .iter()
            .find_map(Value::as_object)
            .map(|first| {
                first
                    .iter()
                    .map(|(name, value)| ColumnDescriptor::new(name.clone(), classify(value)))
                    .collect()
            })
            .unwrap_or_default(),
        InferenceMode::Union => infer_union(documents),
    }
}

fn infer_union(documents: &[Value]) -> Vec<ColumnDescriptor> {
    let objects: Vec<_> = documents.iter().filter_map(Value::as_object).collect();
    let mut columns: Vec<ColumnDescriptor> = Vec::new();

    for doc in &objects {
        for (name, value) in doc.iter() {
            match columns.iter_mut().find(|c| &c.name == name) {
                Some(col) => {
                    // A field first seen as null takes the first concrete type.
                    if col.data_type == "null" && !value.is_null() {
                        col.data_type = classify(value).to_string();
                    }
                }
                None => {
                    let mut col = ColumnDescriptor::new(name.clone(), classify(value));
                    col.nullable = Some(false);
                    columns.push(col);
                }
            }
        }
    }

    for col in &mut columns {
        let missing_or_null = objects
            .iter()
            .any(|doc| doc.get(&col.name).map_or(true, Value::is_null));
        col.nullable = Some(missing_or_null);
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(cols: &[ColumnDescriptor]) -> Vec<&str> {
        cols.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_late_field_absent_in_first_document_mode() {
        let docs = vec![json!({"a": 1, "b": "x"}), json!({"a": 2, "b": "y", "c": true})];
        let cols = infer_columns(&docs, InferenceMode::FirstDocument);
        assert_eq!(names(&cols), vec!["a", "b"]);
    }

    #[test]
    fn test_late_field_present_in_union_mode() {
        let docs = vec![json!({"a": 1, "b": "x"}), json!({"a": 2, "b": "y", "c": true})];
        let cols = infer_columns(&docs, InferenceMode::Union);
        assert_eq!(names(&cols), vec!["a", "b", "c"]);
        let c = cols.iter().find(|c| c.name == "c").unwrap();
        assert_eq!(c.data_type, "boolean");
        assert_eq!(c.nullable, Some(true));
        assert_eq!(cols[0].nullable, Some(false));
    }

    #[test]
    fn test_classify_shapes() {
        assert_eq!(classify(&json!([1, 2])), "array");
        assert_eq!(classify(&json!({"street": "x"})), "object");
        assert_eq!(classify(&json!(3)), "integer");
        assert_eq!(classify(&json!(3.5)), "double");
        assert_eq!(classify(&json!("s")), "string");
        assert_eq!(classify(&json!(null)), "null");
        assert_eq!(classify(&json!({"$oid": "65f0c0ffee"})), "objectId");
        assert_eq!(classify(&json!({"$date": "2024-01-01T00:00:00Z"})), "date");
        assert_eq!(classify(&json!({"$numberDecimal": "1.10"})), "decimal");
    }

    #[test]
    fn test_type_taken_from_first_document() {
        let docs = vec![json!({"v": "text"}), json!({"v": 5})];
        let cols = infer_columns(&docs, InferenceMode::FirstDocument);
        assert_eq!(cols[0].data_type, "string");
        let cols = infer_columns(&docs, InferenceMode::Union);
        assert_eq!(cols[0].data_type, "string");
    }

    #[test]
    fn test_union_promotes_null_to_concrete_type() {
        let docs = vec![json!({"v": null}), json!({"v": [1]})];
        let cols = infer_columns(&docs, InferenceMode::Union);
        assert_eq!(cols[0].data_type, "array");
        assert_eq!(cols[0].nullable, Some(true));
    }

    #[test]
    fn test_empty_sample() {
        assert!(infer_columns(&[], InferenceMode::FirstDocument).is_empty());
        assert!(infer_columns(&[], InferenceMode::Union).is_empty());
    }
}
