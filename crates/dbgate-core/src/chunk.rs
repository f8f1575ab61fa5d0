//! Primary-key-factored row chunker.
//!
//! Turns a table's sampled rows into size-bounded [`ChunkGroup`]s for the
//! downstream indexer. When a column can be established as a key, every
//! row is factored into one `{pk, attribute}` entry per non-key column so
//! the indexer sees each value next to the key that identifies its row.
//! Without a key, whole rows are packed instead.
//!
//! # Algorithm
//!
//! 1. Collect the column set in first-seen order across all rows.
//! 2. A column qualifies as a key when every row carries a non-null value
//!    for it and no two rows share that value.
//! 3. Among qualifying columns, identifier-like names (`id`, `uuid`,
//!    `key`, `*_id`, ...) win; otherwise the first qualifying column is
//!    used. No qualifying column means whole-row fallback.
//! 4. Entries are packed greedily, in order, into groups whose serialized
//!    JSON array stays within `max_bytes`. An entry too large on its own
//!    becomes a one-element group; nothing is split or dropped.
//!
//! # Example
//!
//! ```rust
//! use dbgate_core::chunk::{chunk_rows, ChunkStrategy};
//! use serde_json::json;
//!
//! let rows: Vec<_> = (1..=3)
//!     .map(|i| json!({"id": i, "name": format!("n{i}")}).as_object().unwrap().clone())
//!     .collect();
//! let plan = chunk_rows(&rows, 4000);
//! assert_eq!(plan.strategy, ChunkStrategy::PrimaryKey);
//! assert_eq!(plan.pk_columns, vec!["id".to_string()]);
//! assert_eq!(plan.entry_count(), 3);
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Record;

/// Default serialized-size budget for one chunk group, in bytes.
pub const DEFAULT_MAX_BYTES: usize = 4000;

const ID_NAMES: &[&str] = &["id", "uuid", "guid", "key", "pk", "_id"];
const ID_SUFFIXES: &[&str] = &["_id", "_uuid", "_key"];

/// How a table's rows were encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    PrimaryKey,
    WholeRow,
}

/// A single encoded unit inside a chunk group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkEntry {
    Factored { pk: Record, attribute: Record },
    Row(Record),
}

/// A size-bounded batch of entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkGroup {
    pub entries: Vec<ChunkEntry>,
}

impl ChunkGroup {
    /// Serialized JSON size of this group.
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(&self.entries)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of chunking one table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub strategy: ChunkStrategy,
    pub pk_columns: Vec<String>,
    pub groups: Vec<ChunkGroup>,
}

impl ChunkPlan {
    pub fn entry_count(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }
}

/// Column names in first-seen order across `rows`.
pub fn column_order(rows: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.as_str()) {
                order.push(key.clone());
            }
        }
    }
    order
}

/// Whether a column name looks like a conventional identifier.
pub fn is_identifier_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if ID_NAMES.contains(&lower.as_str()) {
        return true;
    }
    if ID_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
        return true;
    }
    // camelCase: userId, orderUuid
    name.len() > 2 && (name.ends_with("Id") || name.ends_with("Uuid"))
}

fn is_unique_non_null(rows: &[Record], column: &str) -> bool {
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        match row.get(column) {
            None | Some(Value::Null) => return false,
            Some(v) => {
                if !seen.insert(v.to_string()) {
                    return false;
                }
            }
        }
    }
    true
}

/// Pick the key column(s) for `rows`. Empty means whole-row fallback.
pub fn detect_primary_keys(rows: &[Record]) -> Vec<String> {
    if rows.is_empty() {
        return Vec::new();
    }
    let qualifying: Vec<String> = column_order(rows)
        .into_iter()
        .filter(|c| is_unique_non_null(rows, c))
        .collect();

    qualifying
        .iter()
        .find(|c| is_identifier_name(c))
        .or_else(|| qualifying.first())
        .map(|c| vec![c.clone()])
        .unwrap_or_default()
}

/// Encode and pack `rows` into groups of at most `max_bytes`.
pub fn chunk_rows(rows: &[Record], max_bytes: usize) -> ChunkPlan {
    let pk_columns = detect_primary_keys(rows);

    if pk_columns.is_empty() {
        let entries = rows.iter().cloned().map(ChunkEntry::Row).collect();
        return ChunkPlan {
            strategy: ChunkStrategy::WholeRow,
            pk_columns,
            groups: pack(entries, max_bytes),
        };
    }

    let attributes: Vec<String> = column_order(rows)
        .into_iter()
        .filter(|c| !pk_columns.contains(c))
        .collect();

    let mut entries = Vec::with_capacity(rows.len() * attributes.len());
    for row in rows {
        let pk: Record = pk_columns
            .iter()
            .map(|k| (k.clone(), row.get(k).cloned().unwrap_or(Value::Null)))
            .collect();
        for col in &attributes {
            let mut attribute = Record::new();
            attribute.insert(col.clone(), row.get(col).cloned().unwrap_or(Value::Null));
            entries.push(ChunkEntry::Factored {
                pk: pk.clone(),
                attribute,
            });
        }
    }

    ChunkPlan {
        strategy: ChunkStrategy::PrimaryKey,
        pk_columns,
        groups: pack(entries, max_bytes),
    }
}

fn entry_size(entry: &ChunkEntry) -> usize {
    serde_json::to_vec(entry).map(|v| v.len()).unwrap_or(0)
}

/// Greedy append-only packing. Group size is measured as a JSON array:
/// two brackets plus one comma between entries.
fn pack(entries: Vec<ChunkEntry>, max_bytes: usize) -> Vec<ChunkGroup> {
    let mut groups = Vec::new();
    let mut current = ChunkGroup::default();
    let mut current_bytes = 2;

    for entry in entries {
        let size = entry_size(&entry);

        if size + 2 > max_bytes {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_bytes = 2;
            }
            groups.push(ChunkGroup {
                entries: vec![entry],
            });
            continue;
        }

        let separator = usize::from(!current.is_empty());
        if current_bytes + separator + size > max_bytes {
            groups.push(std::mem::take(&mut current));
            current_bytes = 2 + size;
        } else {
            current_bytes += separator + size;
        }
        current.entries.push(entry);
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn rows(values: Vec<Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_id_name_score_picks_id() {
        let input = rows(vec![
            json!({"id": 1, "name": "ada", "score": 10}),
            json!({"id": 2, "name": "bob", "score": 10}),
            json!({"id": 3, "name": "cy", "score": 7}),
        ]);
        let plan = chunk_rows(&input, DEFAULT_MAX_BYTES);
        assert_eq!(plan.strategy, ChunkStrategy::PrimaryKey);
        assert_eq!(plan.pk_columns, vec!["id".to_string()]);
        assert_eq!(plan.entry_count(), 3 * 2);
    }

    #[test]
    fn test_prefers_identifier_over_earlier_unique_column() {
        let input = rows(vec![
            json!({"email": "a@x", "user_id": 10}),
            json!({"email": "b@x", "user_id": 11}),
        ]);
        assert_eq!(detect_primary_keys(&input), vec!["user_id".to_string()]);
    }

    #[test]
    fn test_first_unique_column_without_identifier_name() {
        let input = rows(vec![
            json!({"team": "red", "email": "a@x"}),
            json!({"team": "red", "email": "b@x"}),
        ]);
        assert_eq!(detect_primary_keys(&input), vec!["email".to_string()]);
    }

    #[test]
    fn test_fallback_when_nothing_unique() {
        let input = rows(vec![
            json!({"a": 1, "b": 2}),
            json!({"a": 1, "b": 2}),
        ]);
        let plan = chunk_rows(&input, DEFAULT_MAX_BYTES);
        assert_eq!(plan.strategy, ChunkStrategy::WholeRow);
        assert!(plan.pk_columns.is_empty());
        assert_eq!(plan.entry_count(), 2);
        assert!(matches!(plan.groups[0].entries[0], ChunkEntry::Row(_)));
    }

    #[test]
    fn test_null_values_disqualify_key() {
        let input = rows(vec![
            json!({"id": null, "code": "x"}),
            json!({"id": 2, "code": "y"}),
        ]);
        assert_eq!(detect_primary_keys(&input), vec!["code".to_string()]);
    }

    #[test]
    fn test_empty_input() {
        let plan = chunk_rows(&[], DEFAULT_MAX_BYTES);
        assert_eq!(plan.strategy, ChunkStrategy::WholeRow);
        assert!(plan.groups.is_empty());
    }

    #[test]
    fn test_oversized_entry_is_singleton() {
        let big = "x".repeat(500);
        let input = rows(vec![
            json!({"id": 1, "note": "small"}),
            json!({"id": 2, "note": big}),
            json!({"id": 3, "note": "small"}),
        ]);
        let plan = chunk_rows(&input, 200);
        assert_eq!(plan.entry_count(), 3);
        let oversized: Vec<_> = plan.groups.iter().filter(|g| g.byte_size() > 200).collect();
        assert_eq!(oversized.len(), 1);
        assert_eq!(oversized[0].len(), 1);
        // order is preserved around the singleton
        assert_eq!(plan.groups.len(), 3);
    }

    #[test]
    fn test_factored_entry_shape() {
        let input = rows(vec![json!({"id": 1, "name": "ada"})]);
        let plan = chunk_rows(&input, DEFAULT_MAX_BYTES);
        let v = serde_json::to_value(&plan.groups[0]).unwrap();
        assert_eq!(v, json!([{"pk": {"id": 1}, "attribute": {"name": "ada"}}]));
    }

    #[test]
    fn test_deterministic() {
        let input = rows(
            (0..200)
                .map(|i| json!({"id": i, "name": format!("row-{i}"), "v": i * 3}))
                .collect(),
        );
        let a = chunk_rows(&input, 300);
        let b = chunk_rows(&input, 300);
        assert_eq!(a, b);
    }

    #[test]
    fn test_identifier_names() {
        assert!(is_identifier_name("id"));
        assert!(is_identifier_name("UUID"));
        assert!(is_identifier_name("order_id"));
        assert!(is_identifier_name("customerId"));
        assert!(!is_identifier_name("Id2"));
        assert!(!is_identifier_name("name"));
    }

    proptest! {
        #[test]
        fn prop_factored_entries_conserved(
            n_rows in 1usize..40,
            n_cols in 1usize..6,
            max_bytes in 40usize..600,
        ) {
            let input: Vec<Record> = (0..n_rows)
                .map(|r| {
                    let mut rec = Record::new();
                    rec.insert("id".into(), json!(r));
                    for c in 0..n_cols {
                        rec.insert(format!("c{c}"), json!(format!("v{}", (r * c) % 3)));
                    }
                    rec
                })
                .collect();

            let plan = chunk_rows(&input, max_bytes);
            prop_assert_eq!(plan.strategy, ChunkStrategy::PrimaryKey);
            let total_columns = n_cols + 1;
            prop_assert_eq!(
                plan.entry_count(),
                n_rows * (total_columns - plan.pk_columns.len())
            );
            for group in &plan.groups {
                prop_assert!(!group.is_empty());
                prop_assert!(group.byte_size() <= max_bytes || group.len() == 1);
            }
        }

        #[test]
        fn prop_whole_rows_conserved(n_rows in 1usize..30, max_bytes in 20usize..400) {
            let input: Vec<Record> = (0..n_rows)
                .map(|_| json!({"a": 1, "b": "same"}).as_object().cloned().unwrap())
                .collect();
            let plan = chunk_rows(&input, max_bytes);
            prop_assert_eq!(plan.entry_count(), n_rows);
            for group in &plan.groups {
                prop_assert!(group.byte_size() <= max_bytes || group.len() == 1);
            }
        }
    }
}
