//! Schema discovery model: structural checksumming, diffing, and the
//! LLM-oriented rendering.
//!
//! Checksums are pure functions of structure. Canonical bytes serialise
//! columns, indexes and foreign keys through `BTreeMap`s (sorted keys,
//! stable field order), so identical schemas hash identically no matter
//! when or how they were fetched. Row counts and fetch timestamps never
//! enter a checksum.

pub mod service;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use service::SchemaService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Engine-native type string, e.g. `bigint` or `Nullable(String)`.
    pub r#type: String,
    pub is_nullable: bool,
    #[serde(default)]
    pub default_value: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    #[serde(default)]
    pub on_delete: String,
    #[serde(default)]
    pub on_update: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    /// PRIMARY KEY, UNIQUE, CHECK, …
    pub kind: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeMap<String, ColumnInfo>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexInfo>,
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, ForeignKeyInfo>,
    #[serde(default)]
    pub constraints: Vec<ConstraintInfo>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    pub row_count: i64,
    /// Structural hash; see [`table_checksum`].
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSchema {
    pub name: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub tables: BTreeMap<String, TableSchema>,
    #[serde(default)]
    pub views: BTreeMap<String, ViewSchema>,
    pub updated_at: DateTime<Utc>,
    pub checksum: String,
}

/// Canonical structural bytes of a table: columns, indexes, foreign keys
/// and primary key only.
fn canonical_table_bytes(table: &TableSchema) -> Vec<u8> {
    #[derive(Serialize)]
    struct Canonical<'a> {
        columns: &'a BTreeMap<String, ColumnInfo>,
        indexes: &'a BTreeMap<String, IndexInfo>,
        foreign_keys: &'a BTreeMap<String, ForeignKeyInfo>,
        primary_key: &'a [String],
    }
    serde_json::to_vec(&Canonical {
        columns: &table.columns,
        indexes: &table.indexes,
        foreign_keys: &table.foreign_keys,
        primary_key: &table.primary_key,
    })
    .unwrap_or_default()
}

/// Structural hash of one table.
pub fn table_checksum(table: &TableSchema) -> String {
    hex::encode(Sha256::digest(canonical_table_bytes(table)))
}

/// Structural hash of a whole schema: the sorted (name → table checksum)
/// map, hashed.
pub fn schema_checksum(tables: &BTreeMap<String, TableSchema>) -> String {
    let mut hasher = Sha256::new();
    for (name, table) in tables {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(table.checksum.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

impl SchemaInfo {
    /// Builds a schema from fetched tables, stamping per-table and whole
    /// schema checksums.
    pub fn from_parts(
        mut tables: BTreeMap<String, TableSchema>,
        views: BTreeMap<String, ViewSchema>,
    ) -> Self {
        for table in tables.values_mut() {
            table.checksum = table_checksum(table);
        }
        let checksum = schema_checksum(&tables);
        Self {
            tables,
            views,
            updated_at: Utc::now(),
            checksum,
        }
    }

    /// Applies table selection. `None` (or a list containing "ALL") keeps
    /// everything; otherwise only the named tables survive and the schema
    /// checksum is recomputed over the filtered subset.
    pub fn filtered(mut self, selected: Option<&[String]>) -> Self {
        let Some(selected) = selected else {
            return self;
        };
        if selected.iter().any(|s| s.eq_ignore_ascii_case("ALL")) || selected.is_empty() {
            return self;
        }
        let keep: BTreeSet<&str> = selected.iter().map(|s| s.as_str()).collect();
        self.tables.retain(|name, _| keep.contains(name.as_str()));
        self.views.retain(|name, _| keep.contains(name.as_str()));
        self.checksum = schema_checksum(&self.tables);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
    pub modified_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub modified_tables: BTreeMap<String, TableDiff>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.modified_tables.is_empty()
    }

    /// Structural comparison of two snapshots. Tables with equal checksums
    /// are skipped wholesale.
    pub fn between(old: &SchemaInfo, new: &SchemaInfo) -> Self {
        let mut diff = SchemaDiff::default();

        for name in new.tables.keys() {
            if !old.tables.contains_key(name) {
                diff.added_tables.push(name.clone());
            }
        }
        for name in old.tables.keys() {
            if !new.tables.contains_key(name) {
                diff.removed_tables.push(name.clone());
            }
        }

        for (name, new_table) in &new.tables {
            let Some(old_table) = old.tables.get(name) else {
                continue;
            };
            if old_table.checksum == new_table.checksum {
                continue;
            }
            let mut table_diff = TableDiff::default();
            for column in new_table.columns.keys() {
                if !old_table.columns.contains_key(column) {
                    table_diff.added_columns.push(column.clone());
                }
            }
            for (column, old_column) in &old_table.columns {
                match new_table.columns.get(column) {
                    None => table_diff.removed_columns.push(column.clone()),
                    Some(new_column) if new_column != old_column => {
                        table_diff.modified_columns.push(column.clone())
                    }
                    Some(_) => {}
                }
            }
            if table_diff != TableDiff::default() {
                diff.modified_tables.insert(name.clone(), table_diff);
            }
        }

        diff
    }

    /// Human/LLM readable rendering, appended to schema updates.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.added_tables.is_empty() {
            out.push_str(&format!("Added tables: {}\n", self.added_tables.join(", ")));
        }
        if !self.removed_tables.is_empty() {
            out.push_str(&format!("Removed tables: {}\n", self.removed_tables.join(", ")));
        }
        for (table, table_diff) in &self.modified_tables {
            out.push_str(&format!("Modified table {}:\n", table));
            if !table_diff.added_columns.is_empty() {
                out.push_str(&format!("  added columns: {}\n", table_diff.added_columns.join(", ")));
            }
            if !table_diff.removed_columns.is_empty() {
                out.push_str(&format!(
                    "  removed columns: {}\n",
                    table_diff.removed_columns.join(", ")
                ));
            }
            if !table_diff.modified_columns.is_empty() {
                out.push_str(&format!(
                    "  modified columns: {}\n",
                    table_diff.modified_columns.join(", ")
                ));
            }
        }
        out
    }
}

/// Deterministic, compact rendering for prompts: one block per table with
/// columns, primary key, foreign keys and indexes. Tables arrive sorted by
/// name via the `BTreeMap`.
pub fn format_schema_for_llm(schema: &SchemaInfo) -> String {
    let mut out = String::new();
    for (name, table) in &schema.tables {
        out.push_str(&format!("Table: {} (rows: {})\n", name, table.row_count));
        for (_, column) in &table.columns {
            let nullable = if column.is_nullable { "NULL" } else { "NOT NULL" };
            out.push_str(&format!("  - {} {} {}", column.name, column.r#type, nullable));
            if !column.default_value.is_empty() {
                out.push_str(&format!(" DEFAULT {}", column.default_value));
            }
            if !column.comment.is_empty() {
                out.push_str(&format!(" -- {}", column.comment));
            }
            out.push('\n');
        }
        if !table.primary_key.is_empty() {
            out.push_str(&format!("  PRIMARY KEY ({})\n", table.primary_key.join(", ")));
        }
        for (_, fk) in &table.foreign_keys {
            out.push_str(&format!(
                "  FOREIGN KEY {} ({}) REFERENCES {} ({})\n",
                fk.name, fk.column, fk.referenced_table, fk.referenced_column
            ));
        }
        for (_, index) in &table.indexes {
            let unique = if index.is_unique { "UNIQUE INDEX" } else { "INDEX" };
            out.push_str(&format!(
                "  {} {} ({})\n",
                unique,
                index.name,
                index.columns.join(", ")
            ));
        }
        out.push('\n');
    }
    for (name, view) in &schema.views {
        out.push_str(&format!("View: {}\n", name));
        if !view.definition.is_empty() {
            out.push_str(&format!("  {}\n", view.definition));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, ty: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            r#type: ty.to_string(),
            is_nullable: false,
            default_value: String::new(),
            comment: String::new(),
        }
    }

    fn table(name: &str, columns: &[(&str, &str)]) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(c, t)| (c.to_string(), column(c, t)))
                .collect(),
            indexes: BTreeMap::new(),
            foreign_keys: BTreeMap::new(),
            constraints: Vec::new(),
            primary_key: vec!["id".to_string()],
            row_count: 0,
            checksum: String::new(),
        }
    }

    fn schema(tables: Vec<TableSchema>) -> SchemaInfo {
        SchemaInfo::from_parts(
            tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn checksum_is_independent_of_fetch_time_and_row_count() {
        let mut a = schema(vec![table("orders", &[("id", "bigint"), ("total", "numeric")])]);
        let b = schema(vec![table("orders", &[("id", "bigint"), ("total", "numeric")])]);
        assert_eq!(a.checksum, b.checksum);

        a.tables.get_mut("orders").unwrap().row_count = 42;
        let recomputed = table_checksum(a.tables.get("orders").unwrap());
        assert_eq!(recomputed, b.tables.get("orders").unwrap().checksum);
    }

    #[test]
    fn checksum_survives_serialisation_round_trip() {
        let original = schema(vec![
            table("orders", &[("id", "bigint")]),
            table("users", &[("id", "bigint"), ("email", "text")]),
        ]);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: SchemaInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(schema_checksum(&parsed.tables), original.checksum);
    }

    #[test]
    fn checksum_changes_when_a_column_changes() {
        let a = schema(vec![table("orders", &[("id", "bigint")])]);
        let b = schema(vec![table("orders", &[("id", "bigint"), ("total", "numeric")])]);
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn diff_reports_added_and_modified() {
        let old = schema(vec![
            table("orders", &[("id", "bigint")]),
            table("legacy", &[("id", "bigint")]),
        ]);
        let new = schema(vec![
            table("orders", &[("id", "bigint"), ("status", "text")]),
            table("users", &[("id", "bigint")]),
        ]);

        let diff = SchemaDiff::between(&old, &new);
        assert_eq!(diff.added_tables, vec!["users"]);
        assert_eq!(diff.removed_tables, vec!["legacy"]);
        assert_eq!(
            diff.modified_tables.get("orders").unwrap().added_columns,
            vec!["status"]
        );
    }

    #[test]
    fn diff_is_empty_for_identical_schemas() {
        let a = schema(vec![table("orders", &[("id", "bigint")])]);
        let b = schema(vec![table("orders", &[("id", "bigint")])]);
        assert!(SchemaDiff::between(&a, &b).is_empty());
    }

    #[test]
    fn filtering_recomputes_checksum() {
        let full = schema(vec![
            table("orders", &[("id", "bigint")]),
            table("users", &[("id", "bigint")]),
        ]);
        let only_orders = schema(vec![table("orders", &[("id", "bigint")])]);

        let filtered = full.clone().filtered(Some(&["orders".to_string()]));
        assert_eq!(filtered.tables.len(), 1);
        assert_eq!(filtered.checksum, only_orders.checksum);

        let all = full.clone().filtered(Some(&["ALL".to_string()]));
        assert_eq!(all.checksum, full.checksum);
    }

    #[test]
    fn llm_rendering_is_deterministic_and_sorted() {
        let s = schema(vec![
            table("zebra", &[("id", "bigint")]),
            table("alpha", &[("id", "bigint")]),
        ]);
        let rendered = format_schema_for_llm(&s);
        let alpha = rendered.find("Table: alpha").unwrap();
        let zebra = rendered.find("Table: zebra").unwrap();
        assert!(alpha < zebra);
        assert_eq!(rendered, format_schema_for_llm(&s));
    }
}
