// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::types::{Datum, Row};

/// Seed for all stable fingerprints in the system. Changing it invalidates
/// every persisted row-key hash, so it never changes.
const FINGERPRINT_SEED: u64 = 0x73796e_63776176;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Bool,
    Int,
    Float,
    String,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub data_type: DataType,
    #[serde(default)]
    pub not_null: bool,
}

/// Immutable description of one replicated table. A schema change is modeled
/// as a bumped replica version carrying a fresh spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub schema: String,
    pub name: String,
    pub columns: BTreeMap<String, ColumnSpec>,
    /// Primary key columns in declared order.
    pub primary_key: Vec<String>,
}

impl TableSpec {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Primary key columns in the canonical (sorted) order used for key
    /// encoding, so that two declarations of the same key hash identically.
    pub fn normalized_key_columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self.primary_key.iter().map(|c| c.as_str()).collect();
        cols.sort_unstable();
        cols
    }

    pub fn has_column(&self, column: &str) -> bool {
        column == crate::types::ROW_VERSION_COLUMN || self.columns.contains_key(column)
    }

    /// Stable hash over the column set. Two versions of a table with different
    /// column sets fingerprint differently, which is how a diff spanning a
    /// schema change is detected.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.schema.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        for (column, spec) in &self.columns {
            buf.extend_from_slice(column.as_bytes());
            buf.push(match spec.data_type {
                DataType::Bool => 1,
                DataType::Int => 2,
                DataType::Float => 3,
                DataType::String => 4,
                DataType::Json => 5,
            });
            buf.push(spec.not_null as u8);
        }
        for column in &self.primary_key {
            buf.extend_from_slice(column.as_bytes());
            buf.push(0xff);
        }
        xxh64(&buf, FINGERPRINT_SEED)
    }
}

/// The set of replicated tables at one replica version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    tables: BTreeMap<String, TableSpec>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: TableSpec) -> Option<TableSpec> {
        self.tables.insert(spec.full_name(), spec)
    }

    pub fn get(&self, table: &str) -> Option<&TableSpec> {
        self.tables.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.values()
    }

    /// Combined fingerprint over every table spec.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = Vec::with_capacity(self.tables.len() * 8);
        for spec in self.tables.values() {
            buf.extend_from_slice(&spec.fingerprint().to_be_bytes());
        }
        xxh64(&buf, FINGERPRINT_SEED)
    }
}

/// An ordered projection of a row onto its primary-key columns, in the
/// canonical key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Vec<(String, Datum)>);

impl RowKey {
    /// Project `row` onto the table's primary key. Every key column must be
    /// present and non-null.
    pub fn from_row(spec: &TableSpec, row: &Row) -> anyhow::Result<Self> {
        let mut parts = Vec::with_capacity(spec.primary_key.len());
        for column in spec.normalized_key_columns() {
            let value = row
                .get(column)
                .with_context(|| {
                    format!(
                        "row for table {} is missing key column {}",
                        spec.full_name(),
                        column
                    )
                })?
                .clone();
            if value == Datum::Null {
                return Err(anyhow!(
                    "null key column {} in table {}",
                    column,
                    spec.full_name()
                ));
            }
            parts.push((column.to_owned(), value));
        }
        Ok(Self(parts))
    }

    pub fn parts(&self) -> &[(String, Datum)] {
        &self.0
    }

    /// Deterministic byte encoding, used both as the storage key component and
    /// as the fingerprint input.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        for (column, value) in &self.0 {
            buf.extend_from_slice(&(column.len() as u32).to_be_bytes());
            buf.extend_from_slice(column.as_bytes());
            value.encode_into(&mut buf);
        }
        Bytes::from(buf)
    }

    pub fn fingerprint(&self) -> u64 {
        xxh64(&self.encode(), FINGERPRINT_SEED)
    }
}

/// Stable in-memory identity of one row: the table plus the key fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub table: String,
    pub key_hash: u64,
}

impl RowId {
    pub fn new(table: impl Into<String>, key: &RowKey) -> Self {
        Self {
            table: table.into(),
            key_hash: key.fingerprint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_spec() -> TableSpec {
        TableSpec {
            schema: "public".into(),
            name: "users".into(),
            columns: [
                (
                    "id".to_owned(),
                    ColumnSpec {
                        data_type: DataType::Int,
                        not_null: true,
                    },
                ),
                (
                    "org".to_owned(),
                    ColumnSpec {
                        data_type: DataType::String,
                        not_null: true,
                    },
                ),
                (
                    "name".to_owned(),
                    ColumnSpec {
                        data_type: DataType::String,
                        not_null: false,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            primary_key: vec!["org".into(), "id".into()],
        }
    }

    #[test]
    fn test_key_normalization() {
        // Declared (org, id); canonical order is sorted, so both declarations
        // of the same key fingerprint identically.
        let mut spec_b = users_spec();
        spec_b.primary_key = vec!["id".into(), "org".into()];

        let mut row = Row::new();
        row.insert("id", 7i64);
        row.insert("org", "acme");
        row.insert("name", "alice");

        let key_a = RowKey::from_row(&users_spec(), &row).unwrap();
        let key_b = RowKey::from_row(&spec_b, &row).unwrap();
        assert_eq!(key_a.fingerprint(), key_b.fingerprint());
    }

    #[test]
    fn test_key_requires_columns() {
        let mut row = Row::new();
        row.insert("id", 7i64);
        assert!(RowKey::from_row(&users_spec(), &row).is_err());

        row.insert("org", Datum::Null);
        assert!(RowKey::from_row(&users_spec(), &row).is_err());
    }

    #[test]
    fn test_schema_fingerprint_changes_with_columns() {
        let base = users_spec();
        let mut widened = users_spec();
        widened.columns.insert(
            "email".to_owned(),
            ColumnSpec {
                data_type: DataType::String,
                not_null: false,
            },
        );
        assert_ne!(base.fingerprint(), widened.fingerprint());
    }

    #[test]
    fn test_catalog_fingerprint() {
        let mut a = Catalog::new();
        a.register(users_spec());
        let mut b = Catalog::new();
        b.register(users_spec());
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut widened = users_spec();
        widened.columns.insert(
            "email".to_owned(),
            ColumnSpec {
                data_type: DataType::String,
                not_null: false,
            },
        );
        b.register(widened);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
