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

//! Partitioning flat query output back into per-table sub-rows and
//! accumulating them into a per-row result keyed by stable row identity.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::anyhow;
use syncwave_common::catalog::{Catalog, RowId, RowKey};
use syncwave_common::{Row, Watermark, ROW_VERSION_COLUMN};
use syncwave_query::{TransformationHash, ALIAS_SEPARATOR};

use crate::error::{ViewError, ViewResult};

/// The table named by an alias path is its last segment.
pub fn table_of_alias(alias: &str) -> &str {
    alias
        .rsplit(ALIAS_SEPARATOR)
        .next()
        .unwrap_or(alias)
}

/// Split a flat row's aliased columns at the canonical separator, grouping by
/// row alias. Column names never contain the separator; the prefix before the
/// last occurrence is the row alias.
pub fn partition_flat_row(flat: &Row) -> ViewResult<BTreeMap<String, Row>> {
    let mut groups: BTreeMap<String, Row> = BTreeMap::new();
    for (aliased, value) in flat {
        let (row_alias, column) = aliased
            .rsplit_once(ALIAS_SEPARATOR)
            .ok_or_else(|| ViewError::Internal(anyhow!("unaliased result column {aliased}")))?;
        groups
            .entry(row_alias.to_owned())
            .or_default()
            .insert(column.to_owned(), value.clone());
    }
    Ok(groups)
}

/// One row as referenced by the current query results.
#[derive(Debug, Clone, PartialEq)]
pub struct RowInfo {
    pub table: String,
    pub key: RowKey,
    pub version: Watermark,
    /// Union of referenced column values, version column excluded.
    pub value: Row,
    /// Which queries reference which columns of this row.
    pub queried_columns: BTreeMap<String, BTreeSet<TransformationHash>>,
}

/// Accumulated output of one round of query executions.
#[derive(Debug, Default)]
pub struct RowResult {
    pub rows: HashMap<RowId, RowInfo>,
}

impl RowResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one query's flat output into the result.
    pub fn accumulate(
        &mut self,
        catalog: &Catalog,
        hash: &TransformationHash,
        flat_rows: &[Row],
    ) -> ViewResult<()> {
        for flat in flat_rows {
            for (alias, sub_row) in partition_flat_row(flat)? {
                let table = table_of_alias(&alias);
                let spec = catalog
                    .get(table)
                    .ok_or_else(|| ViewError::Internal(anyhow!("result for unknown table {table}")))?;
                // A result row without its version column is a data error.
                let version = sub_row
                    .version()
                    .ok_or_else(|| ViewError::MissingRowVersion {
                        table: table.to_owned(),
                    })?;
                let key = RowKey::from_row(spec, &sub_row)?;
                let id = RowId::new(table, &key);

                let info = self.rows.entry(id).or_insert_with(|| RowInfo {
                    table: table.to_owned(),
                    key,
                    version: version.clone(),
                    value: Row::new(),
                    queried_columns: BTreeMap::new(),
                });
                if version > info.version {
                    info.version = version;
                }
                for (column, value) in &sub_row {
                    if column == ROW_VERSION_COLUMN {
                        continue;
                    }
                    info.value.insert(column.clone(), value.clone());
                    info.queried_columns
                        .entry(column.clone())
                        .or_default()
                        .insert(hash.clone());
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_groups_by_alias() {
        let mut flat = Row::new();
        flat.insert("public.issues/id", 1i64);
        flat.insert("public.issues/title", "one");
        flat.insert("public.issues/comments/public.comments/id", 10i64);
        flat.insert("public.issues/comments/public.comments/body", "first");

        let groups = partition_flat_row(&flat).unwrap();
        assert_eq!(groups.len(), 2);
        let root = &groups["public.issues"];
        assert_eq!(root.get("title"), Some(&"one".into()));
        let child = &groups["public.issues/comments/public.comments"];
        assert_eq!(child.get("body"), Some(&"first".into()));

        assert_eq!(table_of_alias("public.issues"), "public.issues");
        assert_eq!(
            table_of_alias("public.issues/comments/public.comments"),
            "public.comments"
        );
    }
}
