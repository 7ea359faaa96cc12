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

//! Invalidation summaries: which `(table, filter tag)` pairs a query depends
//! on, and which tags a replica diff touched. A query whose summary does not
//! overlap the diff cannot have changed and is skipped.
//!
//! The rules are deliberately conservative. Wrongly skipping a query is a
//! correctness bug; scanning one too many is only wasted work. Anything but a
//! pure equality predicate collapses to a full-table dependency.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use syncwave_common::{Datum, Row};
use xxhash_rust::xxh64::xxh64;

const TAG_SEED: u64 = 0x696e76;

fn value_tag(column: &str, value: &Datum) -> String {
    let mut buf = Vec::new();
    value.encode_into(&mut buf);
    format!("{column}={:016x}", xxh64(&buf, TAG_SEED))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTags {
    /// Set when the dependency cannot be narrowed to equality tags.
    pub full_table: bool,
    pub tags: BTreeSet<String>,
}

/// What a query depends on, per referenced table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationInfo {
    pub tables: BTreeMap<String, TableTags>,
}

impl InvalidationInfo {
    /// A dependency narrowed to equality constraints `column = value`.
    pub fn add_equality(&mut self, table: &str, column: &str, value: &Datum) {
        self.tables
            .entry(table.to_owned())
            .or_default()
            .tags
            .insert(value_tag(column, value));
    }

    /// A dependency on everything in the table.
    pub fn add_full_table(&mut self, table: &str) {
        self.tables.entry(table.to_owned()).or_default().full_table = true;
    }

    /// Whether a diff summarized by `diff` can possibly affect this query.
    pub fn may_overlap(&self, diff: &DiffTags) -> bool {
        for (table, tags) in &self.tables {
            let Some(changed) = diff.tables.get(table) else {
                continue;
            };
            if tags.full_table || changed.wildcard {
                return true;
            }
            if !tags.tags.is_disjoint(&changed.tags) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DiffTableTags {
    wildcard: bool,
    tags: BTreeSet<String>,
}

/// Tags touched by one replica diff: for every changed row, one tag per
/// column value of both the previous and the next image, so a row moving
/// across a predicate boundary overlaps on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffTags {
    tables: BTreeMap<String, DiffTableTags>,
}

impl DiffTags {
    pub fn add_row(&mut self, table: &str, row: &Row) {
        let entry = self.tables.entry(table.to_owned()).or_default();
        for (column, value) in row {
            entry.tags.insert(value_tag(column, value));
        }
    }

    /// A change whose row images are unavailable, e.g. a truncate. Overlaps
    /// every query referencing the table.
    pub fn add_table_wildcard(&mut self, table: &str) {
        self.tables.entry(table.to_owned()).or_default().wildcard = true;
    }

    pub fn touches_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_tags_prune() {
        let mut info = InvalidationInfo::default();
        info.add_equality("t", "org", &"acme".into());

        let mut matching = DiffTags::default();
        let mut row = Row::new();
        row.insert("org", "acme");
        row.insert("id", 1i64);
        matching.add_row("t", &row);
        assert!(info.may_overlap(&matching));

        let mut other = DiffTags::default();
        let mut row = Row::new();
        row.insert("org", "globex");
        row.insert("id", 1i64);
        other.add_row("t", &row);
        assert!(!info.may_overlap(&other));

        let mut unrelated_table = DiffTags::default();
        let mut row = Row::new();
        row.insert("org", "acme");
        unrelated_table.add_row("u", &row);
        assert!(!info.may_overlap(&unrelated_table));
    }

    #[test]
    fn test_full_table_always_overlaps() {
        let mut info = InvalidationInfo::default();
        info.add_full_table("t");

        let mut diff = DiffTags::default();
        diff.add_table_wildcard("t");
        assert!(info.may_overlap(&diff));
    }

    #[test]
    fn test_wildcard_overlaps_equality_queries() {
        // A truncate has no row images; it must never be pruned away, even
        // for narrowly tagged queries.
        let mut info = InvalidationInfo::default();
        info.add_equality("t", "org", &"acme".into());

        let mut diff = DiffTags::default();
        diff.add_table_wildcard("t");
        assert!(info.may_overlap(&diff));
    }

    #[test]
    fn test_row_crossing_predicate_boundary() {
        // A query for org = acme; the row moved from acme to globex. Both
        // images are tagged, so the query is not wrongly skipped.
        let mut info = InvalidationInfo::default();
        info.add_equality("t", "org", &"acme".into());

        let mut diff = DiffTags::default();
        let mut prev = Row::new();
        prev.insert("org", "acme");
        let mut next = Row::new();
        next.insert("org", "globex");
        diff.add_row("t", &prev);
        diff.add_row("t", &next);
        assert!(info.may_overlap(&diff));
    }
}
