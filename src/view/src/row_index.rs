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

//! The per-group row index: which queries reference which columns of which
//! rows, and the patch stream that keeps clients consistent as references and
//! row versions move.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use syncwave_common::catalog::{RowId, RowKey};
use syncwave_common::{Row, Watermark};
use syncwave_query::TransformationHash;

use crate::protocol::{RowPatch, WireRowId};
use crate::rows::RowResult;

#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub table: String,
    pub key: RowKey,
    pub version: Watermark,
    /// Last values sent for the referenced columns.
    pub value: Row,
    pub queried_columns: BTreeMap<String, BTreeSet<TransformationHash>>,
}

impl RowRecord {
    fn wire_id(&self) -> WireRowId {
        WireRowId {
            table: self.table.clone(),
            key: self.key.clone(),
        }
    }
}

/// Tracks every row currently referenced by some query of the group.
#[derive(Debug, Default)]
pub struct RowIndex {
    rows: HashMap<RowId, RowRecord>,
}

impl RowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &RowId) -> Option<&RowRecord> {
        self.rows.get(id)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Fold in a fresh execution round of the `refreshed` queries and emit
    /// the row patches clients need, each tagged with the version that must
    /// clear the client's base cookie for the patch to apply.
    ///
    /// Rows only referenced by queries outside `refreshed` are untouched.
    pub fn apply(
        &mut self,
        refreshed: &BTreeSet<TransformationHash>,
        result: RowResult,
        cookie: &Watermark,
    ) -> Vec<(Watermark, RowPatch)> {
        let mut candidates: HashSet<RowId> = result.rows.keys().cloned().collect();
        for (id, record) in &self.rows {
            if record
                .queried_columns
                .values()
                .any(|queries| !queries.is_disjoint(refreshed))
            {
                candidates.insert(id.clone());
            }
        }
        let mut candidates: Vec<RowId> = candidates.into_iter().collect();
        candidates.sort();

        let mut result = result;
        let mut patches = Vec::new();
        for id in candidates {
            let contribution = result.rows.remove(&id);
            let old = self.rows.remove(&id);

            // Surviving references: everything the refreshed queries said
            // this round, plus old references from queries not refreshed.
            let mut new_columns: BTreeMap<String, BTreeSet<TransformationHash>> = BTreeMap::new();
            if let Some(old) = &old {
                for (column, queries) in &old.queried_columns {
                    let kept: BTreeSet<_> = queries.difference(refreshed).cloned().collect();
                    if !kept.is_empty() {
                        new_columns.insert(column.clone(), kept);
                    }
                }
            }
            if let Some(contribution) = &contribution {
                for (column, queries) in &contribution.queried_columns {
                    new_columns
                        .entry(column.clone())
                        .or_default()
                        .extend(queries.iter().cloned());
                }
            }

            if new_columns.is_empty() {
                if let Some(old) = old {
                    patches.push((cookie.clone(), RowPatch::Del { id: old.wire_id() }));
                }
                continue;
            }

            let version = match (&contribution, &old) {
                (Some(contribution), _) => contribution.version.clone(),
                (None, Some(old)) => old.version.clone(),
                (None, None) => unreachable!("candidate without contribution or record"),
            };
            let mut value = Row::new();
            for column in new_columns.keys() {
                let datum = contribution
                    .as_ref()
                    .and_then(|c| c.value.get(column))
                    .or_else(|| old.as_ref().and_then(|o| o.value.get(column)));
                if let Some(datum) = datum {
                    value.insert(column.clone(), datum.clone());
                }
            }

            let record = RowRecord {
                table: contribution
                    .as_ref()
                    .map(|c| c.table.clone())
                    .or_else(|| old.as_ref().map(|o| o.table.clone()))
                    .expect("candidate has a table"),
                key: contribution
                    .as_ref()
                    .map(|c| c.key.clone())
                    .or_else(|| old.as_ref().map(|o| o.key.clone()))
                    .expect("candidate has a key"),
                version: version.clone(),
                value,
                queried_columns: new_columns,
            };

            match old {
                None => {
                    // Newly referenced: full column set. The reference came
                    // into being at this processing cookie, whatever the
                    // row's own version.
                    patches.push((
                        cookie.clone(),
                        RowPatch::Put {
                            id: record.wire_id(),
                            value: record.value.clone(),
                        },
                    ));
                }
                Some(old) => {
                    let version_changed = record.version != old.version;
                    let mut changed = Row::new();
                    for (column, datum) in &record.value {
                        if old.value.get(column) != Some(datum) {
                            changed.insert(column.clone(), datum.clone());
                        }
                    }
                    if !changed.is_empty() {
                        let to_version = if version_changed {
                            record.version.clone()
                        } else {
                            cookie.clone()
                        };
                        patches.push((
                            to_version,
                            RowPatch::Merge {
                                id: record.wire_id(),
                                value: changed,
                            },
                        ));
                    }
                    let old_set: BTreeSet<&String> = old.queried_columns.keys().collect();
                    let new_set: BTreeSet<&String> = record.queried_columns.keys().collect();
                    if new_set != old_set && old_set.difference(&new_set).next().is_some() {
                        patches.push((
                            cookie.clone(),
                            RowPatch::Constrain {
                                id: record.wire_id(),
                                columns: record
                                    .queried_columns
                                    .keys()
                                    .cloned()
                                    .collect(),
                            },
                        ));
                    }
                }
            }
            self.rows.insert(id, record);
        }
        patches
    }

    /// The union, over every query referencing the row, of the columns it
    /// selects. Quantified invariant checked by tests.
    pub fn queried_columns_of(&self, id: &RowId) -> Option<Vec<&str>> {
        self.rows
            .get(id)
            .map(|record| record.queried_columns.keys().map(|c| c.as_str()).collect())
    }
}
