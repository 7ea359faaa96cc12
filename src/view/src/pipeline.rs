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

//! Executes a canonicalized query against one replica snapshot, producing
//! flat rows whose columns carry the canonical aliases. Correlated
//! sub-selects expand left-join style: a parent with no children yields one
//! flat row with no child columns at all, so partitioning produces no child
//! sub-row for it.

use std::cmp::Ordering;
use std::collections::HashMap;

use syncwave_common::{Datum, Row};
use syncwave_query::{Direction, TransformedQuery, TransformedSelect};
use syncwave_storage::{PinnedSnapshot, RangeKv};

use crate::error::ViewResult;

/// Run the query and return aliased flat rows in the canonical output order.
pub fn execute_query<R: RangeKv>(
    query: &TransformedQuery,
    snapshot: &PinnedSnapshot<R>,
) -> ViewResult<Vec<Row>> {
    let mut roots: Vec<Row> = snapshot
        .scan_table(&query.root.table)?
        .into_iter()
        .map(|(_, row)| row)
        .filter(|row| match &query.root.filter {
            Some(filter) => filter.matches(row),
            None => true,
        })
        .collect();
    sort_rows(&mut roots, &query.root);

    // One child index per correlation, keyed by the join column value.
    let mut child_indexes: Vec<HashMap<Datum, Vec<Row>>> =
        Vec::with_capacity(query.related.len());
    for correlation in &query.related {
        let mut index: HashMap<Datum, Vec<Row>> = HashMap::new();
        let mut children: Vec<Row> = snapshot
            .scan_table(&correlation.child.table)?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| match &correlation.child.filter {
                Some(filter) => filter.matches(row),
                None => true,
            })
            .collect();
        sort_rows(&mut children, &correlation.child);
        for child in children {
            if let Some(join_value) = child.get(&correlation.child_column) {
                index.entry(join_value.clone()).or_default().push(child);
            }
        }
        child_indexes.push(index);
    }

    let mut flat_rows = Vec::new();
    for root in &roots {
        expand_row(query, root, &child_indexes, &mut flat_rows);
    }
    Ok(flat_rows)
}

/// Cartesian expansion of one root row across all correlations.
fn expand_row(
    query: &TransformedQuery,
    root: &Row,
    child_indexes: &[HashMap<Datum, Vec<Row>>],
    out: &mut Vec<Row>,
) {
    let mut base = Row::new();
    project(&query.root, root, &mut base);

    let mut combos: Vec<Row> = vec![base];
    for (correlation, index) in query.related.iter().zip(child_indexes) {
        let matches: &[Row] = root
            .get(&correlation.parent_column)
            .and_then(|value| index.get(value))
            .map(|rows| rows.as_slice())
            .unwrap_or(&[]);
        if matches.is_empty() {
            // Left join: the parent survives with no child columns.
            continue;
        }
        let mut next = Vec::with_capacity(combos.len() * matches.len());
        for combo in &combos {
            for child in matches {
                let mut widened = combo.clone();
                project(&correlation.child, child, &mut widened);
                next.push(widened);
            }
        }
        combos = next;
    }
    out.append(&mut combos);
}

fn project(select: &TransformedSelect, row: &Row, out: &mut Row) {
    for column in &select.columns {
        if let Some(value) = row.get(column) {
            out.insert(select.column_alias(column), value.clone());
        }
    }
}

fn sort_rows(rows: &mut [Row], select: &TransformedSelect) {
    rows.sort_by(|a, b| {
        for term in &select.order_by {
            let left = a.get(&term.column).unwrap_or(&Datum::Null);
            let right = b.get(&term.column).unwrap_or(&Datum::Null);
            let ordering = match term.direction {
                Direction::Asc => left.cmp(right),
                Direction::Desc => right.cmp(left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
