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

//! Canonicalization of client queries.
//!
//! The transformed form widens the selection to everything the sync pipeline
//! needs (primary keys, the row version column, filter and order inputs),
//! rewrites result columns to `<path>/<table>/<column>` aliases so joined
//! rows can be partitioned back into per-table sub-rows, and normalizes the
//! shape so that equivalent queries hash identically and share one
//! materialization.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use syncwave_common::catalog::{Catalog, TableSpec};
use syncwave_common::ROW_VERSION_COLUMN;
use xxhash_rust::xxh64::xxh64;

use crate::ast::{CmpOp, Condition, Direction, OrderTerm, SelectAst};
use crate::error::{QueryError, QueryResult};
use crate::invalidation::InvalidationInfo;

pub const ALIAS_SEPARATOR: char = '/';

const HASH_SEED: u64 = 0x7478666d;

/// Stable identity of a canonicalized query. Two queries with equal hashes
/// produce identical result sets on identical data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformationHash(String);

impl TransformationHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransformationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One table scan of the canonical form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedSelect {
    pub table: String,
    /// Alias path prefix of this select's output columns.
    pub alias: String,
    /// Expanded column set, sorted and deduplicated.
    pub columns: Vec<String>,
    pub filter: Option<Condition>,
    /// User terms with ascending primary-key columns appended, so the output
    /// order is total.
    pub order_by: Vec<OrderTerm>,
}

impl TransformedSelect {
    pub fn column_alias(&self, column: &str) -> String {
        format!("{}{}{}", self.alias, ALIAS_SEPARATOR, column)
    }
}

/// An explicit correlation resolved from a relationship name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correlation {
    pub relationship: String,
    pub parent_column: String,
    pub child_column: String,
    pub child: TransformedSelect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformedQuery {
    pub hash: TransformationHash,
    pub root: TransformedSelect,
    pub related: Vec<Correlation>,
    pub invalidation: InvalidationInfo,
}

impl TransformedQuery {
    /// Queries with correlations re-execute fully; single-table queries can
    /// be diffed incrementally. Both converge through the same row diffing.
    pub fn is_incremental(&self) -> bool {
        self.related.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.root.table.as_str())
            .chain(self.related.iter().map(|c| c.child.table.as_str()))
    }
}

/// Canonicalize one AST against the catalog.
pub fn transform(ast: &SelectAst, catalog: &Catalog) -> QueryResult<TransformedQuery> {
    let root_spec = lookup_table(catalog, &ast.table)?;
    let root = expand_select(
        root_spec,
        ast.table.clone(),
        &ast.columns,
        ast.filter.clone(),
        ast.order_by.clone(),
    )?;

    let mut related = Vec::with_capacity(ast.related.len());
    for sub in &ast.related {
        if sub.relationship.is_empty() {
            return Err(QueryError::UnknownRelationship {
                relationship: sub.relationship.clone(),
                table: ast.table.clone(),
            });
        }
        require_column(root_spec, &sub.parent_column)?;
        let child_spec = lookup_table(catalog, &sub.child_table)?;
        require_column(child_spec, &sub.child_column)?;

        let alias = format!(
            "{}{}{}{}{}",
            root.alias, ALIAS_SEPARATOR, sub.relationship, ALIAS_SEPARATOR, sub.child_table
        );
        // The correlation column must come along for the join itself.
        let mut columns = sub.columns.clone();
        columns.push(sub.child_column.clone());
        let child = expand_select(child_spec, alias, &columns, sub.filter.clone(), vec![])?;
        related.push(Correlation {
            relationship: sub.relationship.clone(),
            parent_column: sub.parent_column.clone(),
            child_column: sub.child_column.clone(),
            child,
        });
    }
    related.sort_by(|a, b| a.relationship.cmp(&b.relationship));

    let invalidation = build_invalidation(&root, &related);
    let hash = hash_canonical(&root, &related);

    Ok(TransformedQuery {
        hash,
        root,
        related,
        invalidation,
    })
}

fn lookup_table<'a>(catalog: &'a Catalog, table: &str) -> QueryResult<&'a TableSpec> {
    catalog.get(table).ok_or_else(|| QueryError::UnknownTable {
        table: table.to_owned(),
    })
}

fn require_column(spec: &TableSpec, column: &str) -> QueryResult<()> {
    if spec.has_column(column) {
        Ok(())
    } else {
        Err(QueryError::UnknownColumn {
            table: spec.full_name(),
            column: column.to_owned(),
        })
    }
}

fn expand_select(
    spec: &TableSpec,
    alias: String,
    columns: &[String],
    filter: Option<Condition>,
    order_by: Vec<OrderTerm>,
) -> QueryResult<TransformedSelect> {
    let mut expanded = BTreeSet::new();
    for column in columns {
        require_column(spec, column)?;
        expanded.insert(column.clone());
    }
    if let Some(filter) = &filter {
        let mut referenced = Vec::new();
        filter.referenced_columns(&mut referenced);
        for column in referenced {
            require_column(spec, &column)?;
            expanded.insert(column);
        }
    }
    for term in &order_by {
        require_column(spec, &term.column)?;
        expanded.insert(term.column.clone());
    }
    for key_column in spec.normalized_key_columns() {
        expanded.insert(key_column.to_owned());
    }
    expanded.insert(ROW_VERSION_COLUMN.to_owned());

    let mut order_by = order_by;
    for key_column in spec.normalized_key_columns() {
        if !order_by.iter().any(|term| term.column == key_column) {
            order_by.push(OrderTerm {
                column: key_column.to_owned(),
                direction: Direction::Asc,
            });
        }
    }

    Ok(TransformedSelect {
        table: spec.full_name(),
        alias,
        columns: expanded.into_iter().collect(),
        filter: filter.map(normalize_condition),
        order_by,
    })
}

/// Normalize a condition tree: nested conjunctions flatten, conjuncts and
/// disjuncts sort by their canonical serialization and deduplicate.
fn normalize_condition(condition: Condition) -> Condition {
    match condition {
        Condition::And { conditions } => {
            let mut flat = Vec::new();
            for condition in conditions.into_iter().map(normalize_condition) {
                match condition {
                    Condition::And { conditions } => flat.extend(conditions),
                    other => flat.push(other),
                }
            }
            sort_dedup(&mut flat);
            if flat.len() == 1 {
                flat.pop().unwrap()
            } else {
                Condition::And { conditions: flat }
            }
        }
        Condition::Or { conditions } => {
            let mut normalized: Vec<_> =
                conditions.into_iter().map(normalize_condition).collect();
            sort_dedup(&mut normalized);
            if normalized.len() == 1 {
                normalized.pop().unwrap()
            } else {
                Condition::Or {
                    conditions: normalized,
                }
            }
        }
        cmp @ Condition::Cmp { .. } => cmp,
    }
}

fn sort_dedup(conditions: &mut Vec<Condition>) {
    conditions.sort_by_key(|c| serde_json::to_string(c).expect("conditions serialize"));
    conditions.dedup();
}

#[derive(Serialize)]
struct CanonicalForm<'a> {
    root: &'a TransformedSelect,
    related: &'a [Correlation],
}

fn hash_canonical(root: &TransformedSelect, related: &[Correlation]) -> TransformationHash {
    let canonical = serde_json::to_vec(&CanonicalForm { root, related })
        .expect("canonical form serializes");
    TransformationHash(format!("{:016x}", xxh64(&canonical, HASH_SEED)))
}

/// The dependency summary. Equality-only filters narrow to value tags;
/// anything else, including correlated children whose membership depends on
/// parent rows, is a full-table dependency.
fn build_invalidation(root: &TransformedSelect, related: &[Correlation]) -> InvalidationInfo {
    let mut info = InvalidationInfo::default();
    match &root.filter {
        Some(filter) => {
            if !add_equality_tags(&mut info, &root.table, filter) {
                info.add_full_table(&root.table);
            }
        }
        None => info.add_full_table(&root.table),
    }
    for correlation in related {
        info.add_full_table(&correlation.child.table);
    }
    info
}

/// Returns false when the condition is not a pure conjunction of equalities.
fn add_equality_tags(info: &mut InvalidationInfo, table: &str, condition: &Condition) -> bool {
    match condition {
        Condition::Cmp {
            column,
            op: CmpOp::Eq,
            value,
        } => {
            info.add_equality(table, column, value);
            true
        }
        Condition::And { conditions } => conditions
            .iter()
            .all(|c| add_equality_tags(info, table, c)),
        _ => false,
    }
}
