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

//! The tagged-variant query AST as received from clients. Opaque to the view
//! syncer; only the transformer interprets it.

use serde::{Deserialize, Serialize};
use syncwave_common::Datum;

/// One parameterized select over a replicated table, with optional correlated
/// sub-selects pulled in through named relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectAst {
    pub table: String,
    /// Explicitly selected columns. The transformer widens this set.
    pub columns: Vec<String>,
    #[serde(default)]
    pub filter: Option<Condition>,
    #[serde(default)]
    pub order_by: Vec<OrderTerm>,
    #[serde(default)]
    pub related: Vec<RelatedQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTerm {
    pub column: String,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum Condition {
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Cmp {
        column: String,
        op: CmpOp,
        value: Datum,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn eval(self, left: &Datum, right: &Datum) -> bool {
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Ne => left != right,
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
            CmpOp::Gt => left > right,
            CmpOp::Ge => left >= right,
        }
    }
}

/// A correlated sub-select reached through a named relationship: child rows
/// where `child_table.child_column == parent.parent_column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedQuery {
    pub relationship: String,
    pub parent_column: String,
    pub child_table: String,
    pub child_column: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub filter: Option<Condition>,
}

impl Condition {
    /// Every column the condition reads.
    pub fn referenced_columns(&self, out: &mut Vec<String>) {
        match self {
            Condition::And { conditions } | Condition::Or { conditions } => {
                for condition in conditions {
                    condition.referenced_columns(out);
                }
            }
            Condition::Cmp { column, .. } => out.push(column.clone()),
        }
    }

    pub fn matches(&self, row: &syncwave_common::Row) -> bool {
        match self {
            Condition::And { conditions } => conditions.iter().all(|c| c.matches(row)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.matches(row)),
            Condition::Cmp { column, op, value } => match row.get(column) {
                Some(actual) => op.eval(actual, value),
                None => false,
            },
        }
    }
}
