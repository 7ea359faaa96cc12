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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::RowKey;
use crate::types::watermark::Watermark;
use crate::types::Row;

/// One record of the upstream change feed.
///
/// Records between `Begin` and `Commit` form an atomic transaction; the
/// `Commit` carries the watermark naming the transaction's post-state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum Change {
    Begin,
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        /// Present only when the primary key itself changed.
        old_key: Option<RowKey>,
        row: Row,
    },
    Delete {
        table: String,
        key: RowKey,
    },
    Truncate {
        table: String,
    },
    Commit {
        watermark: Watermark,
    },
}

impl Change {
    /// The table a row-level record touches, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Change::Insert { table, .. }
            | Change::Update { table, .. }
            | Change::Delete { table, .. }
            | Change::Truncate { table } => Some(table),
            Change::Begin | Change::Commit { .. } => None,
        }
    }
}

/// One committed upstream transaction: the interior row-level changes with the
/// commit watermark, brackets stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitPayload {
    pub watermark: Watermark,
    pub changes: Vec<Change>,
}

impl CommitPayload {
    pub fn new(watermark: Watermark, changes: Vec<Change>) -> Self {
        Self { watermark, changes }
    }

    /// Assemble a payload from a bracketed record sequence. The sequence must
    /// be exactly `Begin, <row changes>, Commit`.
    pub fn from_bracketed(records: Vec<Change>) -> Result<Self, MalformedTransaction> {
        let mut iter = records.into_iter();
        match iter.next() {
            Some(Change::Begin) => {}
            other => return Err(MalformedTransaction::MissingBegin { found: other }),
        }
        let mut changes = Vec::new();
        for record in iter {
            match record {
                Change::Commit { watermark } => return Ok(Self { watermark, changes }),
                Change::Begin => return Err(MalformedTransaction::NestedBegin),
                row_change => changes.push(row_change),
            }
        }
        Err(MalformedTransaction::MissingCommit)
    }
}

#[derive(Debug, Error)]
pub enum MalformedTransaction {
    #[error("transaction does not start with begin, found {found:?}")]
    MissingBegin { found: Option<Change> },
    #[error("begin inside an open transaction")]
    NestedBegin,
    #[error("transaction ends without commit")]
    MissingCommit,
}

/// Raised when the upstream reports that its position is no longer compatible
/// with the replica. The supervisor reacts by wiping the replica and re-running
/// initial sync.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("upstream requires a replica reset: {reason}")]
pub struct AutoResetSignal {
    pub reason: String,
}

impl AutoResetSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    fn row(id: i64) -> Row {
        [("id".to_owned(), Datum::Int(id))].into_iter().collect()
    }

    #[test]
    fn test_from_bracketed() {
        let payload = CommitPayload::from_bracketed(vec![
            Change::Begin,
            Change::Insert {
                table: "users".into(),
                row: row(1),
            },
            Change::Commit {
                watermark: Watermark::from_lsn(3),
            },
        ])
        .unwrap();
        assert_eq!(payload.watermark, Watermark::from_lsn(3));
        assert_eq!(payload.changes.len(), 1);
    }

    #[test]
    fn test_from_bracketed_rejects_partial() {
        let err = CommitPayload::from_bracketed(vec![
            Change::Begin,
            Change::Insert {
                table: "users".into(),
                row: row(1),
            },
        ])
        .unwrap_err();
        assert!(matches!(err, MalformedTransaction::MissingCommit));

        let err = CommitPayload::from_bracketed(vec![Change::Truncate {
            table: "users".into(),
        }])
        .unwrap_err();
        assert!(matches!(err, MalformedTransaction::MissingBegin { .. }));
    }

    #[test]
    fn test_change_serde_tagged() {
        let change = Change::Truncate {
            table: "users".into(),
        };
        let json = serde_json::to_string(&change).unwrap();
        assert_eq!(json, r#"{"tag":"truncate","table":"users"}"#);
        let back: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }
}
