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

//! Diffing two pinned replica versions.
//!
//! The cursor walks change-index entries in `(prev, curr]` in
//! `(state version, table, row key)` order and resolves each entry against
//! both snapshots. Truncates expand into one tombstone per row present in the
//! previous snapshot.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use syncwave_common::{Row, Watermark};

use crate::error::{StorageError, StorageResult};
use crate::range_kv::RangeKv;
use crate::replica::{PinnedSnapshot, Replica, ReplicaOp};

const DIFF_BATCH: usize = 256;

/// One row-level difference between the two snapshot versions.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    pub row_key: Bytes,
    pub prev_value: Option<Row>,
    pub next_value: Option<Row>,
}

/// Reusable cursor state, leased from the pool for the lifetime of one
/// iteration and returned on close, including on abort.
#[derive(Debug)]
struct DiffHandle {
    batch: VecDeque<(Bytes, Watermark, String, Bytes, ReplicaOp)>,
    truncated: VecDeque<RowChange>,
}

impl DiffHandle {
    fn new() -> Self {
        Self {
            batch: VecDeque::with_capacity(DIFF_BATCH),
            truncated: VecDeque::new(),
        }
    }

    fn clear(&mut self) {
        self.batch.clear();
        self.truncated.clear();
    }
}

#[derive(Debug, Clone, Default)]
struct HandlePool {
    idle: Arc<Mutex<Vec<DiffHandle>>>,
}

impl HandlePool {
    fn acquire(&self) -> DiffHandle {
        self.idle.lock().pop().unwrap_or_else(DiffHandle::new)
    }

    fn release(&self, mut handle: DiffHandle) {
        handle.clear();
        self.idle.lock().push(handle);
    }
}

/// A pair of pinned read snapshots plus the machinery to iterate the
/// version-ordered diff between them.
#[derive(Debug)]
pub struct Snapshotter<R: RangeKv> {
    prev: PinnedSnapshot<R>,
    curr: PinnedSnapshot<R>,
    pool: HandlePool,
}

impl<R: RangeKv> Snapshotter<R> {
    pub fn new(prev: PinnedSnapshot<R>, curr: PinnedSnapshot<R>) -> Self {
        debug_assert!(prev.version() <= curr.version());
        Self {
            prev,
            curr,
            pool: HandlePool::default(),
        }
    }

    /// Pin `(v1, v2]` on the given replica.
    pub fn between(replica: &Replica<R>, v1: Watermark, v2: Watermark) -> Self {
        Self::new(replica.pin_at(v1), replica.pin_at(v2))
    }

    pub fn prev(&self) -> &PinnedSnapshot<R> {
        &self.prev
    }

    pub fn curr(&self) -> &PinnedSnapshot<R> {
        &self.curr
    }

    fn replica(&self) -> &Replica<R> {
        self.curr.replica()
    }

    fn check_valid(&self) -> StorageResult<()> {
        let floor = self.replica().floor();
        if *self.prev.version() < floor {
            return Err(StorageError::InvalidDiff {
                base: self.prev.version().clone(),
                floor,
            });
        }
        // The catalog swap at `changed_at` splits the history: commits at or
        // below it used the old column set. A window straddling that point
        // cannot be diffed. The initial registration on an empty replica is
        // not a change.
        let changed_at = self.replica().catalog_changed_at();
        if !changed_at.is_min()
            && changed_at >= *self.prev.version()
            && changed_at < *self.curr.version()
        {
            return Err(StorageError::SchemaChange { changed_at });
        }
        Ok(())
    }

    /// Start iterating the diff. Fails up front when the base version fell
    /// below the compaction floor or the catalog changed inside the window.
    pub fn diff(&self) -> StorageResult<DiffCursor<'_, R>> {
        self.check_valid()?;
        Ok(DiffCursor {
            snapshotter: self,
            handle: Some(self.pool.acquire()),
            resume: None,
        })
    }
}

/// Lazy cursor over the snapshot diff. `close` is idempotent and also runs on
/// drop, so the leased handle always returns to the pool.
#[derive(Debug)]
pub struct DiffCursor<'a, R: RangeKv> {
    snapshotter: &'a Snapshotter<R>,
    handle: Option<DiffHandle>,
    resume: Option<Bytes>,
}

impl<R: RangeKv> DiffCursor<'_, R> {
    pub fn next(&mut self) -> StorageResult<Option<RowChange>> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(None);
        };

        if let Some(expanded) = handle.truncated.pop_front() {
            return Ok(Some(expanded));
        }

        if handle.batch.is_empty() {
            // Re-validate on every storage read: compaction may have advanced
            // underneath a long-lived cursor.
            self.snapshotter.check_valid()?;
            let chunk = self.snapshotter.replica().change_index_chunk(
                self.snapshotter.prev.version(),
                self.snapshotter.curr.version(),
                self.resume.as_ref(),
                DIFF_BATCH,
            )?;
            let handle = self.handle.as_mut().unwrap();
            handle.batch.extend(chunk);
        }

        let handle = self.handle.as_mut().unwrap();
        let Some((key, _version, table, row_key, op)) = handle.batch.pop_front() else {
            return Ok(None);
        };
        self.resume = Some(key);

        match op {
            ReplicaOp::Set => {
                let next_value = self.snapshotter.curr.get(&table, &row_key)?;
                let prev_value = self.snapshotter.prev.get(&table, &row_key)?;
                Ok(Some(RowChange {
                    table,
                    row_key,
                    prev_value,
                    next_value,
                }))
            }
            ReplicaOp::Del => {
                let prev_value = self.snapshotter.prev.get(&table, &row_key)?;
                Ok(Some(RowChange {
                    table,
                    row_key,
                    prev_value,
                    next_value: None,
                }))
            }
            ReplicaOp::Truncate => {
                let rows = self.snapshotter.prev.scan_table(&table)?;
                let handle = self.handle.as_mut().unwrap();
                for (row_key, row) in rows {
                    handle.truncated.push_back(RowChange {
                        table: table.clone(),
                        row_key,
                        prev_value: Some(row),
                        next_value: None,
                    });
                }
                match handle.truncated.pop_front() {
                    Some(expanded) => Ok(Some(expanded)),
                    // Truncate of an already-empty table.
                    None => self.next(),
                }
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.snapshotter.pool.release(handle);
        }
    }
}

impl<R: RangeKv> Drop for DiffCursor<'_, R> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use syncwave_common::catalog::{ColumnSpec, DataType, RowKey};
    use syncwave_common::{Change, CommitPayload};

    use super::*;
    use crate::range_kv::BTreeMapRangeKv;
    use crate::replica::tests::{key_of, test_replica, user_row, users_spec};

    fn commit(replica: &Replica<BTreeMapRangeKv>, lsn: u64, changes: Vec<Change>) {
        replica
            .ingest_commit(&CommitPayload::new(Watermark::from_lsn(lsn), changes))
            .unwrap();
    }

    fn insert(id: i64, name: &str) -> Change {
        Change::Insert {
            table: "public.users".into(),
            row: user_row(id, name),
        }
    }

    fn delete(id: i64) -> Change {
        Change::Delete {
            table: "public.users".into(),
            key: RowKey::from_row(&users_spec(), &user_row(id, "")).unwrap(),
        }
    }

    fn drain<R: RangeKv>(snapshotter: &Snapshotter<R>) -> Vec<RowChange> {
        let mut cursor = snapshotter.diff().unwrap();
        let mut out = Vec::new();
        while let Some(change) = cursor.next().unwrap() {
            out.push(change);
        }
        cursor.close();
        out
    }

    #[test]
    fn test_diff_roundtrip() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a"), insert(2, "b")]);
        commit(&replica, 2, vec![insert(1, "a2"), insert(3, "c")]);
        commit(&replica, 3, vec![delete(2)]);

        let snapshotter =
            Snapshotter::between(&replica, Watermark::from_lsn(1), Watermark::from_lsn(3));
        let changes = drain(&snapshotter);

        // Exactly the rows touched after v1: 1 updated, 3 inserted, 2 deleted.
        assert_eq!(changes.len(), 3);

        let for_key = |id: i64| changes.iter().find(|c| c.row_key == key_of(id)).unwrap();
        let updated = for_key(1);
        assert_eq!(
            updated.prev_value.as_ref().unwrap().get("name"),
            Some(&"a".into())
        );
        assert_eq!(
            updated.next_value.as_ref().unwrap().get("name"),
            Some(&"a2".into())
        );
        let inserted = for_key(3);
        assert_eq!(inserted.prev_value, None);
        assert!(inserted.next_value.is_some());
        let deleted = for_key(2);
        assert_eq!(deleted.next_value, None);
        assert_eq!(
            deleted.prev_value.as_ref().unwrap().get("name"),
            Some(&"b".into())
        );
    }

    #[test]
    fn test_diff_order_is_version_major() {
        let replica = test_replica();
        commit(&replica, 1, vec![]);
        commit(&replica, 2, vec![insert(9, "z")]);
        commit(&replica, 3, vec![insert(1, "a")]);

        let snapshotter =
            Snapshotter::between(&replica, Watermark::from_lsn(1), Watermark::from_lsn(3));
        let changes = drain(&snapshotter);
        // Version order wins over key order.
        assert_eq!(changes[0].row_key, key_of(9));
        assert_eq!(changes[1].row_key, key_of(1));
    }

    #[test]
    fn test_truncate_expansion() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a"), insert(2, "b")]);
        commit(
            &replica,
            2,
            vec![Change::Truncate {
                table: "public.users".into(),
            }],
        );

        let snapshotter =
            Snapshotter::between(&replica, Watermark::from_lsn(1), Watermark::from_lsn(2));
        let changes = drain(&snapshotter);
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| c.next_value.is_none() && c.prev_value.is_some()));
    }

    #[test]
    fn test_schema_change_fails_diff() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a")]);

        let mut widened = users_spec();
        widened.columns.insert(
            "email".to_owned(),
            ColumnSpec {
                data_type: DataType::String,
                not_null: false,
            },
        );
        replica.register_table(widened).unwrap();
        commit(&replica, 2, vec![insert(2, "b")]);

        let snapshotter =
            Snapshotter::between(&replica, Watermark::min(), Watermark::from_lsn(2));
        let err = snapshotter.diff().unwrap_err();
        assert!(matches!(err, StorageError::SchemaChange { .. }));
    }

    #[test]
    fn test_compacted_base_fails_diff() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a")]);
        commit(&replica, 2, vec![insert(1, "b")]);
        commit(&replica, 3, vec![insert(1, "c")]);

        // No pins outstanding, so compaction advances the floor past v1. A
        // diff then based at v1 is no longer coherent.
        replica.compact_below(&Watermark::from_lsn(2)).unwrap();
        let snapshotter =
            Snapshotter::between(&replica, Watermark::from_lsn(1), Watermark::from_lsn(3));
        let err = snapshotter.diff().unwrap_err();
        assert!(matches!(err, StorageError::InvalidDiff { .. }));
    }
}
