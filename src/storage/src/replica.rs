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

//! The local multi-version replica.
//!
//! Every row write lands as its own `(table, row key, version)` entry, so a
//! read at version `v` resolves to the newest entry at or below `v`. One
//! commit is one atomic batch: the row versions, the cross-table change-log
//! index and the replica watermark all land together. Pinned snapshots hold
//! versions live; the oldest pin gates compaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use syncwave_common::catalog::{Catalog, RowKey, TableSpec};
use syncwave_common::{Change, CommitPayload, Watermark};

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::range_kv::RangeKv;

const REPLICA_META: &str = "replica_meta";
const COMPACT_BATCH: usize = 512;

/// Operation recorded in the change-log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOp {
    Set,
    Del,
    Truncate,
}

impl ReplicaOp {
    fn encode(self) -> Bytes {
        Bytes::from_static(match self {
            ReplicaOp::Set => b"s",
            ReplicaOp::Del => b"d",
            ReplicaOp::Truncate => b"t",
        })
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        match bytes {
            b"s" => Ok(ReplicaOp::Set),
            b"d" => Ok(ReplicaOp::Del),
            b"t" => Ok(ReplicaOp::Truncate),
            other => Err(StorageError::Corrupt(format!(
                "unknown change index op {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReplicaMeta {
    version: Watermark,
    floor: Watermark,
    catalog: Catalog,
    catalog_changed_at: Watermark,
}

#[derive(Debug)]
struct ReplicaShared {
    meta: RwLock<ReplicaMeta>,
    /// Pinned versions with reference counts.
    pins: Mutex<BTreeMap<Watermark, usize>>,
    /// Serializes writers. The replicator is the only steady-state writer,
    /// this also covers catalog updates and compaction.
    write_lock: Mutex<()>,
}

#[derive(Debug)]
pub struct Replica<R: RangeKv> {
    kv: R,
    shared: Arc<ReplicaShared>,
}

impl<R: RangeKv> Clone for Replica<R> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<R: RangeKv> Replica<R> {
    pub fn open(kv: R) -> StorageResult<Self> {
        let meta = match kv.get(&keys::state_key(REPLICA_META))? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => ReplicaMeta::default(),
        };
        Ok(Self {
            kv,
            shared: Arc::new(ReplicaShared {
                meta: RwLock::new(meta),
                pins: Mutex::new(BTreeMap::new()),
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn version(&self) -> Watermark {
        self.shared.meta.read().version.clone()
    }

    /// Oldest version still readable. Diffs based below it are invalid.
    pub fn floor(&self) -> Watermark {
        self.shared.meta.read().floor.clone()
    }

    pub fn catalog(&self) -> Catalog {
        self.shared.meta.read().catalog.clone()
    }

    /// Version at which the current catalog took effect. A diff whose base is
    /// older spans a schema change.
    pub fn catalog_changed_at(&self) -> Watermark {
        self.shared.meta.read().catalog_changed_at.clone()
    }

    /// Install a new table set. Bumps the schema-change marker to the current
    /// version, which invalidates diffs crossing this point.
    pub fn set_catalog(&self, catalog: Catalog) -> StorageResult<()> {
        let _guard = self.shared.write_lock.lock();
        let mut meta = self.shared.meta.read().clone();
        if catalog.fingerprint() == meta.catalog.fingerprint() {
            return Ok(());
        }
        meta.catalog = catalog;
        meta.catalog_changed_at = meta.version.clone();
        self.persist_meta(&meta)
    }

    pub fn register_table(&self, spec: TableSpec) -> StorageResult<()> {
        let mut catalog = self.catalog();
        catalog.register(spec);
        self.set_catalog(catalog)
    }

    fn persist_meta(&self, meta: &ReplicaMeta) -> StorageResult<()> {
        self.kv.ingest_batch(
            [(
                keys::state_key(REPLICA_META),
                Some(Bytes::from(serde_json::to_vec(meta)?)),
            )]
            .into_iter(),
        )?;
        *self.shared.meta.write() = meta.clone();
        Ok(())
    }

    pub(crate) fn kv(&self) -> &R {
        &self.kv
    }

    /// Apply one committed transaction: row versions with `_0_version` set,
    /// change-log index maintenance and the watermark bump, in one batch.
    pub fn ingest_commit(&self, payload: &CommitPayload) -> StorageResult<()> {
        let _guard = self.shared.write_lock.lock();
        let mut meta = self.shared.meta.read().clone();
        if payload.watermark <= meta.version {
            return Err(StorageError::WatermarkRegression {
                watermark: payload.watermark.clone(),
                last: meta.version.clone(),
            });
        }

        let watermark = &payload.watermark;
        let mut batch: Vec<(Bytes, Option<Bytes>)> = Vec::new();
        // Rows already written by this commit, so later changes in the same
        // transaction (notably truncate) observe them.
        let mut pending: HashMap<String, HashMap<Bytes, bool>> = HashMap::new();

        for change in &payload.changes {
            match change {
                Change::Insert { table, row } => {
                    let spec = self.table_spec(&meta, table)?;
                    let key = RowKey::from_row(&spec, row)?.encode();
                    self.put_row(&mut batch, table, &key, watermark, row)?;
                    self.index_set(&mut batch, table, &key, watermark)?;
                    pending.entry(table.clone()).or_default().insert(key, true);
                }
                Change::Update { table, old_key, row } => {
                    let spec = self.table_spec(&meta, table)?;
                    let key = RowKey::from_row(&spec, row)?.encode();
                    if let Some(old_key) = old_key {
                        let old = old_key.encode();
                        if old != key {
                            batch.push((
                                keys::row_version_key(table, &old, watermark),
                                Some(Bytes::new()),
                            ));
                            self.index_del(&mut batch, table, &old, watermark)?;
                            pending
                                .entry(table.clone())
                                .or_default()
                                .insert(old, false);
                        }
                    }
                    self.put_row(&mut batch, table, &key, watermark, row)?;
                    self.index_set(&mut batch, table, &key, watermark)?;
                    pending.entry(table.clone()).or_default().insert(key, true);
                }
                Change::Delete { table, key } => {
                    let key = key.encode();
                    batch.push((
                        keys::row_version_key(table, &key, watermark),
                        Some(Bytes::new()),
                    ));
                    self.index_del(&mut batch, table, &key, watermark)?;
                    pending.entry(table.clone()).or_default().insert(key, false);
                }
                Change::Truncate { table } => {
                    // Tombstone every row live at the pre-state, plus rows
                    // written earlier in this same transaction.
                    let mut live: BTreeMap<Bytes, ()> = self
                        .scan_table_live(table, &meta.version)?
                        .into_iter()
                        .map(|(key, _)| (key, ()))
                        .collect();
                    if let Some(rows) = pending.get_mut(table) {
                        for (key, alive) in rows.iter_mut() {
                            if *alive {
                                live.insert(key.clone(), ());
                            }
                            *alive = false;
                        }
                    }
                    for key in live.keys() {
                        batch.push((
                            keys::row_version_key(table, key, watermark),
                            Some(Bytes::new()),
                        ));
                    }
                    self.index_truncate(&mut batch, table, watermark)?;
                }
                Change::Begin | Change::Commit { .. } => {
                    return Err(anyhow!("transaction bracket inside commit payload").into());
                }
            }
        }

        meta.version = payload.watermark.clone();
        batch.push((
            keys::state_key(REPLICA_META),
            Some(Bytes::from(serde_json::to_vec(&meta)?)),
        ));

        self.kv.ingest_batch(batch.into_iter())?;
        *self.shared.meta.write() = meta;
        Ok(())
    }

    fn table_spec(&self, meta: &ReplicaMeta, table: &str) -> StorageResult<TableSpec> {
        meta.catalog
            .get(table)
            .cloned()
            .ok_or_else(|| anyhow!("change for unknown table {table}").into())
    }

    fn put_row(
        &self,
        batch: &mut Vec<(Bytes, Option<Bytes>)>,
        table: &str,
        key: &Bytes,
        watermark: &Watermark,
        row: &syncwave_common::Row,
    ) -> StorageResult<()> {
        let mut versioned = row.clone();
        versioned.set_version(watermark);
        batch.push((
            keys::row_version_key(table, key, watermark),
            Some(Bytes::from(serde_json::to_vec(&versioned)?)),
        ));
        Ok(())
    }

    /// Upsert the live change-index entry for a row: the prior entry, if any,
    /// is superseded in place.
    fn index_put(
        &self,
        batch: &mut Vec<(Bytes, Option<Bytes>)>,
        table: &str,
        key: &Bytes,
        watermark: &Watermark,
        op: ReplicaOp,
    ) -> StorageResult<()> {
        if let Some(old_version) = self.kv.get(&keys::change_index_by_row_key(table, key))? {
            let old_version =
                Watermark::from_string(String::from_utf8(old_version.to_vec()).map_err(|_| {
                    StorageError::Corrupt("non-utf8 version in by-row index".into())
                })?);
            batch.push((keys::change_index_key(&old_version, table, key), None));
        }
        batch.push((
            keys::change_index_key(watermark, table, key),
            Some(op.encode()),
        ));
        batch.push((
            keys::change_index_by_row_key(table, key),
            Some(Bytes::copy_from_slice(watermark.as_str().as_bytes())),
        ));
        Ok(())
    }

    fn index_set(
        &self,
        batch: &mut Vec<(Bytes, Option<Bytes>)>,
        table: &str,
        key: &Bytes,
        watermark: &Watermark,
    ) -> StorageResult<()> {
        self.index_put(batch, table, key, watermark, ReplicaOp::Set)
    }

    fn index_del(
        &self,
        batch: &mut Vec<(Bytes, Option<Bytes>)>,
        table: &str,
        key: &Bytes,
        watermark: &Watermark,
    ) -> StorageResult<()> {
        self.index_put(batch, table, key, watermark, ReplicaOp::Del)
    }

    /// Drop every live index entry of the table and record one truncate
    /// sentinel with an empty row key.
    fn index_truncate(
        &self,
        batch: &mut Vec<(Bytes, Option<Bytes>)>,
        table: &str,
        watermark: &Watermark,
    ) -> StorageResult<()> {
        let live = self
            .kv
            .range(keys::change_index_by_row_table_range(table), None)?;
        for (by_row_key, version) in live {
            let version = Watermark::from_string(
                String::from_utf8(version.to_vec())
                    .map_err(|_| StorageError::Corrupt("non-utf8 version in by-row index".into()))?,
            );
            // The by-row key is prefix + raw row key bytes.
            let row_key = &by_row_key[keys::change_index_by_row_key(table, b"").len()..];
            batch.push((keys::change_index_key(&version, table, row_key), None));
            batch.push((Bytes::copy_from_slice(&by_row_key), None));
        }
        self.index_put(batch, table, &Bytes::new(), watermark, ReplicaOp::Truncate)
    }

    /// Newest value of one row at or below `version`. `None` when absent or
    /// deleted.
    pub fn get_row_at(
        &self,
        table: &str,
        key: &[u8],
        version: &Watermark,
    ) -> StorageResult<Option<syncwave_common::Row>> {
        let newest = self
            .kv
            .rev_range(keys::row_versions_up_to(table, key, version), Some(1))?;
        match newest.into_iter().next() {
            None => Ok(None),
            Some((_, value)) if value.is_empty() => Ok(None),
            Some((_, value)) => Ok(Some(serde_json::from_slice(&value)?)),
        }
    }

    /// All rows of `table` live at `version`, in row-key order.
    pub fn scan_table_live(
        &self,
        table: &str,
        version: &Watermark,
    ) -> StorageResult<Vec<(Bytes, syncwave_common::Row)>> {
        let entries = self.kv.range(keys::table_rows_range(table), None)?;
        let mut out = Vec::new();
        // Newest retained entry of the row currently being grouped. Entries
        // are version-ascending within one row, so the last one wins.
        let mut current: Option<(Bytes, Bytes)> = None;
        for (key, value) in entries {
            let (_, row_key, entry_version) = keys::decode_row_version_key(&key)?;
            if entry_version > *version {
                continue;
            }
            let same_row = matches!(&current, Some((open_key, _)) if *open_key == row_key);
            if same_row {
                if let Some((_, best)) = current.as_mut() {
                    *best = value;
                }
            } else if let Some((open_key, best)) = current.replace((row_key, value)) {
                if !best.is_empty() {
                    out.push((open_key, serde_json::from_slice(&best)?));
                }
            }
        }
        if let Some((open_key, best)) = current {
            if !best.is_empty() {
                out.push((open_key, serde_json::from_slice(&best)?));
            }
        }
        Ok(out)
    }

    /// Pin the current version. The returned snapshot keeps reads at this
    /// version valid until dropped.
    pub fn pin(&self) -> PinnedSnapshot<R> {
        self.pin_at(self.version())
    }

    pub fn pin_at(&self, version: Watermark) -> PinnedSnapshot<R> {
        *self.shared.pins.lock().entry(version.clone()).or_insert(0) += 1;
        PinnedSnapshot {
            replica: self.clone(),
            version,
        }
    }

    fn unpin(&self, version: &Watermark) {
        let mut pins = self.shared.pins.lock();
        if let Some(count) = pins.get_mut(version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(version);
            }
        }
    }

    fn oldest_pin(&self) -> Option<Watermark> {
        self.shared.pins.lock().keys().next().cloned()
    }

    /// Drop row versions and change-index entries shadowed below `floor`.
    /// The floor is clamped to the oldest pinned snapshot.
    pub fn compact_below(&self, floor: &Watermark) -> StorageResult<()> {
        let _guard = self.shared.write_lock.lock();
        let mut floor = floor.clone();
        if let Some(oldest) = self.oldest_pin() {
            floor = floor.min(oldest);
        }
        let mut meta = self.shared.meta.read().clone();
        floor = floor.min(meta.version.clone());
        if floor <= meta.floor {
            return Ok(());
        }

        self.compact_rows(&floor)?;
        self.compact_change_index(&floor)?;

        meta.floor = floor;
        self.persist_meta(&meta)
    }

    fn compact_rows(&self, floor: &Watermark) -> StorageResult<()> {
        // Within one row, every entry strictly below the newest entry at or
        // below the floor is shadowed. A tombstone at the top of that stack
        // goes too.
        let mut resume: Option<Bytes> = None;
        let mut group: Option<(String, Bytes)> = None;
        let mut group_entries: Vec<(Bytes, Watermark, bool)> = Vec::new();
        loop {
            let range = match &resume {
                None => (
                    std::ops::Bound::Included(Bytes::from(vec![keys::KS_ROW])),
                    keys::table_rows_upper_bound(),
                ),
                Some(key) => (std::ops::Bound::Excluded(key.clone()), keys::table_rows_upper_bound()),
            };
            let chunk = self.kv.range(range, Some(COMPACT_BATCH))?;
            let done = chunk.is_empty();
            for (key, value) in chunk {
                resume = Some(key.clone());
                let (table, row_key, version) = keys::decode_row_version_key(&key)?;
                if group.as_ref() != Some(&(table.clone(), row_key.clone())) {
                    self.flush_row_group(floor, &mut group_entries)?;
                    group = Some((table, row_key));
                }
                group_entries.push((key, version, value.is_empty()));
            }
            if done {
                self.flush_row_group(floor, &mut group_entries)?;
                return Ok(());
            }
        }
    }

    fn flush_row_group(
        &self,
        floor: &Watermark,
        entries: &mut Vec<(Bytes, Watermark, bool)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // Index of the newest entry at or below the floor.
        let visible = entries
            .iter()
            .rposition(|(_, version, _)| version <= floor);
        let mut removals = Vec::new();
        if let Some(visible) = visible {
            for (key, _, _) in &entries[..visible] {
                removals.push((key.clone(), None));
            }
            let (key, _, is_tombstone) = &entries[visible];
            if *is_tombstone {
                removals.push((key.clone(), None));
            }
        }
        entries.clear();
        if !removals.is_empty() {
            self.kv.ingest_batch(removals.into_iter())?;
        }
        Ok(())
    }

    fn compact_change_index(&self, floor: &Watermark) -> StorageResult<()> {
        loop {
            let chunk = self
                .kv
                .range(keys::change_index_range_below(floor), Some(COMPACT_BATCH))?;
            if chunk.is_empty() {
                return Ok(());
            }
            let mut removals = Vec::new();
            for (key, _) in chunk {
                let (version, table, row_key) = keys::decode_change_index_key(&key)?;
                removals.push((key, None));
                let by_row_key = keys::change_index_by_row_key(&table, &row_key);
                if let Some(live) = self.kv.get(&by_row_key)? {
                    if live.as_ref() == version.as_str().as_bytes() {
                        removals.push((by_row_key, None));
                    }
                }
            }
            self.kv.ingest_batch(removals.into_iter())?;
        }
    }

    /// One chunk of change-index entries in `(after, up_to]`, resuming after
    /// `resume` when given. Used by the snapshot differ.
    pub(crate) fn change_index_chunk(
        &self,
        after: &Watermark,
        up_to: &Watermark,
        resume: Option<&Bytes>,
        limit: usize,
    ) -> StorageResult<Vec<(Bytes, Watermark, String, Bytes, ReplicaOp)>> {
        let (lower, upper) = keys::change_index_range(after, up_to);
        let lower = match resume {
            Some(key) => std::ops::Bound::Excluded(key.clone()),
            None => lower,
        };
        let chunk = self.kv.range((lower, upper), Some(limit))?;
        let mut out = Vec::with_capacity(chunk.len());
        for (key, value) in chunk {
            let (version, table, row_key) = keys::decode_change_index_key(&key)?;
            let op = ReplicaOp::decode(&value)?;
            out.push((key, version, table, row_key, op));
        }
        Ok(out)
    }
}

/// A read view of the replica at one pinned version.
#[derive(Debug)]
pub struct PinnedSnapshot<R: RangeKv> {
    replica: Replica<R>,
    version: Watermark,
}

impl<R: RangeKv> PinnedSnapshot<R> {
    pub fn version(&self) -> &Watermark {
        &self.version
    }

    pub fn catalog(&self) -> Catalog {
        self.replica.catalog()
    }

    pub fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<syncwave_common::Row>> {
        self.replica.get_row_at(table, key, &self.version)
    }

    pub fn scan_table(&self, table: &str) -> StorageResult<Vec<(Bytes, syncwave_common::Row)>> {
        self.replica.scan_table_live(table, &self.version)
    }

    pub(crate) fn replica(&self) -> &Replica<R> {
        &self.replica
    }
}

impl<R: RangeKv> Drop for PinnedSnapshot<R> {
    fn drop(&mut self) {
        self.replica.unpin(&self.version);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap as StdBTreeMap;
    use std::sync::Arc;

    use parking_lot::RwLock;
    use syncwave_common::catalog::{ColumnSpec, DataType};
    use syncwave_common::types::Datum;
    use syncwave_common::Row;

    use super::*;
    use crate::range_kv::BTreeMapRangeKv;

    pub(crate) fn users_spec() -> TableSpec {
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
                    "name".to_owned(),
                    ColumnSpec {
                        data_type: DataType::String,
                        not_null: false,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            primary_key: vec!["id".into()],
        }
    }

    pub(crate) fn test_replica() -> Replica<BTreeMapRangeKv> {
        let kv: BTreeMapRangeKv = Arc::new(RwLock::new(StdBTreeMap::new()));
        let replica = Replica::open(kv).unwrap();
        replica.register_table(users_spec()).unwrap();
        replica
    }

    pub(crate) fn user_row(id: i64, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("id", Datum::Int(id));
        row.insert("name", name);
        row
    }

    pub(crate) fn key_of(id: i64) -> Bytes {
        let row = user_row(id, "");
        RowKey::from_row(&users_spec(), &row).unwrap().encode()
    }

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

    #[test]
    fn test_versioned_reads() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "alice")]);
        commit(&replica, 2, vec![insert(1, "alicia")]);
        commit(&replica, 3, vec![delete(1)]);

        let at = |lsn| replica.get_row_at("public.users", &key_of(1), &Watermark::from_lsn(lsn));
        assert_eq!(at(1).unwrap().unwrap().get("name"), Some(&"alice".into()));
        assert_eq!(at(2).unwrap().unwrap().get("name"), Some(&"alicia".into()));
        assert_eq!(at(3).unwrap(), None);

        // Applied rows carry the writing transaction's watermark.
        assert_eq!(
            at(1).unwrap().unwrap().version(),
            Some(Watermark::from_lsn(1))
        );
    }

    #[test]
    fn test_rejects_stale_commit() {
        let replica = test_replica();
        commit(&replica, 2, vec![insert(1, "a")]);
        let err = replica
            .ingest_commit(&CommitPayload::new(Watermark::from_lsn(2), vec![]))
            .unwrap_err();
        assert!(matches!(err, StorageError::WatermarkRegression { .. }));
    }

    #[test]
    fn test_change_index_single_live_entry() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a")]);
        commit(&replica, 2, vec![insert(1, "b")]);

        // The v1 entry was superseded in place by the v2 one.
        let entries = replica
            .change_index_chunk(&Watermark::min(), &Watermark::from_lsn(9), None, 100)
            .unwrap();
        let for_row: Vec<_> = entries
            .iter()
            .filter(|(_, _, _, key, _)| key == &key_of(1))
            .collect();
        assert_eq!(for_row.len(), 1);
        assert_eq!(for_row[0].1, Watermark::from_lsn(2));
        assert_eq!(for_row[0].4, ReplicaOp::Set);
    }

    #[test]
    fn test_truncate_clears_table_and_index() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a"), insert(2, "b")]);
        commit(
            &replica,
            2,
            vec![Change::Truncate {
                table: "public.users".into(),
            }],
        );

        assert!(replica
            .scan_table_live("public.users", &Watermark::from_lsn(2))
            .unwrap()
            .is_empty());
        // Rows are still visible below the truncate.
        assert_eq!(
            replica
                .scan_table_live("public.users", &Watermark::from_lsn(1))
                .unwrap()
                .len(),
            2
        );

        let entries = replica
            .change_index_chunk(&Watermark::min(), &Watermark::from_lsn(9), None, 100)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].4, ReplicaOp::Truncate);
        assert!(entries[0].3.is_empty());
    }

    #[test]
    fn test_insert_after_truncate_in_one_commit() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a")]);
        commit(
            &replica,
            2,
            vec![
                insert(2, "b"),
                Change::Truncate {
                    table: "public.users".into(),
                },
                insert(3, "c"),
            ],
        );
        let live = replica
            .scan_table_live("public.users", &Watermark::from_lsn(2))
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1.get("id"), Some(&Datum::Int(3)));
    }

    #[test]
    fn test_pin_gates_compaction() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a")]);
        commit(&replica, 2, vec![insert(1, "b")]);
        commit(&replica, 3, vec![insert(1, "c")]);

        let pin = replica.pin_at(Watermark::from_lsn(2));
        replica.compact_below(&Watermark::from_lsn(3)).unwrap();
        // Clamped to the pin: version 2 stays readable.
        assert_eq!(replica.floor(), Watermark::from_lsn(2));
        assert_eq!(
            replica
                .get_row_at("public.users", &key_of(1), &Watermark::from_lsn(2))
                .unwrap()
                .unwrap()
                .get("name"),
            Some(&"b".into())
        );

        drop(pin);
        replica.compact_below(&Watermark::from_lsn(3)).unwrap();
        assert_eq!(replica.floor(), Watermark::from_lsn(3));
        // The v1 entry is gone, v3 still resolves.
        assert_eq!(
            replica
                .get_row_at("public.users", &key_of(1), &Watermark::from_lsn(3))
                .unwrap()
                .unwrap()
                .get("name"),
            Some(&"c".into())
        );
    }

    #[test]
    fn test_compaction_drops_dead_tombstones() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a")]);
        commit(&replica, 2, vec![delete(1)]);
        commit(&replica, 3, vec![insert(2, "b")]);

        replica.compact_below(&Watermark::from_lsn(3)).unwrap();
        // Nothing remains for row 1 at any readable version.
        assert_eq!(
            replica
                .get_row_at("public.users", &key_of(1), &Watermark::from_lsn(3))
                .unwrap(),
            None
        );
        let entries = replica
            .kv()
            .range(keys::row_versions_range("public.users", &key_of(1)), None)
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_schema_change_marker() {
        let replica = test_replica();
        commit(&replica, 1, vec![insert(1, "a")]);
        assert!(replica.catalog_changed_at().is_min());

        let mut widened = users_spec();
        widened.columns.insert(
            "email".to_owned(),
            ColumnSpec {
                data_type: DataType::String,
                not_null: false,
            },
        );
        replica.register_table(widened).unwrap();
        assert_eq!(replica.catalog_changed_at(), Watermark::from_lsn(1));
    }
}
