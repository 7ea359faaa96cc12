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

//! The durable change log owned by the change streamer.
//!
//! Commits are stored one record per `(watermark, pos)` key, the commit
//! record itself included, so a scan can reassemble transaction boundaries
//! without a separate manifest. A singleton replication-state row carries the
//! last appended watermark and the writer lease.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use syncwave_common::{Change, CommitPayload, Watermark};

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::range_kv::RangeKv;

const REPLICATION_STATE: &str = "replication_state";
const REPLICATION_CONFIG: &str = "replication_config";
const SCHEMA_VERSIONS: &str = "schema_versions";

const SCAN_BATCH: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub last_watermark: Watermark,
    /// Writer lease token. A writer must CAS its own token in before
    /// appending; a foreign token means the lease moved on.
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub replica_version: String,
    pub publications: Vec<String>,
    pub reset_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersions {
    pub min_supported_version: u32,
    pub max_supported_version: u32,
}

impl Default for SchemaVersions {
    fn default() -> Self {
        Self {
            min_supported_version: 1,
            max_supported_version: 1,
        }
    }
}

/// Outcome of reconciling the stored replication config with the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCheck {
    /// Stored and live agree.
    Ready,
    /// Stored state disagreed with the live config; the log was truncated and
    /// reinitialized. Callers must re-run initial sync.
    Reinitialized,
    /// The stored config demands a reset. With auto-reset configured the
    /// supervisor wipes the replica; otherwise this is fatal.
    ResetRequired,
}

#[derive(Clone)]
pub struct ChangeLogStore<R: RangeKv> {
    kv: R,
    // Serializes read-modify-write cycles on the singleton rows.
    state_lock: Arc<Mutex<()>>,
}

impl<R: RangeKv> ChangeLogStore<R> {
    pub fn new(kv: R) -> StorageResult<Self> {
        let store = Self {
            kv,
            state_lock: Arc::new(Mutex::new(())),
        };
        if store.read_state()?.is_none() {
            store.write_state(&ReplicationState::default())?;
        }
        Ok(store)
    }

    fn read_state(&self) -> StorageResult<Option<ReplicationState>> {
        self.kv
            .get(&keys::state_key(REPLICATION_STATE))?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
            .transpose()
    }

    fn write_state(&self, state: &ReplicationState) -> StorageResult<()> {
        self.kv.ingest_batch(
            [(
                keys::state_key(REPLICATION_STATE),
                Some(Bytes::from(serde_json::to_vec(state)?)),
            )]
            .into_iter(),
        )
    }

    pub fn replication_state(&self) -> StorageResult<ReplicationState> {
        self.read_state()?
            .ok_or_else(|| StorageError::Corrupt("missing replication state".into()))
    }

    pub fn last_watermark(&self) -> StorageResult<Watermark> {
        Ok(self.replication_state()?.last_watermark)
    }

    /// CAS this writer's token into the owner slot. Whoever held the lease
    /// before loses it on its next append.
    pub fn acquire_owner(&self, token: &str) -> StorageResult<()> {
        let _guard = self.state_lock.lock();
        let mut state = self.replication_state()?;
        tracing::info!(
            token,
            previous = ?state.owner,
            "acquiring change log writer lease"
        );
        state.owner = Some(token.to_owned());
        self.write_state(&state)
    }

    /// Append one committed transaction. Atomic: the records, the commit
    /// marker and the state watermark land in a single batch.
    pub fn append(&self, owner: &str, payload: &CommitPayload) -> StorageResult<()> {
        let _guard = self.state_lock.lock();
        let mut state = self.replication_state()?;

        match state.owner.as_deref() {
            Some(current) if current == owner => {}
            other => {
                return Err(StorageError::LeaseLost {
                    current_owner: other.unwrap_or("<none>").to_owned(),
                });
            }
        }
        if payload.watermark <= state.last_watermark {
            return Err(StorageError::WatermarkRegression {
                watermark: payload.watermark.clone(),
                last: state.last_watermark.clone(),
            });
        }

        let mut batch = Vec::with_capacity(payload.changes.len() + 2);
        for (pos, change) in payload.changes.iter().enumerate() {
            batch.push((
                keys::log_key(&payload.watermark, pos as u32),
                Some(Bytes::from(serde_json::to_vec(change)?)),
            ));
        }
        let commit = Change::Commit {
            watermark: payload.watermark.clone(),
        };
        batch.push((
            keys::log_key(&payload.watermark, payload.changes.len() as u32),
            Some(Bytes::from(serde_json::to_vec(&commit)?)),
        ));

        state.last_watermark = payload.watermark.clone();
        batch.push((
            keys::state_key(REPLICATION_STATE),
            Some(Bytes::from(serde_json::to_vec(&state)?)),
        ));

        self.kv.ingest_batch(batch.into_iter())
    }

    /// Lazy, restartable scan of all commits with watermark strictly greater
    /// than `after`.
    pub fn scan(&self, after: &Watermark) -> LogScanCursor<R> {
        LogScanCursor {
            kv: self.kv.clone(),
            resume_after: ResumePoint::Watermark(after.clone()),
            batch: VecDeque::new(),
        }
    }

    /// Drop entries strictly below `watermark`. Only sound once every
    /// subscriber has acknowledged at least `watermark`.
    pub fn truncate_below(&self, watermark: &Watermark) -> StorageResult<()> {
        loop {
            let chunk = self
                .kv
                .range(keys::log_range_below(watermark), Some(SCAN_BATCH))?;
            if chunk.is_empty() {
                return Ok(());
            }
            self.kv
                .ingest_batch(chunk.into_iter().map(|(key, _)| (key, None)))?;
        }
    }

    pub fn replication_config(&self) -> StorageResult<Option<ReplicationConfig>> {
        self.kv
            .get(&keys::state_key(REPLICATION_CONFIG))?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
            .transpose()
    }

    pub fn put_replication_config(&self, config: &ReplicationConfig) -> StorageResult<()> {
        self.kv.ingest_batch(
            [(
                keys::state_key(REPLICATION_CONFIG),
                Some(Bytes::from(serde_json::to_vec(config)?)),
            )]
            .into_iter(),
        )
    }

    /// Reconcile the stored replication config with the live one. On
    /// disagreement the log is truncated and the state reinitialized.
    pub fn ensure_config(&self, live: &ReplicationConfig) -> StorageResult<ConfigCheck> {
        let _guard = self.state_lock.lock();
        match self.replication_config()? {
            None => {
                self.put_replication_config(live)?;
                Ok(ConfigCheck::Ready)
            }
            Some(stored) if stored.reset_required => Ok(ConfigCheck::ResetRequired),
            Some(stored)
                if stored.replica_version == live.replica_version
                    && stored.publications == live.publications =>
            {
                Ok(ConfigCheck::Ready)
            }
            Some(stored) => {
                tracing::warn!(
                    stored_version = %stored.replica_version,
                    live_version = %live.replica_version,
                    "replication config changed, reinitializing change log"
                );
                self.wipe()?;
                self.write_state(&ReplicationState::default())?;
                self.put_replication_config(live)?;
                Ok(ConfigCheck::Reinitialized)
            }
        }
    }

    fn wipe(&self) -> StorageResult<()> {
        loop {
            let chunk = self.kv.range(
                keys::log_range_after(&Watermark::min()),
                Some(SCAN_BATCH),
            )?;
            if chunk.is_empty() {
                return Ok(());
            }
            self.kv
                .ingest_batch(chunk.into_iter().map(|(key, _)| (key, None)))?;
        }
    }

    pub fn schema_versions(&self) -> StorageResult<SchemaVersions> {
        Ok(self
            .kv
            .get(&keys::state_key(SCHEMA_VERSIONS))?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?
            .unwrap_or_default())
    }

    pub fn set_schema_versions(&self, versions: &SchemaVersions) -> StorageResult<()> {
        self.kv.ingest_batch(
            [(
                keys::state_key(SCHEMA_VERSIONS),
                Some(Bytes::from(serde_json::to_vec(versions)?)),
            )]
            .into_iter(),
        )
    }
}

enum ResumePoint {
    /// Resume strictly after every entry of this watermark.
    Watermark(Watermark),
    /// Resume strictly after this raw key.
    Key(Bytes),
}

/// Cursor over the change log, yielding one reassembled commit at a time.
/// Restartable: it remembers the last consumed key and re-reads from there,
/// so a consumer can hold it across arbitrarily long pauses.
pub struct LogScanCursor<R: RangeKv> {
    kv: R,
    resume_after: ResumePoint,
    batch: VecDeque<(Bytes, Bytes)>,
}

impl<R: RangeKv> LogScanCursor<R> {
    fn fill_batch(&mut self) -> StorageResult<()> {
        let range = match &self.resume_after {
            ResumePoint::Watermark(after) => keys::log_range_after(after),
            ResumePoint::Key(key) => (
                std::ops::Bound::Excluded(key.clone()),
                keys::log_range_after(&Watermark::min()).1,
            ),
        };
        self.batch = self.kv.range(range, Some(SCAN_BATCH))?.into();
        Ok(())
    }

    /// The next complete commit, or `None` when the cursor has caught up with
    /// the end of the log.
    pub fn next_commit(&mut self) -> StorageResult<Option<CommitPayload>> {
        let mut changes = Vec::new();
        loop {
            let (key, value) = match self.batch.pop_front() {
                Some(entry) => entry,
                None => {
                    self.fill_batch()?;
                    match self.batch.pop_front() {
                        Some(entry) => entry,
                        None if changes.is_empty() => return Ok(None),
                        // Appends are atomic, so a visible commit is complete.
                        None => {
                            return Err(StorageError::Corrupt(
                                "change log ends inside a commit".into(),
                            ));
                        }
                    }
                }
            };

            let (watermark, _pos) = keys::decode_log_key(&key)?;
            let change: Change = serde_json::from_slice(&value)?;
            self.resume_after = ResumePoint::Key(key);

            match change {
                Change::Commit {
                    watermark: committed,
                } => {
                    if committed != watermark {
                        return Err(StorageError::Corrupt(format!(
                            "commit record {committed} filed under {watermark}"
                        )));
                    }
                    return Ok(Some(CommitPayload::new(watermark, changes)));
                }
                other => changes.push(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use parking_lot::RwLock;
    use syncwave_common::types::Datum;
    use syncwave_common::Row;

    use super::*;
    use crate::range_kv::BTreeMapRangeKv;

    fn store() -> ChangeLogStore<BTreeMapRangeKv> {
        let kv: BTreeMapRangeKv = Arc::new(RwLock::new(BTreeMap::new()));
        let store = ChangeLogStore::new(kv).unwrap();
        store.acquire_owner("me").unwrap();
        store
    }

    fn insert(table: &str, id: i64) -> Change {
        let mut row = Row::new();
        row.insert("id", Datum::Int(id));
        Change::Insert {
            table: table.into(),
            row,
        }
    }

    fn commit(store: &ChangeLogStore<BTreeMapRangeKv>, lsn: u64, changes: Vec<Change>) {
        store
            .append("me", &CommitPayload::new(Watermark::from_lsn(lsn), changes))
            .unwrap();
    }

    #[test]
    fn test_append_and_scan() {
        let store = store();
        commit(&store, 1, vec![insert("t", 1), insert("t", 2)]);
        commit(&store, 2, vec![insert("t", 3)]);

        let mut cursor = store.scan(&Watermark::min());
        let first = cursor.next_commit().unwrap().unwrap();
        assert_eq!(first.watermark, Watermark::from_lsn(1));
        assert_eq!(first.changes.len(), 2);
        let second = cursor.next_commit().unwrap().unwrap();
        assert_eq!(second.watermark, Watermark::from_lsn(2));
        assert!(cursor.next_commit().unwrap().is_none());

        // New data appended after the cursor drained is picked up on the next
        // call, from the remembered position.
        commit(&store, 3, vec![insert("t", 4)]);
        let third = cursor.next_commit().unwrap().unwrap();
        assert_eq!(third.watermark, Watermark::from_lsn(3));
    }

    #[test]
    fn test_scan_from_midpoint() {
        let store = store();
        for lsn in 1..=5 {
            commit(&store, lsn, vec![insert("t", lsn as i64)]);
        }
        let mut cursor = store.scan(&Watermark::from_lsn(3));
        assert_eq!(
            cursor.next_commit().unwrap().unwrap().watermark,
            Watermark::from_lsn(4)
        );
    }

    #[test]
    fn test_append_rejects_regression() {
        let store = store();
        commit(&store, 5, vec![]);
        let err = store
            .append("me", &CommitPayload::new(Watermark::from_lsn(5), vec![]))
            .unwrap_err();
        assert!(matches!(err, StorageError::WatermarkRegression { .. }));
    }

    #[test]
    fn test_append_requires_lease() {
        let store = store();
        store.acquire_owner("thief").unwrap();
        let err = store
            .append("me", &CommitPayload::new(Watermark::from_lsn(1), vec![]))
            .unwrap_err();
        match err {
            StorageError::LeaseLost { current_owner } => assert_eq!(current_owner, "thief"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truncate_below() {
        let store = store();
        for lsn in 1..=4 {
            commit(&store, lsn, vec![insert("t", lsn as i64)]);
        }
        store.truncate_below(&Watermark::from_lsn(3)).unwrap();

        let mut cursor = store.scan(&Watermark::min());
        assert_eq!(
            cursor.next_commit().unwrap().unwrap().watermark,
            Watermark::from_lsn(3)
        );
        // State watermark is untouched by truncation.
        assert_eq!(store.last_watermark().unwrap(), Watermark::from_lsn(4));
    }

    #[test]
    fn test_empty_commit_survives_scan() {
        let store = store();
        commit(&store, 1, vec![]);
        let mut cursor = store.scan(&Watermark::min());
        let payload = cursor.next_commit().unwrap().unwrap();
        assert_eq!(payload.watermark, Watermark::from_lsn(1));
        assert!(payload.changes.is_empty());
    }

    #[test]
    fn test_schema_versions_roundtrip() {
        let store = store();
        assert_eq!(store.schema_versions().unwrap(), SchemaVersions::default());
        let widened = SchemaVersions {
            min_supported_version: 1,
            max_supported_version: 2,
        };
        store.set_schema_versions(&widened).unwrap();
        assert_eq!(store.schema_versions().unwrap(), widened);
    }

    #[test]
    fn test_ensure_config() {
        let store = store();
        let live = ReplicationConfig {
            replica_version: "v1".into(),
            publications: vec!["pub1".into()],
            reset_required: false,
        };
        assert_eq!(store.ensure_config(&live).unwrap(), ConfigCheck::Ready);
        assert_eq!(store.ensure_config(&live).unwrap(), ConfigCheck::Ready);

        commit(&store, 1, vec![insert("t", 1)]);

        // A changed publication set truncates and reinitializes.
        let changed = ReplicationConfig {
            publications: vec!["pub2".into()],
            ..live.clone()
        };
        assert_eq!(
            store.ensure_config(&changed).unwrap(),
            ConfigCheck::Reinitialized
        );
        assert!(store.last_watermark().unwrap().is_min());
        let mut cursor = store.scan(&Watermark::min());
        assert!(cursor.next_commit().unwrap().is_none());

        // A stored reset flag surfaces to the supervisor.
        let mut reset = changed.clone();
        reset.reset_required = true;
        store.put_replication_config(&reset).unwrap();
        assert_eq!(
            store.ensure_config(&changed).unwrap(),
            ConfigCheck::ResetRequired
        );
    }
}
