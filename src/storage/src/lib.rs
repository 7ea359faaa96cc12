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

//! Durable state for the sync engine: the watermark-keyed change log that the
//! streamer owns, the multi-version local replica that the replicator writes,
//! and the snapshotter that diffs two pinned replica versions.

mod change_log;
mod error;
mod keys;
mod range_kv;
mod replica;
mod snapshot;

pub use change_log::{
    ChangeLogStore, ConfigCheck, ReplicationConfig, ReplicationState, SchemaVersions,
};
pub use error::{StorageError, StorageResult};
pub use range_kv::{sled_kv, BTreeMapRangeKv, RangeKv};
pub use replica::{PinnedSnapshot, Replica, ReplicaOp};
pub use snapshot::{DiffCursor, RowChange, Snapshotter};
