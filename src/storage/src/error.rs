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

use syncwave_common::Watermark;
use thiserror::Error;

/// A specialized Result type for storage operations.
pub type StorageResult<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The replica database cannot be opened. Fatal: the process exits
    /// nonzero.
    #[error("failed to open replica database")]
    DatabaseInit(#[source] anyhow::Error),

    #[error("watermark {watermark} does not advance past {last}")]
    WatermarkRegression { watermark: Watermark, last: Watermark },

    /// Another writer CAS-ed itself into the owner slot. The losing writer
    /// must stop appending.
    #[error("writer lease lost to {current_owner}")]
    LeaseLost { current_owner: String },

    /// A snapshot diff spans a schema change; the caller must resync from
    /// scratch.
    #[error("diff spans a schema change at {changed_at}")]
    SchemaChange { changed_at: Watermark },

    /// A diff was attempted below the compaction floor; the snapshots are no
    /// longer coherent and must be re-pinned.
    #[error("diff base {base} is below the compaction floor {floor}")]
    InvalidDiff { base: Watermark, floor: Watermark },

    #[error("corrupt storage entry: {0}")]
    Corrupt(String),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}
