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

use syncwave_common::AutoResetSignal;
use syncwave_storage::StorageError;
use thiserror::Error;

/// A specialized Result type for change pipeline operations.
pub type StreamResult<T, E = StreamError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StreamError {
    /// The subscriber exceeded its outbound high-water mark and was cancelled.
    /// Its client reconnects and resumes from its last acknowledged watermark.
    #[error("subscriber fell behind its outbound queue")]
    SubscriberBehind,

    /// Propagated to the supervisor, which wipes the replica and re-runs
    /// initial sync.
    #[error(transparent)]
    AutoReset(#[from] AutoResetSignal),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("upstream source error: {0}")]
    Source(#[source] anyhow::Error),

    #[error("change streamer is shut down")]
    Shutdown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
