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

use syncwave_query::QueryError;
use syncwave_storage::StorageError;
use syncwave_stream::StreamError;
use thiserror::Error;

pub type ViewResult<T, E = ViewError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ViewError {
    /// An outbound value cannot be represented in the client's numeric
    /// domain. Fails the poke for that client only.
    #[error("integer {value} exceeds the safe range of the client numeric domain")]
    UnsafeInteger { value: i64 },

    /// A row produced by a query execution is missing its version column.
    /// This is a data error, not a client error.
    #[error("row in table {table} is missing its version column")]
    MissingRowVersion { table: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
