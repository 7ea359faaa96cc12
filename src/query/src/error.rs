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

use thiserror::Error;

pub type QueryResult<T, E = QueryError> = std::result::Result<T, E>;

/// Errors reported back to the client that desired the query. Other queries
/// are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown table {table}")]
    UnknownTable { table: String },

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("unknown relationship {relationship} on table {table}")]
    UnknownRelationship { relationship: String, table: String },
}
