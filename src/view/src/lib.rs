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

//! The view syncer: per-client-group query state, incremental poke
//! computation against replica snapshots, the per-client outbound handler and
//! the wire protocol they speak.

mod client_handler;
mod error;
mod materialize;
mod pipeline;
mod protocol;
mod row_index;
mod rows;
mod service;
mod syncer;

pub use client_handler::{ClientHandler, ClientHandlerOptions, Poker};
pub use error::{ViewError, ViewResult};
pub use materialize::MaterializationRegistry;
pub use pipeline::execute_query;
pub use protocol::{
    ClientGroupId, ClientId, ClientsPatchOp, DesiredQueryOp, Downstream, ErrorKind, ErrorMessage,
    PokeEnd, PokePart, PokePatch, PokeStart, QueriesPatchOp, RowPatch, Upstream, WireRowId,
};
pub use row_index::RowIndex;
pub use rows::{partition_flat_row, table_of_alias, RowInfo, RowResult};
pub use service::{ViewSyncerService, ViewSyncerServiceOptions};
pub use syncer::ViewSyncer;
