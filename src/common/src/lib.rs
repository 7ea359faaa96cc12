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

//! Core data model shared by every syncwave crate: the scalar/row types, the
//! sortable watermark, change records, table catalog and the node configuration.

pub mod catalog;
pub mod change;
pub mod config;
pub mod types;
pub mod util;

pub use change::{AutoResetSignal, Change, CommitPayload};
pub use types::watermark::Watermark;
pub use types::{Datum, Row, ROW_VERSION_COLUMN};
