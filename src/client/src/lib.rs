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

//! Client-side poke handling: frame assembly, merging of consecutive server
//! pokes, and tick-aligned application.

mod merge;
mod poke_handler;
mod tick;

pub use merge::{merge_pokes, MergeError, MergedPatchOp, MergedPoke, PendingPoke};
pub use poke_handler::{PokeError, PokeHandler};
pub use tick::IntervalTicker;
