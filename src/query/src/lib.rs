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

//! Query canonicalization: the tagged-variant AST consumed from clients, the
//! transformer that expands and normalizes it into the form the view pipeline
//! executes, and the invalidation summary used to prune unaffected queries.

mod ast;
mod error;
mod invalidation;
mod transform;

pub use ast::{CmpOp, Condition, Direction, OrderTerm, RelatedQuery, SelectAst};
pub use error::{QueryError, QueryResult};
pub use invalidation::{DiffTags, InvalidationInfo};
pub use transform::{
    transform, Correlation, TransformationHash, TransformedQuery, TransformedSelect,
    ALIAS_SEPARATOR,
};
