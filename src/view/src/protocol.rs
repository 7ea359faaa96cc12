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

//! Wire messages between the view syncer and connected clients. Framing and
//! transport are the connection layer's concern; these are the payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use syncwave_common::catalog::RowKey;
use syncwave_common::{Row, Watermark};
use syncwave_query::SelectAst;

pub type ClientId = String;
pub type ClientGroupId = String;

/// Row identity as the client sees it: table plus primary-key values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRowId {
    pub table: String,
    pub key: RowKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RowPatch {
    /// Full row values for a newly referenced row.
    Put { id: WireRowId, value: Row },
    /// Changed or newly referenced column values of an already-known row.
    Merge { id: WireRowId, value: Row },
    /// The union of columns still referenced; the client drops the rest.
    Constrain { id: WireRowId, columns: Vec<String> },
    Del { id: WireRowId },
}

impl RowPatch {
    pub fn id(&self) -> &WireRowId {
        match self {
            RowPatch::Put { id, .. }
            | RowPatch::Merge { id, .. }
            | RowPatch::Constrain { id, .. }
            | RowPatch::Del { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientsPatchOp {
    Put { client_id: ClientId },
    Del { client_id: ClientId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueriesPatchOp {
    Put { hash: String },
    Del { hash: String },
}

/// One patch item addressed to a client, used internally between the syncer
/// and the client handler before frame assembly.
#[derive(Debug, Clone, PartialEq)]
pub enum PokePatch {
    Entity(RowPatch),
    Clients(ClientsPatchOp),
    DesiredQueries(ClientId, QueriesPatchOp),
    GotQueries(QueriesPatchOp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    pub poke_id: String,
    pub base_cookie: Watermark,
    pub cookie: Watermark,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    pub poke_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mutation_id_changes: Option<BTreeMap<ClientId, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients_patch: Option<Vec<ClientsPatchOp>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueriesPatchOp>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueriesPatchOp>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities_patch: Option<Vec<RowPatch>>,
}

impl PokePart {
    pub fn is_empty(&self) -> bool {
        self.last_mutation_id_changes.is_none()
            && self.clients_patch.is_none()
            && self.desired_queries_patches.is_none()
            && self.got_queries_patch.is_none()
            && self.entities_patch.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    pub poke_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Protocol,
    InvalidQuery,
    UnsafeInteger,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub kind: ErrorKind,
    pub message: String,
}

/// Server to client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Downstream {
    PokeStart(PokeStart),
    PokePart(PokePart),
    PokeEnd(PokeEnd),
    Error(ErrorMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DesiredQueryOp {
    Put { hash: String, ast: SelectAst },
    Del { hash: String },
}

/// Client to server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Upstream {
    ChangeDesiredQueries {
        desired_queries_patch: Vec<DesiredQueryOp>,
    },
    DeleteClients {
        client_ids: Vec<ClientId>,
    },
}
