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

//! Merging consecutive server pokes into one apply.
//!
//! Patch entries are rewritten into namespaced keys (`c/` clients, `d/`
//! desired queries, `g/` got queries, `e/` entities), which makes a merged
//! poke a flat, order-preserving sequence the downstream applier can replay.
//! Patch lists concatenate with no deduplication: applying `put` after `put`
//! to the same key is idempotent by last write at the receiver.

use std::collections::BTreeMap;

use syncwave_common::{Row, Watermark};
use syncwave_view::{ClientId, ClientsPatchOp, PokePart, QueriesPatchOp, RowPatch, WireRowId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeError {
    #[error("poke base cookie {got} does not chain from {expected}")]
    CookieGap { expected: Watermark, got: Watermark },
}

/// One namespaced patch entry of a merged poke.
#[derive(Debug, Clone, PartialEq)]
pub enum MergedPatchOp {
    Put { key: String, value: Row },
    Merge { key: String, value: Row },
    Constrain { key: String, columns: Vec<String> },
    Del { key: String },
}

impl MergedPatchOp {
    pub fn key(&self) -> &str {
        match self {
            MergedPatchOp::Put { key, .. }
            | MergedPatchOp::Merge { key, .. }
            | MergedPatchOp::Constrain { key, .. }
            | MergedPatchOp::Del { key } => key,
        }
    }
}

fn entity_key(id: &WireRowId) -> String {
    let key = serde_json::to_string(&id.key).expect("row keys serialize");
    format!("e/{}/{}", id.table, key)
}

/// One fully assembled server poke, in arrival order of its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPoke {
    pub poke_id: String,
    pub base_cookie: Watermark,
    pub cookie: Watermark,
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
    pub patch: Vec<MergedPatchOp>,
}

impl PendingPoke {
    pub fn new(poke_id: String, base_cookie: Watermark, cookie: Watermark) -> Self {
        Self {
            poke_id,
            base_cookie,
            cookie,
            last_mutation_id_changes: BTreeMap::new(),
            patch: Vec::new(),
        }
    }

    /// Fold one `pokePart` frame in, preserving within-poke order.
    pub fn absorb_part(&mut self, part: PokePart) {
        if let Some(changes) = part.last_mutation_id_changes {
            for (client_id, id) in changes {
                let entry = self.last_mutation_id_changes.entry(client_id).or_insert(0);
                *entry = (*entry).max(id);
            }
        }
        if let Some(ops) = part.clients_patch {
            for op in ops {
                self.patch.push(match op {
                    ClientsPatchOp::Put { client_id } => MergedPatchOp::Put {
                        key: format!("c/{client_id}"),
                        value: Row::new(),
                    },
                    ClientsPatchOp::Del { client_id } => MergedPatchOp::Del {
                        key: format!("c/{client_id}"),
                    },
                });
            }
        }
        if let Some(patches) = part.desired_queries_patches {
            for (client_id, ops) in patches {
                for op in ops {
                    self.patch.push(match op {
                        QueriesPatchOp::Put { hash } => MergedPatchOp::Put {
                            key: format!("d/{client_id}/{hash}"),
                            value: Row::new(),
                        },
                        QueriesPatchOp::Del { hash } => MergedPatchOp::Del {
                            key: format!("d/{client_id}/{hash}"),
                        },
                    });
                }
            }
        }
        if let Some(ops) = part.got_queries_patch {
            for op in ops {
                self.patch.push(match op {
                    QueriesPatchOp::Put { hash } => MergedPatchOp::Put {
                        key: format!("g/{hash}"),
                        value: Row::new(),
                    },
                    QueriesPatchOp::Del { hash } => MergedPatchOp::Del {
                        key: format!("g/{hash}"),
                    },
                });
            }
        }
        if let Some(ops) = part.entities_patch {
            for op in ops {
                self.patch.push(match op {
                    RowPatch::Put { id, value } => MergedPatchOp::Put {
                        key: entity_key(&id),
                        value,
                    },
                    RowPatch::Merge { id, value } => MergedPatchOp::Merge {
                        key: entity_key(&id),
                        value,
                    },
                    RowPatch::Constrain { id, columns } => MergedPatchOp::Constrain {
                        key: entity_key(&id),
                        columns,
                    },
                    RowPatch::Del { id } => MergedPatchOp::Del {
                        key: entity_key(&id),
                    },
                });
            }
        }
    }
}

pub type MergedPoke = PendingPoke;

/// Merge consecutive pokes into one. Empty input merges to `None`; a broken
/// cookie chain is a fatal merge error. Associative.
pub fn merge_pokes(pokes: Vec<PendingPoke>) -> Result<Option<MergedPoke>, MergeError> {
    let mut iter = pokes.into_iter();
    let Some(mut merged) = iter.next() else {
        return Ok(None);
    };
    for poke in iter {
        if poke.base_cookie != merged.cookie {
            return Err(MergeError::CookieGap {
                expected: merged.cookie.clone(),
                got: poke.base_cookie.clone(),
            });
        }
        merged.cookie = poke.cookie;
        merged.poke_id = poke.poke_id;
        for (client_id, id) in poke.last_mutation_id_changes {
            let entry = merged.last_mutation_id_changes.entry(client_id).or_insert(0);
            *entry = (*entry).max(id);
        }
        merged.patch.extend(poke.patch);
    }
    Ok(Some(merged))
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    pub(crate) fn entity_put(poke: &mut PendingPoke, table: &str, value: &str) {
        poke.patch.push(MergedPatchOp::Put {
            key: format!("e/{table}/[[\"id\",1]]"),
            value: {
                let mut row = Row::new();
                row.insert("v", value);
                row
            },
        });
    }

    fn poke(id: &str, base: u64, cookie: u64) -> PendingPoke {
        PendingPoke::new(
            id.to_owned(),
            Watermark::from_lsn(base),
            Watermark::from_lsn(cookie),
        )
    }

    #[test]
    fn test_empty_merge_is_none() {
        assert_eq!(merge_pokes(vec![]).unwrap(), None);
    }

    #[test]
    fn test_merge_chains_and_concatenates() {
        let mut p1 = poke("p1", 1, 2);
        p1.last_mutation_id_changes = btreemap! {"c1".to_owned() => 2, "c2".to_owned() => 1};
        entity_put(&mut p1, "foo", "foo1");
        entity_put(&mut p1, "foo", "foo2");
        entity_put(&mut p1, "bar", "bar1");

        let mut p2 = poke("p2", 2, 3);
        p2.last_mutation_id_changes = btreemap! {"c2".to_owned() => 4};
        entity_put(&mut p2, "baz", "baz1");
        entity_put(&mut p2, "bar", "bar2");

        let merged = merge_pokes(vec![p1, p2]).unwrap().unwrap();
        assert_eq!(merged.base_cookie, Watermark::from_lsn(1));
        assert_eq!(merged.cookie, Watermark::from_lsn(3));
        // Per-client max.
        assert_eq!(
            merged.last_mutation_id_changes,
            btreemap! {"c1".to_owned() => 2, "c2".to_owned() => 4}
        );
        // Concatenated, order preserved, no dedup.
        let keys: Vec<_> = merged.patch.iter().map(|op| op.key().to_owned()).collect();
        assert_eq!(
            keys,
            vec![
                "e/foo/[[\"id\",1]]",
                "e/foo/[[\"id\",1]]",
                "e/bar/[[\"id\",1]]",
                "e/baz/[[\"id\",1]]",
                "e/bar/[[\"id\",1]]",
            ]
        );
    }

    #[test]
    fn test_cookie_gap_raises() {
        let p1 = poke("p1", 1, 2);
        let p2 = poke("p2", 3, 4);
        assert!(matches!(
            merge_pokes(vec![p1, p2]).unwrap_err(),
            MergeError::CookieGap { .. }
        ));
    }

    #[test]
    fn test_merge_is_associative() {
        let make = || {
            let mut a = poke("a", 1, 2);
            entity_put(&mut a, "x", "1");
            let mut b = poke("b", 2, 3);
            entity_put(&mut b, "y", "2");
            b.last_mutation_id_changes = btreemap! {"c".to_owned() => 7};
            let mut c = poke("c", 3, 4);
            entity_put(&mut c, "x", "3");
            c.last_mutation_id_changes = btreemap! {"c".to_owned() => 5};
            (a, b, c)
        };

        let (a, b, c) = make();
        let ab = merge_pokes(vec![a, b]).unwrap().unwrap();
        let ab_c = merge_pokes(vec![ab, c]).unwrap().unwrap();

        let (a, b, c) = make();
        let bc = merge_pokes(vec![b, c]).unwrap().unwrap();
        let a_bc = merge_pokes(vec![a, bc]).unwrap().unwrap();

        // The merged poke id tracks the newest constituent; everything else
        // must agree exactly.
        assert_eq!(ab_c.base_cookie, a_bc.base_cookie);
        assert_eq!(ab_c.cookie, a_bc.cookie);
        assert_eq!(ab_c.patch, a_bc.patch);
        assert_eq!(ab_c.last_mutation_id_changes, a_bc.last_mutation_id_changes);
    }

    #[test]
    fn test_absorb_part_namespaces_keys() {
        let mut poke = poke("p", 0, 1);
        poke.absorb_part(PokePart {
            poke_id: "p".into(),
            last_mutation_id_changes: Some(btreemap! {"c1".to_owned() => 9}),
            clients_patch: Some(vec![ClientsPatchOp::Put {
                client_id: "c1".into(),
            }]),
            desired_queries_patches: Some(btreemap! {
                "c1".to_owned() => vec![QueriesPatchOp::Put { hash: "h1".into() }]
            }),
            got_queries_patch: Some(vec![QueriesPatchOp::Del { hash: "h2".into() }]),
            entities_patch: None,
        });
        let keys: Vec<_> = poke.patch.iter().map(|op| op.key().to_owned()).collect();
        assert_eq!(keys, vec!["c/c1", "d/c1/h1", "g/h2"]);
        assert_eq!(poke.last_mutation_id_changes["c1"], 9);
    }
}
