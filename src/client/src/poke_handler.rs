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

//! Receiving side of the poke protocol.
//!
//! Frames assemble into pending pokes; completed pokes are applied on the
//! next tick, merged when several complete within one tick window. Any
//! protocol violation fires the error callback, clears all state and leaves
//! the handler dropping frames until the connection layer reconnects.

use std::collections::VecDeque;

use syncwave_common::Watermark;
use syncwave_view::Downstream;
use thiserror::Error;

use crate::merge::{merge_pokes, MergeError, MergedPoke, PendingPoke};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PokeError {
    #[error("pokePart for {poke_id} without a matching pokeStart")]
    OrphanPart { poke_id: String },

    #[error("pokeEnd for {poke_id} without a matching pokeStart")]
    OrphanEnd { poke_id: String },

    #[error("pokeStart {poke_id} while {open} is still open")]
    OverlappingPoke { poke_id: String, open: String },

    #[error(transparent)]
    CookieGap(#[from] MergeError),

    #[error("poke apply failed: {message}")]
    ApplyFailed { message: String },
}

pub type Applier = Box<dyn FnMut(&MergedPoke) -> anyhow::Result<()> + Send>;
pub type ErrorHook = Box<dyn FnMut(PokeError) + Send>;

pub struct PokeHandler {
    applier: Applier,
    on_poke_error: ErrorHook,

    /// Poke currently between start and end.
    assembling: Option<PendingPoke>,
    /// Completed pokes waiting for the next tick.
    pending: VecDeque<PendingPoke>,
    /// Cookie of the last completed poke, for the start-chain check.
    last_cookie: Option<Watermark>,
    /// Set after a failure: frames are dropped until reconnect.
    broken: bool,
}

impl PokeHandler {
    pub fn new(applier: Applier, on_poke_error: ErrorHook) -> Self {
        Self {
            applier,
            on_poke_error,
            assembling: None,
            pending: VecDeque::new(),
            last_cookie: None,
            broken: false,
        }
    }

    pub fn pending_pokes(&self) -> usize {
        self.pending.len()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Feed one downstream frame.
    pub fn handle_frame(&mut self, frame: Downstream) {
        match frame {
            Downstream::PokeStart(start) => {
                if self.broken {
                    return;
                }
                if let Some(open) = &self.assembling {
                    let open_id = open.poke_id.clone();
                    self.fail(PokeError::OverlappingPoke {
                        poke_id: start.poke_id,
                        open: open_id,
                    });
                    return;
                }
                if let Some(expected) = self.expected_base() {
                    if start.base_cookie != expected {
                        self.fail(PokeError::CookieGap(MergeError::CookieGap {
                            expected,
                            got: start.base_cookie,
                        }));
                        return;
                    }
                }
                self.assembling = Some(PendingPoke::new(
                    start.poke_id,
                    start.base_cookie,
                    start.cookie,
                ));
            }
            Downstream::PokePart(part) => {
                if self.broken {
                    return;
                }
                match &mut self.assembling {
                    Some(open) if open.poke_id == part.poke_id => open.absorb_part(part),
                    // Fires once per orphan frame.
                    _ => self.fail(PokeError::OrphanPart {
                        poke_id: part.poke_id,
                    }),
                }
            }
            Downstream::PokeEnd(end) => {
                if self.broken {
                    return;
                }
                match self.assembling.take() {
                    Some(open) if open.poke_id == end.poke_id => {
                        self.last_cookie = Some(open.cookie.clone());
                        self.pending.push_back(open);
                    }
                    other => {
                        self.assembling = other;
                        self.fail(PokeError::OrphanEnd {
                            poke_id: end.poke_id,
                        });
                    }
                }
            }
            Downstream::Error(e) => {
                tracing::warn!(kind = ?e.kind, message = %e.message, "server error frame");
            }
        }
    }

    /// The base cookie the next poke must present: the newest completed
    /// cookie, whether applied or still pending.
    fn expected_base(&self) -> Option<Watermark> {
        self.pending
            .back()
            .map(|poke| poke.cookie.clone())
            .or_else(|| self.last_cookie.clone())
    }

    /// Display-tick callback: apply everything that completed since the last
    /// tick as one merged poke.
    pub fn on_tick(&mut self) {
        if self.broken || self.pending.is_empty() {
            return;
        }
        let pokes: Vec<PendingPoke> = self.pending.drain(..).collect();
        let merged = match merge_pokes(pokes) {
            Ok(Some(merged)) => merged,
            Ok(None) => return,
            Err(e) => {
                self.fail(PokeError::CookieGap(e));
                return;
            }
        };
        if let Err(e) = (self.applier)(&merged) {
            self.fail(PokeError::ApplyFailed {
                message: e.to_string(),
            });
        }
    }

    /// Connection teardown: all poke state evaporates and any scheduled
    /// apply becomes a no-op. The handler is ready for the reconnect.
    pub fn handle_disconnect(&mut self) {
        self.assembling = None;
        self.pending.clear();
        self.last_cookie = None;
        self.broken = false;
    }

    fn fail(&mut self, error: PokeError) {
        tracing::warn!(error = %error, "poke protocol failure, clearing state");
        self.assembling = None;
        self.pending.clear();
        self.broken = true;
        (self.on_poke_error)(error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use maplit::btreemap;
    use syncwave_common::Row;
    use syncwave_view::{PokeEnd, PokePart, PokeStart, RowPatch, WireRowId};

    use super::*;
    use crate::merge::MergedPatchOp;

    fn start(poke_id: &str, base: u64, cookie: u64) -> Downstream {
        Downstream::PokeStart(PokeStart {
            poke_id: poke_id.into(),
            base_cookie: Watermark::from_lsn(base),
            cookie: Watermark::from_lsn(cookie),
        })
    }

    fn end(poke_id: &str) -> Downstream {
        Downstream::PokeEnd(PokeEnd {
            poke_id: poke_id.into(),
        })
    }

    fn entity(table: &str, value: &str) -> RowPatch {
        let mut row = Row::new();
        row.insert("v", value);
        RowPatch::Put {
            id: WireRowId {
                table: table.into(),
                key: serde_json::from_str(r#"[["id", 1]]"#).unwrap(),
            },
            value: row,
        }
    }

    fn part(poke_id: &str, entities: Vec<RowPatch>) -> Downstream {
        Downstream::PokePart(PokePart {
            poke_id: poke_id.into(),
            entities_patch: Some(entities),
            ..Default::default()
        })
    }

    struct Harness {
        handler: PokeHandler,
        applied: Arc<Mutex<Vec<MergedPoke>>>,
        errors: Arc<Mutex<Vec<PokeError>>>,
    }

    fn harness() -> Harness {
        harness_with_failures(0)
    }

    /// The first `failures` applies return an error.
    fn harness_with_failures(failures: usize) -> Harness {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let remaining = AtomicUsize::new(failures);
        let applier = {
            let applied = applied.clone();
            Box::new(move |poke: &MergedPoke| {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(anyhow!("downstream rejected poke"));
                }
                applied.lock().unwrap().push(poke.clone());
                Ok(())
            })
        };
        let on_error = {
            let errors = errors.clone();
            Box::new(move |e: PokeError| {
                errors.lock().unwrap().push(e);
            })
        };
        Harness {
            handler: PokeHandler::new(applier, on_error),
            applied,
            errors,
        }
    }

    #[test]
    fn test_single_poke_applies_on_first_tick() {
        let mut h = harness();
        h.handler.handle_frame(start("p1", 1, 2));
        h.handler.handle_frame(Downstream::PokePart(PokePart {
            poke_id: "p1".into(),
            last_mutation_id_changes: Some(
                btreemap! {"c1".to_owned() => 2, "c2".to_owned() => 2},
            ),
            entities_patch: Some(vec![entity("foo", "foo2"), entity("bar", "bar1")]),
            ..Default::default()
        }));
        h.handler.handle_frame(end("p1"));

        // Nothing applies before the tick.
        assert!(h.applied.lock().unwrap().is_empty());

        h.handler.on_tick();
        let applied = h.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        let poke = &applied[0];
        assert_eq!(poke.base_cookie, Watermark::from_lsn(1));
        assert_eq!(poke.cookie, Watermark::from_lsn(2));
        assert_eq!(
            poke.last_mutation_id_changes,
            btreemap! {"c1".to_owned() => 2, "c2".to_owned() => 2}
        );
        let keys: Vec<_> = poke.patch.iter().map(|op| op.key().to_owned()).collect();
        assert_eq!(keys, vec!["e/foo/[[\"id\",1]]", "e/bar/[[\"id\",1]]"]);
        drop(applied);

        // A second tick with nothing new is a no-op.
        h.handler.on_tick();
        assert_eq!(h.applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_two_pokes_before_tick_merge() {
        let mut h = harness();
        h.handler.handle_frame(start("p1", 1, 2));
        h.handler.handle_frame(part(
            "p1",
            vec![entity("foo", "foo1"), entity("foo", "foo2"), entity("bar", "bar1")],
        ));
        h.handler.handle_frame(end("p1"));
        h.handler.handle_frame(start("p2", 2, 3));
        h.handler
            .handle_frame(part("p2", vec![entity("baz", "baz1"), entity("bar", "bar2")]));
        h.handler.handle_frame(end("p2"));

        h.handler.on_tick();
        let applied = h.applied.lock().unwrap();
        assert_eq!(applied.len(), 1, "one merged apply");
        let poke = &applied[0];
        assert_eq!(poke.base_cookie, Watermark::from_lsn(1));
        assert_eq!(poke.cookie, Watermark::from_lsn(3));
        // Concatenated, order preserved, no dedup across pokes.
        assert_eq!(poke.patch.len(), 5);
        assert!(matches!(&poke.patch[0], MergedPatchOp::Put { key, .. } if key == "e/foo/[[\"id\",1]]"));
        assert!(matches!(&poke.patch[4], MergedPatchOp::Put { key, .. } if key == "e/bar/[[\"id\",1]]"));
    }

    #[test]
    fn test_cookie_gap_aborts() {
        let mut h = harness();
        h.handler.handle_frame(start("p1", 1, 2));
        h.handler.handle_frame(end("p1"));
        // Base 3 does not chain from cookie 2.
        h.handler.handle_frame(start("p2", 3, 4));

        assert_eq!(h.errors.lock().unwrap().len(), 1);
        assert!(matches!(
            h.errors.lock().unwrap()[0],
            PokeError::CookieGap(_)
        ));
        // Pending pokes are cleared and later pokes are dropped until
        // reconnect.
        h.handler.on_tick();
        assert!(h.applied.lock().unwrap().is_empty());
        h.handler.handle_frame(start("p3", 2, 5));
        h.handler.handle_frame(end("p3"));
        h.handler.on_tick();
        assert!(h.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn test_apply_failure_clears_pending() {
        let mut h = harness_with_failures(1);
        h.handler.handle_frame(start("p1", 1, 2));
        h.handler.handle_frame(end("p1"));
        h.handler.on_tick();

        assert_eq!(h.errors.lock().unwrap().len(), 1);
        assert!(matches!(
            h.errors.lock().unwrap()[0],
            PokeError::ApplyFailed { .. }
        ));
        // A poke that had queued behind the failed apply is gone; the next
        // tick makes no applier call.
        h.handler.on_tick();
        assert!(h.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn test_orphan_frames_fire_once_each() {
        let mut h = harness();
        h.handler
            .handle_frame(part("ghost", vec![entity("foo", "x")]));
        assert_eq!(h.errors.lock().unwrap().len(), 1);
        assert!(matches!(
            h.errors.lock().unwrap()[0],
            PokeError::OrphanPart { .. }
        ));

        // Still broken: a second orphan is dropped silently until the
        // reconnect resets the handler.
        h.handler.handle_frame(end("ghost"));
        assert_eq!(h.errors.lock().unwrap().len(), 1);

        h.handler.handle_disconnect();
        h.handler.handle_frame(end("ghost2"));
        assert_eq!(h.errors.lock().unwrap().len(), 2);
        assert!(matches!(
            h.errors.lock().unwrap()[1],
            PokeError::OrphanEnd { .. }
        ));
    }

    #[test]
    fn test_disconnect_discards_pending() {
        let mut h = harness();
        h.handler.handle_frame(start("p1", 1, 2));
        h.handler.handle_frame(part("p1", vec![entity("foo", "x")]));
        h.handler.handle_frame(end("p1"));
        assert_eq!(h.handler.pending_pokes(), 1);

        h.handler.handle_disconnect();
        h.handler.on_tick();
        // The downstream applier is never invoked.
        assert!(h.applied.lock().unwrap().is_empty());

        // After reconnect the chain restarts from whatever base the server
        // sends.
        h.handler.handle_frame(start("p2", 7, 8));
        h.handler.handle_frame(end("p2"));
        h.handler.on_tick();
        assert_eq!(h.applied.lock().unwrap().len(), 1);
    }
}
