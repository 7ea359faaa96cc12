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

//! Per-client outbound stream: poke framing, per-patch base-cookie
//! filtering, and the safe-integer guard at emit time.
//!
//! Frames for one client are strictly ordered through a single bounded
//! subscription; a poke's bytes never interleave with a later poke's.

use std::collections::BTreeMap;

use syncwave_common::types::MAX_SAFE_INTEGER;
use syncwave_common::{Datum, Row, Watermark};
use syncwave_stream::{
    subscription_channel, PushOutcome, Subscription, SubscriptionOptions, SubscriptionSender,
};

use crate::error::{ViewError, ViewResult};
use crate::protocol::{
    ClientId, Downstream, ErrorKind, ErrorMessage, PokeEnd, PokePart, PokePatch, PokeStart,
    RowPatch,
};

#[derive(Debug, Clone)]
pub struct ClientHandlerOptions {
    pub high_water_mark: usize,
    /// Patch items per `pokePart` frame before a new frame is started.
    pub max_patches_per_part: usize,
}

impl Default for ClientHandlerOptions {
    fn default() -> Self {
        Self {
            high_water_mark: 512,
            max_patches_per_part: 128,
        }
    }
}

/// The server-side endpoint of one connected client.
pub struct ClientHandler {
    client_id: ClientId,
    base_cookie: Watermark,
    sender: SubscriptionSender<Downstream>,
    options: ClientHandlerOptions,
    poke_seq: u64,
}

impl ClientHandler {
    pub fn new(
        client_id: ClientId,
        base_cookie: Watermark,
        options: ClientHandlerOptions,
    ) -> (Self, Subscription<Downstream>) {
        let (sender, subscription) = subscription_channel(SubscriptionOptions {
            high_water_mark: options.high_water_mark,
            // Identical adjacent error frames are idempotent; everything else
            // must flow through untouched.
            coalesce: Some(Box::new(|last: &Downstream, next: &Downstream| {
                match (last, next) {
                    (Downstream::Error(a), Downstream::Error(b)) if a == b => {
                        Some(next.clone())
                    }
                    _ => None,
                }
            })),
            cleanup: Some(Box::new(|frames: Vec<Downstream>| {
                if !frames.is_empty() {
                    tracing::debug!(count = frames.len(), "dropping undelivered client frames");
                }
            })),
        });
        (
            Self {
                client_id,
                base_cookie,
                sender,
                options,
                poke_seq: 0,
            },
            subscription,
        )
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn base_cookie(&self) -> &Watermark {
        &self.base_cookie
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_cancelled()
    }

    pub fn send_error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.sender.push(Downstream::Error(ErrorMessage {
            kind,
            message: message.into(),
        }));
    }

    /// Open a poke advancing this client to `cookie`. The returned poker
    /// borrows the handler exclusively, so an earlier poke must end (or be
    /// abandoned) before the next can start.
    pub fn start_poke(&mut self, cookie: Watermark) -> ViewResult<Poker<'_>> {
        self.poke_seq += 1;
        let poke_id = format!("{}:{}", self.client_id, self.poke_seq);
        let start = PokeStart {
            poke_id: poke_id.clone(),
            base_cookie: self.base_cookie.clone(),
            cookie: cookie.clone(),
        };
        if self.sender.push(Downstream::PokeStart(start)) == PushOutcome::Cancelled {
            return Err(ViewError::Protocol("client connection is gone".into()));
        }
        Ok(Poker {
            part: PokePart {
                poke_id: poke_id.clone(),
                ..Default::default()
            },
            poke_id,
            cookie,
            patches_in_part: 0,
            finished: false,
            handler: self,
        })
    }
}

/// Builder for one in-flight poke. Dropped without `end`, the poke is
/// abandoned and the handler accepts a new one.
pub struct Poker<'a> {
    handler: &'a mut ClientHandler,
    poke_id: String,
    cookie: Watermark,
    part: PokePart,
    patches_in_part: usize,
    finished: bool,
}

impl Poker<'_> {
    /// Add a patch that became true at `to_version`. Filtered out when the
    /// client's base cookie already covers it, which lets one server-side
    /// poke serve clients at different baselines.
    pub fn add_patch(&mut self, to_version: &Watermark, patch: PokePatch) -> ViewResult<()> {
        if *to_version <= self.handler.base_cookie {
            return Ok(());
        }
        match patch {
            PokePatch::Entity(row_patch) => {
                check_row_patch(&row_patch)?;
                self.part
                    .entities_patch
                    .get_or_insert_with(Vec::new)
                    .push(row_patch);
            }
            PokePatch::Clients(op) => {
                self.part.clients_patch.get_or_insert_with(Vec::new).push(op);
            }
            PokePatch::DesiredQueries(client_id, op) => {
                self.part
                    .desired_queries_patches
                    .get_or_insert_with(BTreeMap::new)
                    .entry(client_id)
                    .or_default()
                    .push(op);
            }
            PokePatch::GotQueries(op) => {
                self.part
                    .got_queries_patch
                    .get_or_insert_with(Vec::new)
                    .push(op);
            }
        }
        self.patches_in_part += 1;
        if self.patches_in_part >= self.handler.options.max_patches_per_part {
            self.flush_part();
        }
        Ok(())
    }

    pub fn set_last_mutation_id_changes(
        &mut self,
        changes: BTreeMap<ClientId, u64>,
    ) -> ViewResult<()> {
        for (_, &id) in &changes {
            if id > MAX_SAFE_INTEGER as u64 {
                return Err(ViewError::UnsafeInteger { value: id as i64 });
            }
        }
        self.part.last_mutation_id_changes = Some(changes);
        Ok(())
    }

    fn flush_part(&mut self) {
        if self.part.is_empty() {
            return;
        }
        let part = std::mem::replace(
            &mut self.part,
            PokePart {
                poke_id: self.poke_id.clone(),
                ..Default::default()
            },
        );
        self.handler.sender.push(Downstream::PokePart(part));
        self.patches_in_part = 0;
    }

    /// Flush, emit the end frame and advance the client's tracked cookie.
    pub fn end(mut self) -> ViewResult<()> {
        self.flush_part();
        self.handler.sender.push(Downstream::PokeEnd(PokeEnd {
            poke_id: self.poke_id.clone(),
        }));
        self.handler.base_cookie = self.cookie.clone();
        self.finished = true;
        Ok(())
    }

    /// Whether `end` ran. An unfinished poker dropped on an error path leaves
    /// the cookie untouched; the caller surfaces the failure to the client.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

fn check_row_patch(patch: &RowPatch) -> ViewResult<()> {
    let check_row = |row: &Row| -> ViewResult<()> {
        for (_, datum) in row {
            if let Datum::Int(value) = datum {
                if !datum.is_safe_integer() {
                    return Err(ViewError::UnsafeInteger { value: *value });
                }
            }
        }
        Ok(())
    };
    match patch {
        RowPatch::Put { value, .. } | RowPatch::Merge { value, .. } => check_row(value),
        RowPatch::Constrain { .. } | RowPatch::Del { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use syncwave_common::catalog::RowKey;

    use super::*;
    use crate::protocol::WireRowId;

    fn wire_id(table: &str) -> WireRowId {
        WireRowId {
            table: table.into(),
            key: serde_json::from_str(r#"[["id", 1]]"#).unwrap(),
        }
    }

    fn put_patch(table: &str, column: &str, value: impl Into<Datum>) -> PokePatch {
        let mut row = Row::new();
        row.insert(column, value);
        PokePatch::Entity(RowPatch::Put {
            id: wire_id(table),
            value: row,
        })
    }

    async fn drain(subscription: &mut Subscription<Downstream>, n: usize) -> Vec<Downstream> {
        let mut frames = Vec::new();
        for _ in 0..n {
            frames.push(subscription.recv().await.unwrap().unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_poke_framing_and_cookie_advance() {
        let (mut handler, mut rx) = ClientHandler::new(
            "c1".into(),
            Watermark::from_lsn(1),
            ClientHandlerOptions::default(),
        );

        let mut poker = handler.start_poke(Watermark::from_lsn(2)).unwrap();
        poker
            .add_patch(&Watermark::from_lsn(2), put_patch("t", "a", 1i64))
            .unwrap();
        poker.end().unwrap();

        let frames = drain(&mut rx, 3).await;
        match &frames[0] {
            Downstream::PokeStart(start) => {
                assert_eq!(start.base_cookie, Watermark::from_lsn(1));
                assert_eq!(start.cookie, Watermark::from_lsn(2));
            }
            other => panic!("expected pokeStart, got {other:?}"),
        }
        assert!(matches!(frames[1], Downstream::PokePart(_)));
        assert!(matches!(frames[2], Downstream::PokeEnd(_)));
        assert_eq!(*handler.base_cookie(), Watermark::from_lsn(2));
    }

    #[tokio::test]
    async fn test_fully_filtered_poke_has_no_parts() {
        let (mut handler, mut rx) = ClientHandler::new(
            "c1".into(),
            Watermark::from_lsn(5),
            ClientHandlerOptions::default(),
        );

        // Every patch is at or below the client's base cookie.
        let mut poker = handler.start_poke(Watermark::from_lsn(6)).unwrap();
        poker
            .add_patch(&Watermark::from_lsn(4), put_patch("t", "a", 1i64))
            .unwrap();
        poker
            .add_patch(&Watermark::from_lsn(5), put_patch("t", "b", 2i64))
            .unwrap();
        poker.end().unwrap();

        let frames = drain(&mut rx, 2).await;
        assert!(matches!(frames[0], Downstream::PokeStart(_)));
        assert!(matches!(frames[1], Downstream::PokeEnd(_)));
    }

    #[tokio::test]
    async fn test_abandoned_poke_keeps_cookie() {
        let (mut handler, _rx) = ClientHandler::new(
            "c1".into(),
            Watermark::from_lsn(3),
            ClientHandlerOptions::default(),
        );
        // An error path drops the poker without ending it: the tracked
        // cookie stays put and the next poke starts from the same base.
        let poker = handler.start_poke(Watermark::from_lsn(4)).unwrap();
        assert!(!poker.is_finished());
        drop(poker);
        assert_eq!(*handler.base_cookie(), Watermark::from_lsn(3));

        let poker = handler.start_poke(Watermark::from_lsn(4)).unwrap();
        poker.end().unwrap();
        assert_eq!(*handler.base_cookie(), Watermark::from_lsn(4));
    }

    #[tokio::test]
    async fn test_unsafe_integer_rejected_at_emit() {
        let (mut handler, _rx) = ClientHandler::new(
            "c1".into(),
            Watermark::min(),
            ClientHandlerOptions::default(),
        );
        let mut poker = handler.start_poke(Watermark::from_lsn(1)).unwrap();
        let err = poker
            .add_patch(
                &Watermark::from_lsn(1),
                put_patch("t", "a", MAX_SAFE_INTEGER + 1),
            )
            .unwrap_err();
        assert!(matches!(err, ViewError::UnsafeInteger { .. }));

        let err = poker
            .set_last_mutation_id_changes(
                [("c1".to_owned(), (MAX_SAFE_INTEGER as u64) + 1)]
                    .into_iter()
                    .collect(),
            )
            .unwrap_err();
        assert!(matches!(err, ViewError::UnsafeInteger { .. }));
    }

    #[tokio::test]
    async fn test_large_pokes_split_into_parts() {
        let (mut handler, mut rx) = ClientHandler::new(
            "c1".into(),
            Watermark::min(),
            ClientHandlerOptions {
                high_water_mark: 512,
                max_patches_per_part: 2,
            },
        );
        let mut poker = handler.start_poke(Watermark::from_lsn(1)).unwrap();
        for i in 0..5i64 {
            poker
                .add_patch(&Watermark::from_lsn(1), put_patch("t", "a", i))
                .unwrap();
        }
        poker.end().unwrap();

        // start + ceil(5 / 2) parts + end
        let frames = drain(&mut rx, 5).await;
        let parts = frames
            .iter()
            .filter(|frame| matches!(frame, Downstream::PokePart(_)))
            .count();
        assert_eq!(parts, 3);
        assert!(matches!(frames[4], Downstream::PokeEnd(_)));
    }

    #[test]
    fn test_row_key_helper_parses() {
        let key: RowKey = serde_json::from_str(r#"[["id", 1]]"#).unwrap();
        assert_eq!(key.parts().len(), 1);
    }
}
