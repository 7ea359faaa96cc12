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

//! Per-client-group view synchronization.
//!
//! The syncer owns the group's desired and got query sets, the row index and
//! the group's position in the version stream. Each replica commit becomes
//! one atomic set of pokes; queries whose invalidation tags don't overlap the
//! diff are skipped outright. A schema change or an invalidated diff falls
//! back to re-materializing every query at the new version.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use syncwave_common::Watermark;
use syncwave_query::{DiffTags, TransformationHash, TransformedQuery};
use syncwave_storage::{RangeKv, Replica, Snapshotter, StorageError};
use syncwave_stream::Subscription;
use thiserror_ext::AsReport;

use crate::client_handler::{ClientHandler, ClientHandlerOptions};
use crate::error::{ViewError, ViewResult};
use crate::materialize::MaterializationRegistry;
use crate::protocol::{
    ClientGroupId, ClientId, ClientsPatchOp, DesiredQueryOp, Downstream, ErrorKind, PokePatch,
    QueriesPatchOp, RowPatch,
};
use crate::row_index::RowIndex;
use crate::rows::RowResult;

/// Client-visible query name (the hash field of desired-query patches),
/// distinct from the canonical transformation hash: two names may share one
/// materialization.
type QueryName = String;

pub struct ViewSyncer<R: RangeKv> {
    group_id: ClientGroupId,
    replica: Replica<R>,
    registry: Arc<MaterializationRegistry>,
    handler_options: ClientHandlerOptions,

    clients: BTreeMap<ClientId, ClientHandler>,
    /// Desired query names per client in the group.
    desired: BTreeMap<ClientId, BTreeSet<QueryName>>,
    /// Resolved queries by name.
    queries: BTreeMap<QueryName, Arc<TransformedQuery>>,
    /// Names whose results have been fully delivered at the current cookie.
    got: BTreeSet<QueryName>,
    row_index: RowIndex,
    current_cookie: Watermark,

    // Patches accumulated since the last flushed poke.
    pending_clients: Vec<ClientsPatchOp>,
    pending_desired: BTreeMap<ClientId, Vec<QueriesPatchOp>>,
    pending_got: Vec<QueriesPatchOp>,
    pending_mutation_ids: BTreeMap<ClientId, u64>,
    /// Names added or removed since the last refresh.
    dirty_names: BTreeSet<QueryName>,
    /// Canonical hashes with no surviving name: their rows must fall out of
    /// the index on the next refresh.
    orphaned_hashes: BTreeSet<TransformationHash>,
}

impl<R: RangeKv> ViewSyncer<R> {
    pub fn new(
        group_id: ClientGroupId,
        replica: Replica<R>,
        registry: Arc<MaterializationRegistry>,
        handler_options: ClientHandlerOptions,
    ) -> Self {
        let current_cookie = replica.version();
        Self {
            group_id,
            replica,
            registry,
            handler_options,
            clients: BTreeMap::new(),
            desired: BTreeMap::new(),
            queries: BTreeMap::new(),
            got: BTreeSet::new(),
            row_index: RowIndex::new(),
            current_cookie,
            pending_clients: Vec::new(),
            pending_desired: BTreeMap::new(),
            pending_got: Vec::new(),
            pending_mutation_ids: BTreeMap::new(),
            dirty_names: BTreeSet::new(),
            orphaned_hashes: BTreeSet::new(),
        }
    }

    pub fn group_id(&self) -> &ClientGroupId {
        &self.group_id
    }

    pub fn current_cookie(&self) -> &Watermark {
        &self.current_cookie
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.desired.values().all(|names| names.is_empty())
    }

    /// Register a client connection at its acknowledged cookie. Returns the
    /// outbound frame stream for the connection layer to drain.
    pub fn add_client(
        &mut self,
        client_id: ClientId,
        base_cookie: Watermark,
    ) -> Subscription<Downstream> {
        let (handler, subscription) =
            ClientHandler::new(client_id.clone(), base_cookie, self.handler_options.clone());
        let newly_known = !self.desired.contains_key(&client_id);
        self.desired.entry(client_id.clone()).or_default();
        self.clients.insert(client_id.clone(), handler);
        if newly_known {
            self.pending_clients
                .push(ClientsPatchOp::Put { client_id });
        }
        subscription
    }

    /// Connection went away. Client state survives for a reconnect; the
    /// client record itself is garbage collected when it holds nothing.
    pub fn disconnect(&mut self, client_id: &ClientId) {
        self.clients.remove(client_id);
        self.collect_client(client_id.clone());
    }

    /// Record an acknowledged mutation for `lastMutationIDChanges` in the
    /// next poke.
    pub fn record_mutation(&mut self, client_id: ClientId, mutation_id: u64) {
        let entry = self.pending_mutation_ids.entry(client_id).or_insert(0);
        *entry = (*entry).max(mutation_id);
    }

    /// Apply a desired-queries patch from one client, then poke the group at
    /// the current cookie so the new queries' rows flow immediately.
    pub fn change_desired_queries(
        &mut self,
        client_id: &ClientId,
        ops: Vec<DesiredQueryOp>,
    ) -> ViewResult<()> {
        let catalog = self.replica.catalog();
        for op in ops {
            match op {
                DesiredQueryOp::Put { hash: name, ast } => {
                    let query = match self.registry.acquire(&ast, &catalog) {
                        Ok(query) => query,
                        Err(e) => {
                            // The bad query is dropped from this client's
                            // desired set; nothing else is affected.
                            tracing::info!(
                                group = %self.group_id,
                                client = %client_id,
                                error = %e.as_report(),
                                "rejecting invalid desired query"
                            );
                            if let Some(handler) = self.clients.get(client_id) {
                                handler.send_error(ErrorKind::InvalidQuery, e.to_string());
                            }
                            continue;
                        }
                    };
                    let inserted = self
                        .desired
                        .entry(client_id.clone())
                        .or_default()
                        .insert(name.clone());
                    if inserted {
                        self.queries.insert(name.clone(), query);
                        self.dirty_names.insert(name.clone());
                        self.pending_desired
                            .entry(client_id.clone())
                            .or_default()
                            .push(QueriesPatchOp::Put { hash: name });
                    } else {
                        // Already desired: the acquire above double-counted.
                        self.registry.release(&query.hash);
                    }
                }
                DesiredQueryOp::Del { hash: name } => {
                    let removed = self
                        .desired
                        .get_mut(client_id)
                        .map(|names| names.remove(&name))
                        .unwrap_or(false);
                    if !removed {
                        continue;
                    }
                    self.pending_desired
                        .entry(client_id.clone())
                        .or_default()
                        .push(QueriesPatchOp::Del { hash: name.clone() });
                    self.drop_name_if_orphaned(&name);
                }
            }
        }
        self.refresh(self.dirty_names.clone(), self.current_cookie.clone())
    }

    /// Explicit removal of clients and everything they desire.
    pub fn delete_clients(&mut self, client_ids: Vec<ClientId>) -> ViewResult<()> {
        for client_id in client_ids {
            let Some(names) = self.desired.remove(&client_id) else {
                continue;
            };
            self.clients.remove(&client_id);
            self.pending_clients
                .push(ClientsPatchOp::Del { client_id });
            for name in names {
                self.drop_name_if_orphaned(&name);
            }
        }
        self.refresh(self.dirty_names.clone(), self.current_cookie.clone())
    }

    fn collect_client(&mut self, client_id: ClientId) {
        let holds_nothing = self
            .desired
            .get(&client_id)
            .map(|names| names.is_empty())
            .unwrap_or(true)
            && !self.pending_mutation_ids.contains_key(&client_id);
        if holds_nothing && !self.clients.contains_key(&client_id) {
            self.desired.remove(&client_id);
            self.pending_clients
                .push(ClientsPatchOp::Del { client_id });
        }
    }

    /// Drop a query name that no client in the group desires anymore.
    fn drop_name_if_orphaned(&mut self, name: &QueryName) {
        let still_desired = self.desired.values().any(|names| names.contains(name));
        if still_desired {
            return;
        }
        if let Some(query) = self.queries.remove(name) {
            // Another name may canonicalize to the same hash and keep the
            // rows alive; only a fully orphaned hash drops them.
            let hash_alive = self.queries.values().any(|q| q.hash == query.hash);
            if !hash_alive {
                self.orphaned_hashes.insert(query.hash.clone());
            }
            self.registry.release(&query.hash);
        }
        if self.got.remove(name) {
            self.pending_got.push(QueriesPatchOp::Del { hash: name.clone() });
        }
        self.dirty_names.insert(name.clone());
    }

    /// Process one replica commit: prune by invalidation tags, re-execute
    /// what remains, and poke every client atomically.
    pub fn process_commit(&mut self, v_new: Watermark) -> ViewResult<()> {
        if v_new <= self.current_cookie {
            return Ok(());
        }
        let affected = match self.collect_diff_tags(&v_new) {
            Ok(tags) => {
                let mut affected: BTreeSet<QueryName> = self
                    .queries
                    .iter()
                    .filter(|(_, query)| query.invalidation.may_overlap(&tags))
                    .map(|(name, _)| name.clone())
                    .collect();
                affected.extend(self.dirty_names.iter().cloned());
                affected
            }
            Err(ViewError::Storage(StorageError::SchemaChange { changed_at })) => {
                // All cached view state is discarded and every query is
                // re-materialized at the new version.
                tracing::warn!(
                    group = %self.group_id,
                    %changed_at,
                    "diff spans a schema change, resyncing group from scratch"
                );
                self.queries.keys().cloned().collect()
            }
            Err(ViewError::Storage(StorageError::InvalidDiff { .. })) => {
                tracing::warn!(
                    group = %self.group_id,
                    "diff base no longer readable, resyncing group from scratch"
                );
                self.queries.keys().cloned().collect()
            }
            Err(e) => return Err(e),
        };
        self.refresh(affected, v_new)
    }

    /// Summarize the `(current, v_new]` diff for invalidation pruning.
    fn collect_diff_tags(&self, v_new: &Watermark) -> ViewResult<DiffTags> {
        let snapshotter = Snapshotter::between(
            &self.replica,
            self.current_cookie.clone(),
            v_new.clone(),
        );
        let mut tags = DiffTags::default();
        let mut cursor = snapshotter.diff()?;
        while let Some(change) = cursor.next()? {
            match (&change.prev_value, &change.next_value) {
                (None, None) => tags.add_table_wildcard(&change.table),
                (prev, next) => {
                    if let Some(prev) = prev {
                        tags.add_row(&change.table, prev);
                    }
                    if let Some(next) = next {
                        tags.add_row(&change.table, next);
                    }
                }
            }
        }
        cursor.close();
        Ok(tags)
    }

    /// Re-execute the named queries at `cookie`, diff the row index and flush
    /// one poke per client. Commits are processed strictly in order, so one
    /// upstream commit yields one atomic set of pokes.
    fn refresh(&mut self, names: BTreeSet<QueryName>, cookie: Watermark) -> ViewResult<()> {
        let advancing = cookie > self.current_cookie;

        // Map names to canonical hashes: a hash is refreshed when any of its
        // names is dirty, and it contributes results as long as any client
        // still desires one of its names.
        let mut refreshed: BTreeSet<TransformationHash> = BTreeSet::new();
        let mut to_execute: BTreeMap<TransformationHash, Vec<QueryName>> = BTreeMap::new();
        for name in &names {
            match self.queries.get(name) {
                Some(query) => {
                    refreshed.insert(query.hash.clone());
                    to_execute
                        .entry(query.hash.clone())
                        .or_default()
                        .push(name.clone());
                }
                // Removed names: hashes with no surviving name fall out of
                // the index because nothing re-contributes them.
                None => {}
            }
        }
        // A hash stays alive when an unrefreshed name still references it;
        // only orphaned hashes may drop rows. Names sharing a hash must
        // therefore all be executed together.
        for (name, query) in &self.queries {
            if refreshed.contains(&query.hash) && !names.contains(name) {
                to_execute
                    .entry(query.hash.clone())
                    .or_default()
                    .push(name.clone());
            }
        }
        // Hashes whose every name was removed refresh with no contribution,
        // which is what deletes their rows from the index and the clients.
        refreshed.extend(std::mem::take(&mut self.orphaned_hashes));

        let mut result = RowResult::new();
        let mut newly_got: Vec<QueryName> = Vec::new();
        if !to_execute.is_empty() {
            let snapshot = self.replica.pin_at(cookie.clone());
            let catalog = self.replica.catalog();
            for (hash, names_of_hash) in &to_execute {
                let rows = self.registry.execute(hash, &snapshot)?;
                result.accumulate(&catalog, hash, &rows)?;
                for name in names_of_hash {
                    if !self.got.contains(name) {
                        newly_got.push(name.clone());
                    }
                }
            }
        }
        for name in &newly_got {
            self.got.insert(name.clone());
            self.pending_got.push(QueriesPatchOp::Put { hash: name.clone() });
        }

        let patches = self.row_index.apply(&refreshed, result, &cookie);

        let has_parts = !patches.is_empty()
            || !self.pending_clients.is_empty()
            || !self.pending_desired.is_empty()
            || !self.pending_got.is_empty()
            || !self.pending_mutation_ids.is_empty();
        if advancing || has_parts {
            self.flush_pokes(&cookie, &patches);
        }

        self.dirty_names.clear();
        self.current_cookie = cookie;
        Ok(())
    }

    /// Emit one poke to every connected client in the group. A failure is a
    /// protocol-level failure for that client only.
    fn flush_pokes(&mut self, cookie: &Watermark, patches: &[(Watermark, RowPatch)]) {
        let pending_clients = std::mem::take(&mut self.pending_clients);
        let pending_desired = std::mem::take(&mut self.pending_desired);
        let pending_got = std::mem::take(&mut self.pending_got);
        let pending_mutation_ids = std::mem::take(&mut self.pending_mutation_ids);

        let mut failed: Vec<ClientId> = Vec::new();
        for (client_id, handler) in self.clients.iter_mut() {
            let outcome = (|| -> ViewResult<()> {
                let mut poker = handler.start_poke(cookie.clone())?;
                if !pending_mutation_ids.is_empty() {
                    poker.set_last_mutation_id_changes(pending_mutation_ids.clone())?;
                }
                for op in &pending_clients {
                    poker.add_patch(cookie, PokePatch::Clients(op.clone()))?;
                }
                for (of_client, ops) in &pending_desired {
                    for op in ops {
                        poker.add_patch(
                            cookie,
                            PokePatch::DesiredQueries(of_client.clone(), op.clone()),
                        )?;
                    }
                }
                for op in &pending_got {
                    poker.add_patch(cookie, PokePatch::GotQueries(op.clone()))?;
                }
                for (to_version, patch) in patches {
                    poker.add_patch(to_version, PokePatch::Entity(patch.clone()))?;
                }
                poker.end()
            })();
            if let Err(e) = outcome {
                tracing::warn!(
                    group = %self.group_id,
                    client = %client_id,
                    error = %e.as_report(),
                    "poke failed, dropping client connection"
                );
                handler.send_error(ErrorKind::UnsafeInteger, e.to_string());
                failed.push(client_id.clone());
            }
        }
        for client_id in failed {
            self.clients.remove(&client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use syncwave_common::{Change, CommitPayload, Row};
    use syncwave_query::{CmpOp, Condition, SelectAst};
    use syncwave_storage::BTreeMapRangeKv;

    use super::*;
    use crate::pipeline::tests::seeded_replica;
    use crate::protocol::{PokePart, PokeStart};

    fn registry() -> Arc<MaterializationRegistry> {
        MaterializationRegistry::new(Duration::from_secs(60))
    }

    fn syncer(replica: &Replica<BTreeMapRangeKv>) -> ViewSyncer<BTreeMapRangeKv> {
        ViewSyncer::new(
            "g1".into(),
            replica.clone(),
            registry(),
            ClientHandlerOptions::default(),
        )
    }

    fn acme_ast() -> SelectAst {
        SelectAst {
            table: "public.issues".into(),
            columns: vec!["title".into()],
            filter: Some(Condition::Cmp {
                column: "org".into(),
                op: CmpOp::Eq,
                value: "acme".into(),
            }),
            order_by: vec![],
            related: vec![],
        }
    }

    fn desire(
        syncer: &mut ViewSyncer<BTreeMapRangeKv>,
        client: &str,
        name: &str,
        ast: SelectAst,
    ) {
        syncer
            .change_desired_queries(
                &client.to_owned(),
                vec![DesiredQueryOp::Put {
                    hash: name.into(),
                    ast,
                }],
            )
            .unwrap();
    }

    async fn recv_poke(
        rx: &mut Subscription<Downstream>,
    ) -> (PokeStart, Vec<PokePart>) {
        let start = match rx.recv().await.unwrap().unwrap() {
            Downstream::PokeStart(start) => start,
            other => panic!("expected pokeStart, got {other:?}"),
        };
        let mut parts = Vec::new();
        loop {
            match rx.recv().await.unwrap().unwrap() {
                Downstream::PokePart(part) => parts.push(part),
                Downstream::PokeEnd(end) => {
                    assert_eq!(end.poke_id, start.poke_id);
                    return (start, parts);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    fn issue_insert(id: i64, org: &str, title: &str) -> Change {
        let mut row = Row::new();
        row.insert("id", id);
        row.insert("org", org);
        row.insert("title", title);
        Change::Insert {
            table: "public.issues".into(),
            row,
        }
    }

    #[tokio::test]
    async fn test_desired_query_flows_rows_immediately() {
        let replica = seeded_replica();
        let mut syncer = syncer(&replica);
        let mut rx = syncer.add_client("c1".into(), Watermark::min());

        desire(&mut syncer, "c1", "q1", acme_ast());
        let (start, parts) = recv_poke(&mut rx).await;
        assert_eq!(start.cookie, replica.version());

        let entities: Vec<_> = parts
            .iter()
            .flat_map(|p| p.entities_patch.iter().flatten())
            .collect();
        assert_eq!(entities.len(), 2, "both acme rows sync: {entities:?}");
        let got: Vec<_> = parts
            .iter()
            .flat_map(|p| p.got_queries_patch.iter().flatten())
            .collect();
        assert_eq!(got, vec![&QueriesPatchOp::Put { hash: "q1".into() }]);
    }

    #[tokio::test]
    async fn test_commit_pokes_only_affected_queries() {
        let replica = seeded_replica();
        let mut syncer = syncer(&replica);
        let mut rx = syncer.add_client("c1".into(), Watermark::min());
        desire(&mut syncer, "c1", "q1", acme_ast());
        let _ = recv_poke(&mut rx).await;

        // A globex-only commit: the acme query's tags don't overlap, so the
        // poke advances the cookie with no entity patches.
        replica
            .ingest_commit(&CommitPayload::new(
                Watermark::from_lsn(2),
                vec![issue_insert(100, "globex", "other")],
            ))
            .unwrap();
        syncer.process_commit(Watermark::from_lsn(2)).unwrap();

        let (start, parts) = recv_poke(&mut rx).await;
        assert_eq!(start.cookie, Watermark::from_lsn(2));
        assert!(
            parts.iter().all(|p| p.entities_patch.is_none()),
            "unaffected query must not re-sync rows: {parts:?}"
        );

        // An acme commit flows through.
        replica
            .ingest_commit(&CommitPayload::new(
                Watermark::from_lsn(3),
                vec![issue_insert(101, "acme", "new one")],
            ))
            .unwrap();
        syncer.process_commit(Watermark::from_lsn(3)).unwrap();
        let (_, parts) = recv_poke(&mut rx).await;
        let entities: Vec<_> = parts
            .iter()
            .flat_map(|p| p.entities_patch.iter().flatten())
            .collect();
        assert_eq!(entities.len(), 1);
        assert!(matches!(entities[0], RowPatch::Put { .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe_deletes_rows_and_got() {
        let replica = seeded_replica();
        let mut syncer = syncer(&replica);
        let mut rx = syncer.add_client("c1".into(), Watermark::min());
        desire(&mut syncer, "c1", "q1", acme_ast());
        let _ = recv_poke(&mut rx).await;

        syncer
            .change_desired_queries(
                &"c1".to_owned(),
                vec![DesiredQueryOp::Del { hash: "q1".into() }],
            )
            .unwrap();
        let (_, parts) = recv_poke(&mut rx).await;
        let dels = parts
            .iter()
            .flat_map(|p| p.entities_patch.iter().flatten())
            .filter(|p| matches!(p, RowPatch::Del { .. }))
            .count();
        assert_eq!(dels, 2);
        let got: Vec<_> = parts
            .iter()
            .flat_map(|p| p.got_queries_patch.iter().flatten())
            .collect();
        assert_eq!(got, vec![&QueriesPatchOp::Del { hash: "q1".into() }]);
        assert!(syncer.row_index.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_query_reported_to_owner_only() {
        let replica = seeded_replica();
        let mut syncer = syncer(&replica);
        let mut rx = syncer.add_client("c1".into(), Watermark::min());

        let mut bad = acme_ast();
        bad.table = "public.nope".into();
        syncer
            .change_desired_queries(
                &"c1".to_owned(),
                vec![DesiredQueryOp::Put {
                    hash: "bad".into(),
                    ast: bad,
                }],
            )
            .unwrap();

        match rx.recv().await.unwrap().unwrap() {
            Downstream::Error(e) => assert_eq!(e.kind, ErrorKind::InvalidQuery),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(syncer.queries.is_empty());
        assert!(!syncer
            .desired
            .get("c1")
            .map(|names| names.contains("bad"))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn test_schema_change_resyncs_group() {
        let replica = seeded_replica();
        let mut syncer = syncer(&replica);
        let mut rx = syncer.add_client("c1".into(), Watermark::min());
        desire(&mut syncer, "c1", "q1", acme_ast());
        let _ = recv_poke(&mut rx).await;

        // Widen the issues table, then commit past the change.
        let mut catalog = replica.catalog();
        let mut spec = catalog.get("public.issues").unwrap().clone();
        spec.columns.insert(
            "assignee".to_owned(),
            syncwave_common::catalog::ColumnSpec {
                data_type: syncwave_common::catalog::DataType::String,
                not_null: false,
            },
        );
        catalog.register(spec);
        replica.set_catalog(catalog).unwrap();
        replica
            .ingest_commit(&CommitPayload::new(
                Watermark::from_lsn(2),
                vec![issue_insert(102, "acme", "after ddl")],
            ))
            .unwrap();

        syncer.process_commit(Watermark::from_lsn(2)).unwrap();
        let (start, parts) = recv_poke(&mut rx).await;
        assert_eq!(start.cookie, Watermark::from_lsn(2));
        // Full re-materialization: the new acme row arrives even though the
        // incremental diff was unusable.
        let puts: Vec<_> = parts
            .iter()
            .flat_map(|p| p.entities_patch.iter().flatten())
            .filter(|p| matches!(p, RowPatch::Put { .. }))
            .collect();
        assert_eq!(puts.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_clients_drops_membership_and_queries() {
        let replica = seeded_replica();
        let mut syncer = syncer(&replica);
        let mut rx1 = syncer.add_client("c1".into(), Watermark::min());
        let mut rx2 = syncer.add_client("c2".into(), Watermark::min());
        desire(&mut syncer, "c1", "q1", acme_ast());
        let _ = recv_poke(&mut rx1).await;
        let _ = recv_poke(&mut rx2).await;

        syncer.delete_clients(vec!["c1".into()]).unwrap();

        // c1 is gone along with its query's rows; c2 observes it all.
        let (_, parts) = recv_poke(&mut rx2).await;
        let clients: Vec<_> = parts
            .iter()
            .flat_map(|p| p.clients_patch.iter().flatten())
            .collect();
        assert_eq!(
            clients,
            vec![&ClientsPatchOp::Del {
                client_id: "c1".into()
            }]
        );
        let dels = parts
            .iter()
            .flat_map(|p| p.entities_patch.iter().flatten())
            .filter(|p| matches!(p, RowPatch::Del { .. }))
            .count();
        assert_eq!(dels, 2);
        assert!(syncer.queries.is_empty());
        assert!(!syncer.desired.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_two_clients_in_group_share_state() {
        let replica = seeded_replica();
        let mut syncer = syncer(&replica);
        let mut rx1 = syncer.add_client("c1".into(), Watermark::min());
        let mut rx2 = syncer.add_client("c2".into(), Watermark::min());

        desire(&mut syncer, "c1", "q1", acme_ast());
        // Both clients in the group observe the same atomic poke.
        let (start1, parts1) = recv_poke(&mut rx1).await;
        let (start2, parts2) = recv_poke(&mut rx2).await;
        assert_eq!(start1.cookie, start2.cookie);
        let count = |parts: &[PokePart]| {
            parts
                .iter()
                .flat_map(|p| p.entities_patch.iter().flatten())
                .count()
        };
        assert_eq!(count(&parts1), count(&parts2));
    }
}
