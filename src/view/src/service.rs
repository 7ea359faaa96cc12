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

//! The connection-facing layer over per-group view syncers: group residency,
//! upstream message dispatch, and the loop that follows the replicator's
//! published versions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use syncwave_common::Watermark;
use syncwave_storage::{RangeKv, Replica};
use syncwave_stream::Subscription;
use thiserror_ext::AsReport;
use tokio::sync::watch;

use crate::client_handler::ClientHandlerOptions;
use crate::error::ViewResult;
use crate::materialize::MaterializationRegistry;
use crate::protocol::{ClientGroupId, ClientId, Downstream, Upstream};
use crate::syncer::ViewSyncer;

#[derive(Debug, Clone)]
pub struct ViewSyncerServiceOptions {
    pub handler: ClientHandlerOptions,
    /// How long a materialization outlives its last reference.
    pub materialization_idle: Duration,
    /// Quiet window before a burst of commits is processed.
    pub debounce_delay: Duration,
}

impl Default for ViewSyncerServiceOptions {
    fn default() -> Self {
        Self {
            handler: ClientHandlerOptions::default(),
            materialization_idle: Duration::from_secs(10),
            debounce_delay: Duration::from_millis(10),
        }
    }
}

pub struct ViewSyncerService<R: RangeKv> {
    replica: Replica<R>,
    registry: Arc<MaterializationRegistry>,
    options: ViewSyncerServiceOptions,
    groups: Mutex<HashMap<ClientGroupId, Arc<Mutex<ViewSyncer<R>>>>>,
}

impl<R: RangeKv> ViewSyncerService<R> {
    pub fn new(replica: Replica<R>, options: ViewSyncerServiceOptions) -> Arc<Self> {
        let registry = MaterializationRegistry::new(options.materialization_idle);
        Arc::new(Self {
            replica,
            registry,
            options,
            groups: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<MaterializationRegistry> {
        &self.registry
    }

    fn group(&self, group_id: &ClientGroupId) -> Arc<Mutex<ViewSyncer<R>>> {
        self.groups
            .lock()
            .entry(group_id.clone())
            .or_insert_with(|| {
                tracing::info!(group = %group_id, "starting view syncer for client group");
                Arc::new(Mutex::new(ViewSyncer::new(
                    group_id.clone(),
                    self.replica.clone(),
                    self.registry.clone(),
                    self.options.handler.clone(),
                )))
            })
            .clone()
    }

    /// Attach a client connection; the returned stream carries its frames.
    pub fn connect(
        &self,
        group_id: &ClientGroupId,
        client_id: &ClientId,
        base_cookie: Watermark,
    ) -> Subscription<Downstream> {
        self.group(group_id)
            .lock()
            .add_client(client_id.clone(), base_cookie)
    }

    pub fn handle_upstream(
        &self,
        group_id: &ClientGroupId,
        client_id: &ClientId,
        message: Upstream,
    ) -> ViewResult<()> {
        let group = self.group(group_id);
        let mut group = group.lock();
        match message {
            Upstream::ChangeDesiredQueries {
                desired_queries_patch,
            } => group.change_desired_queries(client_id, desired_queries_patch),
            Upstream::DeleteClients { client_ids } => group.delete_clients(client_ids),
        }
    }

    pub fn record_mutation(
        &self,
        group_id: &ClientGroupId,
        client_id: &ClientId,
        mutation_id: u64,
    ) {
        self.group(group_id)
            .lock()
            .record_mutation(client_id.clone(), mutation_id);
    }

    /// Detach a connection. An empty group's syncer is torn down.
    pub fn disconnect(&self, group_id: &ClientGroupId, client_id: &ClientId) {
        let group = {
            let groups = self.groups.lock();
            groups.get(group_id).cloned()
        };
        let Some(group) = group else {
            return;
        };
        let empty = {
            let mut group = group.lock();
            group.disconnect(client_id);
            group.is_empty()
        };
        if empty {
            tracing::info!(group = %group_id, "dropping empty client group");
            self.groups.lock().remove(group_id);
        }
    }

    /// Advance every group to `version`, in strict commit order per group.
    pub fn process_commit(&self, version: &Watermark) {
        let groups: Vec<_> = {
            let groups = self.groups.lock();
            groups.values().cloned().collect()
        };
        for group in groups {
            let mut group = group.lock();
            if let Err(e) = group.process_commit(version.clone()) {
                tracing::error!(
                    group = %group.group_id(),
                    error = %e.as_report(),
                    "view syncer failed to process commit"
                );
            }
        }
    }

    /// Follow the replicator's published versions until the channel closes.
    /// Bursts inside the debounce window collapse into one processing round.
    pub async fn run(&self, mut version_rx: watch::Receiver<Watermark>) {
        while version_rx.changed().await.is_ok() {
            if !self.options.debounce_delay.is_zero() {
                tokio::time::sleep(self.options.debounce_delay).await;
            }
            let version = version_rx.borrow_and_update().clone();
            self.process_commit(&version);
        }
        tracing::info!("replicator version stream closed, view syncer service stopping");
    }
}
