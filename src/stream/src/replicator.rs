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

use syncwave_common::Watermark;
use syncwave_storage::{RangeKv, Replica};
use tokio::sync::watch;

use crate::error::StreamResult;
use crate::streamer::{ChangeStreamer, SubscriberHandle};

/// Applies committed transactions from the change streamer to the local
/// replica and publishes the resulting version for view syncers to follow.
///
/// Resumes from the replica's own stored watermark, so a restart replays
/// nothing and loses nothing.
pub struct Replicator<R: RangeKv> {
    replica: Replica<R>,
    version_tx: watch::Sender<Watermark>,
}

impl<R: RangeKv> Replicator<R> {
    pub fn new(replica: Replica<R>) -> (Self, watch::Receiver<Watermark>) {
        let (version_tx, version_rx) = watch::channel(replica.version());
        (
            Self {
                replica,
                version_tx,
            },
            version_rx,
        )
    }

    pub fn replica(&self) -> &Replica<R> {
        &self.replica
    }

    pub async fn run(&self, streamer: &ChangeStreamer<R>) -> StreamResult<()> {
        let from = self.replica.version();
        tracing::info!(%from, "replicator subscribing to change stream");
        let handle = streamer.subscribe(from);
        self.run_with(handle).await
    }

    pub async fn run_with(&self, mut handle: SubscriberHandle<R>) -> StreamResult<()> {
        while let Some(payload) = handle.recv().await? {
            // Replays below the applied watermark are possible after an ack
            // was lost with a restart; applying is idempotent by skipping.
            if payload.watermark <= self.replica.version() {
                tracing::debug!(watermark = %payload.watermark, "skipping already-applied commit");
                handle.ack(payload.watermark.clone());
                continue;
            }
            self.replica.ingest_commit(&payload)?;
            handle.ack(payload.watermark.clone());
            // Receivers only care about the newest version.
            let _ = self.version_tx.send(payload.watermark.clone());
        }
        tracing::info!("change stream ended, replicator stopping");
        Ok(())
    }
}
