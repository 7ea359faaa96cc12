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

//! The change streamer: single writer of the durable change log, multicast
//! to subscribers with per-subscriber backpressure and catch-up from any
//! acknowledged watermark.
//!
//! A subscriber starts `BACKFILLING` (served from storage) when its position
//! is below the in-memory ring, and is promoted to `LIVE` under the state
//! lock with no gap and no duplicate. Ingest holds the same lock across the
//! append and the fan-out, so promotion and delivery are serialized.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use syncwave_common::util::backoff::{Backoff, BackoffConfig};
use syncwave_common::{CommitPayload, Watermark};
use syncwave_storage::{ChangeLogStore, RangeKv};
use thiserror_ext::AsReport;
use tokio_util::sync::CancellationToken;

use crate::error::{StreamError, StreamResult};
use crate::source::{ChangeSource, SourceEvent};
use crate::subscription::{
    subscription_channel, CancelReason, PushOutcome, Subscription, SubscriptionOptions,
    SubscriptionSender,
};

pub type SharedPayload = Arc<CommitPayload>;

#[derive(Debug, Clone)]
pub struct ChangeStreamerOptions {
    /// Number of recent commits kept in memory for catch-up.
    pub ring_capacity: usize,
    /// Per-subscriber queue depth before it counts as lagging.
    pub subscriber_high_water: usize,
    /// Absolute buffered cap. Beyond it the subscriber is cancelled, or
    /// demoted when `demote_lagging` is set.
    pub subscriber_cap: usize,
    /// Downgrade a lagging subscriber to backfilling from storage instead of
    /// cancelling it.
    pub demote_lagging: bool,
    pub backoff: BackoffConfig,
}

impl Default for ChangeStreamerOptions {
    fn default() -> Self {
        Self {
            ring_capacity: 128,
            subscriber_high_water: 256,
            subscriber_cap: 1024,
            demote_lagging: false,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberState {
    Backfilling,
    Live,
    Lagging,
    Closed,
}

struct SubscriberEntry {
    sender: SubscriptionSender<SharedPayload>,
    state: SubscriberState,
    /// Watermark of the last commit handed to this subscriber's queue.
    delivered: Watermark,
    acked: Watermark,
}

struct StreamerState {
    ring: VecDeque<SharedPayload>,
    /// Watermark at or below which the ring cannot serve: the last evicted
    /// commit, or the log head at startup.
    ring_floor: Watermark,
    subscribers: HashMap<u64, SubscriberEntry>,
    next_id: u64,
}

pub struct ChangeStreamer<R: RangeKv> {
    store: ChangeLogStore<R>,
    owner: Arc<String>,
    options: Arc<ChangeStreamerOptions>,
    state: Arc<Mutex<StreamerState>>,
    shutdown: CancellationToken,
}

impl<R: RangeKv> Clone for ChangeStreamer<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            owner: self.owner.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<R: RangeKv> ChangeStreamer<R> {
    /// Acquires the writer lease on the store. Any previous owner loses it on
    /// its next append.
    pub fn new(store: ChangeLogStore<R>, options: ChangeStreamerOptions) -> StreamResult<Self> {
        let owner = format!("streamer-{:016x}", rand::thread_rng().next_u64());
        store.acquire_owner(&owner)?;
        let ring_floor = store.last_watermark()?;
        Ok(Self {
            store,
            owner: Arc::new(owner),
            options: Arc::new(options),
            state: Arc::new(Mutex::new(StreamerState {
                ring: VecDeque::new(),
                ring_floor,
                subscribers: HashMap::new(),
                next_id: 0,
            })),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn owner_token(&self) -> &str {
        &self.owner
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock();
        for (_, entry) in state.subscribers.drain() {
            entry.sender.cancel(CancelReason::Shutdown);
        }
    }

    /// Consume the upstream source until shutdown. Transient read failures
    /// retry on the backoff ladder; a reset signal propagates out for the
    /// supervisor to act on.
    pub async fn run(&self, source: Arc<dyn ChangeSource>) -> StreamResult<()> {
        use futures::StreamExt;

        let mut backoff = Backoff::new(self.options.backoff);
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let from = self.store.last_watermark()?;
            let mut stream = match source.subscribe(from.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e.as_report(),
                        ?delay,
                        "upstream subscribe failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            tracing::info!(%from, "upstream change stream connected");
            backoff.reset();

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    event = stream.next() => match event {
                        Some(Ok(SourceEvent::Commit(payload))) => self.ingest(payload)?,
                        Some(Ok(SourceEvent::Reset(signal))) => {
                            tracing::error!(reason = %signal.reason, "upstream demands replica reset");
                            self.shutdown();
                            return Err(signal.into());
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e.as_report(), "upstream read failed, reconnecting");
                            break;
                        }
                        None => {
                            tracing::warn!("upstream change stream closed, reconnecting");
                            break;
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Append one commit to the durable log and fan it out. Append, ring
    /// update and fan-out happen under one lock, which is what makes
    /// backfill promotion gap-free.
    pub fn ingest(&self, payload: CommitPayload) -> StreamResult<()> {
        let payload = Arc::new(payload);
        let mut state = self.state.lock();

        self.store.append(&self.owner, &payload)?;

        state.ring.push_back(payload.clone());
        while state.ring.len() > self.options.ring_capacity {
            let evicted = state.ring.pop_front().unwrap();
            state.ring_floor = evicted.watermark.clone();
        }

        let mut closed = Vec::new();
        let mut demoted = Vec::new();
        for (&id, entry) in state.subscribers.iter_mut() {
            if !matches!(
                entry.state,
                SubscriberState::Live | SubscriberState::Lagging
            ) {
                continue;
            }
            match entry.sender.push(payload.clone()) {
                PushOutcome::Delivered => {
                    entry.state = SubscriberState::Live;
                    entry.delivered = payload.watermark.clone();
                }
                PushOutcome::Lagging { depth } => {
                    entry.delivered = payload.watermark.clone();
                    if depth > self.options.subscriber_cap {
                        if self.options.demote_lagging {
                            entry.state = SubscriberState::Backfilling;
                            demoted.push((id, entry.delivered.clone()));
                        } else {
                            tracing::warn!(subscriber = id, depth, "cancelling slow subscriber");
                            entry.sender.cancel(CancelReason::Behind);
                            entry.state = SubscriberState::Closed;
                            closed.push(id);
                        }
                    } else {
                        entry.state = SubscriberState::Lagging;
                    }
                }
                PushOutcome::Cancelled => {
                    entry.state = SubscriberState::Closed;
                    closed.push(id);
                }
            }
        }
        for id in closed {
            state.subscribers.remove(&id);
        }
        for (id, from) in demoted {
            tracing::info!(subscriber = id, %from, "demoting lagging subscriber to backfill");
            let this = self.clone();
            tokio::spawn(async move { this.catch_up(id, from).await });
        }
        Ok(())
    }

    /// Register a subscriber resuming strictly after `from`. Served from the
    /// ring when possible, otherwise backfilled from storage first.
    pub fn subscribe(&self, from: Watermark) -> SubscriberHandle<R> {
        let (sender, subscription) = subscription_channel(SubscriptionOptions {
            high_water_mark: self.options.subscriber_high_water,
            coalesce: None,
            cleanup: Some(Box::new(|undelivered: Vec<SharedPayload>| {
                if !undelivered.is_empty() {
                    tracing::debug!(count = undelivered.len(), "discarding undelivered commits");
                }
            })),
        });

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let backfill = from < state.ring_floor;
        let mut entry = SubscriberEntry {
            sender: sender.clone(),
            state: if backfill {
                SubscriberState::Backfilling
            } else {
                SubscriberState::Live
            },
            delivered: from.clone(),
            acked: from.clone(),
        };

        if backfill {
            tracing::info!(subscriber = id, %from, "subscriber backfilling from storage");
        } else {
            for payload in &state.ring {
                if payload.watermark > from {
                    sender.push(payload.clone());
                    entry.delivered = payload.watermark.clone();
                }
            }
        }
        state.subscribers.insert(id, entry);
        drop(state);

        if backfill {
            let this = self.clone();
            tokio::spawn(async move { this.catch_up(id, from).await });
        }

        SubscriberHandle {
            id,
            streamer: self.clone(),
            subscription,
        }
    }

    /// Backfill one subscriber from storage, then promote it to live under
    /// the state lock. The final storage drain happens while holding the
    /// lock, so no commit can land in between.
    async fn catch_up(&self, id: u64, from: Watermark) {
        let mut cursor = self.store.scan(&from);
        loop {
            let next = match cursor.next_commit() {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(subscriber = id, error = %e.as_report(), "backfill read failed");
                    self.remove_subscriber(id, CancelReason::Behind);
                    return;
                }
            };
            match next {
                Some(payload) => {
                    let Some(sender) = self.subscriber_sender(id) else {
                        return;
                    };
                    let watermark = payload.watermark.clone();
                    if sender.push_wait(Arc::new(payload)).await == PushOutcome::Cancelled {
                        self.remove_subscriber(id, CancelReason::Disconnect);
                        return;
                    }
                    if let Some(entry) = self.state.lock().subscribers.get_mut(&id) {
                        entry.delivered = watermark;
                    }
                }
                None => {
                    // Storage is drained. Promote atomically: any residue that
                    // landed since the last read is pushed under the lock.
                    let mut state = self.state.lock();
                    loop {
                        match cursor.next_commit() {
                            Ok(Some(payload)) => {
                                let watermark = payload.watermark.clone();
                                if let Some(entry) = state.subscribers.get_mut(&id) {
                                    entry.sender.push(Arc::new(payload));
                                    entry.delivered = watermark;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(
                                    subscriber = id,
                                    error = %e.as_report(),
                                    "backfill drain failed"
                                );
                                if let Some(entry) = state.subscribers.remove(&id) {
                                    entry.sender.cancel(CancelReason::Behind);
                                }
                                return;
                            }
                        }
                    }
                    if let Some(entry) = state.subscribers.get_mut(&id) {
                        entry.state = SubscriberState::Live;
                        tracing::info!(subscriber = id, delivered = %entry.delivered, "subscriber promoted to live");
                    }
                    return;
                }
            }
        }
    }

    fn subscriber_sender(&self, id: u64) -> Option<SubscriptionSender<SharedPayload>> {
        self.state
            .lock()
            .subscribers
            .get(&id)
            .map(|entry| entry.sender.clone())
    }

    fn remove_subscriber(&self, id: u64, reason: CancelReason) {
        if let Some(entry) = self.state.lock().subscribers.remove(&id) {
            entry.sender.cancel(reason);
        }
    }

    /// Record a subscriber acknowledgment and truncate the log below the
    /// minimum acknowledged position.
    fn ack(&self, id: u64, watermark: Watermark) {
        let min_acked = {
            let mut state = self.state.lock();
            let Some(entry) = state.subscribers.get_mut(&id) else {
                return;
            };
            if watermark > entry.acked {
                entry.acked = watermark;
            }
            state
                .subscribers
                .values()
                .filter(|entry| entry.state != SubscriberState::Closed)
                .map(|entry| entry.acked.clone())
                .min()
        };
        if let Some(min_acked) = min_acked {
            if let Err(e) = self.store.truncate_below(&min_acked) {
                tracing::warn!(error = %e.as_report(), "change log truncation failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

/// One subscriber's receiving end.
pub struct SubscriberHandle<R: RangeKv> {
    id: u64,
    streamer: ChangeStreamer<R>,
    subscription: Subscription<SharedPayload>,
}

impl<R: RangeKv> SubscriberHandle<R> {
    pub async fn recv(&mut self) -> StreamResult<Option<SharedPayload>> {
        self.subscription.recv().await
    }

    /// Acknowledge everything up to and including `watermark`. Feeds log
    /// compaction.
    pub fn ack(&self, watermark: Watermark) {
        self.streamer.ack(self.id, watermark);
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.subscription.cancellation_token()
    }
}

impl<R: RangeKv> Drop for SubscriberHandle<R> {
    fn drop(&mut self) {
        self.streamer
            .remove_subscriber(self.id, CancelReason::Disconnect);
    }
}
