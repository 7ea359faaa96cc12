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

//! Bounded outbound subscription with coalesce and cleanup hooks.
//!
//! The sender never blocks: pushing past the high-water mark reports a
//! lagging depth and leaves policy to the producer. On cancellation, from
//! either side, every undelivered item is handed to the cleanup hook so the
//! consumer can reclaim resources.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{StreamError, StreamResult};

/// Merge an incoming item into the newest queued one. Returning `Some`
/// replaces the queued item; `None` appends. Change records are never
/// coalesced; only idempotent control items should be.
pub type CoalesceFn<T> = Box<dyn Fn(&T, &T) -> Option<T> + Send + Sync>;

/// Receives every undelivered item when the subscription is cancelled.
pub type CleanupFn<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

pub struct SubscriptionOptions<T> {
    /// Queue depth beyond which pushes report lagging.
    pub high_water_mark: usize,
    pub coalesce: Option<CoalesceFn<T>>,
    pub cleanup: Option<CleanupFn<T>>,
}

impl<T> Default for SubscriptionOptions<T> {
    fn default() -> Self {
        Self {
            high_water_mark: 1024,
            coalesce: None,
            cleanup: None,
        }
    }
}

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The consumer failed to drain in time.
    Behind,
    /// The consumer went away.
    Disconnect,
    /// The producer is shutting down.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Queued, but the consumer is past the high-water mark.
    Lagging { depth: usize },
    Cancelled,
}

struct Inner<T> {
    queue: VecDeque<T>,
    cancelled: Option<CancelReason>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    options: SubscriptionOptions<T>,
    readable: Notify,
    writable: Notify,
    token: CancellationToken,
}

impl<T> Shared<T> {
    fn cancel(&self, reason: CancelReason) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.cancelled.is_some() {
                return;
            }
            inner.cancelled = Some(reason);
            std::mem::take(&mut inner.queue)
        };
        if let Some(cleanup) = &self.options.cleanup {
            cleanup(drained.into());
        }
        self.token.cancel();
        // Wake current waiters and store a permit for one that is between
        // its state check and its await.
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
    }
}

pub fn subscription_channel<T: Send + 'static>(
    options: SubscriptionOptions<T>,
) -> (SubscriptionSender<T>, Subscription<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::new(),
            cancelled: None,
        }),
        options,
        readable: Notify::new(),
        writable: Notify::new(),
        token: CancellationToken::new(),
    });
    (
        SubscriptionSender {
            shared: shared.clone(),
        },
        Subscription { shared },
    )
}

pub struct SubscriptionSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SubscriptionSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> SubscriptionSender<T> {
    /// Non-blocking push. Never drops silently: past the high-water mark the
    /// item is still queued and the caller learns the depth.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut inner = self.shared.inner.lock();
        if inner.cancelled.is_some() {
            drop(inner);
            if let Some(cleanup) = &self.shared.options.cleanup {
                cleanup(vec![item]);
            }
            return PushOutcome::Cancelled;
        }
        if let (Some(coalesce), Some(last)) =
            (&self.shared.options.coalesce, inner.queue.back())
        {
            if let Some(merged) = coalesce(last, &item) {
                *inner.queue.back_mut().unwrap() = merged;
                drop(inner);
                self.shared.readable.notify_one();
                return PushOutcome::Delivered;
            }
        }
        inner.queue.push_back(item);
        let depth = inner.queue.len();
        drop(inner);
        self.shared.readable.notify_one();
        if depth > self.shared.options.high_water_mark {
            PushOutcome::Lagging { depth }
        } else {
            PushOutcome::Delivered
        }
    }

    /// Push that waits for the queue to drain below the high-water mark.
    /// Used by storage-driven catch-up, which has no ordering race to fear.
    pub async fn push_wait(&self, item: T) -> PushOutcome {
        loop {
            {
                let inner = self.shared.inner.lock();
                if inner.cancelled.is_some() || inner.queue.len() < self.shared.options.high_water_mark
                {
                    break;
                }
            }
            self.shared.writable.notified().await;
        }
        self.push(item)
    }

    pub fn cancel(&self, reason: CancelReason) {
        self.shared.cancel(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().cancelled.is_some()
    }

    pub fn depth(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }
}

/// Consumer end of a subscription.
pub struct Subscription<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Subscription<T> {
    /// The next item. `Ok(None)` on clean shutdown or disconnect;
    /// `SubscriberBehind` when the producer cancelled for lag.
    pub async fn recv(&mut self) -> StreamResult<Option<T>> {
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if let Some(item) = inner.queue.pop_front() {
                    drop(inner);
                    self.shared.writable.notify_one();
                    return Ok(Some(item));
                }
                match inner.cancelled {
                    Some(CancelReason::Behind) => return Err(StreamError::SubscriberBehind),
                    Some(_) => return Ok(None),
                    None => {}
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Consumer-side unsubscribe. Undelivered items go to the cleanup hook.
    pub fn cancel(&self) {
        self.shared.cancel(CancelReason::Disconnect);
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.token
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shared.cancel(CancelReason::Disconnect);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_push_recv_in_order() {
        let (tx, mut rx) = subscription_channel::<u32>(SubscriptionOptions::default());
        assert_eq!(tx.push(1), PushOutcome::Delivered);
        assert_eq!(tx.push(2), PushOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert_eq!(rx.recv().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_lagging_then_behind() {
        let (tx, mut rx) = subscription_channel::<u32>(SubscriptionOptions {
            high_water_mark: 2,
            ..Default::default()
        });
        assert_eq!(tx.push(1), PushOutcome::Delivered);
        assert_eq!(tx.push(2), PushOutcome::Delivered);
        assert_eq!(tx.push(3), PushOutcome::Lagging { depth: 3 });

        tx.cancel(CancelReason::Behind);
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, StreamError::SubscriberBehind));
    }

    #[tokio::test]
    async fn test_cleanup_receives_undelivered() {
        static CLEANED: AtomicUsize = AtomicUsize::new(0);
        let (tx, rx) = subscription_channel::<u32>(SubscriptionOptions {
            high_water_mark: 16,
            coalesce: None,
            cleanup: Some(Box::new(|items| {
                CLEANED.fetch_add(items.len(), Ordering::SeqCst);
            })),
        });
        tx.push(1);
        tx.push(2);
        tx.push(3);
        rx.cancel();
        assert_eq!(CLEANED.load(Ordering::SeqCst), 3);
        // Pushing after cancel routes the item to cleanup too.
        assert_eq!(tx.push(4), PushOutcome::Cancelled);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_coalesce_replaces_tail() {
        let (tx, mut rx) = subscription_channel::<u32>(SubscriptionOptions {
            high_water_mark: 16,
            // Merge equal adjacent items, the idempotent-control case.
            coalesce: Some(Box::new(|last, next| (last == next).then_some(*next))),
            cleanup: None,
        });
        tx.push(7);
        tx.push(7);
        tx.push(8);
        assert_eq!(rx.recv().await.unwrap(), Some(7));
        assert_eq!(rx.recv().await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_push_wait_resumes_after_drain() {
        let (tx, mut rx) = subscription_channel::<u32>(SubscriptionOptions {
            high_water_mark: 1,
            ..Default::default()
        });
        tx.push(1);
        let tx2 = tx.clone();
        let waiter = tokio::spawn(async move { tx2.push_wait(2).await });
        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert_eq!(waiter.await.unwrap(), PushOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap(), Some(2));
    }
}
