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

//! Upstream change source adapters.
//!
//! A source yields committed transactions in watermark order starting
//! strictly after the requested position, or a reset signal when it can no
//! longer serve that position.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use syncwave_common::{AutoResetSignal, CommitPayload, Watermark};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum SourceEvent {
    Commit(CommitPayload),
    /// The source cannot serve the requested position anymore. The replica
    /// must be rebuilt from scratch.
    Reset(AutoResetSignal),
}

pub type SourceStream = BoxStream<'static, StreamResult<SourceEvent>>;

/// First frame a subscriber sends to a framed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub from: Watermark,
}

/// A pluggable upstream change feed.
#[async_trait]
pub trait ChangeSource: Send + Sync + 'static {
    /// Stream all commits with watermark strictly greater than `from`, then
    /// stay live.
    async fn subscribe(&self, from: Watermark) -> StreamResult<SourceStream>;
}

// ---- in-process source ----

struct ChannelShared {
    /// Full retained history, so a late subscriber can replay from any
    /// position.
    history: Vec<SourceEvent>,
    live: Vec<mpsc::UnboundedSender<SourceEvent>>,
}

/// Generic custom source fed by the embedder (and by tests): pushed commits
/// are retained and broadcast to every live subscriber.
#[derive(Clone)]
pub struct ChannelSource {
    shared: Arc<Mutex<ChannelShared>>,
}

impl ChannelSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(ChannelShared {
                history: Vec::new(),
                live: Vec::new(),
            })),
        }
    }

    pub fn push_commit(&self, payload: CommitPayload) {
        self.broadcast(SourceEvent::Commit(payload));
    }

    pub fn push_reset(&self, signal: AutoResetSignal) {
        self.broadcast(SourceEvent::Reset(signal));
    }

    fn broadcast(&self, event: SourceEvent) {
        let mut shared = self.shared.lock();
        shared.history.push(event.clone());
        shared.live.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn subscribe(&self, from: Watermark) -> StreamResult<SourceStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog: VecDeque<SourceEvent> = {
            let mut shared = self.shared.lock();
            let backlog = shared
                .history
                .iter()
                .filter(|event| match event {
                    SourceEvent::Commit(payload) => payload.watermark > from,
                    SourceEvent::Reset(_) => true,
                })
                .cloned()
                .collect();
            shared.live.push(tx);
            backlog
        };
        let live = tokio_stream_from(rx);
        Ok(futures::stream::iter(backlog.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }
}

fn tokio_stream_from(
    mut rx: mpsc::UnboundedReceiver<SourceEvent>,
) -> Pin<Box<dyn futures::Stream<Item = StreamResult<SourceEvent>> + Send>> {
    Box::pin(futures::stream::poll_fn(move |cx| {
        rx.poll_recv(cx).map(|opt| opt.map(Ok))
    }))
}

// ---- remote custom source over framed JSON ----

/// Remote custom source: newline-framed JSON `SourceEvent`s over TCP. The
/// subscriber opens the connection and sends its resume position first.
pub struct FramedSource {
    addr: String,
}

impl FramedSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ChangeSource for FramedSource {
    async fn subscribe(&self, from: Watermark) -> StreamResult<SourceStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to upstream {}", self.addr))
            .map_err(StreamError::Source)?;
        let mut framed = Framed::new(stream, LinesCodec::new());

        let request = serde_json::to_string(&SubscribeRequest { from })
            .context("encoding subscribe request")
            .map_err(StreamError::Source)?;
        framed
            .send(request)
            .await
            .context("sending subscribe request")
            .map_err(StreamError::Source)?;

        Ok(framed
            .map(|frame| match frame {
                Ok(line) => serde_json::from_str::<SourceEvent>(&line)
                    .with_context(|| format!("malformed source frame: {line}"))
                    .map_err(StreamError::Source),
                Err(e) => Err(StreamError::Source(e.into())),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use syncwave_common::{Change, Row};

    use super::*;

    fn payload(lsn: u64) -> CommitPayload {
        let mut row = Row::new();
        row.insert("id", lsn as i64);
        CommitPayload::new(
            Watermark::from_lsn(lsn),
            vec![Change::Insert {
                table: "t".into(),
                row,
            }],
        )
    }

    #[tokio::test]
    async fn test_channel_source_replays_from_position() {
        let source = ChannelSource::new();
        source.push_commit(payload(1));
        source.push_commit(payload(2));
        source.push_commit(payload(3));

        let mut stream = source.subscribe(Watermark::from_lsn(1)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            SourceEvent::Commit(c) => assert_eq!(c.watermark, Watermark::from_lsn(2)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_source_live_delivery() {
        let source = ChannelSource::new();
        let mut stream = source.subscribe(Watermark::min()).await.unwrap();
        source.push_commit(payload(1));
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, SourceEvent::Commit(_)));

        source.push_reset(AutoResetSignal::new("slot dropped"));
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, SourceEvent::Reset(_)));
    }
}
