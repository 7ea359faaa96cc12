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

//! The `syncwave` node: option parsing and the supervisor that wires the
//! change streamer, replicator and view-syncer service together, restarts
//! them on an upstream reset, and serves the change-streamer port.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use syncwave_common::config::NodeConfig;
use syncwave_stream::{
    ChangeSource, ChangeStreamer, FramedSource, SourceEvent, StreamError, SubscribeRequest,
};
pub use syncwave_stream::ChannelSource;
use thiserror_ext::AsReport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

mod supervisor;

pub use supervisor::{run_node, NodeExit};

/// Command line options of the syncwave node. Every recognized config key
/// has a flag and an environment override.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Realtime relational view synchronization node")]
pub struct SyncwaveOpts {
    /// Upstream change source kind. `custom` is the framed change-source
    /// protocol.
    #[clap(long, env = "SYNCWAVE_UPSTREAM_TYPE", default_value = "custom")]
    pub upstream_type: String,

    /// Upstream address, e.g. `127.0.0.1:9431` for the custom source.
    #[clap(long, env = "SYNCWAVE_UPSTREAM_DB", default_value = "")]
    pub upstream_db: String,

    #[clap(long, env = "SYNCWAVE_UPSTREAM_MAX_CONNS", default_value_t = 4)]
    pub upstream_max_conns: usize,

    /// Replica database directory.
    #[clap(long, env = "SYNCWAVE_REPLICA_FILE", default_value = "./syncwave-replica")]
    pub replica_file: PathBuf,

    /// Port serving downstream change-stream subscribers.
    #[clap(long, env = "SYNCWAVE_CHANGE_STREAMER_PORT", default_value_t = 4849)]
    pub change_streamer_port: u16,

    #[clap(long, env = "SYNCWAVE_SHARD", default_value = "0")]
    pub shard: String,

    /// Wipe the replica and re-run initial sync when the upstream demands a
    /// reset instead of failing.
    #[clap(long, env = "SYNCWAVE_AUTO_RESET")]
    pub auto_reset: bool,

    /// Allow initial sync on an empty replica.
    #[clap(long, env = "SYNCWAVE_INITIAL_SYNC", default_value_t = true)]
    pub initial_sync: bool,

    #[clap(long, env = "SYNCWAVE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Quiet window before a burst of commits is processed, in milliseconds.
    #[clap(long, env = "SYNCWAVE_DEBOUNCE_DELAY_MS", default_value_t = 10)]
    pub debounce_delay_ms: u64,

    /// Liveness watchdog interval, in seconds.
    #[clap(long, env = "SYNCWAVE_WATCHDOG_TIMER_SECS", default_value_t = 30)]
    pub watchdog_timer_secs: u64,

    #[clap(long, env = "SYNCWAVE_MAX_CONNECTIONS", default_value_t = 1024)]
    pub max_connections: usize,

    /// Retry ladder bounds for upstream reads, in milliseconds.
    #[clap(long, env = "SYNCWAVE_MIN_DELAY_MS", default_value_t = 50)]
    pub min_delay_ms: u64,

    #[clap(long, env = "SYNCWAVE_MAX_DELAY_MS", default_value_t = 10_000)]
    pub max_delay_ms: u64,

    /// Optional JSON config file; command line flags win over it.
    #[clap(long, env = "SYNCWAVE_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,
}

impl SyncwaveOpts {
    /// Resolve the effective node config: file defaults, then flags.
    pub fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => NodeConfig::default(),
        };
        config.upstream.kind = self.upstream_type;
        config.upstream.db = self.upstream_db;
        config.upstream.max_conns = self.upstream_max_conns;
        config.replica_file = self.replica_file;
        config.change_streamer_port = self.change_streamer_port;
        config.shard = self.shard;
        config.auto_reset = self.auto_reset;
        config.initial_sync = self.initial_sync;
        config.log.level = self.log_level;
        config.debounce_delay = Duration::from_millis(self.debounce_delay_ms);
        config.watchdog_timer = Duration::from_secs(self.watchdog_timer_secs);
        config.max_connections = self.max_connections;
        config.min_delay_ms = self.min_delay_ms;
        config.max_delay_ms = self.max_delay_ms;
        Ok(config)
    }
}

/// Resolve the configured upstream adapter.
pub fn change_source(config: &NodeConfig) -> Result<std::sync::Arc<dyn ChangeSource>> {
    match config.upstream.kind.as_str() {
        "custom" => {
            if config.upstream.db.is_empty() {
                bail!("upstream.db is required for the custom change source");
            }
            Ok(std::sync::Arc::new(FramedSource::new(
                config.upstream.db.clone(),
            )))
        }
        other => bail!("unsupported upstream source type: {other}"),
    }
}

/// Serve the change-streamer port: each connection presents its resume
/// watermark and receives newline-framed commits from there on.
pub async fn serve_change_stream<R: syncwave_storage::RangeKv>(
    listener: TcpListener,
    streamer: ChangeStreamer<R>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e.as_report(), "change stream accept failed");
                continue;
            }
        };
        tracing::info!(%peer, "change stream subscriber connected");
        let streamer = streamer.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_subscriber(socket, streamer).await {
                tracing::info!(%peer, error = %e, "change stream subscriber closed");
            }
        });
    }
}

async fn serve_subscriber<R: syncwave_storage::RangeKv>(
    socket: TcpStream,
    streamer: ChangeStreamer<R>,
) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let request_line = lines
        .next_line()
        .await?
        .context("connection closed before subscribe request")?;
    let request: SubscribeRequest =
        serde_json::from_str(&request_line).context("malformed subscribe request")?;

    let mut handle = streamer.subscribe(request.from);
    loop {
        match handle.recv().await {
            Ok(Some(payload)) => {
                let event = SourceEvent::Commit((*payload).clone());
                let mut frame = serde_json::to_vec(&event)?;
                frame.push(b'\n');
                writer.write_all(&frame).await?;
                handle.ack(payload.watermark.clone());
            }
            Ok(None) => return Ok(()),
            Err(StreamError::SubscriberBehind) => {
                tracing::warn!("downstream subscriber behind, dropping connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// Re-exported for embedders and tests that feed the node in process.
pub use ChannelSource as InProcessSource;
