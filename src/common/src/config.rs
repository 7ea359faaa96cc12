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

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::backoff::BackoffConfig;

/// Node-level configuration. Field names are the recognized keys; everything
/// has a serde default so partial configs deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub upstream: UpstreamConfig,

    /// Path of the local replica database.
    pub replica_file: PathBuf,

    /// Port on which the change streamer serves downstream subscribers.
    pub change_streamer_port: u16,

    /// Shard identifier carried in persisted state, so that two shards never
    /// share a replica file.
    pub shard: String,

    /// Wipe the replica and re-run initial sync when the upstream demands it.
    /// When unset, a reset demand is a fatal error instead.
    pub auto_reset: bool,

    /// Run initial sync on an empty replica before serving.
    pub initial_sync: bool,

    pub log: LogConfig,

    /// Quiet window applied before a view-syncer processes a burst of commits.
    pub debounce_delay: Duration,

    /// Watchdog interval for supervised tasks.
    pub watchdog_timer: Duration,

    /// Upper bound on concurrently connected sync clients.
    pub max_connections: usize,

    /// Retry ladder bounds for upstream reads.
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            replica_file: PathBuf::from("./syncwave-replica"),
            change_streamer_port: 4849,
            shard: "0".to_owned(),
            auto_reset: false,
            initial_sync: true,
            log: LogConfig::default(),
            debounce_delay: Duration::from_millis(10),
            watchdog_timer: Duration::from_secs(30),
            max_connections: 1024,
            min_delay_ms: 50,
            max_delay_ms: 10_000,
        }
    }
}

impl NodeConfig {
    /// Backoff schedule shared by upstream reads and reconnect loops.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    /// Adapter kind. `custom` is the in-tree framed change source; other kinds
    /// are resolved by the embedder.
    #[serde(rename = "type")]
    pub kind: String,

    /// Adapter-specific address of the upstream, e.g. `host:port` for the
    /// custom source.
    pub db: String,

    pub max_conns: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: "custom".to_owned(),
            db: String::new(),
            max_conns: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}
