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

//! The node supervisor: owns the storage handles and the long-lived tasks,
//! restarts everything from initial sync when the upstream demands a reset,
//! and turns fatal errors into exit codes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use syncwave_common::config::NodeConfig;
use syncwave_storage::sled_kv::SledRangeKv;
use syncwave_storage::{ChangeLogStore, Replica, ReplicationConfig, StorageError};
use syncwave_stream::{ChangeStreamer, ChangeStreamerOptions, Replicator, StreamError};
use syncwave_view::{ViewSyncerService, ViewSyncerServiceOptions};
use thiserror_ext::AsReport;
use tokio::net::TcpListener;
use tokio::signal;

use crate::{change_source, serve_change_stream};

/// How a supervised run ended.
#[derive(Debug)]
pub enum NodeExit {
    /// Clean shutdown: exit 0.
    Clean,
    /// The replica file cannot be opened: exit nonzero.
    DatabaseInit(anyhow::Error),
    /// Bad configuration: exit nonzero.
    Config(anyhow::Error),
    /// The upstream is gone for good: exit nonzero.
    UpstreamLost(anyhow::Error),
}

impl NodeExit {
    pub fn code(&self) -> i32 {
        match self {
            NodeExit::Clean => 0,
            NodeExit::DatabaseInit(_) => 2,
            NodeExit::Config(_) => 3,
            NodeExit::UpstreamLost(_) => 4,
        }
    }
}

fn change_log_path(config: &NodeConfig) -> PathBuf {
    let mut path = config.replica_file.as_os_str().to_owned();
    path.push("-changelog");
    PathBuf::from(path)
}

fn open_kv(path: &Path) -> Result<SledRangeKv, StorageError> {
    SledRangeKv::open(path).map_err(|e| StorageError::DatabaseInit(e.into()))
}

fn wipe_storage(config: &NodeConfig) -> Result<()> {
    for path in [&config.replica_file, &change_log_path(config)] {
        if path.exists() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("wiping {}", path.display()))?;
        }
    }
    Ok(())
}

/// Run the node until shutdown. Loops through full restarts on auto-reset.
pub async fn run_node(config: NodeConfig) -> NodeExit {
    let source = match change_source(&config) {
        Ok(source) => source,
        Err(e) => return NodeExit::Config(e),
    };

    loop {
        let round = match run_once(&config, source.clone()).await {
            Ok(exit) => return exit,
            Err(RoundEnd::AutoReset(reason)) => reason,
            Err(RoundEnd::Fatal(exit)) => return exit,
        };
        if !config.auto_reset {
            return NodeExit::UpstreamLost(anyhow::anyhow!(
                "upstream demanded a replica reset and autoReset is off: {round}"
            ));
        }
        tracing::warn!(reason = %round, "wiping replica for auto reset");
        if let Err(e) = wipe_storage(&config) {
            return NodeExit::DatabaseInit(e);
        }
    }
}

enum RoundEnd {
    AutoReset(String),
    Fatal(NodeExit),
}

async fn run_once(config: &NodeConfig, source: std::sync::Arc<dyn syncwave_stream::ChangeSource>) -> Result<NodeExit, RoundEnd> {
    // Storage first: an unopenable replica file is fatal, immediately.
    let log_kv = open_kv(&change_log_path(config))
        .map_err(|e| RoundEnd::Fatal(NodeExit::DatabaseInit(e.into())))?;
    let replica_kv = open_kv(&config.replica_file)
        .map_err(|e| RoundEnd::Fatal(NodeExit::DatabaseInit(e.into())))?;

    let store = ChangeLogStore::new(log_kv)
        .map_err(|e| RoundEnd::Fatal(NodeExit::DatabaseInit(e.into())))?;
    let live_config = ReplicationConfig {
        replica_version: format!("{}:{}", env!("CARGO_PKG_VERSION"), config.shard),
        publications: Vec::new(),
        reset_required: false,
    };
    match store.ensure_config(&live_config) {
        Ok(syncwave_storage::ConfigCheck::Ready) => {}
        Ok(syncwave_storage::ConfigCheck::Reinitialized) => {
            tracing::warn!("replication config changed, change log reinitialized");
        }
        Ok(syncwave_storage::ConfigCheck::ResetRequired) => {
            return Err(RoundEnd::AutoReset("stored resetRequired flag".into()));
        }
        Err(e) => return Err(RoundEnd::Fatal(NodeExit::DatabaseInit(e.into()))),
    }

    let replica = Replica::open(replica_kv)
        .map_err(|e| RoundEnd::Fatal(NodeExit::DatabaseInit(e.into())))?;
    if replica.version().is_min() {
        if config.initial_sync {
            tracing::info!("empty replica, running initial sync from the source origin");
        } else {
            return Err(RoundEnd::Fatal(NodeExit::Config(anyhow::anyhow!(
                "replica is empty and initialSync is disabled"
            ))));
        }
    }

    let streamer = ChangeStreamer::new(
        store,
        ChangeStreamerOptions {
            backoff: config.backoff(),
            ..Default::default()
        },
    )
    .map_err(|e| RoundEnd::Fatal(NodeExit::DatabaseInit(e.into())))?;

    let (replicator, version_rx) = Replicator::new(replica.clone());
    let service = ViewSyncerService::new(
        replica.clone(),
        ViewSyncerServiceOptions {
            debounce_delay: config.debounce_delay,
            ..Default::default()
        },
    );

    let listener = TcpListener::bind(("0.0.0.0", config.change_streamer_port))
        .await
        .map_err(|e| RoundEnd::Fatal(NodeExit::Config(e.into())))?;
    tracing::info!(port = config.change_streamer_port, "change streamer port open");

    let serve = tokio::spawn(serve_change_stream(listener, streamer.clone()));
    let apply = {
        let streamer = streamer.clone();
        tokio::spawn(async move { replicator.run(&streamer).await })
    };
    let views = {
        let service = service.clone();
        tokio::spawn(async move { service.run(version_rx).await })
    };
    let watchdog = {
        let replica = replica.clone();
        let period = config.watchdog_timer;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                tracing::debug!(version = %replica.version(), "replication liveness");
            }
        })
    };

    let ingest = {
        let streamer = streamer.clone();
        tokio::spawn(async move { streamer.run(source).await })
    };

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(NodeExit::Clean)
        }
        result = ingest => match result {
            Ok(Ok(())) => Ok(NodeExit::Clean),
            Ok(Err(StreamError::AutoReset(signal))) => Err(RoundEnd::AutoReset(signal.reason)),
            Ok(Err(e)) => {
                tracing::error!(error = %e.as_report(), "change streamer failed");
                Err(RoundEnd::Fatal(NodeExit::UpstreamLost(e.into())))
            }
            Err(join) => Err(RoundEnd::Fatal(NodeExit::UpstreamLost(join.into()))),
        },
    };

    streamer.shutdown();
    serve.abort();
    views.abort();
    watchdog.abort();
    apply.abort();
    outcome
}
