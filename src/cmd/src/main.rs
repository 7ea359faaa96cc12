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

use clap::Parser;
use syncwave_cmd::{run_node, NodeExit, SyncwaveOpts};
use tracing_subscriber::EnvFilter;

fn main() {
    let opts = SyncwaveOpts::parse();

    let filter = EnvFilter::try_new(&opts.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match opts.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(3);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build tokio runtime");

    let exit = runtime.block_on(run_node(config));
    match &exit {
        NodeExit::Clean => tracing::info!("syncwave exiting cleanly"),
        NodeExit::DatabaseInit(e) => {
            tracing::error!(error = %e, "replica database cannot be opened")
        }
        NodeExit::Config(e) => tracing::error!(error = %e, "configuration error"),
        NodeExit::UpstreamLost(e) => {
            tracing::error!(error = %e, "upstream is unrecoverable")
        }
    }
    std::process::exit(exit.code());
}
