// This file is part of settlement-engine.
// Copyright (C) 2025 Midnight Foundation
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::error;
use settlement_common::telemetry;
use std::panic;

#[tokio::main]
async fn main() {
    telemetry::init_logging();
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    if let Err(error) = run().await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        telemetry::shutdown();
        std::process::exit(1);
    }

    telemetry::shutdown();
}

async fn run() -> anyhow::Result<()> {
    use anyhow::Context;
    use log::info;
    use settlement_api::{
        application,
        config::Config,
        infra::{
            self,
            api::{AxumApi, Db},
        },
    };
    use settlement_common::{
        config::ConfigExt,
        infra::{migrations, pool},
    };
    use settlement_engine::{
        domain::Engine,
        infra::{chain_gateway::ChainGateway, storage::Storage},
    };
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler can be registered");
    let config = Config::load().context("load configuration")?;
    info!(config:?; "starting");
    let Config {
        run_migrations,
        engine_config,
        infra_config,
        telemetry_config:
            telemetry::Config {
                tracing_config,
                metrics_config,
            },
    } = config;

    telemetry::init_tracing(tracing_config);
    telemetry::init_metrics(metrics_config);

    let infra::Config {
        api_config,
        storage_config,
        chain_config,
    } = infra_config;

    let pool = pool::postgres::PostgresPool::new(storage_config)
        .await
        .context("create DB pool for Postgres")?;
    if run_migrations {
        migrations::postgres::run(&pool)
            .await
            .context("run Postgres migrations")?;
    }

    let chain = ChainGateway::new(chain_config).context("create chain gateway")?;
    let engine = Engine::new(engine_config, Storage::new(pool.clone()), chain);

    let api = AxumApi::new(api_config, engine).with_db(Db(pool));
    application::run(api, sigterm).await.context("run settlement API")
}
