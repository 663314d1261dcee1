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

pub mod v1;

use crate::domain::Api;
use axum::{
    Router,
    extract::{FromRef, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use log::{info, warn};
use serde::Deserialize;
use settlement_common::infra::pool::postgres::PostgresPool;
use settlement_engine::domain::{ChainClient, Engine, storage::Storage};
use std::{io, net::IpAddr};
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

#[derive(Clone)]
pub struct Db(pub PostgresPool);

#[derive(Clone)]
pub struct AppState<S, C> {
    pub engine: Engine<S, C>,
    pub db: Option<Db>,
}

impl<S, C> FromRef<AppState<S, C>> for Option<Db> {
    fn from_ref(s: &AppState<S, C>) -> Option<Db> {
        s.db.clone()
    }
}

pub struct AxumApi<S, C> {
    config: Config,
    engine: Engine<S, C>,
    db: Option<Db>,
}

impl<S, C> AxumApi<S, C> {
    pub fn new(config: Config, engine: Engine<S, C>) -> Self {
        Self {
            config,
            engine,
            db: None,
        }
    }

    /// Let the readiness check ping the given database.
    pub fn with_db(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }
}

impl<S, C> Api for AxumApi<S, C>
where
    S: Storage,
    C: ChainClient,
{
    type Error = AxumApiError;

    async fn serve(self) -> Result<(), Self::Error> {
        let Config {
            address,
            port,
            request_body_limit,
        } = self.config;

        let app = make_app(self.engine, self.db, request_body_limit as usize);

        let listener = tokio::net::TcpListener::bind((address, port))
            .await
            .map_err(AxumApiError::Bind)?;
        info!(address:?, port; "listening to TCP connections");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(AxumApiError::Serve)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,

    #[serde(with = "byte_unit_serde")]
    pub request_body_limit: u64,
}

#[derive(Debug, Error)]
pub enum AxumApiError {
    #[error("cannot bind tcp listener")]
    Bind(#[source] io::Error),

    #[error("cannot serve API")]
    Serve(#[source] io::Error),
}

fn make_app<S, C>(engine: Engine<S, C>, db: Option<Db>, request_body_limit: usize) -> Router
where
    S: Storage,
    C: ChainClient,
{
    let app_state = AppState { engine, db };

    Router::new()
        .route("/ready", get(ready))
        .nest("/api/v1", v1::make_app())
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(request_body_limit))
                .layer(CorsLayer::permissive()),
        )
}

async fn ready(State(db): State<Option<Db>>) -> impl IntoResponse {
    if let Some(Db(pool)) = db {
        if let Err(error) = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&*pool)
            .await
        {
            warn!(error:%; "database not ready");
            return (StatusCode::SERVICE_UNAVAILABLE, "database not ready").into_response();
        }
    }

    StatusCode::OK.into_response()
}

async fn shutdown_signal() {
    signal(SignalKind::terminate())
        .expect("SIGTERM handler can be registered")
        .recv()
        .await;
}
