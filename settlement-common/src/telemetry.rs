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

use fastrace::collector::{Config as FastraceConfig, ConsoleReporter};
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

/// Telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "tracing", default)]
    pub tracing_config: TracingConfig,

    #[serde(rename = "metrics", default)]
    pub metrics_config: MetricsConfig,
}

/// Tracing configuration; when enabled, finished spans are reported to stderr.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracingConfig {
    pub enabled: bool,
}

/// Metrics configuration for the Prometheus exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: IpAddr,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: [0, 0, 0, 0].into(),
            port: 9000,
        }
    }
}

/// Initialize logging; log levels are taken from `RUST_LOG`.
pub fn init_logging() {
    logforth::starter_log::stdout().apply();
}

/// Initialize span reporting for `#[trace]` annotated functions.
pub fn init_tracing(config: TracingConfig) {
    if config.enabled {
        fastrace::set_reporter(ConsoleReporter, FastraceConfig::default());
        info!("span reporting enabled");
    }
}

/// Initialize the Prometheus metrics exporter. Must be called from within a Tokio runtime.
pub fn init_metrics(config: MetricsConfig) {
    let MetricsConfig {
        enabled,
        address,
        port,
    } = config;

    if enabled {
        let result = PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(address, port))
            .install();

        match result {
            Ok(()) => info!(address:%, port; "metrics exporter listening"),
            Err(error) => warn!(error:%; "cannot install metrics exporter"),
        }
    }
}

/// Flush pending spans, e.g. before process exit.
pub fn shutdown() {
    fastrace::flush();
}
