/*
 * Copyright (C) 2024 The Policycore Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::net::SocketAddr;

use clap::Parser;

use crate::policycore::api::types::WatchedKind;
use crate::policycore::logger::{LogFormat, LogLevel};

/// Exports the compliance state of policy resources as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "policycore-metrics")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct MetricsArgs {
    /// Policy kind to report on, as group/version/Kind (repeat per kind)
    #[arg(long = "kind", value_name = "GROUP/VERSION/KIND")]
    pub kinds: Vec<WatchedKind>,

    /// Address the metrics and health endpoints listen on
    #[arg(long, value_name = "ADDR")]
    pub metrics_bind_address: Option<SocketAddr>,

    /// Log line format: text or json
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Minimum log level: debug, info, warn, or error
    #[arg(long)]
    pub log_level: Option<LogLevel>,
}
