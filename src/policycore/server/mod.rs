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

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::policycore::logger::log_info;
use crate::policycore::observability::health::ReadinessSource;
use crate::policycore::observability::metrics::MetricsRegistry;
use crate::policycore::util::error::with_context;

pub mod handlers;

/// Shared by every handler; cheap to clone.
#[derive(Clone)]
pub struct ServerState {
    registry: MetricsRegistry,
    readiness: Vec<Arc<dyn ReadinessSource>>,
}

impl ServerState {
    pub fn new(registry: MetricsRegistry) -> Self {
        ServerState {
            registry,
            readiness: Vec::new(),
        }
    }

    pub fn with_readiness(mut self, source: Arc<dyn ReadinessSource>) -> Self {
        self.readiness.push(source);
        self
    }

    pub(crate) fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub(crate) fn readiness_sources(&self) -> Vec<&dyn ReadinessSource> {
        self.readiness.iter().map(|source| source.as_ref()).collect()
    }
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/healthz", get(handlers::combined_health))
        .route("/readyz", get(handlers::readiness))
        .route("/livez", get(handlers::liveness))
        .with_state(state)
}

/// Serves the metrics and health endpoints on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind metrics listener at {addr}")))?;
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| addr.to_string());
    log_info(
        "server",
        "Metrics server listening",
        &[("address", local.as_str())],
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| with_context(e, "Metrics server terminated"))?;

    log_info("server", "Metrics server stopped", &[]);
    Ok(())
}
