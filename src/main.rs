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

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;

use policycore::policycore::cli::{MetricsArgs, Settings};
use policycore::policycore::controller::multiplexer::{setup, SetupError};
use policycore::policycore::k8s::cache::ResourceCache;
use policycore::policycore::k8s::source::KubeSource;
use policycore::policycore::logger::{log_error, log_info, set_log_format, set_log_level};
use policycore::policycore::observability::metrics::MetricsRegistry;
use policycore::policycore::observability::tracing;
use policycore::policycore::server::{serve, ServerState};
use policycore::policycore::util::{with_context, BoxError};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::resolve(MetricsArgs::parse()) {
        Ok(settings) => settings,
        Err(err) => {
            let message = err.to_string();
            log_error("main", "Invalid configuration", &[("error", message.as_str())]);
            return ExitCode::FAILURE;
        }
    };
    set_log_format(settings.log_format);
    set_log_level(settings.log_level);
    tracing::init();

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = err.to_string();
            log_error(
                "main",
                "Compliance metrics exporter failed",
                &[("error", message.as_str())],
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), BoxError> {
    // Reject an empty kind list before touching the cluster.
    if settings.kinds.is_empty() {
        return Err(Box::new(SetupError::NoWatchedKinds));
    }

    let client = Client::try_default()
        .await
        .map_err(|e| with_context(e, "Failed to create Kubernetes client"))?;
    let cache = Arc::new(ResourceCache::new());
    let source = KubeSource::discover(client, Arc::clone(&cache), &settings.kinds).await?;

    let registry = MetricsRegistry::new();
    let metrics = setup(&settings.kinds, &registry, cache.clone(), &source)?;
    let kinds = metrics
        .kinds()
        .iter()
        .map(|kind| kind.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let handle = metrics.start(settings.retry);
    log_info(
        "main",
        "Compliance metrics exporter started",
        &[("kinds", kinds.as_str())],
    );

    let shutdown = CancellationToken::new();
    let state = ServerState::new(registry).with_readiness(cache);
    let mut server = tokio::spawn(serve(
        settings.metrics_bind_address,
        state,
        shutdown.clone(),
    ));

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| with_context(e, "Failed to listen for shutdown signal"))?;
            log_info("main", "Shutdown signal received", &[]);
            shutdown.cancel();
            (&mut server).await
        }
        result = &mut server => result,
    };

    handle.shutdown().await;
    server_result.map_err(|e| with_context(e, "Metrics server task failed"))??;
    log_info("main", "Compliance metrics exporter stopped", &[]);
    Ok(())
}
