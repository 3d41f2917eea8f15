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
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::policycore::api::types::{ComplianceCode, ResourceKey, WatchedKind};
use crate::policycore::controller::compliance;
use crate::policycore::logger::{log_debug, log_error, log_info};
use crate::policycore::observability::metrics::{ComplianceGauge, ReconcileCounter, ReconcileResult};
use crate::policycore::observability::tracing;

const COMPONENT: &str = "compliance-metrics";
const MISSING_LITERAL: &str = "<missing>";

/// Prefix of every per-kind controller name; the kind is appended.
pub const CONTROLLER_NAME: &str = "compliance_metrics";

/// Result of reading one resource from the upstream store.
pub enum FetchOutcome {
    /// The resource exists; carries the whole object as JSON.
    Found(Value),
    NotFound,
    Failed(Box<dyn Error + Send + Sync>),
}

impl fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOutcome::Found(_) => f.write_str("Found"),
            FetchOutcome::NotFound => f.write_str("NotFound"),
            FetchOutcome::Failed(err) => write!(f, "Failed({err})"),
        }
    }
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = FetchOutcome> + Send + 'a>>;

/// Read access to the current state of watched resources.
pub trait ResourceReader: Send + Sync {
    fn fetch<'a>(&'a self, kind: &'a WatchedKind, namespace: &'a str, name: &'a str)
        -> FetchFuture<'a>;
}

#[derive(Debug)]
pub enum ReconcileError {
    Fetch {
        key: ResourceKey,
        source: Box<dyn Error + Send + Sync>,
    },
    Metric {
        key: ResourceKey,
        source: prometheus::Error,
    },
}

impl ReconcileError {
    pub fn key(&self) -> &ResourceKey {
        match self {
            ReconcileError::Fetch { key, .. } | ReconcileError::Metric { key, .. } => key,
        }
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Fetch { key, source } => {
                write!(f, "failed to get policy {key}: {source}")
            }
            ReconcileError::Metric { key, source } => {
                write!(f, "failed to update compliance metric for {key}: {source}")
            }
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReconcileError::Fetch { source, .. } => Some(source.as_ref()),
            ReconcileError::Metric { source, .. } => Some(source),
        }
    }
}

/// What a successful reconcile did to the series of its key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Set(ComplianceCode),
    /// The resource is gone; `removed` tells whether a series existed.
    Deleted { removed: bool },
}

/// Dependencies shared by every per-kind reconciler: one reader, one gauge
/// family, one reconcile counter.
pub struct ReconcileContext {
    reader: Arc<dyn ResourceReader>,
    gauge: ComplianceGauge,
    reconciles: ReconcileCounter,
}

impl ReconcileContext {
    pub fn new(
        reader: Arc<dyn ResourceReader>,
        gauge: ComplianceGauge,
        reconciles: ReconcileCounter,
    ) -> Self {
        Self {
            reader,
            gauge,
            reconciles,
        }
    }

    pub fn gauge(&self) -> &ComplianceGauge {
        &self.gauge
    }

    pub fn reconciles(&self) -> &ReconcileCounter {
        &self.reconciles
    }
}

/// Reconciler for one watched kind. Every kind runs the same logic; only the
/// kind descriptor differs.
pub struct ComplianceReconciler {
    kind: WatchedKind,
    name: String,
    ctx: Arc<ReconcileContext>,
}

impl ComplianceReconciler {
    pub fn new(kind: WatchedKind, ctx: Arc<ReconcileContext>) -> Self {
        let name = format!("{}_{}", CONTROLLER_NAME, kind.kind);
        Self { kind, name, ctx }
    }

    pub fn kind(&self) -> &WatchedKind {
        &self.kind
    }

    /// Controller name, used as the `controller` label of the reconcile counter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Brings the series for `namespace/name` in line with the resource's
    /// current state.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        tracing::with_span(COMPONENT, format!("reconcile {}", self.name), async {
            let result = self.reconcile_inner(namespace, name).await;
            let label = match &result {
                Ok(ReconcileOutcome::Set(_)) => ReconcileResult::Set,
                Ok(ReconcileOutcome::Deleted { .. }) => ReconcileResult::Deleted,
                Err(_) => ReconcileResult::Error,
            };
            self.ctx.reconciles.record(&self.name, label);
            result
        })
        .await
    }

    async fn reconcile_inner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let key = ResourceKey::new(&self.kind, namespace, name);
        let kind = self.kind.kind.as_str();
        let fields = [
            ("request_namespace", namespace),
            ("request_name", name),
            ("request_kind", kind),
        ];
        log_debug(COMPONENT, "Reconciling metric for the policy", &fields);

        let object = match self.ctx.reader.fetch(&self.kind, namespace, name).await {
            FetchOutcome::Found(object) => object,
            FetchOutcome::NotFound => {
                let removed = self.ctx.gauge.delete_series(&key);
                let removed_label = if removed { "true" } else { "false" };
                log_info(
                    COMPONENT,
                    "Policy not found. It must have been deleted.",
                    &[
                        ("request_namespace", namespace),
                        ("request_name", name),
                        ("request_kind", kind),
                        ("status-gauge-deleted", removed_label),
                    ],
                );
                return Ok(ReconcileOutcome::Deleted { removed });
            }
            FetchOutcome::Failed(source) => {
                let message = source.to_string();
                log_error(
                    COMPONENT,
                    "Failed to get policy",
                    &[
                        ("request_namespace", namespace),
                        ("request_name", name),
                        ("request_kind", kind),
                        ("error", message.as_str()),
                    ],
                );
                return Err(ReconcileError::Fetch { key, source });
            }
        };

        let status = compliance::status_payload(&object);
        let literal = compliance::compliance_literal(status);
        if literal.is_none() {
            log_debug(
                COMPONENT,
                "Couldn't get compliance, using UnknownCompliancy",
                &fields,
            );
        }
        let code = compliance::map_status(status);
        log_debug(
            COMPONENT,
            "Setting metric based on compliance",
            &[
                ("request_namespace", namespace),
                ("request_name", name),
                ("request_kind", kind),
                ("compliance", literal.unwrap_or(MISSING_LITERAL)),
                ("compliance_code", code.as_label()),
            ],
        );

        if let Err(source) = self.ctx.gauge.set_series(&key, code) {
            let message = source.to_string();
            log_error(
                COMPONENT,
                "Failed to get status metric from GaugeVec",
                &[
                    ("request_namespace", namespace),
                    ("request_name", name),
                    ("request_kind", kind),
                    ("error", message.as_str()),
                ],
            );
            return Err(ReconcileError::Metric { key, source });
        }

        Ok(ReconcileOutcome::Set(code))
    }
}
