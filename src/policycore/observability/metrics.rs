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

use prometheus::core::Collector;
use prometheus::proto::Metric;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::policycore::api::types::{ComplianceCode, ResourceKey};

pub const COMPLIANCE_METRIC_NAME: &str = "ocm_policy_compliance";
const COMPLIANCE_METRIC_HELP: &str = "The compliance status of the named policy. \
     0 == Compliant. 1 == NonCompliant. 2 == UnknownCompliancy.";
const COMPLIANCE_LABELS: [&str; 3] = ["policy_kind", "policy_name", "policy_namespace"];
const RECONCILE_LABELS: [&str; 2] = ["controller", "result"];

fn has_labels(metric: &Metric, names: &[&str], values: &[&str]) -> bool {
    let labels = metric.get_label();
    names.iter().zip(values.iter()).all(|(name, value)| {
        labels
            .iter()
            .any(|pair| pair.get_name() == *name && pair.get_value() == *value)
    })
}

/// Prometheus registry handed to every component that exports metrics.
///
/// Cloning is cheap and every clone refers to the same set of collectors, so
/// the registry can be shared between the reconcilers and the HTTP server.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    registry: Registry,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    /// Registers a collector, failing with `AlreadyReg` when a collector
    /// describing the same family is already present.
    pub fn register<C>(&self, collector: C) -> Result<C, prometheus::Error>
    where
        C: Clone + Collector + Send + Sync + 'static,
    {
        self.registry.register(Box::new(collector.clone()))?;
        Ok(collector)
    }

    pub fn unregister<C>(&self, collector: &C) -> bool
    where
        C: Clone + Collector + Send + Sync + 'static,
    {
        self.registry.unregister(Box::new(collector.clone())).is_ok()
    }

    /// Encodes all registered metrics using the Prometheus text exposition
    /// format.
    pub fn gather(&self) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
        Ok(buffer)
    }
}

/// The `ocm_policy_compliance` gauge family. Owns every compliance series;
/// reconcilers only issue set and delete commands against it.
#[derive(Clone)]
pub struct ComplianceGauge {
    gauge: IntGaugeVec,
}

impl ComplianceGauge {
    /// Builds the gauge family without registering it anywhere.
    pub fn new() -> Result<Self, prometheus::Error> {
        let opts = Opts::new(COMPLIANCE_METRIC_NAME, COMPLIANCE_METRIC_HELP);
        let gauge = IntGaugeVec::new(opts, &COMPLIANCE_LABELS)?;
        Ok(Self { gauge })
    }

    pub fn register(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        let gauge = Self::new()?;
        registry.register(gauge.gauge.clone())?;
        Ok(gauge)
    }

    pub(crate) fn unregister(&self, registry: &MetricsRegistry) -> bool {
        registry.unregister(&self.gauge)
    }

    /// Creates or overwrites the series for `key`.
    pub fn set_series(&self, key: &ResourceKey, code: ComplianceCode) -> Result<(), prometheus::Error> {
        self.gauge
            .get_metric_with_label_values(&key.label_values())?
            .set(code.metric_value());
        Ok(())
    }

    /// Removes the series for `key`, reporting whether one existed.
    pub fn delete_series(&self, key: &ResourceKey) -> bool {
        self.gauge.remove_label_values(&key.label_values()).is_ok()
    }

    /// Current value of the series for `key`, without creating it.
    pub fn series_value(&self, key: &ResourceKey) -> Option<i64> {
        let wanted = key.label_values();
        self.gauge
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| has_labels(metric, &COMPLIANCE_LABELS, &wanted))
            .map(|metric| metric.get_gauge().get_value() as i64)
    }

    pub fn series_count(&self) -> usize {
        self.gauge
            .collect()
            .iter()
            .map(|family| family.get_metric().len())
            .sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReconcileResult {
    Set,
    Deleted,
    Error,
}

impl ReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ReconcileResult::Set => "set",
            ReconcileResult::Deleted => "deleted",
            ReconcileResult::Error => "error",
        }
    }
}

/// Reconcile attempts per controller, grouped by outcome.
#[derive(Clone)]
pub struct ReconcileCounter {
    counter: IntCounterVec,
}

impl ReconcileCounter {
    pub fn new() -> Result<Self, prometheus::Error> {
        let opts = Opts::new(
            "compliance_metrics_reconciles_total",
            "Compliance metric reconciliations grouped by controller and result",
        );
        let counter = IntCounterVec::new(opts, &RECONCILE_LABELS)?;
        Ok(Self { counter })
    }

    pub fn register(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        let counter = Self::new()?;
        registry.register(counter.counter.clone())?;
        Ok(counter)
    }

    pub(crate) fn unregister(&self, registry: &MetricsRegistry) -> bool {
        registry.unregister(&self.counter)
    }

    pub fn record(&self, controller: &str, result: ReconcileResult) {
        self.counter
            .with_label_values(&[controller, result.as_label()])
            .inc();
    }

    /// Attempts recorded so far; reading never creates a series.
    pub fn count(&self, controller: &str, result: ReconcileResult) -> u64 {
        let wanted = [controller, result.as_label()];
        self.counter
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| has_labels(metric, &RECONCILE_LABELS, &wanted))
            .map(|metric| metric.get_counter().get_value() as u64)
            .unwrap_or(0)
    }
}
