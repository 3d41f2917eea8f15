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

use serde::Serialize;

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        ComponentHealth {
            name: name.into(),
            healthy: true,
            error: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            let mut cut = ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        ComponentHealth {
            name: name.into(),
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = if components.iter().all(|component| component.healthy) {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        };
        HealthReport { status, components }
    }

    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Anything that can report whether its part of the pipeline is serving,
/// such as the per-kind resource caches.
pub trait ReadinessSource: Send + Sync {
    fn component_health(&self) -> Vec<ComponentHealth>;
}

/// Readiness assessment used by `/readyz` and `/healthz`.
pub fn readiness_report(sources: &[&dyn ReadinessSource]) -> HealthReport {
    let components = sources
        .iter()
        .flat_map(|source| source.component_health())
        .collect();
    HealthReport::from_components(components)
}

/// Liveness only confirms the process answers requests.
pub fn liveness_report() -> HealthReport {
    HealthReport::from_components(vec![ComponentHealth::healthy("process")])
}
