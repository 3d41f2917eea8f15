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

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};

use crate::policycore::api::types::{ResourceKey, WatchedKind};
use crate::policycore::observability::metrics::ComplianceGauge;

pub struct EnvTestLock {
    inner: Mutex<()>,
}

impl EnvTestLock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EnvTestLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Global mutex for tests that mutate `POLICYCORE_*` environment variables.
pub fn env_lock() -> &'static EnvTestLock {
    static LOCK: OnceLock<EnvTestLock> = OnceLock::new();
    LOCK.get_or_init(EnvTestLock::new)
}

/// Builds a policy object of `kind`. `compliant` of `None` leaves the
/// `status.compliant` field out while keeping an (empty) status.
pub fn policy_object(
    kind: &WatchedKind,
    namespace: &str,
    name: &str,
    compliant: Option<&str>,
) -> Value {
    let mut metadata = json!({ "name": name });
    if !namespace.is_empty() {
        metadata["namespace"] = Value::String(namespace.to_string());
    }
    let status = match compliant {
        Some(state) => json!({ "compliant": state }),
        None => json!({}),
    };
    json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind,
        "metadata": metadata,
        "spec": { "remediationAction": "inform" },
        "status": status,
    })
}

const SERIES_WAIT: Duration = Duration::from_secs(5);

/// Polls until the series for `key` reads `expected` (`None` meaning absent).
/// Panics after five seconds.
pub async fn wait_for_series(gauge: &ComplianceGauge, key: &ResourceKey, expected: Option<i64>) {
    let observed = tokio::time::timeout(SERIES_WAIT, async {
        loop {
            if gauge.series_value(key) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if observed.is_err() {
        panic!(
            "series {key} never reached {expected:?}; last value {:?}",
            gauge.series_value(key)
        );
    }
}
