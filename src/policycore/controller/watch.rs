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
use std::time::Duration;

use futures_util::stream::BoxStream;

use crate::policycore::api::types::WatchedKind;

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// A change was observed for one resource of a watched kind. Notifications
/// carry no state; the reconciler always re-reads the resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Notification {
    pub namespace: String,
    pub name: String,
}

impl Notification {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

pub type NotificationStream = BoxStream<'static, Notification>;

/// Source of change notifications, one stream per watched kind.
///
/// `subscribe` must register interest immediately: changes made after it
/// returns are delivered even if the stream is polled later.
pub trait NotificationSource: Send + Sync {
    fn subscribe(
        &self,
        kind: &WatchedKind,
    ) -> Result<NotificationStream, Box<dyn Error + Send + Sync>>;
}

/// Exponential backoff for requeueing failed reconciles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(BACKOFF_INITIAL_MS),
            max: Duration::from_millis(BACKOFF_MAX_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay to use after `current`, capped at `max`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.saturating_mul(2);
        if next > self.max {
            self.max
        } else {
            next
        }
    }
}
