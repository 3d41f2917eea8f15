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

//! In-process stand-in for the cluster: stores policy objects, answers
//! reads, and broadcasts change notifications per kind.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::future;
use std::sync::Mutex;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::policycore::api::types::{ResourceKey, WatchedKind};
use crate::policycore::controller::reconcile::{FetchFuture, FetchOutcome, ResourceReader};
use crate::policycore::controller::watch::{Notification, NotificationSource, NotificationStream};
use crate::policycore::logger::log_warn;
use crate::policycore::observability::health::{ComponentHealth, ReadinessSource};
use crate::policycore::util::new_error;

const EVENT_BUFFER: usize = 1024;

#[derive(Default)]
struct State {
    objects: HashMap<ResourceKey, Value>,
    failing_fetches: HashMap<ResourceKey, usize>,
    failing_subscriptions: HashSet<String>,
    subscribed: HashSet<String>,
}

pub struct InMemoryCluster {
    state: Mutex<State>,
    events: broadcast::Sender<(String, Notification)>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, kind: &WatchedKind, namespace: &str, name: &str) {
        // No receivers simply means nothing is watching yet.
        let _ = self
            .events
            .send((kind.kind.clone(), Notification::new(namespace, name)));
    }

    /// Creates or replaces an object and notifies watchers of its kind.
    pub fn apply(&self, kind: &WatchedKind, namespace: &str, name: &str, object: Value) {
        self.state()
            .objects
            .insert(ResourceKey::new(kind, namespace, name), object);
        self.notify(kind, namespace, name);
    }

    /// Removes an object, returning whether it existed. Watchers are notified
    /// either way, mirroring a delete event that raced with a prior delete.
    pub fn delete(&self, kind: &WatchedKind, namespace: &str, name: &str) -> bool {
        let existed = self
            .state()
            .objects
            .remove(&ResourceKey::new(kind, namespace, name))
            .is_some();
        self.notify(kind, namespace, name);
        existed
    }

    pub fn get(&self, kind: &WatchedKind, namespace: &str, name: &str) -> Option<Value> {
        self.state()
            .objects
            .get(&ResourceKey::new(kind, namespace, name))
            .cloned()
    }

    /// The next `count` reads of the object fail with a transient error.
    pub fn fail_fetches(&self, kind: &WatchedKind, namespace: &str, name: &str, count: usize) {
        self.state()
            .failing_fetches
            .insert(ResourceKey::new(kind, namespace, name), count);
    }

    /// Subscribing to `kind` fails from now on.
    pub fn fail_subscriptions(&self, kind: &WatchedKind) {
        self.state()
            .failing_subscriptions
            .insert(kind.kind.clone());
    }

    pub fn is_subscribed(&self, kind: &WatchedKind) -> bool {
        self.state().subscribed.contains(&kind.kind)
    }
}

impl ResourceReader for InMemoryCluster {
    fn fetch<'a>(
        &'a self,
        kind: &'a WatchedKind,
        namespace: &'a str,
        name: &'a str,
    ) -> FetchFuture<'a> {
        let key = ResourceKey::new(kind, namespace, name);
        let outcome = {
            let mut guard = self.state();
            let state = &mut *guard;
            match state.failing_fetches.get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    FetchOutcome::Failed(new_error(format!(
                        "resource store unavailable while reading {key}"
                    )))
                }
                _ => match state.objects.get(&key) {
                    Some(object) => FetchOutcome::Found(object.clone()),
                    None => FetchOutcome::NotFound,
                },
            }
        };
        Box::pin(future::ready(outcome))
    }
}

impl NotificationSource for InMemoryCluster {
    fn subscribe(
        &self,
        kind: &WatchedKind,
    ) -> Result<NotificationStream, Box<dyn Error + Send + Sync>> {
        {
            let mut state = self.state();
            if state.failing_subscriptions.contains(&kind.kind) {
                return Err(new_error(format!("cannot watch {kind}")));
            }
            state.subscribed.insert(kind.kind.clone());
        }

        let wanted = kind.kind.clone();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            let notification = match event {
                Ok((event_kind, notification)) if event_kind == wanted => Some(notification),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    let skipped = skipped.to_string();
                    log_warn(
                        "in-memory-cluster",
                        "Notification stream lagged",
                        &[("kind", wanted.as_str()), ("skipped", skipped.as_str())],
                    );
                    None
                }
            };
            future::ready(notification)
        });
        Ok(stream.boxed())
    }
}

impl ReadinessSource for InMemoryCluster {
    fn component_health(&self) -> Vec<ComponentHealth> {
        let mut kinds: Vec<String> = self.state().subscribed.iter().cloned().collect();
        kinds.sort();
        kinds
            .into_iter()
            .map(|kind| ComponentHealth::healthy(format!("cache:{kind}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn kind(name: &str) -> WatchedKind {
        WatchedKind::new("policy.example.io", "v1", name)
    }

    #[tokio::test]
    async fn reads_reflect_applies_and_deletes() {
        let cluster = InMemoryCluster::new();
        let a = kind("PolicyKindA");
        assert!(matches!(
            cluster.fetch(&a, "ns1", "p1").await,
            FetchOutcome::NotFound
        ));

        cluster.apply(&a, "ns1", "p1", json!({"status": {"compliant": "Compliant"}}));
        match cluster.fetch(&a, "ns1", "p1").await {
            FetchOutcome::Found(object) => assert_eq!(object["status"]["compliant"], "Compliant"),
            other => panic!("unexpected outcome {other:?}"),
        }

        assert!(cluster.delete(&a, "ns1", "p1"));
        assert!(!cluster.delete(&a, "ns1", "p1"));
        assert!(cluster.get(&a, "ns1", "p1").is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let cluster = InMemoryCluster::new();
        let a = kind("PolicyKindA");
        cluster.apply(&a, "ns1", "p1", json!({}));
        cluster.fail_fetches(&a, "ns1", "p1", 2);

        assert!(matches!(cluster.fetch(&a, "ns1", "p1").await, FetchOutcome::Failed(_)));
        assert!(matches!(cluster.fetch(&a, "ns1", "p1").await, FetchOutcome::Failed(_)));
        assert!(matches!(cluster.fetch(&a, "ns1", "p1").await, FetchOutcome::Found(_)));
    }

    #[tokio::test]
    async fn subscriptions_only_see_their_kind() {
        let cluster = InMemoryCluster::new();
        let a = kind("PolicyKindA");
        let b = kind("PolicyKindB");
        let mut stream_a = cluster.subscribe(&a).expect("subscribe a");

        cluster.apply(&b, "ns1", "other", json!({}));
        cluster.apply(&a, "ns1", "p1", json!({}));

        let received = timeout(Duration::from_secs(1), stream_a.next())
            .await
            .expect("notification timeout")
            .expect("stream open");
        assert_eq!(received, Notification::new("ns1", "p1"));
        assert!(cluster.is_subscribed(&a));
        assert!(!cluster.is_subscribed(&b));
    }

    #[test]
    fn failing_subscription_is_reported() {
        let cluster = InMemoryCluster::new();
        let a = kind("PolicyKindA");
        cluster.fail_subscriptions(&a);
        assert!(cluster.subscribe(&a).is_err());
        assert!(!cluster.is_subscribed(&a));
    }
}
