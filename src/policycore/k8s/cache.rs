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

use std::collections::HashMap;
use std::error::Error;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use kube::api::{ApiResource, DynamicObject};
use kube::runtime::reflector::{ObjectRef, Store};

use crate::policycore::api::types::WatchedKind;
use crate::policycore::controller::reconcile::{FetchFuture, FetchOutcome, ResourceReader};
use crate::policycore::observability::health::{ComponentHealth, ReadinessSource};
use crate::policycore::util::{new_error, with_context};

#[derive(Clone)]
struct CachedKind {
    resource: ApiResource,
    store: Store<DynamicObject>,
    synced: Arc<AtomicBool>,
}

/// Reflector stores for every watched kind, shared by all reconcilers.
///
/// A kind only answers reads once its initial list has completed; until then
/// reads fail so the reconcile is retried instead of mistaking a not yet
/// listed object for a deleted one.
#[derive(Default)]
pub struct ResourceCache {
    kinds: RwLock<HashMap<String, CachedKind>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the store backing `kind`. Returns the flag the watcher sets
    /// once the initial list is in the store.
    pub fn insert(
        &self,
        kind: &WatchedKind,
        resource: ApiResource,
        store: Store<DynamicObject>,
    ) -> Result<Arc<AtomicBool>, Box<dyn Error + Send + Sync>> {
        let mut kinds = self
            .kinds
            .write()
            .map_err(|_| new_error("resource cache lock poisoned"))?;
        if kinds.contains_key(&kind.kind) {
            return Err(new_error(format!("kind {} is already cached", kind.kind)));
        }
        let synced = Arc::new(AtomicBool::new(false));
        kinds.insert(
            kind.kind.clone(),
            CachedKind {
                resource,
                store,
                synced: Arc::clone(&synced),
            },
        );
        Ok(synced)
    }

    pub fn is_synced(&self, kind: &WatchedKind) -> bool {
        self.lookup(kind)
            .map(|cached| cached.synced.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn lookup(&self, kind: &WatchedKind) -> Option<CachedKind> {
        self.kinds.read().ok()?.get(&kind.kind).cloned()
    }

    fn read(&self, kind: &WatchedKind, namespace: &str, name: &str) -> FetchOutcome {
        let Some(cached) = self.lookup(kind) else {
            return FetchOutcome::Failed(new_error(format!("no cache registered for kind {kind}")));
        };
        if !cached.synced.load(Ordering::Acquire) {
            return FetchOutcome::Failed(new_error(format!(
                "cache for kind {kind} has not completed its initial list"
            )));
        }

        let mut reference = ObjectRef::<DynamicObject>::new_with(name, cached.resource.clone());
        if !namespace.is_empty() {
            reference = reference.within(namespace);
        }
        match cached.store.get(&reference) {
            Some(object) => match serde_json::to_value(object.as_ref()) {
                Ok(value) => FetchOutcome::Found(value),
                Err(err) => FetchOutcome::Failed(with_context(
                    err,
                    format!("Failed to encode cached {kind} {name}"),
                )),
            },
            None => FetchOutcome::NotFound,
        }
    }
}

impl ResourceReader for ResourceCache {
    fn fetch<'a>(
        &'a self,
        kind: &'a WatchedKind,
        namespace: &'a str,
        name: &'a str,
    ) -> FetchFuture<'a> {
        Box::pin(future::ready(self.read(kind, namespace, name)))
    }
}

impl ReadinessSource for ResourceCache {
    fn component_health(&self) -> Vec<ComponentHealth> {
        let Ok(kinds) = self.kinds.read() else {
            return vec![ComponentHealth::unhealthy(
                "resource_cache",
                "resource cache lock poisoned",
            )];
        };
        let mut components: Vec<ComponentHealth> = kinds
            .iter()
            .map(|(kind, cached)| {
                let name = format!("cache:{kind}");
                if cached.synced.load(Ordering::Acquire) {
                    ComponentHealth::healthy(name)
                } else {
                    ComponentHealth::unhealthy(name, "initial list has not completed")
                }
            })
            .collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));
        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::GroupVersionKind;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;
    use serde_json::json;

    fn kind() -> WatchedKind {
        WatchedKind::new("policy.example.io", "v1", "PolicyKindA")
    }

    fn resource(kind: &WatchedKind) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind))
    }

    fn listed_writer(resource: &ApiResource, objects: Vec<DynamicObject>) -> Writer<DynamicObject> {
        let mut writer = Writer::new(resource.clone());
        writer.apply_watcher_event(&Event::Init);
        for object in objects {
            writer.apply_watcher_event(&Event::InitApply(object));
        }
        writer.apply_watcher_event(&Event::InitDone);
        writer
    }

    #[tokio::test]
    async fn reads_fail_until_synced() {
        let kind = kind();
        let resource = resource(&kind);
        let object = DynamicObject::new("p1", &resource)
            .within("ns1")
            .data(json!({"status": {"compliant": "Compliant"}}));
        let writer = listed_writer(&resource, vec![object]);

        let cache = ResourceCache::new();
        let synced = cache
            .insert(&kind, resource.clone(), writer.as_reader())
            .expect("insert");
        assert!(matches!(
            cache.fetch(&kind, "ns1", "p1").await,
            FetchOutcome::Failed(_)
        ));
        assert!(!cache.component_health()[0].healthy);

        synced.store(true, Ordering::Release);
        match cache.fetch(&kind, "ns1", "p1").await {
            FetchOutcome::Found(value) => {
                assert_eq!(value["status"]["compliant"], "Compliant");
                assert_eq!(value["metadata"]["name"], "p1");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            cache.fetch(&kind, "ns1", "missing").await,
            FetchOutcome::NotFound
        ));
        assert!(cache.is_synced(&kind));
        assert!(cache.component_health()[0].healthy);
    }

    #[tokio::test]
    async fn cluster_scoped_objects_have_no_namespace() {
        let kind = kind();
        let resource = resource(&kind);
        let object = DynamicObject::new("global", &resource).data(json!({"status": {}}));
        let writer = listed_writer(&resource, vec![object]);

        let cache = ResourceCache::new();
        cache
            .insert(&kind, resource, writer.as_reader())
            .expect("insert")
            .store(true, Ordering::Release);
        assert!(matches!(
            cache.fetch(&kind, "", "global").await,
            FetchOutcome::Found(_)
        ));
    }

    #[tokio::test]
    async fn unknown_kind_and_duplicates_are_errors() {
        let kind = kind();
        let resource = resource(&kind);
        let cache = ResourceCache::new();
        assert!(matches!(
            cache.fetch(&kind, "ns1", "p1").await,
            FetchOutcome::Failed(_)
        ));

        let writer: Writer<DynamicObject> = Writer::new(resource.clone());
        cache
            .insert(&kind, resource.clone(), writer.as_reader())
            .expect("first insert");
        assert!(cache.insert(&kind, resource, writer.as_reader()).is_err());
    }
}
