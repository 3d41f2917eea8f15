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

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{stream, StreamExt};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};

use crate::policycore::api::types::WatchedKind;
use crate::policycore::controller::watch::{Notification, NotificationSource, NotificationStream};
use crate::policycore::k8s::cache::ResourceCache;
use crate::policycore::logger::{log_info, log_warn};
use crate::policycore::util::with_context;

const COMPONENT: &str = "kube-source";

/// Turns raw watcher events into reconcile notifications.
///
/// Objects listed during a (re)list are held back until the list completes,
/// because the reflector store only swaps in the new list at that point.
/// Objects known before a relist that are absent from it are reported too,
/// so their series are cleaned up even though no delete event was seen.
pub struct RelistTracker {
    known: HashSet<Notification>,
    relisting: Option<HashSet<Notification>>,
    synced: Arc<AtomicBool>,
}

impl RelistTracker {
    pub fn new(synced: Arc<AtomicBool>) -> Self {
        Self {
            known: HashSet::new(),
            relisting: None,
            synced,
        }
    }

    pub fn observe(&mut self, event: Event<DynamicObject>) -> Vec<Notification> {
        match event {
            Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(object) => {
                let notification = notification_for(&object);
                self.relisting
                    .get_or_insert_with(HashSet::new)
                    .insert(notification);
                Vec::new()
            }
            Event::InitDone => {
                let listed = self.relisting.take().unwrap_or_default();
                let mut notifications: Vec<Notification> =
                    self.known.difference(&listed).cloned().collect();
                notifications.extend(listed.iter().cloned());
                self.known = listed;
                self.synced.store(true, Ordering::Release);
                notifications
            }
            Event::Apply(object) => {
                let notification = notification_for(&object);
                self.known.insert(notification.clone());
                vec![notification]
            }
            Event::Delete(object) => {
                let notification = notification_for(&object);
                self.known.remove(&notification);
                vec![notification]
            }
        }
    }
}

fn notification_for(object: &DynamicObject) -> Notification {
    Notification::new(object.namespace().unwrap_or_default(), object.name_any())
}

/// Watches policy kinds through the Kubernetes API and feeds the shared
/// [`ResourceCache`].
pub struct KubeSource {
    client: Client,
    cache: Arc<ResourceCache>,
    resources: HashMap<String, ApiResource>,
}

impl KubeSource {
    pub fn new(client: Client, cache: Arc<ResourceCache>) -> Self {
        Self {
            client,
            cache,
            resources: HashMap::new(),
        }
    }

    /// Resolves every kind against the API server so plurals come from
    /// discovery and unknown kinds are rejected before anything is watched.
    pub async fn discover(
        client: Client,
        cache: Arc<ResourceCache>,
        kinds: &[WatchedKind],
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut source = Self::new(client, cache);
        for kind in kinds {
            let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
            let (resource, _capabilities) = discovery::pinned_kind(&source.client, &gvk)
                .await
                .map_err(|err| with_context(err, format!("Failed to discover kind {kind}")))?;
            let label = kind.to_string();
            log_info(
                COMPONENT,
                "Discovered policy kind",
                &[("kind", label.as_str()), ("plural", resource.plural.as_str())],
            );
            source.resources.insert(kind.kind.clone(), resource);
        }
        Ok(source)
    }

    fn resource_for(&self, kind: &WatchedKind) -> ApiResource {
        self.resources.get(&kind.kind).cloned().unwrap_or_else(|| {
            ApiResource::from_gvk(&GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind))
        })
    }
}

impl NotificationSource for KubeSource {
    fn subscribe(
        &self,
        kind: &WatchedKind,
    ) -> Result<NotificationStream, Box<dyn Error + Send + Sync>> {
        let resource = self.resource_for(kind);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let writer = Writer::new(resource.clone());
        let synced = self
            .cache
            .insert(kind, resource, writer.as_reader())
            .map_err(|err| with_context(err, format!("Failed to watch kind {kind}")))?;

        let mut tracker = RelistTracker::new(synced);
        let label = kind.to_string();
        let notifications = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .filter_map(move |event| {
                let batch = match event {
                    Ok(event) => Some(stream::iter(tracker.observe(event))),
                    Err(err) => {
                        let message = err.to_string();
                        log_warn(
                            COMPONENT,
                            "Watch stream error; retrying with backoff",
                            &[("kind", label.as_str()), ("error", message.as_str())],
                        );
                        None
                    }
                };
                future::ready(batch)
            })
            .flatten();
        Ok(notifications.boxed())
    }
}
