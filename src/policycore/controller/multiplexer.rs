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

//! Wiring of one reconcile pipeline per watched kind.
//!
//! Every pipeline shares the same reader, gauge family, and reconcile
//! counter. Setup is all or nothing: either every kind is subscribed and the
//! metric families are registered, or nothing is left behind.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::policycore::api::types::WatchedKind;
use crate::policycore::controller::reconcile::{
    ComplianceReconciler, ReconcileContext, ResourceReader,
};
use crate::policycore::controller::watch::{
    Notification, NotificationSource, NotificationStream, RetryPolicy,
};
use crate::policycore::logger::{log_debug, log_info, log_warn};
use crate::policycore::observability::metrics::{
    ComplianceGauge, MetricsRegistry, ReconcileCounter,
};

const COMPONENT: &str = "compliance-metrics";

#[derive(Debug)]
pub enum SetupError {
    NoWatchedKinds,
    /// Two watched kinds share a Kind name and would write the same series.
    DuplicateKind(String),
    Registration(prometheus::Error),
    Subscribe {
        kind: WatchedKind,
        source: Box<dyn Error + Send + Sync>,
    },
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::NoWatchedKinds => write!(
                f,
                "must provide at least one policy type to report metrics on"
            ),
            SetupError::DuplicateKind(kind) => {
                write!(f, "policy kind {kind} is configured more than once")
            }
            SetupError::Registration(err) => {
                write!(f, "failed to register compliance metrics: {err}")
            }
            SetupError::Subscribe { kind, source } => {
                write!(f, "failed to watch policy kind {kind}: {source}")
            }
        }
    }
}

impl Error for SetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SetupError::Registration(err) => Some(err),
            SetupError::Subscribe { source, .. } => Some(source.as_ref()),
            SetupError::NoWatchedKinds | SetupError::DuplicateKind(_) => None,
        }
    }
}

struct Pipeline {
    reconciler: Arc<ComplianceReconciler>,
    notifications: NotificationStream,
}

/// Configured but not yet running pipelines.
pub struct ComplianceMetrics {
    context: Arc<ReconcileContext>,
    pipelines: Vec<Pipeline>,
}

/// Validates `kinds`, registers the metric families on `registry`, and
/// subscribes one notification stream per kind.
pub fn setup(
    kinds: &[WatchedKind],
    registry: &MetricsRegistry,
    reader: Arc<dyn ResourceReader>,
    source: &dyn NotificationSource,
) -> Result<ComplianceMetrics, SetupError> {
    if kinds.is_empty() {
        return Err(SetupError::NoWatchedKinds);
    }
    let mut seen = HashSet::new();
    for kind in kinds {
        if !seen.insert(kind.kind.as_str()) {
            return Err(SetupError::DuplicateKind(kind.kind.clone()));
        }
    }

    let gauge = ComplianceGauge::register(registry).map_err(SetupError::Registration)?;
    let reconciles = match ReconcileCounter::register(registry) {
        Ok(counter) => counter,
        Err(err) => {
            gauge.unregister(registry);
            return Err(SetupError::Registration(err));
        }
    };
    let context = Arc::new(ReconcileContext::new(reader, gauge, reconciles));

    let mut pipelines = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match source.subscribe(kind) {
            Ok(notifications) => pipelines.push(Pipeline {
                reconciler: Arc::new(ComplianceReconciler::new(
                    kind.clone(),
                    Arc::clone(&context),
                )),
                notifications,
            }),
            Err(source) => {
                context.gauge().unregister(registry);
                context.reconciles().unregister(registry);
                return Err(SetupError::Subscribe {
                    kind: kind.clone(),
                    source,
                });
            }
        }
    }

    Ok(ComplianceMetrics { context, pipelines })
}

impl ComplianceMetrics {
    pub fn kinds(&self) -> Vec<&WatchedKind> {
        self.pipelines
            .iter()
            .map(|pipeline| pipeline.reconciler.kind())
            .collect()
    }

    pub fn gauge(&self) -> &ComplianceGauge {
        self.context.gauge()
    }

    /// Spawns one task per kind that hands each notified key to a worker,
    /// one worker per key at a time. Must be called inside a Tokio runtime.
    pub fn start(self, retry: RetryPolicy) -> ComplianceMetricsHandle {
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        for pipeline in self.pipelines {
            let kind = pipeline.reconciler.kind().to_string();
            log_info(
                COMPONENT,
                "Starting compliance metrics controller",
                &[("controller", pipeline.reconciler.name()), ("kind", &kind)],
            );
            tasks.spawn(run_pipeline(
                pipeline,
                shutdown.clone(),
                tasks.clone(),
                retry,
            ));
        }

        ComplianceMetricsHandle {
            shutdown,
            tasks,
            context: self.context,
        }
    }
}

/// Running pipelines. Dropping the handle leaves them running; call
/// [`ComplianceMetricsHandle::shutdown`] to stop them.
pub struct ComplianceMetricsHandle {
    shutdown: CancellationToken,
    tasks: TaskTracker,
    context: Arc<ReconcileContext>,
}

impl ComplianceMetricsHandle {
    pub fn gauge(&self) -> &ComplianceGauge {
        self.context.gauge()
    }

    pub fn reconciles(&self) -> &ReconcileCounter {
        self.context.reconciles()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops watching, abandons pending retries, and waits for in-flight
    /// reconciles to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Keys of one kind that have a worker. A notification for a key that is
/// already being worked on only marks it dirty, so at most one reconcile per
/// key runs at a time and any burst collapses into a single follow-up.
#[derive(Clone, Default)]
struct KeyQueue {
    keys: Arc<Mutex<HashMap<Notification, KeyState>>>,
}

struct KeyState {
    dirty: bool,
    wake: Arc<Notify>,
}

impl KeyQueue {
    fn keys(&self) -> MutexGuard<'_, HashMap<Notification, KeyState>> {
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns true when the caller has to start a worker for the key.
    fn enqueue(&self, notification: &Notification) -> bool {
        let mut keys = self.keys();
        match keys.get_mut(notification) {
            Some(state) => {
                state.dirty = true;
                state.wake.notify_waiters();
                false
            }
            None => {
                keys.insert(
                    notification.clone(),
                    KeyState {
                        dirty: false,
                        wake: Arc::new(Notify::new()),
                    },
                );
                true
            }
        }
    }

    /// Consumes the dirty flag ahead of an attempt.
    fn begin(&self, notification: &Notification) {
        if let Some(state) = self.keys().get_mut(notification) {
            state.dirty = false;
        }
    }

    fn is_dirty(&self, notification: &Notification) -> bool {
        self.keys()
            .get(notification)
            .is_some_and(|state| state.dirty)
    }

    /// After a successful attempt: true when a notification arrived during
    /// it, otherwise the key is released.
    fn finish(&self, notification: &Notification) -> bool {
        let mut keys = self.keys();
        if keys.get(notification).is_some_and(|state| state.dirty) {
            return true;
        }
        keys.remove(notification);
        false
    }

    fn wake_handle(&self, notification: &Notification) -> Option<Arc<Notify>> {
        self.keys()
            .get(notification)
            .map(|state| Arc::clone(&state.wake))
    }

    fn release(&self, notification: &Notification) {
        self.keys().remove(notification);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys().len()
    }
}

async fn run_pipeline(
    pipeline: Pipeline,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    retry: RetryPolicy,
) {
    let Pipeline {
        reconciler,
        mut notifications,
    } = pipeline;
    let queue = KeyQueue::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = notifications.next() => match next {
                Some(notification) => {
                    if queue.enqueue(&notification) {
                        tasks.spawn(drive_key(
                            Arc::clone(&reconciler),
                            notification,
                            queue.clone(),
                            shutdown.clone(),
                            retry,
                        ));
                    }
                }
                None => {
                    log_warn(
                        COMPONENT,
                        "Notification stream closed",
                        &[("controller", reconciler.name())],
                    );
                    break;
                }
            }
        }
    }
}

/// Worker for one key. Reconciles until an attempt succeeds with no newer
/// notification pending, backing off exponentially between failures. A
/// notification arriving during the backoff replaces the pending retry.
async fn drive_key(
    reconciler: Arc<ComplianceReconciler>,
    notification: Notification,
    queue: KeyQueue,
    shutdown: CancellationToken,
    retry: RetryPolicy,
) {
    let mut delay = retry.initial;
    loop {
        if shutdown.is_cancelled() {
            queue.release(&notification);
            return;
        }
        queue.begin(&notification);

        let err = match reconciler
            .reconcile(&notification.namespace, &notification.name)
            .await
        {
            Ok(_) => {
                if !queue.finish(&notification) {
                    return;
                }
                delay = retry.initial;
                continue;
            }
            Err(err) => err,
        };

        let message = err.to_string();
        let delay_ms = delay.as_millis().to_string();
        log_debug(
            COMPONENT,
            "Requeueing failed reconcile",
            &[
                ("controller", reconciler.name()),
                ("request_namespace", notification.namespace.as_str()),
                ("request_name", notification.name.as_str()),
                ("backoff_ms", delay_ms.as_str()),
                ("error", message.as_str()),
            ],
        );

        let Some(wake) = queue.wake_handle(&notification) else {
            return;
        };
        let woken = wake.notified();
        tokio::pin!(woken);
        // Register before checking the flag so a concurrent enqueue is not missed.
        woken.as_mut().enable();
        if queue.is_dirty(&notification) {
            delay = retry.initial;
            continue;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                queue.release(&notification);
                return;
            }
            _ = sleep(delay) => delay = retry.next_delay(delay),
            _ = &mut woken => delay = retry.initial,
        }
    }
}
