//! Best-effort view of pods on nodes under maintenance.
//!
//! The watcher follows pod events for the whole cluster, keeps the pods of
//! tracked nodes in a local cache and sends a reconcile trigger for the owning
//! request whenever one of those pods leaves its node. Nothing here is
//! authoritative: drain decisions always come from a fresh listing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use futures::{channel::mpsc, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{reflector::ObjectRef, watcher, WatchStreamExt},
    ResourceExt,
};
use tracing::{debug, info, warn};

use crate::crd::NodeMaintenance;

type Trigger = ObjectRef<NodeMaintenance>;

#[derive(Default)]
struct Cache {
    /// node name -> requests keeping it in maintenance
    tracked: HashMap<String, Vec<Trigger>>,
    /// node name -> "namespace/name" of pods believed to be on it
    pods: HashMap<String, BTreeSet<String>>,
    /// relist in progress
    buffer: Option<HashMap<String, BTreeSet<String>>>,
}

pub struct PodWatcher {
    cache: RwLock<Cache>,
    triggers: mpsc::UnboundedSender<Trigger>,
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn node_of(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
}

fn has_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

impl PodWatcher {
    /// Creates a watcher and the stream of reconcile triggers it produces.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Trigger>) {
        let (triggers, receiver) = mpsc::unbounded();
        let watcher = Self {
            cache: RwLock::new(Cache::default()),
            triggers,
        };
        (watcher, receiver)
    }

    /// Starts following pods on `node_name` on behalf of `request`.
    pub fn track(&self, node_name: &str, request: Trigger) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let requests = cache.tracked.entry(node_name.to_string()).or_default();
        if requests.is_empty() {
            debug!("Watching pods on node '{}'", node_name);
        }
        if !requests.contains(&request) {
            requests.push(request);
        }
    }

    /// Stops following `node_name` for `request`. The node stays watched
    /// while other requests still target it.
    pub fn untrack(&self, node_name: &str, request: &str) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let Some(requests) = cache.tracked.get_mut(node_name) else {
            return;
        };
        requests.retain(|r| r.name != request);
        if requests.is_empty() {
            cache.tracked.remove(node_name);
            cache.pods.remove(node_name);
            debug!("Stopped watching pods on node '{}'", node_name);
        }
    }

    #[cfg(test)]
    fn is_tracked(&self, node_name: &str) -> bool {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.tracked.contains_key(node_name)
    }

    /// Cached pods on a tracked node, as "namespace/name".
    pub fn pods_on(&self, node_name: &str) -> Vec<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .pods
            .get(node_name)
            .map(|pods| pods.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Applies one watch event to the cache, sending triggers as needed.
    pub fn handle(&self, event: watcher::Event<Pod>) {
        let mut fired = Vec::new();
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            match event {
                watcher::Event::Init => cache.buffer = Some(HashMap::new()),
                watcher::Event::InitApply(pod) => {
                    if let Some(node) = node_of(&pod).filter(|n| cache.tracked.contains_key(*n)) {
                        let node = node.to_string();
                        if let Some(buffer) = cache.buffer.as_mut() {
                            buffer.entry(node).or_default().insert(pod_key(&pod));
                        }
                    }
                }
                watcher::Event::InitDone => {
                    let buffer = cache.buffer.take().unwrap_or_default();
                    cache.pods = buffer;
                    // Deletes may have been missed while disconnected.
                    fired.extend(cache.tracked.values().flatten().cloned());
                }
                watcher::Event::Apply(pod) => {
                    if let Some(node) = node_of(&pod) {
                        if let Some(requests) = cache.tracked.get(node).cloned() {
                            let key = pod_key(&pod);
                            let pods = cache.pods.entry(node.to_string()).or_default();
                            if has_finished(&pod) || pod.metadata.deletion_timestamp.is_some() {
                                if pods.remove(&key) {
                                    fired.extend(requests);
                                }
                            } else {
                                pods.insert(key);
                            }
                        }
                    }
                }
                watcher::Event::Delete(pod) => {
                    if let Some(node) = node_of(&pod) {
                        if let Some(requests) = cache.tracked.get(node).cloned() {
                            if let Some(pods) = cache.pods.get_mut(node) {
                                pods.remove(&pod_key(&pod));
                            }
                            fired.extend(requests);
                        }
                    }
                }
            }
        }
        for request in fired {
            if self.triggers.unbounded_send(request).is_err() {
                debug!("Reconcile trigger dropped, controller is gone");
            }
        }
    }

    /// Follows pod events until the stream ends. Watch errors are retried
    /// with backoff by the watcher itself.
    pub async fn run(self: Arc<Self>, pods: Api<Pod>) {
        info!("Starting pod watcher");
        let mut events = watcher(pods, watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.handle(event),
                Err(e) => warn!("Pod watch error: {}", e),
            }
        }
        warn!("Pod watcher stopped; relying on periodic requeue");
    }
}
