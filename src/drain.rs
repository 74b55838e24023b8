//! Evicts pods from a node, similar to `kubectl drain`.
//!
//! A drain pass lists the pods on the node, evicts the eligible ones through
//! the Eviction API (which honors PodDisruptionBudgets) and waits for them to
//! go away. The pass is bounded by a deadline: pods that are still on the node
//! when it expires are reported back instead of failing the pass, and the next
//! pass simply starts over with whatever is left.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::time::{sleep, timeout_at, Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, info, warn};

use crate::error::{EvictionError, Result};
use crate::store::PodEvictor;

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Deadline for a whole pass.
    pub timeout: Duration,
    pub concurrency: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub deletion_poll: Duration,
}

impl DrainSettings {
    // Delays of retry_base, 2x, 4x, ... capped at retry_max.
    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.retry_base.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.retry_max)
            .map(jitter)
    }
}

/// Pods found on a node, split into all of them and those we may evict.
#[derive(Debug, Default)]
pub struct PodCensus {
    pub total: usize,
    pub eligible: Vec<Pod>,
}

impl PodCensus {
    pub fn eligible_names(&self) -> Vec<String> {
        self.eligible.iter().map(|p| p.name_any()).collect()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub evicted: usize,
    /// Names of pods still on the node when the pass ended.
    pub remaining: Vec<String>,
    /// Most recent non-retryable eviction failure, if any.
    pub last_error: Option<String>,
}

/// Whether a pod is managed by eviction at all.
///
/// DaemonSet pods are skipped because the DaemonSet controller ignores cordons
/// and would just recreate them. Mirror pods are static and cannot be evicted.
pub fn is_evictable(pod: &Pod) -> bool {
    let daemon_owned = pod
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.kind == "DaemonSet");
    if daemon_owned {
        debug!("Not draining pod '{}': member of a DaemonSet", pod.name_any());
        return false;
    }
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        debug!("Not draining pod '{}': static mirror pod", pod.name_any());
        return false;
    }
    true
}

/// Counts the pods on `node_name` and selects the ones to evict.
pub async fn census(evictor: &dyn PodEvictor, node_name: &str) -> Result<PodCensus> {
    let pods = evictor.list_pods(node_name).await?;
    let total = pods.len();
    let eligible = pods.into_iter().filter(is_evictable).collect();
    Ok(PodCensus { total, eligible })
}

enum PodResult {
    Drained,
    Pending { pod: String, error: Option<String> },
}

/// Runs one drain pass over `node_name`.
pub async fn drain_node(
    evictor: &dyn PodEvictor,
    node_name: &str,
    settings: &DrainSettings,
) -> Result<DrainReport> {
    let deadline = Instant::now() + settings.timeout;
    let targets = census(evictor, node_name).await?.eligible;
    if targets.is_empty() {
        return Ok(DrainReport::default());
    }
    info!("Draining {} pods from node '{}'", targets.len(), node_name);

    let results: Vec<PodResult> = stream::iter(targets)
        .map(|pod| drain_pod(evictor, pod, settings, deadline))
        .buffer_unordered(settings.concurrency.max(1))
        .collect()
        .await;

    let mut report = DrainReport::default();
    for result in results {
        match result {
            PodResult::Drained => report.evicted += 1,
            PodResult::Pending { pod, error } => {
                report.remaining.push(pod);
                if error.is_some() {
                    report.last_error = error;
                }
            }
        }
    }
    report.remaining.sort();
    Ok(report)
}

async fn drain_pod(
    evictor: &dyn PodEvictor,
    pod: Pod,
    settings: &DrainSettings,
    deadline: Instant,
) -> PodResult {
    let name = pod.name_any();
    let attempt = async {
        if evict_with_retry(evictor, &pod, settings).await? {
            wait_for_deletion(evictor, &pod, settings.deletion_poll).await;
        }
        Ok::<(), EvictionError>(())
    };
    match timeout_at(deadline, attempt).await {
        Ok(Ok(())) => PodResult::Drained,
        Ok(Err(e)) => {
            warn!("Giving up on pod '{}' for this pass: {}", name, e);
            PodResult::Pending {
                pod: name,
                error: Some(e.to_string()),
            }
        }
        Err(_) => {
            debug!("Pod '{}' still present at drain deadline", name);
            PodResult::Pending {
                pod: name,
                error: None,
            }
        }
    }
}

/// Returns `Ok(true)` once an eviction was accepted, `Ok(false)` if the pod
/// was already gone.
async fn evict_with_retry(
    evictor: &dyn PodEvictor,
    pod: &Pod,
    settings: &DrainSettings,
) -> Result<bool, EvictionError> {
    let mut delays = settings.retry_strategy();
    loop {
        match evictor.evict(pod).await {
            Ok(()) => return Ok(true),
            Err(EvictionError::NotFound { .. }) => return Ok(false),
            Err(e) if e.should_retry() => {
                let delay = delays.next().unwrap_or(settings.retry_max);
                debug!("{}. Retrying in {:.2}s", e, delay.as_secs_f64());
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn wait_for_deletion(evictor: &dyn PodEvictor, pod: &Pod, poll: Duration) {
    loop {
        match evictor.pod_exists(pod).await {
            Ok(false) => {
                debug!("Pod '{}' deleted", pod.name_any());
                return;
            }
            Ok(true) => {}
            Err(e) => warn!(
                "Could not determine if pod '{}' has been deleted: {}",
                pod.name_any(),
                e
            ),
        }
        sleep(poll).await;
    }
}

/// Live drain state for one node.
///
/// Passes on the same node are serialized, even when two requests target it.
#[derive(Debug)]
pub struct DrainSession {
    node_name: String,
    settings: DrainSettings,
    passes: AtomicU32,
    running: tokio::sync::Mutex<()>,
}

impl DrainSession {
    fn new(node_name: &str, settings: DrainSettings) -> Self {
        Self {
            node_name: node_name.to_string(),
            settings,
            passes: AtomicU32::new(0),
            running: tokio::sync::Mutex::new(()),
        }
    }

    #[cfg(test)]
    fn passes(&self) -> u32 {
        self.passes.load(Ordering::SeqCst)
    }

    pub async fn drain(&self, evictor: &dyn PodEvictor) -> Result<DrainReport> {
        let _guard = self.running.lock().await;
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Drain pass {} on node '{}'", pass, self.node_name);
        drain_node(evictor, &self.node_name, &self.settings).await
    }
}

#[derive(Debug)]
struct Entry {
    session: Arc<DrainSession>,
    /// requests currently draining this node
    requests: BTreeSet<String>,
}

/// Drain sessions keyed by node name, shared by all reconciles.
#[derive(Debug, Default)]
pub struct DrainSessions {
    sessions: Mutex<HashMap<String, Entry>>,
}

impl DrainSessions {
    /// The session for `node_name`, registering `request` as one of its users.
    pub fn session(
        &self,
        node_name: &str,
        request: &str,
        settings: &DrainSettings,
    ) -> Arc<DrainSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let entry = sessions
            .entry(node_name.to_string())
            .or_insert_with(|| Entry {
                session: Arc::new(DrainSession::new(node_name, settings.clone())),
                requests: BTreeSet::new(),
            });
        entry.requests.insert(request.to_string());
        entry.session.clone()
    }

    /// Unregisters `request`; the session goes away with its last user.
    pub fn release(&self, node_name: &str, request: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = sessions.get_mut(node_name) {
            entry.requests.remove(request);
            if entry.requests.is_empty() {
                sessions.remove(node_name);
                debug!("Dropped drain session for node '{}'", node_name);
            }
        }
    }

    #[cfg(test)]
    fn contains(&self, node_name: &str) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.contains_key(node_name)
    }
}
