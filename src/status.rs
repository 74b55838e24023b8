//! Status bookkeeping for `NodeMaintenance` requests.
//!
//! A reconcile pass collects what happened into a [`StatusChange`] and writes
//! it with a single status patch. The change is re-applied to a fresh copy of
//! the request if that write conflicts.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::crd::{MaintenancePhase, NodeMaintenance, NodeMaintenanceStatus};
use crate::drain::{DrainReport, PodCensus};
use crate::error::{Error, Result};
use crate::store::ClusterApi;

/// Pod census of the target node at the moment a request is first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Initialization {
    pub node_name: String,
    pub total_pods: usize,
    pub pending_pods: Vec<String>,
}

impl Initialization {
    pub fn from_census(node_name: &str, census: &PodCensus) -> Self {
        Self {
            node_name: node_name.to_string(),
            total_pods: census.total,
            pending_pods: census.eligible_names(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A drain pass finished, possibly with pods left over.
    Drained(DrainReport),
    /// The request cannot make progress without outside intervention.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Set when the request was uninitialized at the start of the pass.
    pub init: Option<Initialization>,
    /// Discard the previous status first; used when the target node changed.
    pub restart: bool,
    pub outcome: Outcome,
}

impl StatusChange {
    pub fn apply(&self, prev: Option<&NodeMaintenanceStatus>, now: Time) -> NodeMaintenanceStatus {
        let prev = if self.restart { None } else { prev };
        let base = self
            .init
            .as_ref()
            .and_then(|init| initialize(prev, init, now.clone()))
            .or_else(|| prev.cloned())
            .unwrap_or_default();
        update(&base, &self.outcome, now)
    }
}

/// Starts a maintenance cycle: phase Running and the pod counts fixed.
///
/// Returns `None` when the status already has a phase, so counters are never
/// reset by later passes.
pub fn initialize(
    prev: Option<&NodeMaintenanceStatus>,
    init: &Initialization,
    now: Time,
) -> Option<NodeMaintenanceStatus> {
    if prev.is_some_and(|s| s.phase.is_some()) {
        return None;
    }
    Some(NodeMaintenanceStatus {
        phase: Some(MaintenancePhase::Running),
        node_name: Some(init.node_name.clone()),
        pending_pods: init.pending_pods.clone(),
        eviction_pods: count(init.pending_pods.len()),
        total_pods: count(init.total_pods),
        last_error: String::new(),
        last_updated: Some(now),
    })
}

/// Folds an outcome into the status. Terminal phases are left untouched.
pub fn update(prev: &NodeMaintenanceStatus, outcome: &Outcome, now: Time) -> NodeMaintenanceStatus {
    if prev.phase.is_some_and(MaintenancePhase::is_terminal) {
        return prev.clone();
    }
    let mut status = prev.clone();
    match outcome {
        Outcome::Drained(report) => {
            status.pending_pods = report.remaining.clone();
            if report.remaining.is_empty() {
                status.phase = Some(MaintenancePhase::Succeeded);
                status.last_error.clear();
            } else {
                status.phase = Some(MaintenancePhase::Running);
                status.last_error = report.last_error.clone().unwrap_or_default();
            }
        }
        Outcome::Failed(message) => {
            status.phase = Some(MaintenancePhase::Failed);
            status.last_error = message.clone();
        }
    }
    status.last_updated = Some(now);
    status
}

fn unchanged(prev: Option<&NodeMaintenanceStatus>, next: &NodeMaintenanceStatus) -> bool {
    let strip = |s: &NodeMaintenanceStatus| NodeMaintenanceStatus {
        last_updated: None,
        ..s.clone()
    };
    prev.is_some_and(|prev| strip(prev) == strip(next))
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Writes `change` to the request, re-fetching and re-applying on conflict.
///
/// Returns the status that was written (or computed, if the request vanished
/// in the meantime).
pub async fn persist(
    cluster: &dyn ClusterApi,
    nm: &NodeMaintenance,
    change: &StatusChange,
    conflict_retries: u32,
) -> Result<NodeMaintenanceStatus> {
    let name = nm.name_any();
    let attempts = conflict_retries.max(1);
    let mut current = nm.clone();
    for attempt in 1..=attempts {
        let status = change.apply(current.status.as_ref(), Time(Utc::now()));
        if unchanged(current.status.as_ref(), &status) {
            return Ok(status);
        }
        match cluster.patch_maintenance_status(&current, &status).await {
            Ok(_) => {
                if current.phase() != status.phase {
                    info!(
                        "NodeMaintenance '{}' phase {:?} -> {}",
                        name,
                        current.phase().map(MaintenancePhase::as_str),
                        status.phase.map_or("", MaintenancePhase::as_str)
                    );
                }
                return Ok(status);
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    "Conflict updating status of NodeMaintenance '{}' (attempt {}/{}), retrying",
                    name, attempt, attempts
                );
                match cluster.get_maintenance(&name).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(status),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::ConflictRetriesExhausted {
        kind: "NodeMaintenance",
        name,
        attempts,
    })
}
