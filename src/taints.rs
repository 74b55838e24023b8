//! Taint/cordon transitions for nodes under maintenance.
//!
//! The pure functions compute the desired node; [`update_node`] writes it back
//! with optimistic concurrency, re-reading the node on conflict.

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::ClusterApi;

pub const DRAIN_TAINT_KEY: &str = "kubevirt.io/drain";
pub const UNSCHEDULABLE_TAINT_KEY: &str = "node.kubernetes.io/unschedulable";
pub const NO_SCHEDULE: &str = "NoSchedule";

/// The two taints owned by maintenance, in the order they are appended.
pub fn maintenance_taints() -> [Taint; 2] {
    [DRAIN_TAINT_KEY, UNSCHEDULABLE_TAINT_KEY].map(|key| Taint {
        key: key.to_string(),
        effect: NO_SCHEDULE.to_string(),
        ..Default::default()
    })
}

fn is_maintenance_taint(taint: &Taint) -> bool {
    taint.effect == NO_SCHEDULE
        && (taint.key == DRAIN_TAINT_KEY || taint.key == UNSCHEDULABLE_TAINT_KEY)
}

/// Adds (`enable`) or removes the maintenance taints, matching by key and effect.
///
/// Returns `None` when the list already has the desired shape. Unrelated taints
/// keep their relative order.
pub fn apply_maintenance(taints: &[Taint], enable: bool) -> Option<Vec<Taint>> {
    if enable {
        let missing: Vec<Taint> = maintenance_taints()
            .into_iter()
            .filter(|wanted| {
                !taints
                    .iter()
                    .any(|t| t.key == wanted.key && t.effect == wanted.effect)
            })
            .collect();
        if missing.is_empty() {
            return None;
        }
        let mut updated = taints.to_vec();
        updated.extend(missing);
        Some(updated)
    } else {
        let updated: Vec<Taint> = taints
            .iter()
            .filter(|t| !is_maintenance_taint(t))
            .cloned()
            .collect();
        (updated.len() != taints.len()).then_some(updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChange {
    /// Add the maintenance taints and cordon.
    Enter,
    /// Remove the maintenance taints and uncordon.
    Release,
}

/// The node as it should look after `change`, or `None` if it already does.
pub fn desired_node(node: &Node, change: NodeChange) -> Option<Node> {
    let spec = node.spec.clone().unwrap_or_default();
    let current = spec.taints.as_deref().unwrap_or_default();
    let unschedulable = change == NodeChange::Enter;

    let taints = apply_maintenance(current, unschedulable);
    let cordon_changed = spec.unschedulable.unwrap_or(false) != unschedulable;
    if taints.is_none() && !cordon_changed {
        return None;
    }

    let mut updated = node.clone();
    let spec = updated.spec.get_or_insert_with(Default::default);
    if let Some(taints) = taints {
        spec.taints = (!taints.is_empty()).then_some(taints);
    }
    if cordon_changed {
        spec.unschedulable = Some(unschedulable);
    }
    Some(updated)
}

#[derive(Debug)]
pub enum NodeUpdate {
    Updated(Node),
    Unchanged(Node),
    NotFound,
}

/// Applies `change` to the named node, retrying on write conflicts.
pub async fn update_node(
    cluster: &dyn ClusterApi,
    node_name: &str,
    change: NodeChange,
    conflict_retries: u32,
) -> Result<NodeUpdate> {
    let attempts = conflict_retries.max(1);
    for attempt in 1..=attempts {
        let Some(node) = cluster.get_node(node_name).await? else {
            return Ok(NodeUpdate::NotFound);
        };
        let Some(desired) = desired_node(&node, change) else {
            debug!("Node '{}' already in desired state ({:?})", node_name, change);
            return Ok(NodeUpdate::Unchanged(node));
        };
        match cluster.replace_node(&desired).await {
            Ok(updated) => {
                info!("Node '{}' updated ({:?})", updated.name_any(), change);
                return Ok(NodeUpdate::Updated(updated));
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    "Conflict updating node '{}' (attempt {}/{}), retrying",
                    node_name, attempt, attempts
                );
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::ConflictRetriesExhausted {
        kind: "Node",
        name: node_name.to_string(),
        attempts,
    })
}
