//! The `NodeMaintenance` custom resource.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Requests that a node be cordoned, tainted and drained for maintenance.
///
/// Deleting the request reverses the taints and uncordons the node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nodemaintenance.kubevirt.io",
    version = "v1alpha1",
    kind = "NodeMaintenance",
    plural = "nodemaintenances",
    shortname = "nm",
    status = "NodeMaintenanceStatus",
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Evictions", "type":"integer", "jsonPath":".status.evictionPods"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeMaintenanceSpec {
    /// Name of the node to put into maintenance.
    pub node_name: String,

    /// Free-text reason, for operators.
    #[serde(default)]
    pub reason: String,

    /// Give up and mark the request Failed if pods are still pending this
    /// many seconds after the request was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MaintenancePhase {
    Running,
    Succeeded,
    Failed,
}

impl MaintenancePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

// Every field is always serialized so that a merge patch of the whole status
// clears values that went away.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeMaintenanceStatus {
    /// Absent until the request has been initialized.
    #[serde(default)]
    pub phase: Option<MaintenancePhase>,

    /// Node captured when the request was initialized.
    #[serde(default)]
    pub node_name: Option<String>,

    /// Pods that still have to leave the node.
    #[serde(default)]
    pub pending_pods: Vec<String>,

    /// Pods eligible for eviction at initialization.
    #[serde(default)]
    pub eviction_pods: i32,

    /// All pods on the node at initialization.
    #[serde(default)]
    pub total_pods: i32,

    #[serde(default)]
    pub last_error: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_updated: Option<Time>,
}

impl NodeMaintenance {
    pub fn phase(&self) -> Option<MaintenancePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Node the maintenance cycle is operating on: the one captured at
    /// initialization, or the requested one before that.
    pub fn target_node(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or(&self.spec.node_name)
    }
}
