//! In-memory cluster used by the reconcile tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Node, NodeSpec, Pod, PodCondition, PodSpec, PodStatus, Taint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::{core::ErrorResponse, ResourceExt};
use node_maintenance_operator::{
    ClusterApi, Config, Error, EvictionError, NodeMaintenance, NodeMaintenanceSpec,
    NodeMaintenanceStatus, PodEvictor, Result,
};

#[derive(Default)]
struct State {
    requests: BTreeMap<String, NodeMaintenance>,
    nodes: BTreeMap<String, Node>,
    pods: Vec<Pod>,
    version: u64,
    /// pod name -> number of 429s still to hand out (u32::MAX: forever)
    blocked: HashMap<String, u32>,
    status_conflicts: u32,
    node_conflicts: u32,
    forbid_node_writes: bool,
    forbid_finalizer_writes: bool,
    node_writes: usize,
    evictions: Vec<String>,
}

impl State {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn conflict(kind: &str, name: &str) -> Error {
    api_error(
        409,
        "Conflict",
        format!("Operation cannot be fulfilled on {kind} \"{name}\": the object has been modified"),
    )
}

fn forbidden(kind: &str, name: &str) -> Error {
    api_error(
        403,
        "Forbidden",
        format!("{kind} \"{name}\" is forbidden: permission denied"),
    )
}

fn not_found(kind: &str, name: &str) -> Error {
    api_error(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

/// Keeps requests, nodes and pods in memory with resourceVersion checks.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, name: &str, taints: Vec<Taint>) {
        let mut state = self.state();
        let resource_version = state.next_version();
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version,
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: (!taints.is_empty()).then_some(taints),
                ..Default::default()
            }),
            ..Default::default()
        };
        state.nodes.insert(name.to_string(), node);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.push(pod);
    }

    pub fn create_request(&self, name: &str, node_name: &str) {
        self.create_request_with(
            name,
            NodeMaintenanceSpec {
                node_name: node_name.to_string(),
                reason: "test reason".to_string(),
                max_wait_seconds: None,
            },
        );
    }

    pub fn create_request_with(&self, name: &str, spec: NodeMaintenanceSpec) {
        let mut state = self.state();
        let mut nm = NodeMaintenance::new(name, spec);
        nm.metadata.resource_version = state.next_version();
        nm.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.requests.insert(name.to_string(), nm);
    }

    /// Edits a request the way a user would, bumping its resourceVersion.
    pub fn edit_request(&self, name: &str, edit: impl FnOnce(&mut NodeMaintenance)) {
        let mut state = self.state();
        let version = state.next_version();
        let nm = state.requests.get_mut(name).expect("request exists");
        edit(nm);
        nm.metadata.resource_version = version;
    }

    /// Deletes like the API server: blocked by finalizers until they are gone.
    pub fn delete_request(&self, name: &str) {
        let mut state = self.state();
        let has_finalizers = state
            .requests
            .get(name)
            .is_some_and(|nm| !nm.finalizers().is_empty());
        if has_finalizers {
            let version = state.next_version();
            let nm = state.requests.get_mut(name).unwrap();
            nm.metadata.deletion_timestamp = Some(Time(Utc::now()));
            nm.metadata.resource_version = version;
        } else {
            state.requests.remove(name);
        }
    }

    pub fn request(&self, name: &str) -> Option<NodeMaintenance> {
        self.state().requests.get(name).cloned()
    }

    pub fn status(&self, name: &str) -> NodeMaintenanceStatus {
        self.request(name)
            .and_then(|nm| nm.status)
            .expect("request has a status")
    }

    pub fn node(&self, name: &str) -> Node {
        self.state().nodes.get(name).cloned().expect("node exists")
    }

    pub fn pods_on(&self, node_name: &str) -> Vec<String> {
        self.state()
            .pods
            .iter()
            .filter(|p| scheduled_on(p, node_name))
            .map(|p| p.name_any())
            .collect()
    }

    pub fn block_eviction(&self, pod: &str, times: u32) {
        self.state().blocked.insert(pod.to_string(), times);
    }

    pub fn fail_status_writes_with_conflict(&self, times: u32) {
        self.state().status_conflicts = times;
    }

    pub fn fail_node_writes_with_conflict(&self, times: u32) {
        self.state().node_conflicts = times;
    }

    /// Node writes fail with 403 from now on.
    pub fn forbid_node_writes(&self) {
        self.state().forbid_node_writes = true;
    }

    /// Finalizer patches fail with 403 from now on.
    pub fn forbid_finalizer_writes(&self) {
        self.state().forbid_finalizer_writes = true;
    }

    pub fn node_writes(&self) -> usize {
        self.state().node_writes
    }

    pub fn evictions(&self) -> Vec<String> {
        self.state().evictions.clone()
    }
}

fn scheduled_on(pod: &Pod, node_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| n == node_name)
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_maintenance(&self, name: &str) -> Result<Option<NodeMaintenance>> {
        Ok(self.request(name))
    }

    async fn patch_maintenance_status(
        &self,
        nm: &NodeMaintenance,
        status: &NodeMaintenanceStatus,
    ) -> Result<NodeMaintenance> {
        let name = nm.name_any();
        let mut state = self.state();
        if state.status_conflicts > 0 {
            // Someone else wrote the object in the meantime.
            state.status_conflicts -= 1;
            let version = state.next_version();
            if let Some(stored) = state.requests.get_mut(&name) {
                stored.metadata.resource_version = version;
            }
            return Err(conflict("nodemaintenances", &name));
        }
        let version = state.next_version();
        let stored = state
            .requests
            .get_mut(&name)
            .ok_or_else(|| not_found("nodemaintenances", &name))?;
        if stored.metadata.resource_version != nm.metadata.resource_version {
            return Err(conflict("nodemaintenances", &name));
        }
        stored.status = Some(status.clone());
        stored.metadata.resource_version = version;
        Ok(stored.clone())
    }

    async fn patch_maintenance_finalizers(
        &self,
        nm: &NodeMaintenance,
        finalizers: Vec<String>,
    ) -> Result<NodeMaintenance> {
        let name = nm.name_any();
        let mut state = self.state();
        if state.forbid_finalizer_writes {
            return Err(forbidden("nodemaintenances", &name));
        }
        let version = state.next_version();
        let stored = state
            .requests
            .get_mut(&name)
            .ok_or_else(|| not_found("nodemaintenances", &name))?;
        if stored.metadata.resource_version != nm.metadata.resource_version {
            return Err(conflict("nodemaintenances", &name));
        }
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = version;
        let updated = stored.clone();
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.requests.remove(&name);
        }
        Ok(updated)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state().nodes.get(name).cloned())
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        let mut state = self.state();
        if state.forbid_node_writes {
            return Err(forbidden("nodes", &name));
        }
        let version = state.next_version();
        if state.node_conflicts > 0 {
            state.node_conflicts -= 1;
            if let Some(stored) = state.nodes.get_mut(&name) {
                stored.metadata.resource_version = version;
            }
            return Err(conflict("nodes", &name));
        }
        let stored = state
            .nodes
            .get_mut(&name)
            .ok_or_else(|| not_found("nodes", &name))?;
        if stored.metadata.resource_version != node.metadata.resource_version {
            return Err(conflict("nodes", &name));
        }
        *stored = node.clone();
        stored.metadata.resource_version = version;
        let updated = stored.clone();
        state.node_writes += 1;
        Ok(updated)
    }
}

#[async_trait]
impl PodEvictor for FakeCluster {
    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|p| scheduled_on(p, node_name))
            .cloned()
            .collect())
    }

    async fn evict(&self, pod: &Pod) -> Result<(), EvictionError> {
        let name = pod.name_any();
        let mut state = self.state();
        state.evictions.push(name.clone());
        if let Some(blocks) = state.blocked.get_mut(&name) {
            if *blocks > 0 {
                if *blocks != u32::MAX {
                    *blocks -= 1;
                }
                return Err(EvictionError::DisruptionBudget {
                    pod: name,
                    message: "Cannot evict pod as it would violate the pod's disruption budget."
                        .to_string(),
                });
            }
        }
        let before = state.pods.len();
        state.pods.retain(|p| p.uid() != pod.uid());
        if state.pods.len() == before {
            return Err(EvictionError::NotFound { pod: name });
        }
        Ok(())
    }

    async fn pod_exists(&self, pod: &Pod) -> Result<bool> {
        Ok(self.state().pods.iter().any(|p| p.uid() == pod.uid()))
    }
}

pub fn taint(key: &str, effect: &str) -> Taint {
    Taint {
        key: key.to_string(),
        effect: effect.to_string(),
        ..Default::default()
    }
}

/// A running, ready pod bound to `node_name`.
pub fn ready_pod(name: &str, node_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn daemon_pod(name: &str, node_name: &str) -> Pod {
    let mut pod = ready_pod(name, node_name);
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "DaemonSet".to_string(),
        name: name.to_string(),
        uid: format!("uid-ds-{name}"),
        controller: Some(true),
        ..Default::default()
    }]);
    pod
}

/// Short timeouts so partial drains finish quickly.
pub fn test_config() -> Config {
    Config {
        drain_timeout_seconds: 1,
        eviction_retry_base_ms: 2,
        eviction_retry_max_ms: 20,
        deletion_poll_ms: 5,
        watch_pods: false,
        ..Default::default()
    }
}
