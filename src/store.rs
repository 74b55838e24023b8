//! Seams between the controller and the cluster.
//!
//! [`ClusterApi`] covers the object store (requests and nodes), [`PodEvictor`]
//! the drain primitive. [`KubeCluster`] implements both against the API server;
//! tests substitute in-memory doubles.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{
        Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams, Preconditions,
        ResourceExt,
    },
    core::ErrorResponse,
    Client,
};
use serde_json::json;
use tracing::debug;

use crate::crd::{NodeMaintenance, NodeMaintenanceStatus};
use crate::error::{EvictionError, Result};

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_maintenance(&self, name: &str) -> Result<Option<NodeMaintenance>>;

    /// Writes the whole status. Fails with a conflict if `nm` is stale.
    async fn patch_maintenance_status(
        &self,
        nm: &NodeMaintenance,
        status: &NodeMaintenanceStatus,
    ) -> Result<NodeMaintenance>;

    /// Replaces the finalizer list. Fails with a conflict if `nm` is stale.
    async fn patch_maintenance_finalizers(
        &self,
        nm: &NodeMaintenance,
        finalizers: Vec<String>,
    ) -> Result<NodeMaintenance>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Writes the node back. Fails with a conflict if `node` is stale.
    async fn replace_node(&self, node: &Node) -> Result<Node>;
}

#[async_trait]
pub trait PodEvictor: Send + Sync {
    /// All pods scheduled on the node.
    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>>;

    async fn evict(&self, pod: &Pod) -> Result<(), EvictionError>;

    /// Whether this exact pod (same uid) still exists.
    async fn pod_exists(&self, pod: &Pod) -> Result<bool>;
}

/// [`ClusterApi`] and [`PodEvictor`] backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn maintenance_api(&self) -> Api<NodeMaintenance> {
        Api::all(self.client.clone())
    }

    fn node_api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pod_api(&self, pod: &Pod) -> Api<Pod> {
        match pod.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_maintenance(&self, name: &str) -> Result<Option<NodeMaintenance>> {
        Ok(self.maintenance_api().get_opt(name).await?)
    }

    async fn patch_maintenance_status(
        &self,
        nm: &NodeMaintenance,
        status: &NodeMaintenanceStatus,
    ) -> Result<NodeMaintenance> {
        let patch = json!({
            "metadata": {
                "resourceVersion": nm.resource_version(),
            },
            "status": serde_json::to_value(status)?,
        });
        Ok(self
            .maintenance_api()
            .patch_status(&nm.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_maintenance_finalizers(
        &self,
        nm: &NodeMaintenance,
        finalizers: Vec<String>,
    ) -> Result<NodeMaintenance> {
        let patch = json!({
            "metadata": {
                "resourceVersion": nm.resource_version(),
                "finalizers": finalizers,
            }
        });
        Ok(self
            .maintenance_api()
            .patch(&nm.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.node_api().get_opt(name).await?)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        Ok(self
            .node_api()
            .replace(&node.name_any(), &PostParams::default(), node)
            .await?)
    }
}

#[async_trait]
impl PodEvictor for KubeCluster {
    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        Ok(pods.list(&params).await?.items)
    }

    async fn evict(&self, pod: &Pod) -> Result<(), EvictionError> {
        let name = pod.name_any();
        match self.pod_api(pod).evict(&name, &eviction_params(pod)).await {
            Ok(_) => {
                debug!("Created eviction for pod '{}'", name);
                Ok(())
            }
            Err(kube::Error::Api(ErrorResponse { code, message, .. })) => {
                Err(classify_eviction_response(name, code, message))
            }
            Err(e) => Err(EvictionError::Retriable {
                pod: name,
                message: e.to_string(),
            }),
        }
    }

    async fn pod_exists(&self, pod: &Pod) -> Result<bool> {
        let current = self.pod_api(pod).get_opt(&pod.name_any()).await?;
        Ok(current.is_some_and(|p| p.uid() == pod.uid()))
    }
}

// Pinned to the pod's uid, so a replacement pod with the same name is never
// evicted by a retry.
fn eviction_params(pod: &Pod) -> EvictParams {
    EvictParams {
        delete_options: Some(DeleteParams {
            preconditions: Some(Preconditions {
                uid: pod.uid(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// 429 is how the API server reports a disruption budget that cannot be
// satisfied yet. A 500 usually means several budgets select the same pod.
// A 409 is a failed uid precondition: the pod we meant is gone.
fn classify_eviction_response(pod: String, code: u16, message: String) -> EvictionError {
    match code {
        429 => EvictionError::DisruptionBudget { pod, message },
        404 | 409 => EvictionError::NotFound { pod },
        403 => EvictionError::Fatal { pod, message },
        _ => EvictionError::Retriable { pod, message },
    }
}
