use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use futures::StreamExt;
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time};
use kube::{
    api::{Api, ResourceExt},
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    Client,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    crd::{MaintenancePhase, NodeMaintenance},
    drain::{self, DrainSessions},
    error::{Error, Result},
    metrics::{init_metrics, ERRORS_TOTAL, PODS_EVICTED_TOTAL, RECONCILES_TOTAL},
    pod_watcher::PodWatcher,
    status::{self, Initialization, Outcome, StatusChange},
    store::{ClusterApi, KubeCluster, PodEvictor},
    taints::{self, NodeChange, NodeUpdate},
};

pub const FINALIZER_NAME: &str = "nodemaintenance.kubevirt.io/finalizer";
const REQUEUE_TIME: Duration = Duration::from_secs(2);
const MAX_RETRY_TIME: Duration = Duration::from_secs(3600);

/// Passed to the reconciler
pub struct Context {
    cluster: Arc<dyn ClusterApi>,
    evictor: Arc<dyn PodEvictor>,
    config: Config,
    sessions: DrainSessions,
    watcher: Option<Arc<PodWatcher>>,
    /// request name -> consecutive failed reconciles
    attempts: Mutex<HashMap<String, u32>>,
}

impl Context {
    pub fn new(cluster: Arc<dyn ClusterApi>, evictor: Arc<dyn PodEvictor>, config: Config) -> Self {
        init_metrics();
        Self {
            cluster,
            evictor,
            config,
            sessions: DrainSessions::default(),
            watcher: None,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<PodWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    fn track(&self, node_name: &str, request: &str) {
        if let Some(watcher) = &self.watcher {
            watcher.track(node_name, ObjectRef::new(request));
        }
    }

    // Forget what `request` keeps in memory for a node. Other requests on the
    // same node keep their session and watch.
    fn release(&self, node_name: &str, request: &str) {
        self.sessions.release(node_name, request);
        if let Some(watcher) = &self.watcher {
            watcher.untrack(node_name, request);
        }
    }

    fn attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs the controller until shutdown.
pub async fn run(client: Client, config: Config) -> anyhow::Result<()> {
    let requests: Api<NodeMaintenance> = Api::all(client.clone());
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let mut context = Context::new(cluster.clone(), cluster, config.clone());

    let mut controller = Controller::new(requests, watcher::Config::default());
    if config.watch_pods {
        let (pod_watcher, triggers) = PodWatcher::new();
        let pod_watcher = Arc::new(pod_watcher);
        tokio::spawn(pod_watcher.clone().run(Api::<Pod>::all(client.clone())));
        context = context.with_watcher(pod_watcher);
        controller = controller.reconcile_on(triggers);
    }

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(context))
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!("Reconciled NodeMaintenance '{}'", obj.name),
                Err(e) => warn!("Reconciliation error: {:?}", e),
            }
        })
        .await;
    Ok(())
}

/// Action to take on NodeMaintenance events
pub async fn reconcile(nm: Arc<NodeMaintenance>, ctx: Arc<Context>) -> Result<Action> {
    let name = nm
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey("metadata.name"))?;
    let action = reconcile_request(&ctx, name).await?;
    ctx.attempts().remove(name);
    Ok(action)
}

/// One pass of the maintenance state machine for the named request.
///
/// Always works from a fresh read, so it is safe to call repeatedly and from
/// stale triggers.
pub async fn reconcile_request(ctx: &Context, name: &str) -> Result<Action> {
    let Some(nm) = ctx.cluster.get_maintenance(name).await? else {
        debug!("NodeMaintenance '{}' is gone", name);
        return Ok(Action::await_change());
    };

    if nm.metadata.deletion_timestamp.is_some() {
        return cleanup(ctx, &nm).await;
    }
    let (nm, finalizer_failure) = match terminal(ensure_finalizer(ctx, &nm).await)? {
        Ok(updated) => (updated, None),
        Err(outcome) => (nm, Some(outcome)),
    };

    let target = nm.spec.node_name.trim().to_string();
    let mut restart = false;
    if let Some(previous) = nm.status.as_ref().and_then(|s| s.node_name.clone()) {
        if nm.phase().is_some() && previous != target {
            info!(
                "NodeMaintenance '{}' moved from node '{}' to '{}', starting over",
                name, previous, target
            );
            release_node(ctx, &previous, name).await?;
            restart = true;
        }
    }

    match nm.phase() {
        Some(MaintenancePhase::Failed) if !restart => {
            debug!("NodeMaintenance '{}' already failed", name);
            return Ok(Action::await_change());
        }
        Some(MaintenancePhase::Succeeded) if !restart => {
            // Keep the node in maintenance until the request is deleted.
            if !target.is_empty() {
                taints::update_node(
                    ctx.cluster.as_ref(),
                    &target,
                    NodeChange::Enter,
                    ctx.config.conflict_retries,
                )
                .await?;
            }
            RECONCILES_TOTAL.with_label_values(&["Succeeded"]).inc();
            return Ok(Action::await_change());
        }
        _ => {}
    }

    let uninitialized = restart || nm.phase().is_none();
    let (init, outcome) = if let Some(outcome) = finalizer_failure {
        (
            uninitialized.then(|| Initialization {
                node_name: target.clone(),
                ..Default::default()
            }),
            outcome,
        )
    } else if target.is_empty() {
        (
            uninitialized.then(Initialization::default),
            Outcome::Failed("spec.nodeName must not be empty".to_string()),
        )
    } else {
        drive(ctx, &nm, &target, uninitialized).await?
    };

    let change = StatusChange {
        init,
        restart,
        outcome,
    };
    let status = status::persist(
        ctx.cluster.as_ref(),
        &nm,
        &change,
        ctx.config.conflict_retries,
    )
    .await?;

    let phase = status.phase.unwrap_or(MaintenancePhase::Running);
    RECONCILES_TOTAL.with_label_values(&[phase.as_str()]).inc();
    match phase {
        MaintenancePhase::Running => {
            ctx.track(&target, name);
            Ok(Action::requeue(ctx.config.requeue_interval()))
        }
        MaintenancePhase::Succeeded => {
            info!("Node '{}' drained for NodeMaintenance '{}'", target, name);
            ctx.release(&target, name);
            Ok(Action::await_change())
        }
        MaintenancePhase::Failed => {
            warn!(
                "NodeMaintenance '{}' failed: {}",
                name, status.last_error
            );
            ctx.release(&target, name);
            Ok(Action::await_change())
        }
    }
}

/// Taints, cordons and drains `target`; returns what to record in status.
async fn drive(
    ctx: &Context,
    nm: &NodeMaintenance,
    target: &str,
    uninitialized: bool,
) -> Result<(Option<Initialization>, Outcome)> {
    let not_found = || Outcome::Failed(format!("Node '{}' not found", target));
    // Initialization for passes that stop before the pods are counted.
    let uncounted = || {
        uninitialized.then(|| Initialization {
            node_name: target.to_string(),
            ..Default::default()
        })
    };

    match terminal(ctx.cluster.get_node(target).await)? {
        Ok(Some(_)) => {}
        Ok(None) => return Ok((uncounted(), not_found())),
        Err(outcome) => return Ok((uncounted(), outcome)),
    }

    let init = if uninitialized {
        let census = match terminal(drain::census(ctx.evictor.as_ref(), target).await)? {
            Ok(census) => census,
            Err(outcome) => return Ok((uncounted(), outcome)),
        };
        info!(
            "Starting maintenance of node '{}': {} pods, {} to evict",
            target,
            census.total,
            census.eligible.len()
        );
        Some(Initialization::from_census(target, &census))
    } else {
        None
    };

    let update = taints::update_node(
        ctx.cluster.as_ref(),
        target,
        NodeChange::Enter,
        ctx.config.conflict_retries,
    )
    .await;
    match terminal(update)? {
        Ok(NodeUpdate::NotFound) => return Ok((init, not_found())),
        Ok(_) => {}
        Err(outcome) => return Ok((init, outcome)),
    }

    if let Some(watcher) = &ctx.watcher {
        debug!(
            "Watcher sees {} pods on node '{}'",
            watcher.pods_on(target).len(),
            target
        );
    }
    let session = ctx
        .sessions
        .session(target, &nm.name_any(), &ctx.config.drain_settings());
    let report = match terminal(session.drain(ctx.evictor.as_ref()).await)? {
        Ok(report) => report,
        Err(outcome) => return Ok((init, outcome)),
    };
    if report.evicted > 0 {
        PODS_EVICTED_TOTAL
            .with_label_values(&[target])
            .inc_by(report.evicted as u64);
    }

    if !report.remaining.is_empty() {
        if let Some(limit) = nm.spec.max_wait_seconds {
            if waited_longer_than(nm, Duration::from_secs(limit)) {
                let message = format!(
                    "Node '{}' not drained within {}s, pods still pending: {}",
                    target,
                    limit,
                    report.remaining.join(", ")
                );
                return Ok((init, Outcome::Failed(message)));
            }
        }
        info!(
            "{} pods still pending on node '{}'",
            report.remaining.len(),
            target
        );
    }
    Ok((init, Outcome::Drained(report)))
}

/// Leaves retryable errors to the error policy. Anything else cannot be fixed
/// by retrying and ends the request.
fn terminal<T>(result: Result<T>) -> Result<Result<T, Outcome>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            warn!("Giving up after non-retryable error: {}", e);
            Ok(Err(Outcome::Failed(e.to_string())))
        }
    }
}

fn waited_longer_than(nm: &NodeMaintenance, limit: Duration) -> bool {
    let Some(Time(created)) = nm.metadata.creation_timestamp.as_ref() else {
        return false;
    };
    let created: SystemTime = (*created).into();
    SystemTime::now()
        .duration_since(created)
        .unwrap_or_default()
        > limit
}

async fn ensure_finalizer(ctx: &Context, nm: &NodeMaintenance) -> Result<NodeMaintenance> {
    if nm.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        return Ok(nm.clone());
    }
    let mut finalizers = nm.finalizers().to_vec();
    finalizers.push(FINALIZER_NAME.to_string());
    let updated = ctx
        .cluster
        .patch_maintenance_finalizers(nm, finalizers)
        .await?;
    debug!("Added finalizer to NodeMaintenance '{}'", nm.name_any());
    Ok(updated)
}

/// Removes the maintenance taints and uncordons the node.
async fn release_node(ctx: &Context, node_name: &str, request: &str) -> Result<()> {
    if node_name.is_empty() {
        return Ok(());
    }
    ctx.release(node_name, request);
    match taints::update_node(
        ctx.cluster.as_ref(),
        node_name,
        NodeChange::Release,
        ctx.config.conflict_retries,
    )
    .await?
    {
        NodeUpdate::NotFound => {
            debug!("Node '{}' is gone, nothing to release", node_name);
        }
        NodeUpdate::Updated(_) => info!("Node '{}' released from maintenance", node_name),
        NodeUpdate::Unchanged(_) => {}
    }
    Ok(())
}

/// Handle NodeMaintenance deletion
async fn cleanup(ctx: &Context, nm: &NodeMaintenance) -> Result<Action> {
    let name = nm.name_any();
    if !nm.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        return Ok(Action::await_change());
    }
    info!("Cleaning up NodeMaintenance '{}'", name);
    RECONCILES_TOTAL.with_label_values(&["cleanup"]).inc();

    release_node(ctx, nm.target_node(), &name).await?;

    let finalizers: Vec<String> = nm
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER_NAME)
        .cloned()
        .collect();
    ctx.cluster
        .patch_maintenance_finalizers(nm, finalizers)
        .await?;
    debug!("Removed finalizer from NodeMaintenance '{}'", name);
    Ok(Action::await_change())
}

/// Exponential backoff on error
pub fn error_policy(nm: Arc<NodeMaintenance>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        "Reconciliation of NodeMaintenance '{}' failed: {:?}",
        nm.name_any(),
        error
    );
    ERRORS_TOTAL
        .with_label_values(&["reconcile", error.metric_label()])
        .inc();
    let attempt = {
        let mut attempts = ctx.attempts();
        let attempt = attempts.entry(nm.name_any()).or_insert(0);
        *attempt += 1;
        *attempt
    };
    let base_secs = REQUEUE_TIME.as_secs();
    let max_secs = MAX_RETRY_TIME.as_secs();
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    let delay_s = base_secs.saturating_mul(factor).min(max_secs);
    Action::requeue(Duration::from_secs(delay_s))
}
