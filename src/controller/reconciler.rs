//! Service controller feeding the load-balancer engine
//!
//! Implements the controller pattern using kube-rs runtime. kube-runtime
//! runs at most one reconcile per service at a time, which is the
//! serialization the engine needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Node, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::loadbalancer::{BackendNode, LoadBalancerEngine, ServiceSpec};

use super::conversion::{
    backend_node, cleared_status, ingress_status, is_load_balancer, service_spec, EXCLUDE_LABEL,
};
use super::finalizers::{has_finalizer, remove_finalizer, LOAD_BALANCER_FINALIZER};

const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);
const TRANSIENT_REQUEUE: Duration = Duration::from_secs(30);
const CONFIG_REQUEUE: Duration = Duration::from_secs(300);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub engine: Arc<LoadBalancerEngine>,
    pub cluster_name: String,
    pub is_leader: Arc<AtomicBool>,
    /// Cancelled on shutdown so in-flight waits stop promptly
    pub cancel: CancellationToken,
    /// Spec fingerprint of the last successful full ensure, per service key
    fingerprints: Mutex<HashMap<String, u64>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        engine: Arc<LoadBalancerEngine>,
        cluster_name: String,
        is_leader: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            engine,
            cluster_name,
            is_leader,
            cancel,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    fn converged(&self, key: &str, fingerprint: u64) -> bool {
        self.fingerprints
            .lock()
            .map(|map| map.get(key) == Some(&fingerprint))
            .unwrap_or(false)
    }

    fn remember(&self, key: String, fingerprint: u64) {
        if let Ok(mut map) = self.fingerprints.lock() {
            map.insert(key, fingerprint);
        }
    }

    fn forget(&self, key: &str) {
        if let Ok(mut map) = self.fingerprints.lock() {
            map.remove(key);
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let services: Api<Service> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    info!("Starting LoadBalancer service controller");

    let controller = Controller::new(services, Config::default());
    let store = controller.store();

    controller
        // Any node change may alter the backend set of every load balancer
        .watches(nodes, Config::default(), move |_node: Node| {
            store
                .state()
                .into_iter()
                .filter(|svc| is_load_balancer(svc) || has_finalizer(svc))
                .map(|svc| ObjectRef::from_obj(svc.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled service {}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    service: &Service,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", service.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: service.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

async fn emit_event_logged(
    client: &Client,
    service: &Service,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    if let Err(e) = emit_event(client, service, event_type, reason, message).await {
        warn!("Failed to emit {} event: {}", reason, e);
    }
}

/// Nodes eligible to receive traffic
async fn list_backend_nodes(client: &Client) -> Result<Vec<BackendNode>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let params = ListParams::default().labels(&format!("!{EXCLUDE_LABEL}"));
    let list = nodes.list(&params).await.map_err(Error::KubeError)?;
    Ok(list.items.iter().filter_map(backend_node).collect())
}

async fn patch_status(api: &Api<Service>, name: &str, patch: serde_json::Value) -> Result<()> {
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// The main reconciliation function
///
/// Called whenever a service changes, any node changes, or the resync
/// timer expires.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = ?obj.namespace()))]
async fn reconcile(obj: Arc<Service>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }
    if !is_load_balancer(&obj) && !has_finalizer(&obj) {
        return Ok(Action::await_change());
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, LOAD_BALANCER_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(service) => apply_service(&ctx, &api, &service).await,
            FinalizerEvent::Cleanup(service) => cleanup_service(&ctx, &service).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn apply_service(
    ctx: &ControllerState,
    api: &Api<Service>,
    service: &Service,
) -> Result<Action> {
    let spec = service_spec(service);

    if !is_load_balancer(service) {
        info!(
            "Service {} is no longer a load balancer, releasing its resources",
            spec.key()
        );
        cleanup_service(ctx, service).await?;
        patch_status(api, &spec.name, cleared_status()).await?;
        remove_finalizer(api, service).await?;
        return Ok(Action::await_change());
    }

    if !ctx.engine.cloud_config().load_balancer.enabled {
        warn!(
            "Load balancers are disabled, ignoring service {}",
            spec.key()
        );
        return Ok(Action::await_change());
    }

    let nodes = list_backend_nodes(&ctx.client).await?;
    let fingerprint = spec.fingerprint();

    if ctx.converged(&spec.key(), fingerprint) {
        match ctx
            .engine
            .update(&ctx.cluster_name, &spec, &nodes, &ctx.cancel)
            .await
        {
            Ok(()) => return Ok(Action::requeue(RESYNC_INTERVAL)),
            Err(e @ (Error::LoadBalancerNotFound { .. } | Error::MissingResource { .. })) => {
                warn!("{}, running a full ensure", e);
            }
            Err(e) => return Err(e),
        }
    }

    ensure_service(ctx, api, service, &spec, &nodes).await?;
    ctx.remember(spec.key(), fingerprint);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn ensure_service(
    ctx: &ControllerState,
    api: &Api<Service>,
    service: &Service,
    spec: &ServiceSpec,
    nodes: &[BackendNode],
) -> Result<()> {
    emit_event_logged(
        &ctx.client,
        service,
        "Normal",
        "EnsuringLoadBalancer",
        "Ensuring load balancer",
    )
    .await;

    let address = match ctx
        .engine
        .ensure(&ctx.cluster_name, spec, nodes, &ctx.cancel)
        .await
    {
        Ok(address) => address,
        Err(e) => {
            emit_event_logged(
                &ctx.client,
                service,
                "Warning",
                "SyncLoadBalancerFailed",
                &format!("Error syncing load balancer: {e}"),
            )
            .await;
            return Err(e);
        }
    };

    patch_status(api, &spec.name, ingress_status(&address)).await?;
    emit_event_logged(
        &ctx.client,
        service,
        "Normal",
        "EnsuredLoadBalancer",
        &format!("Ensured load balancer at {address}"),
    )
    .await;
    Ok(())
}

async fn cleanup_service(ctx: &ControllerState, service: &Service) -> Result<Action> {
    let spec = service_spec(service);
    info!("Deleting load balancer of service {}", spec.key());

    if let Err(e) = ctx
        .engine
        .ensure_deleted(&ctx.cluster_name, &spec, &ctx.cancel)
        .await
    {
        emit_event_logged(
            &ctx.client,
            service,
            "Warning",
            "DeleteLoadBalancerFailed",
            &format!("Error deleting load balancer: {e}"),
        )
        .await;
        return Err(e);
    }

    ctx.forget(&spec.key());
    emit_event_logged(
        &ctx.client,
        service,
        "Normal",
        "DeletedLoadBalancer",
        "Deleted load balancer",
    )
    .await;
    Ok(Action::await_change())
}

/// Configuration problems wait for a change or a slow retry; everything
/// else retries sooner
fn error_policy(service: Arc<Service>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!(
        "Reconciliation error for {}/{}: {}",
        service.namespace().unwrap_or_default(),
        service.name_any(),
        error
    );

    let retry_duration = if error.is_config_error() {
        CONFIG_REQUEUE
    } else {
        TRANSIENT_REQUEUE
    };
    Action::requeue(retry_duration)
}
