//! Finalizer handling for load-balancer services
//!
//! The finalizer keeps a `type: LoadBalancer` service around until its
//! cloud resources are gone. The kube-rs `finalizer` helper adds it and
//! removes it on deletion; [`remove_finalizer`] covers services that stop
//! being load balancers without being deleted.

use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::error::Result;

/// Same name the in-tree service controller uses
pub const LOAD_BALANCER_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

pub fn has_finalizer(service: &Service) -> bool {
    service
        .finalizers()
        .iter()
        .any(|f| f == LOAD_BALANCER_FINALIZER)
}

/// Drop our finalizer, keeping any others
pub async fn remove_finalizer(api: &Api<Service>, service: &Service) -> Result<()> {
    let finalizers: Vec<String> = service
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != LOAD_BALANCER_FINALIZER)
        .cloned()
        .collect();

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &service.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    info!(
        "Removed finalizer from service {}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    );
    Ok(())
}
