//! Conversion of Kubernetes objects into engine inputs

use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::loadbalancer::{
    AddressKind, BackendNode, NodeAddress, ServicePort, ServiceSpec, SessionAffinity,
};

/// Source ranges as an annotation, used when the spec field is empty
pub const ANN_SOURCE_RANGES: &str = "service.beta.kubernetes.io/load-balancer-source-ranges";

/// Nodes carrying this label never receive load-balancer traffic
pub const EXCLUDE_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";

const PROVIDER_PREFIX: &str = "openstack://";

/// A `type: LoadBalancer` service not delegated to another controller
pub fn is_load_balancer(service: &Service) -> bool {
    service.spec.as_ref().is_some_and(|spec| {
        spec.type_.as_deref() == Some("LoadBalancer") && spec.load_balancer_class.is_none()
    })
}

pub fn service_spec(service: &Service) -> ServiceSpec {
    let annotations = service.annotations().clone();
    let spec = service.spec.clone().unwrap_or_default();

    let ports = spec
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| ServicePort {
            name: p.name.unwrap_or_default(),
            protocol: p.protocol.unwrap_or_else(|| "TCP".to_string()),
            port: p.port,
            node_port: p.node_port.unwrap_or(0),
        })
        .collect();

    let session_affinity = match spec.session_affinity.as_deref() {
        Some("ClientIP") => SessionAffinity::ClientIp,
        _ => SessionAffinity::None,
    };

    let mut source_ranges = spec.load_balancer_source_ranges.unwrap_or_default();
    if source_ranges.is_empty() {
        if let Some(value) = annotations.get(ANN_SOURCE_RANGES) {
            source_ranges = value
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    ServiceSpec {
        namespace: service.namespace().unwrap_or_else(|| "default".to_string()),
        name: service.name_any(),
        uid: service.uid().unwrap_or_default(),
        ports,
        session_affinity,
        load_balancer_ip: spec.load_balancer_ip.filter(|ip| !ip.is_empty()),
        source_ranges,
        annotations,
    }
}

/// Compute instance id from a `providerID` like `openstack:///<id>`
pub fn instance_id(provider_id: &str) -> Option<String> {
    let rest = provider_id.strip_prefix(PROVIDER_PREFIX)?;
    rest.rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Backend view of a node, or `None` when it must not receive traffic
pub fn backend_node(node: &Node) -> Option<BackendNode> {
    let name = node.name_any();
    if node.labels().contains_key(EXCLUDE_LABEL) {
        debug!("Node {} is excluded from load balancers", name);
        return None;
    }
    if !is_ready(node) {
        debug!("Node {} is not ready", name);
        return None;
    }

    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter_map(|a| {
                    let kind = match a.type_.as_str() {
                        "InternalIP" => AddressKind::InternalIp,
                        "ExternalIP" => AddressKind::ExternalIp,
                        "Hostname" => AddressKind::Hostname,
                        _ => return None,
                    };
                    Some(NodeAddress {
                        kind,
                        address: a.address.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let instance_id = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .and_then(instance_id);

    Some(BackendNode {
        name,
        addresses,
        instance_id,
    })
}

/// `status` merge patch publishing the exposed address
pub fn ingress_status(address: &str) -> Value {
    let entry = if address.parse::<IpAddr>().is_ok() {
        json!({ "ip": address })
    } else {
        json!({ "hostname": address })
    };
    json!({
        "status": {
            "loadBalancer": {
                "ingress": [entry]
            }
        }
    })
}

/// `status` merge patch clearing the exposed address
pub fn cleared_status() -> Value {
    json!({
        "status": {
            "loadBalancer": {
                "ingress": []
            }
        }
    })
}
