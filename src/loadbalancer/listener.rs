//! Listener convergence
//!
//! Listeners are keyed by `(protocol, port)`. Existing listeners are taken
//! out of the caller's working set as they are matched; whatever is left
//! afterwards is obsolete.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lbaas::{CreateListener, Listener, Protocol, ResourceKind, UpdateListener};

use super::accessor::{record_mutation, Remote};
use super::desired::{ListenerSpec, ServiceConfig};
use super::naming;

/// Take the listener matching `(protocol, port)` out of `existing`
pub fn take_listener(existing: &mut Vec<Listener>, protocol: Protocol, port: i32) -> Option<Listener> {
    let position = existing
        .iter()
        .position(|l| l.protocol == protocol && l.protocol_port == port)?;
    Some(existing.remove(position))
}

/// Mutable fields of `current` that differ from the desired configuration
pub fn listener_diff(current: &Listener, config: &ServiceConfig) -> UpdateListener {
    let mut update = UpdateListener::default();

    if current.connection_limit != config.connection_limit {
        update.connection_limit = Some(config.connection_limit);
    }

    let want = &config.timeouts;
    let have = &current.timeouts;
    if want.timeout_client_data.is_some() && want.timeout_client_data != have.timeout_client_data {
        update.timeouts.timeout_client_data = want.timeout_client_data;
    }
    if want.timeout_member_connect.is_some()
        && want.timeout_member_connect != have.timeout_member_connect
    {
        update.timeouts.timeout_member_connect = want.timeout_member_connect;
    }
    if want.timeout_member_data.is_some() && want.timeout_member_data != have.timeout_member_data {
        update.timeouts.timeout_member_data = want.timeout_member_data;
    }
    if want.timeout_tcp_inspect.is_some() && want.timeout_tcp_inspect != have.timeout_tcp_inspect {
        update.timeouts.timeout_tcp_inspect = want.timeout_tcp_inspect;
    }

    if let Some(wanted) = &config.allowed_cidrs {
        let mut have: Vec<String> = current.allowed_cidrs.clone().unwrap_or_default();
        have.sort();
        let mut want = wanted.clone();
        want.sort();
        if have != want {
            update.allowed_cidrs = Some(wanted.clone());
        }
    }

    if current.protocol == Protocol::Http {
        let headers = config.insert_headers();
        if current.insert_headers != headers {
            update.insert_headers = Some(headers);
        }
    }

    update
}

/// Create or update the listener for one service port
#[allow(clippy::too_many_arguments)]
pub async fn ensure_listener(
    remote: &Remote<'_>,
    lb_id: &str,
    lb_name: &str,
    index: usize,
    spec: &ListenerSpec,
    config: &ServiceConfig,
    tags: &[String],
    existing: &mut Vec<Listener>,
) -> Result<Listener> {
    if let Some(listener) = take_listener(existing, spec.protocol, spec.port) {
        let update = listener_diff(&listener, config);
        if update.is_empty() {
            debug!(
                "Listener {} ({} {}) is up to date",
                listener.id, spec.protocol, spec.port
            );
            return Ok(listener);
        }

        info!(
            "Updating listener {} ({} {})",
            listener.id, spec.protocol, spec.port
        );
        let updated = remote
            .lb
            .update_listener(&listener.id, &update)
            .await
            .map_err(Error::api(ResourceKind::Listener, Some(listener.id.as_str())))?;
        record_mutation(ResourceKind::Listener, "update");
        remote.wait_active(lb_id).await?;
        return Ok(updated);
    }

    let opts = CreateListener {
        name: naming::listener_name(index, lb_name),
        loadbalancer_id: lb_id.to_string(),
        protocol: spec.protocol,
        protocol_port: spec.port,
        connection_limit: config.connection_limit,
        timeouts: config.timeouts.clone(),
        allowed_cidrs: config.allowed_cidrs.clone(),
        insert_headers: config.insert_headers(),
        tags: tags.to_vec(),
    };
    info!(
        "Creating listener {} ({} {}) on load balancer {}",
        opts.name, spec.protocol, spec.port, lb_id
    );
    let listener = remote
        .lb
        .create_listener(&opts)
        .await
        .map_err(Error::api(ResourceKind::Listener, None))?;
    record_mutation(ResourceKind::Listener, "create");
    remote.wait_active(lb_id).await?;
    Ok(listener)
}
