//! Security group synchronization for the VIP and the backend nodes
//!
//! The VIP side is one security group per service, attached to the VIP
//! port. The node side is a set of rules, tagged with the VIP group name as
//! their description, spread over every security group used by a backend
//! node port. Both sides are reconciled by set difference.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lbaas::{
    ignore_not_found, Capabilities, CreateSecurityGroup, Feature, LoadBalancer, PortFilter, ResourceKind,
    RuleFilter, SecurityGroup, SecurityGroupRule, SecurityGroupRuleSpec,
};

use super::accessor::{record_mutation, Remote};
use super::desired::ServiceConfig;
use super::naming::ServiceNames;

const INGRESS: &str = "ingress";
const IPV4: &str = "IPv4";
const IPV6: &str = "IPv6";

/// Providers whose VIP traffic reaches the members from the member subnet
const SUBNET_SOURCED_PROVIDERS: &[&str] = &["amphora", "octavia"];

fn ethertype(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => IPV4,
        IpNet::V6(_) => IPV6,
    }
}

/// ICMP "fragmentation needed" rules for path MTU discovery
fn path_mtu_rules(group_id: &str, description: &str) -> [SecurityGroupRuleSpec; 2] {
    [
        SecurityGroupRuleSpec {
            security_group_id: group_id.to_string(),
            direction: INGRESS.to_string(),
            ethertype: IPV4.to_string(),
            protocol: Some("icmp".to_string()),
            port_range_min: Some(3),
            port_range_max: Some(4),
            remote_ip_prefix: Some("0.0.0.0/0".to_string()),
            remote_group_id: None,
            description: description.to_string(),
        },
        SecurityGroupRuleSpec {
            security_group_id: group_id.to_string(),
            direction: INGRESS.to_string(),
            ethertype: IPV6.to_string(),
            protocol: Some("ipv6-icmp".to_string()),
            port_range_min: Some(2),
            port_range_max: Some(0),
            remote_ip_prefix: Some("::/0".to_string()),
            remote_group_id: None,
            description: description.to_string(),
        },
    ]
}

/// Desired ingress rules of the VIP security group
///
/// Port rules are only needed when the backend cannot enforce the source
/// ranges on the listener itself.
pub fn vip_rules(
    group_id: &str,
    names: &ServiceNames,
    config: &ServiceConfig,
    caps: &Capabilities,
) -> BTreeSet<SecurityGroupRuleSpec> {
    let description = names.description();
    let mut rules: BTreeSet<SecurityGroupRuleSpec> =
        path_mtu_rules(group_id, &description).into_iter().collect();

    if !caps.supports(Feature::VipAcl) {
        for listener in &config.listeners {
            for range in &config.source_ranges {
                rules.insert(SecurityGroupRuleSpec {
                    security_group_id: group_id.to_string(),
                    direction: INGRESS.to_string(),
                    ethertype: ethertype(range).to_string(),
                    protocol: Some(listener.protocol.rule_protocol().to_string()),
                    port_range_min: Some(listener.port),
                    port_range_max: Some(listener.port),
                    remote_ip_prefix: Some(range.to_string()),
                    remote_group_id: None,
                    description: description.clone(),
                });
            }
        }
    }
    rules
}

/// Where node-side rules accept traffic from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRuleSource {
    Cidr(IpNet),
    Group(String),
}

/// Address families of the backends, IPv4 when none parses
fn backend_ethertypes(config: &ServiceConfig) -> BTreeSet<&'static str> {
    let mut families: BTreeSet<&'static str> = config
        .backends
        .iter()
        .filter_map(|b| b.address.parse::<IpAddr>().ok())
        .map(|ip| if ip.is_ipv4() { IPV4 } else { IPV6 })
        .collect();
    if families.is_empty() {
        families.insert(IPV4);
    }
    families
}

/// Desired node-side rules: every node group times every node port
///
/// A group source gets one rule per backend address family.
pub fn node_rules(
    node_groups: &BTreeSet<String>,
    source: &NodeRuleSource,
    tag: &str,
    config: &ServiceConfig,
) -> BTreeSet<SecurityGroupRuleSpec> {
    let sources: Vec<(&'static str, Option<String>, Option<String>)> = match source {
        NodeRuleSource::Cidr(net) => vec![(ethertype(net), Some(net.to_string()), None)],
        NodeRuleSource::Group(id) => backend_ethertypes(config)
            .into_iter()
            .map(|family| (family, None, Some(id.clone())))
            .collect(),
    };

    let mut rules = BTreeSet::new();
    for group in node_groups {
        for listener in &config.listeners {
            for (family, remote_ip_prefix, remote_group_id) in &sources {
                rules.insert(SecurityGroupRuleSpec {
                    security_group_id: group.clone(),
                    direction: INGRESS.to_string(),
                    ethertype: family.to_string(),
                    protocol: Some(listener.pool_protocol.rule_protocol().to_string()),
                    port_range_min: Some(listener.node_port),
                    port_range_max: Some(listener.node_port),
                    remote_ip_prefix: remote_ip_prefix.clone(),
                    remote_group_id: remote_group_id.clone(),
                    description: tag.to_string(),
                });
            }
        }
    }
    rules
}

/// Apply the set difference between `current` and `desired`
async fn apply_rule_diff(
    remote: &Remote<'_>,
    current: Vec<SecurityGroupRule>,
    desired: &BTreeSet<SecurityGroupRuleSpec>,
) -> Result<()> {
    let existing: HashSet<&SecurityGroupRuleSpec> = current.iter().map(|r| &r.spec).collect();

    for rule in current.iter().filter(|r| !desired.contains(&r.spec)) {
        info!(
            "Deleting security group rule {} from group {}",
            rule.id, rule.spec.security_group_id
        );
        ignore_not_found(remote.net.delete_security_group_rule(&rule.id).await)
            .map_err(Error::api(ResourceKind::SecurityGroupRule, Some(rule.id.as_str())))?;
        record_mutation(ResourceKind::SecurityGroupRule, "delete");
    }

    for spec in desired.iter().filter(|s| !existing.contains(s)) {
        info!(
            "Creating security group rule in group {} for {:?} port {:?}",
            spec.security_group_id, spec.protocol, spec.port_range_min
        );
        remote
            .net
            .create_security_group_rule(spec)
            .await
            .map_err(Error::api(ResourceKind::SecurityGroupRule, None))?;
        record_mutation(ResourceKind::SecurityGroupRule, "create");
    }
    Ok(())
}

async fn find_group(remote: &Remote<'_>, name: &str) -> Result<Option<SecurityGroup>> {
    let mut groups = remote
        .net
        .list_security_groups(name)
        .await
        .map_err(Error::api(ResourceKind::SecurityGroup, None))?;
    if groups.len() > 1 {
        warn!(
            "{} security groups are named {}, using {}",
            groups.len(),
            name,
            groups[0].id
        );
    }
    Ok(if groups.is_empty() {
        None
    } else {
        Some(groups.swap_remove(0))
    })
}

async fn ensure_group(remote: &Remote<'_>, names: &ServiceNames) -> Result<SecurityGroup> {
    let name = names.security_group();
    if let Some(group) = find_group(remote, &name).await? {
        return Ok(group);
    }
    info!("Creating security group {}", name);
    let group = remote
        .net
        .create_security_group(&CreateSecurityGroup {
            name,
            description: names.description(),
        })
        .await
        .map_err(Error::api(ResourceKind::SecurityGroup, None))?;
    record_mutation(ResourceKind::SecurityGroup, "create");
    Ok(group)
}

/// Security groups of the ports carrying the backend addresses
async fn node_security_groups(
    remote: &Remote<'_>,
    config: &ServiceConfig,
) -> Result<BTreeSet<String>> {
    let mut groups = BTreeSet::new();
    for backend in &config.backends {
        let Some(instance_id) = &backend.instance_id else {
            warn!(
                "Node {} has no instance id, its security groups are not managed",
                backend.name
            );
            continue;
        };
        let ports = remote
            .net
            .list_ports(&PortFilter {
                device_id: Some(instance_id.clone()),
                ..Default::default()
            })
            .await
            .map_err(Error::api(ResourceKind::Port, None))?;

        let carrying: Vec<_> = ports
            .iter()
            .filter(|p| p.fixed_ips.iter().any(|ip| ip.ip_address == backend.address))
            .collect();
        let selected = if carrying.is_empty() {
            ports.iter().collect()
        } else {
            carrying
        };
        for port in selected {
            groups.extend(port.security_groups.iter().cloned());
        }
    }
    Ok(groups)
}

async fn node_rule_source(
    remote: &Remote<'_>,
    lb: &LoadBalancer,
    config: &ServiceConfig,
    vip_group: &SecurityGroup,
) -> Result<NodeRuleSource> {
    let provider = if lb.provider.is_empty() {
        config.lb_provider.as_str()
    } else {
        lb.provider.as_str()
    };
    let subnet_sourced = SUBNET_SOURCED_PROVIDERS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(provider));

    if let (true, Some(subnet_id)) = (subnet_sourced, config.member_subnet()) {
        let subnet = remote
            .net
            .get_subnet(subnet_id)
            .await
            .map_err(Error::api(ResourceKind::Subnet, Some(subnet_id)))?;
        let cidr = subnet.cidr.parse::<IpNet>().map_err(|_| {
            Error::ConfigError(format!("subnet {} has invalid CIDR {}", subnet.id, subnet.cidr))
        })?;
        return Ok(NodeRuleSource::Cidr(cidr));
    }
    Ok(NodeRuleSource::Group(vip_group.id.clone()))
}

/// Converge both rule sets and attach the VIP group to the VIP port
pub async fn sync_firewall(
    remote: &Remote<'_>,
    names: &ServiceNames,
    lb: &LoadBalancer,
    config: &ServiceConfig,
    caps: &Capabilities,
) -> Result<()> {
    let group = ensure_group(remote, names).await?;

    let current_vip: Vec<SecurityGroupRule> = remote
        .net
        .list_security_group_rules(&RuleFilter {
            security_group_id: Some(group.id.clone()),
            ..Default::default()
        })
        .await
        .map_err(Error::api(ResourceKind::SecurityGroupRule, None))?
        .into_iter()
        .filter(|r| r.spec.direction == INGRESS)
        .collect();
    apply_rule_diff(remote, current_vip, &vip_rules(&group.id, names, config, caps)).await?;

    if !lb.vip_port_id.is_empty() {
        let port = remote
            .net
            .get_port(&lb.vip_port_id)
            .await
            .map_err(Error::api(ResourceKind::Port, Some(lb.vip_port_id.as_str())))?;
        if !port.security_groups.contains(&group.id) {
            info!("Attaching security group {} to VIP port {}", group.id, port.id);
            let mut groups = port.security_groups.clone();
            groups.push(group.id.clone());
            remote
                .net
                .update_port_security_groups(&port.id, &groups)
                .await
                .map_err(Error::api(ResourceKind::Port, Some(port.id.as_str())))?;
            record_mutation(ResourceKind::Port, "update");
        }
    }

    let tag = names.security_group();
    let node_groups = node_security_groups(remote, config).await?;
    let source = node_rule_source(remote, lb, config, &group).await?;
    let current_nodes = remote
        .net
        .list_security_group_rules(&RuleFilter {
            description: Some(tag.clone()),
            ..Default::default()
        })
        .await
        .map_err(Error::api(ResourceKind::SecurityGroupRule, None))?;
    debug!(
        "Syncing node rules over {} security groups for {}",
        node_groups.len(),
        names.display()
    );
    apply_rule_diff(
        remote,
        current_nodes,
        &node_rules(&node_groups, &source, &tag, config),
    )
    .await
}

/// Remove node rules, detach the VIP group from every port, delete it
pub async fn delete_firewall(remote: &Remote<'_>, names: &ServiceNames) -> Result<()> {
    let tag = names.security_group();

    let node_rules = remote
        .net
        .list_security_group_rules(&RuleFilter {
            description: Some(tag.clone()),
            ..Default::default()
        })
        .await
        .map_err(Error::api(ResourceKind::SecurityGroupRule, None))?;
    apply_rule_diff(remote, node_rules, &BTreeSet::new()).await?;

    let Some(group) = find_group(remote, &tag).await? else {
        debug!("Security group {} is already gone", tag);
        return Ok(());
    };

    let ports = remote
        .net
        .list_ports(&PortFilter {
            security_group_id: Some(group.id.clone()),
            ..Default::default()
        })
        .await
        .map_err(Error::api(ResourceKind::Port, None))?;
    for port in ports {
        let remaining: Vec<String> = port
            .security_groups
            .iter()
            .filter(|g| **g != group.id)
            .cloned()
            .collect();
        info!("Detaching security group {} from port {}", group.id, port.id);
        match remote
            .net
            .update_port_security_groups(&port.id, &remaining)
            .await
        {
            Ok(_) => record_mutation(ResourceKind::Port, "update"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(Error::api(ResourceKind::Port, Some(port.id.as_str()))(e)),
        }
    }

    info!("Deleting security group {}", group.id);
    ignore_not_found(remote.net.delete_security_group(&group.id).await)
        .map_err(Error::api(ResourceKind::SecurityGroup, Some(group.id.as_str())))?;
    record_mutation(ResourceKind::SecurityGroup, "delete");
    Ok(())
}
