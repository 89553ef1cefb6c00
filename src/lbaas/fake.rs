//! In-memory cloud used by the engine tests
//!
//! Implements both remote API traits over plain maps. Load balancer
//! mutations can be made to stay `PENDING_*` for a configurable number of
//! reads, during which further mutations are refused with a conflict.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::*;
use super::{ApiError, ApiResult, LoadBalancing, Networking};

#[derive(Default)]
struct State {
    next_id: u64,
    pending_reads: u32,
    lb_pending: HashMap<String, u32>,
    load_balancers: BTreeMap<String, LoadBalancer>,
    listeners: BTreeMap<String, Listener>,
    pools: BTreeMap<String, Pool>,
    members: BTreeMap<String, Vec<Member>>,
    monitors: BTreeMap<String, HealthMonitor>,
    ports: BTreeMap<String, Port>,
    subnets: BTreeMap<String, Subnet>,
    groups: BTreeMap<String, SecurityGroup>,
    rules: BTreeMap<String, SecurityGroupRule>,
    floating_ips: BTreeMap<String, FloatingIp>,
    failures: Vec<&'static str>,
    mutations: Vec<String>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn fail(&mut self, op: &'static str) -> ApiResult<()> {
        if let Some(pos) = self.failures.iter().position(|f| *f == op) {
            self.failures.remove(pos);
            return Err(ApiError::Status {
                code: 503,
                body: format!("injected failure in {op}"),
            });
        }
        Ok(())
    }

    fn record(&mut self, entry: String) {
        self.mutations.push(entry);
    }

    /// Refuse mutations while the parent load balancer is not ACTIVE
    fn guard(&self, lb_id: &str) -> ApiResult<()> {
        match self.load_balancers.get(lb_id) {
            Some(lb) if lb.provisioning_status.is_pending() => Err(ApiError::Conflict(format!(
                "load balancer {lb_id} is immutable in {}",
                lb.provisioning_status
            ))),
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound),
        }
    }

    fn touch(&mut self, lb_id: &str, status: ProvisioningStatus) {
        if self.pending_reads == 0 {
            return;
        }
        if let Some(lb) = self.load_balancers.get_mut(lb_id) {
            lb.provisioning_status = status;
            self.lb_pending.insert(lb_id.to_string(), self.pending_reads);
        }
    }

    fn pool_lb(&self, pool_id: &str) -> ApiResult<String> {
        self.pools
            .get(pool_id)
            .and_then(|p| p.loadbalancers.first())
            .map(|r| r.id.clone())
            .ok_or(ApiError::NotFound)
    }

    fn remove_pool(&mut self, pool_id: &str) {
        if let Some(pool) = self.pools.remove(pool_id) {
            self.members.remove(pool_id);
            if let Some(hm) = pool.healthmonitor_id {
                self.monitors.remove(&hm);
            }
            for listener in self.listeners.values_mut() {
                if listener.default_pool_id.as_deref() == Some(pool_id) {
                    listener.default_pool_id = None;
                }
            }
            for lb in self.load_balancers.values_mut() {
                lb.pools.retain(|r| r.id != pool_id);
            }
        }
    }

    fn remove_load_balancer(&mut self, lb_id: &str) {
        let pools: Vec<String> = self
            .pools
            .values()
            .filter(|p| p.loadbalancers.iter().any(|r| r.id == lb_id))
            .map(|p| p.id.clone())
            .collect();
        for pool in pools {
            self.remove_pool(&pool);
        }
        self.listeners
            .retain(|_, l| !l.loadbalancers.iter().any(|r| r.id == lb_id));
        if let Some(lb) = self.load_balancers.remove(lb_id) {
            self.ports.remove(&lb.vip_port_id);
        }
        self.lb_pending.remove(lb_id);
    }
}

pub(crate) struct FakeCloud {
    version: ApiVersion,
    state: Mutex<State>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new(ApiVersion::new(2, 25))
    }
}

impl FakeCloud {
    pub fn new(version: ApiVersion) -> Self {
        Self {
            version,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Keep load balancers `PENDING_*` for `reads` reads after each mutation
    pub fn set_pending_reads(&self, reads: u32) {
        self.state().pending_reads = reads;
    }

    /// Make the next call of `op` (e.g. `"create_listener"`) fail with a 503
    pub fn inject_failure(&self, op: &'static str) {
        self.state().failures.push(op);
    }

    pub fn add_subnet(&self, id: &str, network_id: &str, cidr: &str) {
        let ip_version = if cidr.contains(':') { 6 } else { 4 };
        self.state().subnets.insert(
            id.to_string(),
            Subnet {
                id: id.to_string(),
                network_id: network_id.to_string(),
                cidr: cidr.to_string(),
                ip_version,
            },
        );
    }

    /// Attach a port to a compute instance, returning its id
    pub fn add_node_port(
        &self,
        instance_id: &str,
        subnet_id: &str,
        address: &str,
        security_groups: &[&str],
    ) -> String {
        let mut state = self.state();
        let id = state.id("port");
        let network_id = state
            .subnets
            .get(subnet_id)
            .map(|s| s.network_id.clone())
            .unwrap_or_default();
        state.ports.insert(
            id.clone(),
            Port {
                id: id.clone(),
                name: String::new(),
                network_id,
                device_id: instance_id.to_string(),
                fixed_ips: vec![FixedIp {
                    subnet_id: subnet_id.to_string(),
                    ip_address: address.to_string(),
                }],
                security_groups: security_groups.iter().map(|s| s.to_string()).collect(),
            },
        );
        id
    }

    pub fn add_floating_ip(&self, address: &str, port_id: Option<&str>, description: &str) -> String {
        let mut state = self.state();
        let id = state.id("fip");
        state.floating_ips.insert(
            id.clone(),
            FloatingIp {
                id: id.clone(),
                floating_ip_address: address.to_string(),
                floating_network_id: "ext-net".to_string(),
                port_id: port_id.map(str::to_string),
                fixed_ip_address: None,
                description: description.to_string(),
            },
        );
        id
    }

    /// Insert a load balancer as if another actor had created it
    pub fn insert_load_balancer(&self, name: &str, status: ProvisioningStatus) -> String {
        let mut state = self.state();
        let id = state.id("lb");
        state.load_balancers.insert(
            id.clone(),
            LoadBalancer {
                id: id.clone(),
                name: name.to_string(),
                provider: "amphora".to_string(),
                provisioning_status: status,
                ..Default::default()
            },
        );
        id
    }

    pub fn set_lb_status(&self, id: &str, status: ProvisioningStatus) {
        if let Some(lb) = self.state().load_balancers.get_mut(id) {
            lb.provisioning_status = status;
        }
    }

    pub fn load_balancers(&self) -> Vec<LoadBalancer> {
        self.state().load_balancers.values().cloned().collect()
    }

    pub fn listeners(&self) -> Vec<Listener> {
        self.state().listeners.values().cloned().collect()
    }

    pub fn pools(&self) -> Vec<Pool> {
        self.state().pools.values().cloned().collect()
    }

    pub fn pool_members(&self, pool_id: &str) -> Vec<Member> {
        self.state()
            .members
            .get(pool_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn monitors(&self) -> Vec<HealthMonitor> {
        self.state().monitors.values().cloned().collect()
    }

    pub fn port(&self, id: &str) -> Option<Port> {
        self.state().ports.get(id).cloned()
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.state().groups.values().cloned().collect()
    }

    pub fn rules(&self) -> Vec<SecurityGroupRule> {
        self.state().rules.values().cloned().collect()
    }

    pub fn floating_ips(&self) -> Vec<FloatingIp> {
        self.state().floating_ips.values().cloned().collect()
    }

    /// Every mutating call so far, as `"<op> <target>"`
    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state().mutations.clear();
    }
}

#[async_trait]
impl LoadBalancing for FakeCloud {
    async fn api_version(&self) -> ApiResult<ApiVersion> {
        Ok(self.version)
    }

    async fn list_load_balancers(&self, name: &str) -> ApiResult<Vec<LoadBalancer>> {
        let mut state = self.state();
        state.fail("list_load_balancers")?;
        Ok(state
            .load_balancers
            .values()
            .filter(|lb| lb.name == name)
            .cloned()
            .collect())
    }

    async fn get_load_balancer(&self, id: &str) -> ApiResult<LoadBalancer> {
        let mut state = self.state();
        state.fail("get_load_balancer")?;
        match state.lb_pending.get(id).copied() {
            Some(remaining) if remaining > 0 => {
                state.lb_pending.insert(id.to_string(), remaining - 1);
            }
            Some(_) => {
                state.lb_pending.remove(id);
                let deleting = state
                    .load_balancers
                    .get(id)
                    .map(|lb| lb.provisioning_status == ProvisioningStatus::PendingDelete)
                    .unwrap_or(false);
                if deleting {
                    state.remove_load_balancer(id);
                } else if let Some(lb) = state.load_balancers.get_mut(id) {
                    lb.provisioning_status = ProvisioningStatus::Active;
                }
            }
            None => {}
        }
        state.load_balancers.get(id).cloned().ok_or(ApiError::NotFound)
    }

    async fn create_load_balancer(&self, opts: &CreateLoadBalancer) -> ApiResult<LoadBalancer> {
        let mut state = self.state();
        state.fail("create_load_balancer")?;
        let id = state.id("lb");
        let port_id = state.id("port");
        let subnet = opts
            .vip_subnet_id
            .as_ref()
            .and_then(|s| state.subnets.get(s))
            .cloned();
        let network_id = opts
            .vip_network_id
            .clone()
            .or_else(|| subnet.as_ref().map(|s| s.network_id.clone()))
            .unwrap_or_default();
        let vip_address = format!("10.0.0.{}", 100 + state.next_id);
        state.ports.insert(
            port_id.clone(),
            Port {
                id: port_id.clone(),
                name: format!("octavia-lb-{id}"),
                network_id: network_id.clone(),
                device_id: format!("lb-{id}"),
                fixed_ips: vec![FixedIp {
                    subnet_id: opts.vip_subnet_id.clone().unwrap_or_default(),
                    ip_address: vip_address.clone(),
                }],
                security_groups: Vec::new(),
            },
        );

        let status = if state.pending_reads > 0 {
            ProvisioningStatus::PendingCreate
        } else {
            ProvisioningStatus::Active
        };
        let lb = LoadBalancer {
            id: id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            vip_address,
            vip_port_id: opts.vip_port_id.clone().unwrap_or(port_id),
            vip_subnet_id: opts.vip_subnet_id.clone(),
            vip_network_id: Some(network_id),
            provider: opts.provider.clone(),
            provisioning_status: status,
            flavor_id: opts.flavor_id.clone(),
            availability_zone: opts.availability_zone.clone(),
            tags: opts.tags.clone(),
            ..Default::default()
        };
        state.load_balancers.insert(id.clone(), lb.clone());
        if state.pending_reads > 0 {
            let reads = state.pending_reads;
            state.lb_pending.insert(id.clone(), reads);
        }
        state.record(format!("create_load_balancer {}", opts.name));
        Ok(lb)
    }

    async fn delete_load_balancer(&self, id: &str, cascade: bool) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("delete_load_balancer")?;
        state.guard(id)?;
        let has_children = state
            .load_balancers
            .get(id)
            .map(|lb| !lb.listeners.is_empty() || !lb.pools.is_empty())
            .unwrap_or(false);
        if has_children && !cascade {
            return Err(ApiError::Status {
                code: 400,
                body: "Cannot delete Load Balancer - it has children".to_string(),
            });
        }
        state.record(format!("delete_load_balancer {id}"));
        if state.pending_reads > 0 {
            state.touch(id, ProvisioningStatus::PendingDelete);
        } else {
            state.remove_load_balancer(id);
        }
        Ok(())
    }

    async fn list_listeners(&self, lb_id: &str) -> ApiResult<Vec<Listener>> {
        let mut state = self.state();
        state.fail("list_listeners")?;
        Ok(state
            .listeners
            .values()
            .filter(|l| l.loadbalancers.iter().any(|r| r.id == lb_id))
            .cloned()
            .collect())
    }

    async fn create_listener(&self, opts: &CreateListener) -> ApiResult<Listener> {
        let mut state = self.state();
        state.fail("create_listener")?;
        state.guard(&opts.loadbalancer_id)?;
        let id = state.id("listener");
        let listener = Listener {
            id: id.clone(),
            name: opts.name.clone(),
            protocol: opts.protocol,
            protocol_port: opts.protocol_port,
            connection_limit: opts.connection_limit,
            default_pool_id: None,
            loadbalancers: vec![IdRef {
                id: opts.loadbalancer_id.clone(),
            }],
            timeouts: opts.timeouts.clone(),
            allowed_cidrs: opts.allowed_cidrs.clone(),
            insert_headers: opts.insert_headers.clone(),
            provisioning_status: ProvisioningStatus::Active,
            tags: opts.tags.clone(),
        };
        state.listeners.insert(id.clone(), listener.clone());
        if let Some(lb) = state.load_balancers.get_mut(&opts.loadbalancer_id) {
            lb.listeners.push(IdRef { id: id.clone() });
        }
        state.touch(&opts.loadbalancer_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("create_listener {}", opts.name));
        Ok(listener)
    }

    async fn update_listener(&self, id: &str, opts: &UpdateListener) -> ApiResult<Listener> {
        let mut state = self.state();
        state.fail("update_listener")?;
        let lb_id = state
            .listeners
            .get(id)
            .and_then(|l| l.loadbalancers.first())
            .map(|r| r.id.clone())
            .ok_or(ApiError::NotFound)?;
        state.guard(&lb_id)?;
        let listener = state.listeners.get_mut(id).ok_or(ApiError::NotFound)?;
        if let Some(limit) = opts.connection_limit {
            listener.connection_limit = limit;
        }
        let t = &opts.timeouts;
        if t.timeout_client_data.is_some() {
            listener.timeouts.timeout_client_data = t.timeout_client_data;
        }
        if t.timeout_member_connect.is_some() {
            listener.timeouts.timeout_member_connect = t.timeout_member_connect;
        }
        if t.timeout_member_data.is_some() {
            listener.timeouts.timeout_member_data = t.timeout_member_data;
        }
        if t.timeout_tcp_inspect.is_some() {
            listener.timeouts.timeout_tcp_inspect = t.timeout_tcp_inspect;
        }
        if let Some(cidrs) = &opts.allowed_cidrs {
            listener.allowed_cidrs = Some(cidrs.clone());
        }
        if let Some(headers) = &opts.insert_headers {
            listener.insert_headers = headers.clone();
        }
        let updated = listener.clone();
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("update_listener {id}"));
        Ok(updated)
    }

    async fn delete_listener(&self, id: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("delete_listener")?;
        let lb_id = state
            .listeners
            .get(id)
            .and_then(|l| l.loadbalancers.first())
            .map(|r| r.id.clone())
            .ok_or(ApiError::NotFound)?;
        state.guard(&lb_id)?;
        state.listeners.remove(id);
        for pool in state.pools.values_mut() {
            pool.listeners.retain(|r| r.id != id);
        }
        if let Some(lb) = state.load_balancers.get_mut(&lb_id) {
            lb.listeners.retain(|r| r.id != id);
        }
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("delete_listener {id}"));
        Ok(())
    }

    async fn list_pools(&self, lb_id: &str) -> ApiResult<Vec<Pool>> {
        let mut state = self.state();
        state.fail("list_pools")?;
        let pools: Vec<Pool> = state
            .pools
            .values()
            .filter(|p| p.loadbalancers.iter().any(|r| r.id == lb_id))
            .cloned()
            .collect();
        Ok(pools
            .into_iter()
            .map(|mut p| {
                p.members = state
                    .members
                    .get(&p.id)
                    .map(|ms| ms.iter().map(|m| IdRef { id: m.id.clone() }).collect())
                    .unwrap_or_default();
                p
            })
            .collect())
    }

    async fn create_pool(&self, opts: &CreatePool) -> ApiResult<Pool> {
        let mut state = self.state();
        state.fail("create_pool")?;
        let lb_id = state
            .listeners
            .get(&opts.listener_id)
            .and_then(|l| l.loadbalancers.first())
            .map(|r| r.id.clone())
            .ok_or(ApiError::NotFound)?;
        state.guard(&lb_id)?;
        let id = state.id("pool");
        let pool = Pool {
            id: id.clone(),
            name: opts.name.clone(),
            protocol: opts.protocol,
            lb_algorithm: opts.lb_algorithm.clone(),
            session_persistence: opts.session_persistence.clone(),
            listeners: vec![IdRef {
                id: opts.listener_id.clone(),
            }],
            loadbalancers: vec![IdRef { id: lb_id.clone() }],
            members: Vec::new(),
            healthmonitor_id: None,
            provisioning_status: ProvisioningStatus::Active,
        };
        state.pools.insert(id.clone(), pool.clone());
        if let Some(listener) = state.listeners.get_mut(&opts.listener_id) {
            listener.default_pool_id = Some(id.clone());
        }
        if let Some(lb) = state.load_balancers.get_mut(&lb_id) {
            lb.pools.push(IdRef { id: id.clone() });
        }
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("create_pool {}", opts.name));
        Ok(pool)
    }

    async fn update_pool(&self, id: &str, opts: &UpdatePool) -> ApiResult<Pool> {
        let mut state = self.state();
        state.fail("update_pool")?;
        let lb_id = state.pool_lb(id)?;
        state.guard(&lb_id)?;
        let pool = state.pools.get_mut(id).ok_or(ApiError::NotFound)?;
        pool.lb_algorithm = opts.lb_algorithm.clone();
        pool.session_persistence = opts.session_persistence.clone();
        let updated = pool.clone();
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("update_pool {id}"));
        Ok(updated)
    }

    async fn delete_pool(&self, id: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("delete_pool")?;
        let lb_id = state.pool_lb(id)?;
        state.guard(&lb_id)?;
        state.remove_pool(id);
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("delete_pool {id}"));
        Ok(())
    }

    async fn list_members(&self, pool_id: &str) -> ApiResult<Vec<Member>> {
        let mut state = self.state();
        state.fail("list_members")?;
        if !state.pools.contains_key(pool_id) {
            return Err(ApiError::NotFound);
        }
        Ok(state.members.get(pool_id).cloned().unwrap_or_default())
    }

    async fn batch_update_members(&self, pool_id: &str, members: &[MemberSpec]) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("batch_update_members")?;
        let lb_id = state.pool_lb(pool_id)?;
        state.guard(&lb_id)?;
        let existing = state.members.get(pool_id).cloned().unwrap_or_default();
        let mut next = Vec::with_capacity(members.len());
        for spec in members {
            let id = match existing
                .iter()
                .find(|m| m.address == spec.address && m.protocol_port == spec.protocol_port)
            {
                Some(m) => m.id.clone(),
                None => state.id("member"),
            };
            next.push(Member {
                id,
                name: spec.name.clone(),
                address: spec.address.clone(),
                protocol_port: spec.protocol_port,
                subnet_id: spec.subnet_id.clone(),
                provisioning_status: ProvisioningStatus::Active,
            });
        }
        state.members.insert(pool_id.to_string(), next);
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("batch_update_members {pool_id}"));
        Ok(())
    }

    async fn get_health_monitor(&self, id: &str) -> ApiResult<HealthMonitor> {
        let mut state = self.state();
        state.fail("get_health_monitor")?;
        state.monitors.get(id).cloned().ok_or(ApiError::NotFound)
    }

    async fn create_health_monitor(
        &self,
        opts: &CreateHealthMonitor,
    ) -> ApiResult<HealthMonitor> {
        let mut state = self.state();
        state.fail("create_health_monitor")?;
        let lb_id = state.pool_lb(&opts.pool_id)?;
        state.guard(&lb_id)?;
        let id = state.id("hm");
        let monitor = HealthMonitor {
            id: id.clone(),
            name: opts.name.clone(),
            type_: opts.type_.clone(),
            delay: opts.delay,
            timeout: opts.timeout,
            max_retries: opts.max_retries,
            max_retries_down: Some(opts.max_retries_down),
            pools: vec![IdRef {
                id: opts.pool_id.clone(),
            }],
            provisioning_status: ProvisioningStatus::Active,
        };
        state.monitors.insert(id.clone(), monitor.clone());
        if let Some(pool) = state.pools.get_mut(&opts.pool_id) {
            pool.healthmonitor_id = Some(id.clone());
        }
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("create_health_monitor {}", opts.name));
        Ok(monitor)
    }

    async fn delete_health_monitor(&self, id: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("delete_health_monitor")?;
        let pool_id = state
            .monitors
            .get(id)
            .and_then(|m| m.pools.first())
            .map(|r| r.id.clone())
            .ok_or(ApiError::NotFound)?;
        let lb_id = state.pool_lb(&pool_id)?;
        state.guard(&lb_id)?;
        state.monitors.remove(id);
        if let Some(pool) = state.pools.get_mut(&pool_id) {
            pool.healthmonitor_id = None;
        }
        state.touch(&lb_id, ProvisioningStatus::PendingUpdate);
        state.record(format!("delete_health_monitor {id}"));
        Ok(())
    }
}

#[async_trait]
impl Networking for FakeCloud {
    async fn list_ports(&self, filter: &PortFilter) -> ApiResult<Vec<Port>> {
        let mut state = self.state();
        state.fail("list_ports")?;
        Ok(state
            .ports
            .values()
            .filter(|p| filter.device_id.as_ref().map_or(true, |d| &p.device_id == d))
            .filter(|p| filter.network_id.as_ref().map_or(true, |n| &p.network_id == n))
            .filter(|p| {
                filter
                    .security_group_id
                    .as_ref()
                    .map_or(true, |g| p.security_groups.contains(g))
            })
            .cloned()
            .collect())
    }

    async fn get_port(&self, id: &str) -> ApiResult<Port> {
        let mut state = self.state();
        state.fail("get_port")?;
        state.ports.get(id).cloned().ok_or(ApiError::NotFound)
    }

    async fn update_port_security_groups(&self, id: &str, groups: &[String]) -> ApiResult<Port> {
        let mut state = self.state();
        state.fail("update_port_security_groups")?;
        let port = state.ports.get_mut(id).ok_or(ApiError::NotFound)?;
        port.security_groups = groups.to_vec();
        let updated = port.clone();
        state.record(format!("update_port_security_groups {id}"));
        Ok(updated)
    }

    async fn get_subnet(&self, id: &str) -> ApiResult<Subnet> {
        let mut state = self.state();
        state.fail("get_subnet")?;
        state.subnets.get(id).cloned().ok_or(ApiError::NotFound)
    }

    async fn list_security_groups(&self, name: &str) -> ApiResult<Vec<SecurityGroup>> {
        let mut state = self.state();
        state.fail("list_security_groups")?;
        Ok(state
            .groups
            .values()
            .filter(|g| g.name == name)
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        opts: &CreateSecurityGroup,
    ) -> ApiResult<SecurityGroup> {
        let mut state = self.state();
        state.fail("create_security_group")?;
        let id = state.id("sg");
        let group = SecurityGroup {
            id: id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
        };
        state.groups.insert(id, group.clone());
        state.record(format!("create_security_group {}", opts.name));
        Ok(group)
    }

    async fn delete_security_group(&self, id: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("delete_security_group")?;
        if state.ports.values().any(|p| p.security_groups.iter().any(|g| g == id)) {
            return Err(ApiError::Conflict(format!("security group {id} in use")));
        }
        state.groups.remove(id).ok_or(ApiError::NotFound)?;
        state.rules.retain(|_, r| r.spec.security_group_id != id);
        state.record(format!("delete_security_group {id}"));
        Ok(())
    }

    async fn list_security_group_rules(
        &self,
        filter: &RuleFilter,
    ) -> ApiResult<Vec<SecurityGroupRule>> {
        let mut state = self.state();
        state.fail("list_security_group_rules")?;
        Ok(state
            .rules
            .values()
            .filter(|r| {
                filter
                    .security_group_id
                    .as_ref()
                    .map_or(true, |g| &r.spec.security_group_id == g)
            })
            .filter(|r| {
                filter
                    .description
                    .as_ref()
                    .map_or(true, |d| &r.spec.description == d)
            })
            .cloned()
            .collect())
    }

    async fn create_security_group_rule(
        &self,
        spec: &SecurityGroupRuleSpec,
    ) -> ApiResult<SecurityGroupRule> {
        let mut state = self.state();
        state.fail("create_security_group_rule")?;
        if state.rules.values().any(|r| &r.spec == spec) {
            return Err(ApiError::Conflict("security group rule exists".to_string()));
        }
        let id = state.id("rule");
        let rule = SecurityGroupRule {
            id: id.clone(),
            spec: spec.clone(),
        };
        state.rules.insert(id.clone(), rule.clone());
        state.record(format!("create_security_group_rule {}", spec.security_group_id));
        Ok(rule)
    }

    async fn delete_security_group_rule(&self, id: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("delete_security_group_rule")?;
        state.rules.remove(id).ok_or(ApiError::NotFound)?;
        state.record(format!("delete_security_group_rule {id}"));
        Ok(())
    }

    async fn list_floating_ips(&self, filter: &FloatingIpFilter) -> ApiResult<Vec<FloatingIp>> {
        let mut state = self.state();
        state.fail("list_floating_ips")?;
        Ok(state
            .floating_ips
            .values()
            .filter(|f| {
                filter
                    .port_id
                    .as_ref()
                    .map_or(true, |p| f.port_id.as_ref() == Some(p))
            })
            .filter(|f| {
                filter
                    .floating_ip_address
                    .as_ref()
                    .map_or(true, |a| &f.floating_ip_address == a)
            })
            .cloned()
            .collect())
    }

    async fn create_floating_ip(&self, opts: &CreateFloatingIp) -> ApiResult<FloatingIp> {
        let mut state = self.state();
        state.fail("create_floating_ip")?;
        let id = state.id("fip");
        let address = opts
            .floating_ip_address
            .clone()
            .unwrap_or_else(|| format!("203.0.113.{}", state.next_id));
        let fixed_ip_address = opts
            .port_id
            .as_ref()
            .and_then(|p| state.ports.get(p))
            .and_then(|p| p.fixed_ips.first())
            .map(|ip| ip.ip_address.clone());
        let fip = FloatingIp {
            id: id.clone(),
            floating_ip_address: address,
            floating_network_id: opts.floating_network_id.clone(),
            port_id: opts.port_id.clone(),
            fixed_ip_address,
            description: opts.description.clone(),
        };
        state.floating_ips.insert(id, fip.clone());
        state.record(format!("create_floating_ip {}", opts.floating_network_id));
        Ok(fip)
    }

    async fn update_floating_ip_port(
        &self,
        id: &str,
        port_id: Option<&str>,
    ) -> ApiResult<FloatingIp> {
        let mut state = self.state();
        state.fail("update_floating_ip_port")?;
        let fixed = port_id
            .and_then(|p| state.ports.get(p))
            .and_then(|p| p.fixed_ips.first())
            .map(|ip| ip.ip_address.clone());
        let fip = state.floating_ips.get_mut(id).ok_or(ApiError::NotFound)?;
        fip.port_id = port_id.map(str::to_string);
        fip.fixed_ip_address = fixed;
        let updated = fip.clone();
        state.record(format!("update_floating_ip_port {id}"));
        Ok(updated)
    }

    async fn delete_floating_ip(&self, id: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.fail("delete_floating_ip")?;
        state.floating_ips.remove(id).ok_or(ApiError::NotFound)?;
        state.record(format!("delete_floating_ip {id}"));
        Ok(())
    }
}
