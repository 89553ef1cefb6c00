//! Deterministic names for remote resources
//!
//! The load balancer name is the identity key used for lookups, so it must
//! never change for a given service. Sub-resource names are informational.

const MAX_NAME_LEN: usize = 255;
const LEGACY_NAME_LEN: usize = 32;

/// Names and tags derived from one service identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceNames {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ServiceNames {
    pub fn new(cluster: &str, namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Name used for new load balancers
    pub fn primary(&self) -> String {
        truncate(
            &format!(
                "kube_service_{}_{}_{}",
                self.cluster, self.namespace, self.name
            ),
            MAX_NAME_LEN,
        )
    }

    /// Name given by older releases; only ever looked up
    pub fn legacy(&self) -> Option<String> {
        if self.uid.is_empty() {
            return None;
        }
        let compact: String = self.uid.chars().filter(|c| *c != '-').collect();
        Some(truncate(&format!("a{compact}"), LEGACY_NAME_LEN))
    }

    /// Lookup keys in priority order
    pub fn candidates(&self) -> Vec<String> {
        let mut names = vec![self.primary()];
        if let Some(legacy) = self.legacy() {
            names.push(legacy);
        }
        names
    }

    pub fn description(&self) -> String {
        format!(
            "Kubernetes external service {}/{} from cluster {}",
            self.namespace, self.name, self.cluster
        )
    }

    pub fn security_group(&self) -> String {
        truncate(
            &format!("lb-sg-{}-{}-{}", self.cluster, self.namespace, self.name),
            MAX_NAME_LEN,
        )
    }

    /// Description tag marking floating IPs allocated for this service
    pub fn floating_ip_description(&self) -> String {
        format!(
            "Floating IP for Kubernetes external service {}/{} from cluster {}",
            self.namespace, self.name, self.cluster
        )
    }

    pub fn display(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

pub fn listener_name(index: usize, lb_name: &str) -> String {
    truncate(&format!("listener_{index}_{lb_name}"), MAX_NAME_LEN)
}

pub fn pool_name(index: usize, lb_name: &str) -> String {
    truncate(&format!("pool_{index}_{lb_name}"), MAX_NAME_LEN)
}

pub fn monitor_name(index: usize, lb_name: &str) -> String {
    truncate(&format!("monitor_{index}_{lb_name}"), MAX_NAME_LEN)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
