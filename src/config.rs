//! Cloud configuration
//!
//! Loaded once at startup from a TOML file and shared read-only with the
//! engine. Per-service annotations override `[load_balancer_class.<name>]`
//! entries, which override the `[load_balancer]` defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::waiter::Backoff;

/// Load-balancing algorithms accepted by the backend
pub const LB_METHODS: &[&str] = &[
    "ROUND_ROBIN",
    "LEAST_CONNECTIONS",
    "SOURCE_IP",
    "SOURCE_IP_PORT",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub global: GlobalOpts,

    #[serde(default)]
    pub load_balancer: LoadBalancerOpts,

    #[serde(default)]
    pub load_balancer_class: BTreeMap<String, LoadBalancerClass>,

    #[serde(default)]
    pub backoff: BackoffOpts,
}

/// Remote endpoints and credentials
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalOpts {
    #[serde(default)]
    pub lb_endpoint: String,

    #[serde(default)]
    pub network_endpoint: String,

    /// Pre-issued API token
    #[serde(default)]
    pub auth_token: Option<String>,

    /// File holding the API token; re-read on every start
    #[serde(default)]
    pub auth_token_file: Option<PathBuf>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GlobalOpts {
    fn default() -> Self {
        Self {
            lb_endpoint: String::new(),
            network_endpoint: String::new(),
            auth_token: None,
            auth_token_file: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl GlobalOpts {
    /// Token from `auth_token`, or from `auth_token_file` when set
    pub fn resolve_token(&self) -> Result<Option<String>> {
        if let Some(token) = &self.auth_token {
            return Ok(Some(token.clone()));
        }
        match &self.auth_token_file {
            Some(path) => {
                let token = std::fs::read_to_string(path).map_err(|e| {
                    Error::ConfigError(format!(
                        "Failed to read auth token file {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(token.trim().to_string()))
            }
            None => Ok(None),
        }
    }
}

/// Global load balancer defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadBalancerOpts {
    /// Disables the service controller entirely when false
    pub enabled: bool,
    pub subnet_id: Option<String>,
    pub network_id: Option<String>,
    pub member_subnet_id: Option<String>,
    pub floating_network_id: Option<String>,
    pub floating_subnet_id: Option<String>,
    pub lb_method: String,
    pub lb_provider: String,
    pub create_monitor: bool,
    pub monitor_delay: i32,
    pub monitor_timeout: i32,
    pub monitor_max_retries: i32,
    pub monitor_max_retries_down: i32,
    pub manage_security_groups: bool,
    pub internal_lb: bool,
    pub cascade_delete: bool,
    pub flavor_id: Option<String>,
    pub availability_zone: Option<String>,
    /// -1 means unlimited
    pub connection_limit: i32,
}

impl Default for LoadBalancerOpts {
    fn default() -> Self {
        Self {
            enabled: true,
            subnet_id: None,
            network_id: None,
            member_subnet_id: None,
            floating_network_id: None,
            floating_subnet_id: None,
            lb_method: "ROUND_ROBIN".to_string(),
            lb_provider: "amphora".to_string(),
            create_monitor: false,
            monitor_delay: 5,
            monitor_timeout: 3,
            monitor_max_retries: 1,
            monitor_max_retries_down: 3,
            manage_security_groups: false,
            internal_lb: false,
            cascade_delete: true,
            flavor_id: None,
            availability_zone: None,
            connection_limit: -1,
        }
    }
}

impl LoadBalancerOpts {
    pub fn validate(&self) -> Result<()> {
        if !LB_METHODS.contains(&self.lb_method.as_str()) {
            return Err(Error::ConfigError(format!(
                "lb_method {:?} is not one of {:?}",
                self.lb_method, LB_METHODS
            )));
        }
        if self.lb_provider.is_empty() {
            return Err(Error::ConfigError("lb_provider must not be empty".to_string()));
        }
        if self.create_monitor {
            if self.monitor_delay <= 0 || self.monitor_timeout <= 0 {
                return Err(Error::ConfigError(
                    "monitor_delay and monitor_timeout must be positive".to_string(),
                ));
            }
            if self.monitor_max_retries <= 0 || self.monitor_max_retries_down <= 0 {
                return Err(Error::ConfigError(
                    "monitor_max_retries and monitor_max_retries_down must be positive"
                        .to_string(),
                ));
            }
            if self.monitor_timeout > self.monitor_delay {
                return Err(Error::ConfigError(
                    "monitor_timeout must not exceed monitor_delay".to_string(),
                ));
            }
        }
        if self.connection_limit < -1 {
            return Err(Error::ConfigError(format!(
                "connection_limit {} is invalid, use -1 for unlimited",
                self.connection_limit
            )));
        }
        Ok(())
    }
}

/// Named override set selected with the `class` annotation
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerClass {
    #[serde(default)]
    pub floating_network_id: Option<String>,
    #[serde(default)]
    pub floating_subnet_id: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub member_subnet_id: Option<String>,
}

/// Waiter tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffOpts {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub activation_steps: u32,
    pub deletion_steps: u32,
}

impl Default for BackoffOpts {
    fn default() -> Self {
        Self {
            initial_delay_ms: Backoff::ACTIVATION.initial_delay.as_millis() as u64,
            factor: Backoff::ACTIVATION.factor,
            activation_steps: Backoff::ACTIVATION.steps,
            deletion_steps: Backoff::DELETION.steps,
        }
    }
}

impl BackoffOpts {
    pub fn activation(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            factor: self.factor,
            steps: self.activation_steps,
        }
    }

    pub fn deletion(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            factor: self.factor,
            steps: self.deletion_steps,
        }
    }
}

impl CloudConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse cloud config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.global.lb_endpoint.is_empty() {
            return Err(Error::ConfigError("global.lb_endpoint is required".to_string()));
        }
        if self.global.network_endpoint.is_empty() {
            return Err(Error::ConfigError(
                "global.network_endpoint is required".to_string(),
            ));
        }
        if self.backoff.factor < 1.0 || self.backoff.activation_steps == 0 {
            return Err(Error::ConfigError(
                "backoff.factor must be >= 1 and activation_steps positive".to_string(),
            ));
        }
        self.load_balancer.validate()
    }

    pub fn class(&self, name: &str) -> Result<&LoadBalancerClass> {
        self.load_balancer_class
            .get(name)
            .ok_or_else(|| Error::InvalidClass {
                class: name.to_string(),
            })
    }
}
