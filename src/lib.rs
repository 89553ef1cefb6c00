//! LBaaS-K8s: Kubernetes LoadBalancer services on cloud load balancers
//!
//! This crate reconciles `type: LoadBalancer` services onto a remote
//! load-balancing API (load balancers, listeners, pools, members and health
//! monitors) plus the networking API for floating IPs and security groups.

pub mod config;
pub mod controller;
pub mod error;
pub mod lbaas;
pub mod loadbalancer;
pub mod telemetry;
pub mod waiter;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
