//! Controller module for LoadBalancer service reconciliation
//!
//! Watches `type: LoadBalancer` services and cluster nodes, and drives the
//! load-balancer engine for each service.

pub mod conversion;
mod finalizers;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;

pub use finalizers::LOAD_BALANCER_FINALIZER;
pub use reconciler::{run_controller, ControllerState};
