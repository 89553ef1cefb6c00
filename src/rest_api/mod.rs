//! REST API module for operational endpoints
//!
//! Exposes health, Prometheus metrics and a read-only view of the load
//! balancer behind a service.

mod dto;
mod handlers;
mod server;

pub use server::run_server;
