//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use tracing::{error, instrument};

use crate::controller::conversion::{is_load_balancer, service_spec};
use crate::controller::ControllerState;

use super::dto::{ErrorResponse, HealthResponse, LoadBalancerStatusResponse};

type ApiResponse<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
    })
}

/// Look up the load balancer of a service without changing anything
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn load_balancer_status(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResponse<LoadBalancerStatusResponse> {
    let api: Api<Service> = Api::namespaced(state.client.clone(), &namespace);

    let service = match api.get(&name).await {
        Ok(service) => service,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(
                    "not_found",
                    &format!("Service {namespace}/{name} not found"),
                )),
            ))
        }
        Err(e) => {
            error!("Failed to get service: {:?}", e);
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ));
        }
    };

    if !is_load_balancer(&service) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "not_load_balancer",
                &format!("Service {namespace}/{name} is not of type LoadBalancer"),
            )),
        ));
    }

    let spec = service_spec(&service);
    match state.engine.get_status(&state.cluster_name, &spec).await {
        Ok(address) => Ok(Json(LoadBalancerStatusResponse {
            namespace,
            name,
            exists: address.is_some(),
            address,
        })),
        Err(e) => {
            error!("Failed to look up load balancer: {}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new("lookup_failed", &e.to_string())),
            ))
        }
    }
}
