use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use lbaas_k8s::config::CloudConfig;
use lbaas_k8s::lbaas::OpenStackClient;
use lbaas_k8s::loadbalancer::LoadBalancerEngine;
use lbaas_k8s::{controller, telemetry, Error};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the load balancer controller
    Run(RunArgs),
    /// Parse and validate a cloud configuration file
    CheckConfig(CheckConfigArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the cloud configuration file
    #[arg(long, env = "CLOUD_CONFIG")]
    cloud_config: PathBuf,

    /// Cluster name, part of every load balancer name
    #[arg(long, env = "CLUSTER_NAME", default_value = "kubernetes")]
    cluster_name: String,

    /// Namespace holding the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kube-system")]
    namespace: String,

    /// Listen address of the health and metrics server
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    api_addr: SocketAddr,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Parser, Debug)]
struct CheckConfigArgs {
    /// Path to the cloud configuration file
    #[arg(long, env = "CLOUD_CONFIG")]
    cloud_config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("LBaaS-K8s Controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::CheckConfig(check_args) => run_check_config(check_args),
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

fn run_check_config(args: CheckConfigArgs) -> Result<(), Error> {
    let config = CloudConfig::from_file(&args.cloud_config)?;
    println!("Configuration {} is valid", args.cloud_config.display());
    println!("Load balancer provider: {}", config.load_balancer.lb_provider);
    println!("Load balancer classes: {}", config.load_balancer_class.len());
    Ok(())
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    telemetry::init(args.log_json)?;

    info!(
        "Starting LBaaS-K8s Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cloud = CloudConfig::from_file(&args.cloud_config)?;
    let cloud_client = OpenStackClient::from_config(&cloud.global)?;
    let engine = LoadBalancerEngine::new(
        Arc::new(cloud_client.clone()),
        Arc::new(cloud_client),
        Arc::new(cloud),
    )
    .await?;

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    // Leader election configuration
    let leader_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));

    {
        let lease_client = client.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        let cancel_bg = cancel.clone();

        tokio::spawn(async move {
            run_leader_election(
                lease_client,
                &leader_namespace,
                &holder_identity,
                is_leader_bg,
                cancel_bg,
            )
            .await;
        });
    }

    // Create shared controller state
    let state = Arc::new(controller::ControllerState::new(
        client,
        Arc::new(engine),
        args.cluster_name.clone(),
        Arc::clone(&is_leader),
        cancel.clone(),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let api_addr = args.api_addr;
        tokio::spawn(async move {
            if let Err(e) = lbaas_k8s::rest_api::run_server(api_state, api_addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    let _ = args.api_addr;

    // Run the main controller loop
    let result = controller::run_controller(state).await;

    // Flush any remaining traces
    telemetry::shutdown();

    result
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    cancel.cancel();
}

const LEASE_NAME: &str = "lbaas-controller-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        let pause = match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                RENEW_INTERVAL
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                RETRY_INTERVAL
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                RETRY_INTERVAL
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                is_leader.store(false, Ordering::Relaxed);
                return;
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    let expiry = renew.0 + chrono::Duration::seconds(duration as i64);
                    now > expiry
                })
                .unwrap_or(true);

            if expired {
                info!(
                    "Lease held by {:?} has expired, taking over",
                    current_holder
                );
                let patch = serde_json::json!({
                    "spec": {
                        "holderIdentity": identity,
                        "acquireTime": MicroTime(now),
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
