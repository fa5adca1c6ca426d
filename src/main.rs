//! Local PV Provisioner
//!
//! Runs the volume controller against the cluster, plus health and
//! Prometheus endpoints.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localpv_provisioner::config::{parse_image_pull_secrets, DEFAULT_BASE_PATH, DEFAULT_HELPER_IMAGE};
use localpv_provisioner::{
    ControllerConfig, Error, KubeCluster, Provisioner, ProvisionerConfig, ProvisionerMetrics,
    Result, VolumeController,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local PV Provisioner - hostpath and block device backed local volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace for helper pods and block device claims
    #[arg(long, env = "OPENEBS_NAMESPACE")]
    namespace: String,

    /// Image used for helper pods
    #[arg(long, env = "OPENEBS_IO_HELPER_IMAGE", default_value = DEFAULT_HELPER_IMAGE)]
    helper_image: String,

    /// Default base path for hostpath volumes
    #[arg(long, env = "OPENEBS_IO_BASE_PATH", default_value = DEFAULT_BASE_PATH)]
    base_path: String,

    /// Service account helper pods run as
    #[arg(long, env = "OPENEBS_SERVICE_ACCOUNT", default_value = "")]
    service_account: String,

    /// Comma separated image pull secrets for helper pods
    #[arg(long, env = "OPENEBS_IO_IMAGE_PULL_SECRETS", default_value = "")]
    image_pull_secrets: String,

    /// Run helper pods on the host network ("true" to enable)
    #[arg(long, env = "OPENEBS_IO_HELPER_POD_HOST_NETWORK", default_value = "false")]
    helper_host_network: String,

    /// Number of block device claim checks before giving up
    #[arg(long = "bd-time-out", default_value = "12")]
    bd_time_out: u32,

    /// Seconds between reconcile passes
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "10")]
    resync_interval_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            namespace: self.namespace.clone(),
            helper_image: self.helper_image.clone(),
            default_base_path: self.base_path.clone(),
            service_account: self.service_account.clone(),
            image_pull_secrets: parse_image_pull_secrets(&self.image_pull_secrets),
            helper_host_network: self.helper_host_network.trim() == "true",
            claim_retry_count: self.bd_time_out,
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = args.provisioner_config();
    info!("Starting Local PV Provisioner");
    info!("  Version: {}", localpv_provisioner::VERSION);
    info!("  Namespace: {}", config.namespace);
    info!("  Helper image: {}", config.helper_image);
    info!("  Base path: {}", config.default_base_path);
    info!("  BDC retries: {}", config.claim_retry_count);

    let registry = prometheus::Registry::new();
    let metrics = ProvisionerMetrics::register(&registry)
        .map_err(|e| Error::Internal(format!("Failed to register metrics: {}", e)))?;

    let cluster = KubeCluster::try_default().await?;
    let client = cluster.client().clone();
    let provisioner = Provisioner::new(Arc::new(cluster), config)?.with_metrics(metrics);

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!("Unable to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    let controller = VolumeController::new(
        client,
        Arc::new(provisioner),
        ControllerConfig {
            resync_interval: Duration::from_secs(args.resync_interval_secs),
            ..Default::default()
        },
    );
    controller.run(cancel).await;

    info!("Provisioner shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let directive = |d: &str| {
        d.parse::<tracing_subscriber::filter::Directive>()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", d, e)))
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, registry: prometheus::Registry) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = text_response(StatusCode::OK, buffer);
                                    if let Ok(value) = encoder.format_type().parse() {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    e.to_string(),
                                ),
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
