use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rescale_core::{BoundsResolver, ReplicaCount};
use rescale_ops::{Scaler, ServiceQuery};
use rescale_swarm::{engine, DockerEngine, EngineEndpoint, SwarmServiceQuery};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rescalectl", version, about = "Scale orchestrator services by name")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Orchestrator backend
    #[arg(long = "backend", value_enum, global = true, env = "RESCALE_BACKEND", default_value_t = Backend::Swarm)]
    backend: Backend,

    /// Docker Engine address (unix:///path or tcp://host:port)
    #[arg(long = "docker-host", global = true, env = "DOCKER_HOST")]
    docker_host: Option<String>,

    /// Kubernetes namespace for the kube backend
    #[arg(long = "ns", global = true, env = "RESCALE_KUBE_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend { Swarm, Kube }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway until Ctrl-C
    Serve {
        #[arg(long = "listen", env = "RESCALE_LISTEN", default_value = "0.0.0.0:8081")]
        listen: String,
    },
    /// Scale a service once and print the update window
    Scale {
        name: String,
        replicas: ReplicaCount,
    },
    /// Show current replicas and resolved bounds
    Replicas {
        name: String,
    },
}

#[derive(Serialize)]
struct ScaleReport<'a> {
    service: &'a str,
    replicas: ReplicaCount,
    send_ns: i64,
    response_ns: i64,
}

fn init_tracing() {
    let env = std::env::var("RESCALE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RESCALE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RESCALE_METRICS_ADDR; expected host:port");
        }
    }
}

async fn build_query(cli: &Cli) -> Result<Arc<dyn ServiceQuery>> {
    let bounds = BoundsResolver::from_env();
    match cli.backend {
        Backend::Swarm => {
            let engine = match cli.docker_host.as_deref() {
                Some(host) => {
                    let version = std::env::var("RESCALE_DOCKER_API_VERSION").unwrap_or_else(|_| engine::DEFAULT_API_VERSION.to_string());
                    DockerEngine::new(EngineEndpoint::parse(host)?, version)
                }
                None => DockerEngine::from_env()?,
            };
            info!(endpoint = ?engine.endpoint(), min = bounds.default_min, max = bounds.default_max, "swarm backend");
            Ok(Arc::new(SwarmServiceQuery::new(engine, bounds)))
        }
        Backend::Kube => {
            let q = rescale_kubehub::KubeServiceQuery::try_default(&cli.namespace, bounds).await?;
            Ok(Arc::new(q))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let scaler = Scaler::new(build_query(&cli).await?);

    match &cli.command {
        Commands::Serve { listen } => {
            let listener = tokio::net::TcpListener::bind(listen.as_str()).await.with_context(|| format!("binding {}", listen))?;
            info!(addr = %listen, backend = ?cli.backend, "gateway listening");
            axum::serve(listener, rescale_api::build_router(scaler))
                .with_graceful_shutdown(async {
                    let _ = signal::ctrl_c().await;
                    info!("shutdown requested");
                })
                .await?;
        }
        Commands::Scale { name, replicas } => {
            let outcome = scaler.scale(name, *replicas).await;
            if let Err(e) = &outcome.result {
                error!(service = %name, error = %e, "scale failed");
                anyhow::bail!("scale {}: {}", name, e);
            }
            let w = outcome.window;
            match cli.output {
                Output::Human => match (w.start, w.end) {
                    (Some(s), Some(e)) => println!("{} → {} replicas (sent {}, done {}, {:.1} ms)", name, replicas, s.to_rfc3339(), e.to_rfc3339(), w.elapsed_ms().unwrap_or(0.0)),
                    _ => println!("nothing to scale"),
                },
                Output::Json => {
                    let report = ScaleReport { service: name, replicas: *replicas, send_ns: w.start_nanos(), response_ns: w.end_nanos() };
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Commands::Replicas { name } => {
            let b = scaler.replicas(name).await?;
            match cli.output {
                Output::Human => println!("{} • {} replicas • min {} • max {}", name, b.current, b.min, b.max),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rescale_api::ReplicaStatus::new(name, b))?),
            }
        }
    }
    Ok(())
}
