//! Platform agent binary: joins the leader election for its agent identity
//! and, while leading, runs the outbound channel against the configured
//! session backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use streamspace::agent::docker::DockerBackend;
use streamspace::agent::kubernetes::KubernetesBackend;
use streamspace::agent::{AgentConfig, SessionBackend, run_agent};
use streamspace::election::file::FileLease;
use streamspace::election::kubernetes::KubernetesLease;
use streamspace::election::redis::RedisLease;
use streamspace::election::swarm::SwarmLease;
use streamspace::election::{LeaseBackend, LeaseConfig, run_elector};
use streamspace::model::Platform;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlatformArg {
    Kubernetes,
    Docker,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ElectionArg {
    Kubernetes,
    Redis,
    File,
    Swarm,
}

#[derive(Debug, Parser)]
#[command(name = "streamspace-agent", about = "StreamSpace platform agent")]
struct Cli {
    /// Control plane base URL (ws:// or wss://).
    #[arg(long, env = "STREAMSPACE_CP_URL", default_value = "ws://localhost:8080")]
    control_plane_url: String,

    /// Stable operator-assigned agent identity; survives restarts and
    /// failovers.
    #[arg(long, env = "STREAMSPACE_AGENT_ID")]
    agent_id: String,

    #[arg(long, env = "STREAMSPACE_PLATFORM", value_enum, default_value = "kubernetes")]
    platform: PlatformArg,

    #[arg(long, env = "STREAMSPACE_REGION")]
    region: Option<String>,

    #[arg(long, env = "STREAMSPACE_CLUSTER_ID")]
    cluster_id: Option<String>,

    #[arg(long, env = "STREAMSPACE_MAX_SESSIONS", default_value_t = 100)]
    max_sessions: i32,

    /// Shared secret presented on the channel upgrade.
    #[arg(long, env = "STREAMSPACE_AGENT_TOKEN")]
    agent_token: Option<String>,

    #[arg(long, env = "STREAMSPACE_HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Namespace for session resources and the coordination lease.
    #[arg(long, env = "STREAMSPACE_NAMESPACE", default_value = "streamspace")]
    namespace: String,

    #[arg(long, env = "STREAMSPACE_ELECTION_BACKEND", value_enum, default_value = "kubernetes")]
    election_backend: ElectionArg,

    /// Required when the election backend is redis.
    #[arg(long, env = "STREAMSPACE_ELECTION_REDIS_URL")]
    election_redis_url: Option<String>,

    /// Lock directory for the file election backend (replicas must share
    /// the host).
    #[arg(long, env = "STREAMSPACE_ELECTION_LOCK_DIR", default_value = "/var/lib/streamspace/leases")]
    election_lock_dir: PathBuf,

    #[arg(long, env = "STREAMSPACE_LEASE_DURATION_SECS", default_value_t = 15)]
    lease_duration_secs: u64,

    #[arg(long, env = "STREAMSPACE_LEASE_RENEW_DEADLINE_SECS", default_value_t = 10)]
    lease_renew_deadline_secs: u64,

    #[arg(long, env = "STREAMSPACE_LEASE_RETRY_PERIOD_SECS", default_value_t = 2)]
    lease_retry_period_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("STREAMSPACE_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let platform = match cli.platform {
        PlatformArg::Kubernetes => Platform::Kubernetes,
        PlatformArg::Docker => Platform::Docker,
    };

    let backend: Arc<dyn SessionBackend> = match platform {
        Platform::Kubernetes => {
            let client = kube::Client::try_default().await?;
            Arc::new(KubernetesBackend::new(client, cli.namespace.clone()))
        }
        Platform::Docker => Arc::new(DockerBackend::connect()?),
    };

    let lease_backend: Arc<dyn LeaseBackend> = match cli.election_backend {
        ElectionArg::Kubernetes => {
            let client = kube::Client::try_default().await?;
            Arc::new(KubernetesLease::new(client, &cli.namespace))
        }
        ElectionArg::Redis => {
            let url = cli.election_redis_url.clone().ok_or_else(|| {
                anyhow::anyhow!("STREAMSPACE_ELECTION_REDIS_URL required for redis election")
            })?;
            Arc::new(RedisLease::connect(&url).await?)
        }
        ElectionArg::File => Arc::new(FileLease::new(cli.election_lock_dir.clone())),
        ElectionArg::Swarm => Arc::new(SwarmLease::new()),
    };

    let lease_cfg = LeaseConfig {
        duration: Duration::from_secs(cli.lease_duration_secs),
        renew_deadline: Duration::from_secs(cli.lease_renew_deadline_secs),
        retry_period: Duration::from_secs(cli.lease_retry_period_secs),
    };

    // Each replica has a distinct identity; the agent_id is what they
    // contend for.
    let identity = format!("{}-{}", cli.agent_id, uuid::Uuid::new_v4().simple());
    let lease_name = format!("streamspace-agent-{}", cli.agent_id);

    let (leader_tx, leader_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    tokio::spawn(run_elector(
        lease_backend,
        identity,
        lease_name,
        lease_cfg,
        leader_tx,
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let agent_cfg = AgentConfig {
        control_plane_url: cli.control_plane_url,
        agent_id: cli.agent_id,
        platform,
        region: cli.region,
        cluster_id: cli.cluster_id,
        max_sessions: cli.max_sessions,
        agent_token: cli.agent_token,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
        metadata: None,
    };

    run_agent(agent_cfg, backend, leader_rx, shutdown_rx).await?;
    tracing::info!("agent stopped");
    Ok(())
}
