//! Corral - multi-cluster management server

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::{Api, Client, CustomResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corral_common::crd::ManagedCluster;
use corral_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use corral_common::DEFAULT_HTTPS_PORT;
use corral_manager::{
    reflect_clusters, ClusterSync, DirectDialerFactory, KubeSecretLookup, KubeStatusWriter,
    Manager, ManagerConfig, PeerSet, PeerState, RbacControllers, RestConfigBuilder, SyncConfig,
    TunnelClientFactory,
};

/// Corral - shards downstream clusters across server replicas
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
struct Cli {
    /// Generate the ManagedCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// This replica's identity within the peer set
    #[arg(long, env = "CORRAL_PEER_ID")]
    peer_id: Option<String>,

    /// Every replica identity, comma separated; omit to own every cluster
    #[arg(long, env = "CORRAL_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Whether this replica is the elected leader
    #[arg(long, env = "CORRAL_LEADER")]
    leader: bool,

    /// Port of the management server, used in generated kubeconfigs
    #[arg(long, env = "CORRAL_HTTPS_PORT", default_value_t = DEFAULT_HTTPS_PORT)]
    https_port: u16,

    /// Clusters allowed in controller startup at the same time
    #[arg(long, env = "CORRAL_CONTROLLER_START_CONCURRENCY", default_value_t = 50)]
    controller_start_concurrency: usize,

    /// Sync interval until a pass succeeds (e.g. 5s, 2m)
    #[arg(long, env = "CORRAL_INITIAL_SYNC_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    initial_sync_interval: Duration,

    /// Sync interval once passes succeed
    #[arg(long, env = "CORRAL_STEADY_SYNC_INTERVAL", default_value = "120s", value_parser = parse_duration)]
    steady_sync_interval: Duration,

    /// Log encoding: json or pretty
    #[arg(long, env = "CORRAL_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Cli {
    /// Initial peer set, or `None` when no membership is configured
    fn peer_set(&self) -> anyhow::Result<Option<PeerSet>> {
        if self.peers.is_empty() {
            return Ok(None);
        }
        let self_id = self
            .peer_id
            .clone()
            .filter(|id| !id.is_empty())
            .context("--peer-id is required when --peers is set")?;
        let ids = self.peers.iter().map(|p| p.trim()).filter(|p| !p.is_empty());
        Ok(Some(PeerSet::new(self_id, ids, self.leader, true)))
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            start_concurrency: self.controller_start_concurrency,
            https_port: self.https_port,
            ..ManagerConfig::default()
        }
    }

    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            initial_interval: self.initial_sync_interval,
            steady_interval: self.steady_sync_interval,
            ..SyncConfig::default()
        }
    }
}

/// Parse `500ms`, `5s`, `2m`, `1h`, or a bare number of seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' is too large"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ManagedCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        log_format: cli.log_format,
        ..TelemetryConfig::default()
    })?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let initial_peers = cli.peer_set()?;

    let config = kube::Config::infer()
        .await
        .context("failed to load management cluster config")?;
    let client = Client::try_from(config.clone()).context("failed to build management client")?;
    let shutdown = CancellationToken::new();

    // Cluster listing plus change notifications
    let (changes_tx, changes_rx) = mpsc::channel(256);
    let (store, reflector) = reflect_clusters(
        Api::<ManagedCluster>::all(client.clone()),
        changes_tx,
        shutdown.clone(),
    );
    let lister = Arc::new(store.clone());

    let builder = RestConfigBuilder::new(
        config,
        Arc::new(DirectDialerFactory),
        Arc::new(KubeSecretLookup::new(client.clone())),
    );
    let manager = Manager::new(
        cli.manager_config(),
        builder,
        Arc::new(TunnelClientFactory::new(client.clone())),
        Arc::new(RbacControllers),
        Arc::new(KubeStatusWriter::new(client)),
        Arc::clone(&lister) as _,
    );

    let peers = match &initial_peers {
        Some(set) => PeerState::clustered(set.self_id()),
        None => PeerState::standalone(),
    };
    let sync = ClusterSync::new(manager, lister, peers, cli.sync_config());

    // Static membership: one notification, then the channel closes
    let (peers_tx, peers_rx) = mpsc::channel(1);
    match initial_peers {
        Some(set) => {
            tracing::info!(self_id = %set.self_id(), peers = ?set.ids(), leader = set.is_leader(), "running clustered");
            peers_tx
                .send(set)
                .await
                .context("peer channel closed before start")?;
        }
        None => tracing::info!("no peers configured, owning every cluster"),
    }
    drop(peers_tx);

    store
        .wait_until_ready()
        .await
        .context("ManagedCluster reflector stopped before its first list")?;
    tracing::info!("ManagedCluster cache synced");

    let sync_task = tokio::spawn(sync.run(peers_rx, changes_rx, shutdown.clone()));

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    shutdown.cancel();

    sync_task.await.context("sync loop panicked")?;
    reflector.await.context("reflector panicked")?;
    tracing::info!("corral stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
