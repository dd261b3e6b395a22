//! Cluster sync loop
//!
//! Every pass walks all known clusters and brings the registry in line with
//! the current ownership decision. Passes are triggered by a new peer set,
//! by a change to any ManagedCluster, and by a timer that starts short and
//! backs off once a pass completes cleanly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use kube::ResourceExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_common::crd::ManagedCluster;
use corral_common::{AggregateError, Result};

use crate::lister::{ClusterChange, ClusterLister};
use crate::manager::Manager;
use crate::peers::{Membership, PeerSet, PeerState};

/// Timer and fan-out settings for the sync loop
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Timer interval until a pass succeeds, and after any failing pass
    pub initial_interval: Duration,
    /// Timer interval once passes succeed
    pub steady_interval: Duration,
    /// Clusters reconciled concurrently within one pass
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            steady_interval: Duration::from_secs(120),
            concurrency: 16,
        }
    }
}

impl SyncConfig {
    /// Interval to wait after a pass with the given outcome
    pub fn next_interval(&self, outcome: &std::result::Result<(), AggregateError>) -> Duration {
        match outcome {
            Ok(()) => self.steady_interval,
            Err(_) => self.initial_interval,
        }
    }
}

/// Drives `Manager::start`/`stop` for every known cluster
pub struct ClusterSync {
    manager: Arc<Manager>,
    lister: Arc<dyn ClusterLister>,
    peers: PeerState,
    // Serializes peer replacement with the pass it triggers
    peers_sync: Mutex<()>,
    config: SyncConfig,
}

impl ClusterSync {
    /// Create a sync loop over `lister`, deciding ownership from `peers`
    pub fn new(
        manager: Arc<Manager>,
        lister: Arc<dyn ClusterLister>,
        peers: PeerState,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            lister,
            peers,
            peers_sync: Mutex::new(()),
            config,
        })
    }

    /// Shared membership view, for readers such as the context resolver
    pub fn peers(&self) -> &PeerState {
        &self.peers
    }

    /// Replace the peer set and resync every cluster under it
    pub async fn set_peers(&self, peers: PeerSet) -> std::result::Result<(), AggregateError> {
        let _serial = self.peers_sync.lock().await;
        let version = self.peers.replace(peers.clone());
        info!(
            version,
            self_id = %peers.self_id(),
            peers = ?peers.ids(),
            leader = peers.is_leader(),
            ready = peers.is_ready(),
            "peer set updated"
        );
        self.pass().await
    }

    /// Resync every cluster against the current peer set
    pub async fn sync_all(&self) -> std::result::Result<(), AggregateError> {
        let _serial = self.peers_sync.lock().await;
        self.pass().await
    }

    /// Reconcile one cluster against `membership`
    pub async fn sync_cluster(&self, cluster: &ManagedCluster, membership: &Membership) -> Result<()> {
        if cluster.is_deleted() || !cluster.is_provisioned() {
            self.manager.stop(cluster);
            return Ok(());
        }
        let is_owner = membership.is_owner(&cluster.cluster_uid());
        self.manager.start(cluster, is_owner).await.map(|_| ())
    }

    async fn pass(&self) -> std::result::Result<(), AggregateError> {
        let membership = self.peers.membership();
        let clusters = self.lister.list();
        let total = clusters.len();

        let results: Vec<(String, Result<()>)> = stream::iter(clusters)
            .map(|cluster| {
                let membership = Arc::clone(&membership);
                async move {
                    let outcome = self.sync_cluster(&cluster, &membership).await;
                    (cluster.name_any(), outcome)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut errors = AggregateError::new();
        for (name, outcome) in results {
            if let Err(e) = outcome {
                warn!(cluster = %name, error = %e, "cluster sync failed");
                errors.push(e);
            }
        }

        // Listed again so clusters created during the pass are not treated as orphans
        let known: HashSet<String> = self
            .lister
            .list()
            .iter()
            .map(|c| c.cluster_uid())
            .collect();
        let orphans = self.manager.stop_unknown(&known);

        debug!(clusters = total, failed = errors.len(), orphans, "sync pass finished");
        errors.into_result()
    }

    /// Run until `shutdown` fires, then stop every record
    ///
    /// A closed channel disables its trigger; the timer keeps running. The
    /// timer is only re-armed when it fires or its interval changes, so a
    /// steady stream of change events cannot starve the periodic pass.
    pub async fn run(
        self: Arc<Self>,
        mut peers_rx: mpsc::Receiver<PeerSet>,
        mut changes_rx: mpsc::Receiver<ClusterChange>,
        shutdown: CancellationToken,
    ) {
        let mut interval = self.config.initial_interval;
        let mut peers_open = true;
        let mut changes_open = true;
        let timer = tokio::time::sleep(interval);
        tokio::pin!(timer);
        info!(?interval, "cluster sync loop started");

        loop {
            let mut ticked = false;
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = peers_rx.recv(), if peers_open => match received {
                    Some(mut peers) => {
                        // Only the newest membership matters
                        while let Ok(newer) = peers_rx.try_recv() {
                            peers = newer;
                        }
                        self.set_peers(peers).await
                    }
                    None => {
                        debug!("peer notifier closed");
                        peers_open = false;
                        continue;
                    }
                },
                received = changes_rx.recv(), if changes_open => match received {
                    Some(change) => {
                        let mut coalesced = 1usize;
                        while changes_rx.try_recv().is_ok() {
                            coalesced += 1;
                        }
                        debug!(?change, coalesced, "cluster changed, syncing");
                        self.sync_all().await
                    }
                    None => {
                        debug!("cluster change feed closed");
                        changes_open = false;
                        continue;
                    }
                },
                _ = &mut timer => {
                    ticked = true;
                    self.sync_all().await
                }
            };

            if let Err(e) = &outcome {
                warn!(error = %e, "sync pass finished with errors");
            }
            let next = self.config.next_interval(&outcome);
            if next != interval {
                info!(from = ?interval, to = ?next, "sync interval changed");
                interval = next;
                ticked = true;
            }
            if ticked {
                timer.as_mut().reset(Instant::now() + interval);
            }
        }

        self.manager.stop_all();
        info!("cluster sync loop stopped");
    }
}
