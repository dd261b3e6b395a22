//! Controller registry
//!
//! The [`Manager`] keeps at most one live [`ClusterRecord`] per cluster uid.
//! `start` is idempotent: unchanged connection material is a no-op, changed
//! material replaces the record, and concurrent callers racing the install
//! all observe the single winner. Controller startup runs asynchronously in
//! the record's cancellation scope; if it fails, the record removes itself.
//!
//! Replicas that do not own a cluster can still hand out detached clients:
//! plain clients without controllers, cached per uid until the connection
//! material changes.
//!
//! Locks are never held across an await: the registry is a `DashMap` whose
//! guards live only for in-memory bookkeeping.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kube::ResourceExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use corral_common::crd::{ConnectionSnapshot, ManagedCluster};
use corral_common::{Error, Result, DEFAULT_HTTPS_PORT};

use crate::access::AccessControl;
use crate::controllers::{ClusterClients, ClusterControllers};
use crate::kubeconfig::{kubeconfig_for, Kubeconfig};
use crate::lister::ClusterLister;
use crate::record::ClusterRecord;
use crate::rest_config::{ClientFactory, RestConfig, RestConfigBuilder, DOWNSTREAM_READ_TIMEOUT};
use crate::status::ClusterStatusWriter;

/// Tunables for the registry
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Clusters allowed in controller startup at the same time
    pub start_concurrency: usize,
    /// Delay between downstream health probes during startup
    pub probe_interval: Duration,
    /// Bound on a single probe; a probe that runs out counts as failed
    pub probe_timeout: Duration,
    /// Consecutive failed probes after which startup is abandoned
    pub probe_failure_threshold: u32,
    /// Deadline for controllers to sync once started
    pub startup_timeout: Duration,
    /// Port of the management server, used in generated kubeconfigs
    pub https_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            start_concurrency: 50,
            probe_interval: Duration::from_secs(5),
            probe_timeout: DOWNSTREAM_READ_TIMEOUT,
            probe_failure_threshold: 3,
            startup_timeout: Duration::from_secs(10 * 60),
            https_port: DEFAULT_HTTPS_PORT,
        }
    }
}

/// Diagnostic view of one live record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordInfo {
    /// Cluster uid
    pub uid: String,
    /// Cluster object name
    pub name: String,
    /// Whether controllers have synced
    pub ready: bool,
}

/// Registry of per-cluster records
pub struct Manager {
    config: ManagerConfig,
    builder: RestConfigBuilder,
    clients: Arc<dyn ClientFactory>,
    controllers: Arc<dyn ClusterControllers>,
    status: Arc<dyn ClusterStatusWriter>,
    lister: Arc<dyn ClusterLister>,
    records: DashMap<String, Arc<ClusterRecord>>,
    detached: DashMap<String, (ConnectionSnapshot, Arc<ClusterClients>)>,
    start_permits: Semaphore,
}

impl Manager {
    /// Create an empty registry
    pub fn new(
        config: ManagerConfig,
        builder: RestConfigBuilder,
        clients: Arc<dyn ClientFactory>,
        controllers: Arc<dyn ClusterControllers>,
        status: Arc<dyn ClusterStatusWriter>,
        lister: Arc<dyn ClusterLister>,
    ) -> Arc<Self> {
        let start_permits = Semaphore::new(config.start_concurrency.max(1));
        Arc::new(Self {
            config,
            builder,
            clients,
            controllers,
            status,
            lister,
            records: DashMap::new(),
            detached: DashMap::new(),
            start_permits,
        })
    }

    /// Bring the cluster's record in line with the ownership decision
    ///
    /// Returns the live record when one exists after the call. `Ok(None)`
    /// means no record: not owned, deleted, or not yet connectable.
    pub async fn start(
        self: &Arc<Self>,
        cluster: &ManagedCluster,
        is_owner: bool,
    ) -> Result<Option<Arc<ClusterRecord>>> {
        let uid = cluster.cluster_uid();
        let name = cluster.name_any();

        if cluster.is_deleted() {
            self.detached.remove(&uid);
            self.stop_uid(&uid);
            return Ok(None);
        }
        if !is_owner {
            self.stop_uid(&uid);
            return Ok(None);
        }
        // Owners serve from the record
        self.detached.remove(&uid);

        let snapshot = cluster.connection_snapshot();
        if let Some(existing) = self.record(&uid) {
            if existing.snapshot() == &snapshot {
                return Ok(Some(existing));
            }
            info!(cluster = %name, uid = %uid, "connection material changed, restarting");
            self.remove_record(&existing);
        }

        let rest = match self.builder.build(cluster).await {
            Ok(Some(rest)) => rest,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.build_failed(&name, e).await),
        };
        let client = match self.clients.client(&rest) {
            Ok(client) => client,
            Err(e) => {
                let e = Error::build(&name, "client", e.to_string());
                return Err(self.build_failed(&name, e).await);
            }
        };

        let record = Arc::new(ClusterRecord::new(
            uid,
            name.clone(),
            snapshot,
            ClusterClients {
                cluster: name,
                rest_config: rest,
                client,
            },
        ));

        let winner = self.install(Arc::clone(&record));
        if Arc::ptr_eq(&winner, &record) {
            self.spawn_startup(record);
        }
        Ok(Some(winner))
    }

    /// Cancel and remove the cluster's record, if any
    pub fn stop(&self, cluster: &ManagedCluster) {
        self.stop_uid(&cluster.cluster_uid());
    }

    /// Cancel and remove the record for `uid`; returns whether one existed
    pub fn stop_uid(&self, uid: &str) -> bool {
        match self.records.remove(uid) {
            Some((_, record)) => {
                record.cancel();
                info!(cluster = %record.name(), uid = %uid, "stopped cluster record");
                true
            }
            None => false,
        }
    }

    /// Stop every record whose uid is not in `known`
    ///
    /// Detached clients of vanished clusters are dropped as well.
    pub fn stop_unknown(&self, known: &HashSet<String>) -> usize {
        self.detached.retain(|uid, _| known.contains(uid));
        let orphans: Vec<String> = self
            .records
            .iter()
            .filter(|entry| !known.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        orphans.iter().filter(|uid| self.stop_uid(uid)).count()
    }

    /// Stop every record and drop every detached client
    pub fn stop_all(&self) {
        self.detached.clear();
        let uids: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        for uid in uids {
            self.stop_uid(&uid);
        }
    }

    /// Live record for `uid`
    pub fn record(&self, uid: &str) -> Option<Arc<ClusterRecord>> {
        self.records
            .get(uid)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|record| !record.is_cancelled())
    }

    /// Derived configuration for `uid`
    pub fn rest_config(&self, uid: &str) -> Result<RestConfig> {
        self.record(uid)
            .map(|r| r.rest_config().clone())
            .ok_or_else(|| Error::cluster_not_found(uid))
    }

    /// Client for `uid`
    pub fn client(&self, uid: &str) -> Result<kube::Client> {
        self.record(uid)
            .map(|r| r.clients().client.clone())
            .ok_or_else(|| Error::cluster_not_found(uid))
    }

    /// Access control evaluator for `uid`
    pub fn access_control(&self, uid: &str) -> Result<Arc<AccessControl>> {
        self.record(uid)
            .map(|r| Arc::clone(r.access_control()))
            .ok_or_else(|| Error::cluster_not_found(uid))
    }

    /// Live records, sorted by name
    pub fn records(&self) -> Vec<RecordInfo> {
        let mut infos: Vec<RecordInfo> = self
            .records
            .iter()
            .filter(|entry| !entry.value().is_cancelled())
            .map(|entry| RecordInfo {
                uid: entry.key().clone(),
                name: entry.value().name().to_string(),
                ready: entry.value().is_ready(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Client for a cluster by name, without installing a record or starting controllers
    pub async fn client_without_controllers(&self, cluster_name: &str) -> Result<kube::Client> {
        let cluster = self
            .lister
            .get(cluster_name)
            .ok_or_else(|| Error::cluster_not_found(cluster_name))?;
        self.detached_clients(&cluster)
            .await?
            .map(|clients| clients.client.clone())
            .ok_or_else(|| {
                Error::cluster_unavailable(cluster_name, "connection material not populated yet")
            })
    }

    /// Clients for a cluster without a record or controllers
    ///
    /// Built on first use and reused while the connection material is
    /// unchanged. `Ok(None)` when the cluster is not yet connectable. Build
    /// failures are returned without touching the cluster's status, which
    /// belongs to the owning replica.
    pub async fn detached_clients(
        &self,
        cluster: &ManagedCluster,
    ) -> Result<Option<Arc<ClusterClients>>> {
        let uid = cluster.cluster_uid();
        let snapshot = cluster.connection_snapshot();
        let cached = self
            .detached
            .get(&uid)
            .filter(|entry| entry.0 == snapshot)
            .map(|entry| Arc::clone(&entry.1));
        if cached.is_some() {
            return Ok(cached);
        }

        let name = cluster.name_any();
        let Some(rest) = self.builder.build(cluster).await? else {
            return Ok(None);
        };
        let client = self
            .clients
            .client(&rest)
            .map_err(|e| Error::build(&name, "client", e.to_string()))?;
        let clients = Arc::new(ClusterClients {
            cluster: name,
            rest_config: rest,
            client,
        });
        debug!(cluster = %clients.cluster, uid = %uid, "built detached client");
        self.detached.insert(uid, (snapshot, Arc::clone(&clients)));
        Ok(Some(clients))
    }

    /// Kubeconfig reaching `cluster_name` through the management server
    pub fn kubeconfig(&self, cluster_name: &str, token: &str) -> Kubeconfig {
        kubeconfig_for(cluster_name, token, self.config.https_port)
    }

    /// Port of the management server
    pub fn https_port(&self) -> u16 {
        self.config.https_port
    }

    /// Install `record` unless a live record with the same snapshot won the race
    ///
    /// Returns whichever record is installed afterwards.
    fn install(&self, record: Arc<ClusterRecord>) -> Arc<ClusterRecord> {
        match self.records.entry(record.uid().to_string()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if !current.is_cancelled() && current.snapshot() == record.snapshot() {
                    debug!(cluster = %record.name(), "concurrent start already installed a record");
                    record.cancel();
                    return Arc::clone(current);
                }
                let previous = slot.insert(Arc::clone(&record));
                previous.cancel();
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&record));
            }
        }
        info!(cluster = %record.name(), uid = %record.uid(), "installed cluster record");
        record
    }

    /// Remove `record` only if it is still the installed one, and cancel it
    fn remove_record(&self, record: &Arc<ClusterRecord>) {
        self.records
            .remove_if(record.uid(), |_, installed| Arc::ptr_eq(installed, record));
        record.cancel();
    }

    async fn build_failed(&self, name: &str, e: Error) -> Error {
        warn!(cluster = %name, error = %e, "failed to build cluster client");
        self.mark_unavailable(name, &e.to_string()).await;
        e
    }

    async fn mark_unavailable(&self, name: &str, message: &str) {
        if let Err(e) = self.status.mark_unavailable(name, message).await {
            warn!(cluster = %name, error = %e, "failed to mark cluster unavailable");
        }
    }

    fn spawn_startup(self: &Arc<Self>, record: Arc<ClusterRecord>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let token = record.token().clone();
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    debug!(cluster = %record.name(), "record stopped during startup");
                    return;
                }
                outcome = manager.run_startup(&record) => outcome,
            };

            match outcome {
                Ok(()) => {
                    record.mark_ready();
                    info!(cluster = %record.name(), "cluster controllers started");
                }
                Err(e) => {
                    error!(cluster = %record.name(), error = %e, "controller startup failed, removing record");
                    manager.remove_record(&record);
                    manager.mark_unavailable(record.name(), &e.to_string()).await;
                }
            }
        });
    }

    async fn probe(&self, record: &ClusterRecord) -> Result<()> {
        tokio::time::timeout(
            self.config.probe_timeout,
            self.controllers.probe(record.clients()),
        )
        .await
        .map_err(|_| {
            Error::startup(
                record.name(),
                format!("probe got no answer within {:?}", self.config.probe_timeout),
            )
        })?
    }

    async fn run_startup(&self, record: &ClusterRecord) -> Result<()> {
        let name = record.name();

        let mut failures = 0u32;
        while let Err(e) = self.probe(record).await {
            failures += 1;
            warn!(cluster = %name, attempt = failures, error = %e, "downstream API not reachable");
            if failures >= self.config.probe_failure_threshold {
                return Err(Error::startup(
                    name,
                    format!("downstream API unreachable after {failures} probes: {e}"),
                ));
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }

        let _permit = self
            .start_permits
            .acquire()
            .await
            .map_err(|_| Error::internal_with_context("registry", "start semaphore closed"))?;

        tokio::time::timeout(
            self.config.startup_timeout,
            self.controllers.start(
                Arc::clone(record.clients()),
                Arc::clone(record.access_control()),
                record.token().clone(),
            ),
        )
        .await
        .map_err(|_| {
            Error::startup(
                name,
                format!(
                    "controllers did not sync within {:?}",
                    self.config.startup_timeout
                ),
            )
        })?
    }
}
