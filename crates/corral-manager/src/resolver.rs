//! Per-request resolution of cluster handles
//!
//! An API request is scoped to nothing (the management plane), to a cluster,
//! or to a project named `clusterID:projectName`. The resolver maps that
//! scope to the matching record's handles, starting the record on demand
//! when this replica owns the cluster.
//!
//! Every replica answers client and config lookups. A replica that does not
//! own the cluster serves them from detached clients that run no
//! controllers. Access decisions need synced RBAC caches, so only the owner
//! answers those.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::debug;

use corral_common::crd::ManagedCluster;
use corral_common::{Error, Result};

use crate::access::AccessControl;
use crate::controllers::ClusterClients;
use crate::lister::ClusterLister;
use crate::manager::Manager;
use crate::peers::PeerState;
use crate::record::ClusterRecord;
use crate::rest_config::{RestConfig, Transport};

/// Which store a request reads from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageContext {
    /// Unspecified; served by the management plane
    #[default]
    Default,
    /// The management plane's own objects
    Management,
    /// Objects inside a downstream cluster
    User,
}

/// Scope declared by an inbound request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestScope {
    /// Target store
    pub storage: StorageContext,
    /// Explicit cluster id
    pub cluster: Option<String>,
    /// Project id, `clusterID:projectName`
    pub project: Option<String>,
}

impl RequestScope {
    /// Scope of the management plane itself
    pub fn management() -> Self {
        Self {
            storage: StorageContext::Management,
            ..Self::default()
        }
    }

    /// Scope of one downstream cluster
    pub fn cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            storage: StorageContext::User,
            cluster: Some(cluster_id.into()),
            project: None,
        }
    }

    /// Scope of a project inside a downstream cluster
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            storage: StorageContext::User,
            cluster: None,
            project: Some(project_id.into()),
        }
    }

    /// Cluster the scope targets; `None` means the management plane
    ///
    /// An explicit cluster id wins over the project id. A project id without
    /// a `:` separator names no cluster.
    pub fn cluster_name(&self) -> Option<&str> {
        if self.storage != StorageContext::User {
            return None;
        }
        if let Some(cluster) = self.cluster.as_deref().filter(|c| !c.is_empty()) {
            return Some(cluster);
        }
        let project = self.project.as_deref()?;
        let mut parts = project.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(cluster), Some(_)) if !cluster.is_empty() => Some(cluster),
            _ => None,
        }
    }
}

/// Handles of the management plane, served for unscoped requests
#[derive(Clone)]
pub struct ManagementHandles {
    /// Evaluator over the management cluster's RBAC
    pub access: Arc<AccessControl>,
    /// Configuration of the management client
    pub config: kube::Config,
    /// The management client
    pub client: kube::Client,
}

/// Maps request scopes to cluster handles
pub struct ContextResolver {
    manager: Arc<Manager>,
    lister: Arc<dyn ClusterLister>,
    peers: PeerState,
    management: ManagementHandles,
}

impl ContextResolver {
    /// Create a resolver sharing the sync loop's membership view
    pub fn new(
        manager: Arc<Manager>,
        lister: Arc<dyn ClusterLister>,
        peers: PeerState,
        management: ManagementHandles,
    ) -> Self {
        Self {
            manager,
            lister,
            peers,
            management,
        }
    }

    /// Record serving `scope`; `None` for the management plane
    ///
    /// Only the owning replica has a record; elsewhere this is
    /// [`Error::ClusterUnavailable`].
    pub async fn record(&self, scope: &RequestScope) -> Result<Option<Arc<ClusterRecord>>> {
        let Some(cluster) = self.lookup(scope)? else {
            return Ok(None);
        };
        let is_owner = self.peers.is_owner(&cluster.cluster_uid());
        self.owned_record(&cluster, is_owner).await.map(Some)
    }

    /// Access control for `scope`
    ///
    /// A cluster's evaluator is only handed out once its caches have synced.
    pub async fn access_control(&self, scope: &RequestScope) -> Result<Arc<AccessControl>> {
        match self.record(scope).await? {
            None => Ok(Arc::clone(&self.management.access)),
            Some(record) if record.is_ready() => Ok(Arc::clone(record.access_control())),
            Some(record) => Err(Error::cluster_unavailable(
                record.name(),
                "cannot determine access, cluster controllers are not ready",
            )),
        }
    }

    /// Client configuration for `scope`
    pub async fn config(&self, scope: &RequestScope) -> Result<RestConfig> {
        Ok(match self.clients(scope).await? {
            None => RestConfig {
                config: self.management.config.clone(),
                transport: Transport::Management,
            },
            Some(clients) => clients.rest_config.clone(),
        })
    }

    /// Client for `scope`
    pub async fn client(&self, scope: &RequestScope) -> Result<kube::Client> {
        Ok(match self.clients(scope).await? {
            None => self.management.client.clone(),
            Some(clients) => clients.client.clone(),
        })
    }

    /// Cluster named by `scope`; `None` for the management plane
    fn lookup(&self, scope: &RequestScope) -> Result<Option<Arc<ManagedCluster>>> {
        let Some(name) = scope.cluster_name() else {
            return Ok(None);
        };
        let cluster = self
            .lister
            .get(name)
            .ok_or_else(|| Error::cluster_not_found(name))?;
        if cluster.is_deleted() {
            return Err(Error::cluster_unavailable(name, "cluster is being deleted"));
        }
        Ok(Some(cluster))
    }

    async fn owned_record(
        &self,
        cluster: &ManagedCluster,
        is_owner: bool,
    ) -> Result<Arc<ClusterRecord>> {
        let name = cluster.name_any();
        match self.manager.start(cluster, is_owner).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => {
                debug!(cluster = %name, is_owner, "no record for request scope");
                Err(Error::cluster_unavailable(
                    name,
                    if is_owner {
                        "connection details are not available yet"
                    } else {
                        "cluster is served by another replica"
                    },
                ))
            }
            Err(e) => Err(Error::cluster_unavailable(name, e.to_string())),
        }
    }

    /// Client handles for `scope`, from the record or a detached client
    async fn clients(&self, scope: &RequestScope) -> Result<Option<Arc<ClusterClients>>> {
        let Some(cluster) = self.lookup(scope)? else {
            return Ok(None);
        };
        if self.peers.is_owner(&cluster.cluster_uid()) {
            let record = self.owned_record(&cluster, true).await?;
            return Ok(Some(Arc::clone(record.clients())));
        }

        let name = cluster.name_any();
        match self.manager.detached_clients(&cluster).await {
            Ok(Some(clients)) => Ok(Some(clients)),
            Ok(None) => Err(Error::cluster_unavailable(
                name,
                "connection details are not available yet",
            )),
            Err(e) => Err(Error::cluster_unavailable(name, e.to_string())),
        }
    }
}
