//! Background work run against a downstream cluster
//!
//! Once a record is installed, the manager probes the downstream API and
//! then starts the cluster's controllers inside the record's cancellation
//! scope. The production controllers mirror the cluster's RBAC objects into
//! the record's [`AccessControl`].

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_common::{Error, Result};

use crate::access::AccessControl;
use crate::rest_config::RestConfig;

/// Namespace every conformant cluster has; fetched to prove the API answers
pub const PROBE_NAMESPACE: &str = "kube-system";

/// Client handles derived for one cluster
#[derive(Clone)]
pub struct ClusterClients {
    /// Cluster object name
    pub cluster: String,
    /// Configuration the client was built from
    pub rest_config: RestConfig,
    /// Client scoped to the cluster
    pub client: kube::Client,
}

impl Debug for ClusterClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClients")
            .field("cluster", &self.cluster)
            .field("endpoint", &self.rest_config.config.cluster_url)
            .finish_non_exhaustive()
    }
}

/// Controllers launched for each owned cluster
#[async_trait]
pub trait ClusterControllers: Send + Sync {
    /// Check that the downstream API answers
    async fn probe(&self, clients: &ClusterClients) -> Result<()>;

    /// Start controllers and wait for their caches to sync
    ///
    /// Spawned work must exit once `token` is cancelled. Returning `Ok`
    /// means the access control caches are populated.
    async fn start(
        &self,
        clients: Arc<ClusterClients>,
        access: Arc<AccessControl>,
        token: CancellationToken,
    ) -> Result<()>;
}

/// Controllers mirroring downstream RBAC into the record's access control
#[derive(Clone, Copy, Debug, Default)]
pub struct RbacControllers;

#[async_trait]
impl ClusterControllers for RbacControllers {
    async fn probe(&self, clients: &ClusterClients) -> Result<()> {
        let api: Api<Namespace> = Api::all(clients.client.clone());
        match api.get(PROBE_NAMESPACE).await {
            Ok(_) => Ok(()),
            // Any answer from the apiserver proves it is reachable
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn start(
        &self,
        clients: Arc<ClusterClients>,
        access: Arc<AccessControl>,
        token: CancellationToken,
    ) -> Result<()> {
        let cluster = clients.cluster.clone();

        let roles_synced = spawn_watch(
            "clusterroles",
            &cluster,
            Api::<ClusterRole>::all(clients.client.clone()),
            token.clone(),
            role_handler(Arc::clone(&access)),
        );
        let bindings_synced = spawn_watch(
            "clusterrolebindings",
            &cluster,
            Api::<ClusterRoleBinding>::all(clients.client.clone()),
            token.clone(),
            binding_handler(Arc::clone(&access)),
        );

        tokio::select! {
            _ = token.cancelled() => {
                Err(Error::startup(&cluster, "cancelled before caches synced"))
            }
            synced = async { roles_synced.await.and(bindings_synced.await) } => {
                synced.map_err(|_| Error::startup(&cluster, "watch stopped before caches synced"))?;
                access.mark_synced();
                info!(cluster = %cluster, "RBAC caches synced");
                Ok(())
            }
        }
    }
}

/// Drive a watcher until `token` fires, feeding every event to `handle`
///
/// The returned receiver resolves after the first complete relist.
fn spawn_watch<K, F>(
    kind: &'static str,
    cluster: &str,
    api: Api<K>,
    token: CancellationToken,
    mut handle: F,
) -> oneshot::Receiver<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: FnMut(Event<K>) + Send + 'static,
{
    let (synced_tx, synced_rx) = oneshot::channel();
    let cluster = cluster.to_string();

    tokio::spawn(async move {
        let mut synced_tx = Some(synced_tx);
        let mut stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    let relisted = matches!(event, Event::InitDone);
                    handle(event);
                    if relisted {
                        if let Some(tx) = synced_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                }
                Some(Err(e)) => warn!(cluster = %cluster, kind, error = %e, "watch error"),
                None => break,
            }
        }
        debug!(cluster = %cluster, kind, "watch stopped");
    });

    synced_rx
}

fn role_handler(access: Arc<AccessControl>) -> impl FnMut(Event<ClusterRole>) + Send + 'static {
    let mut relist: Option<Vec<ClusterRole>> = None;
    move |event| match event {
        Event::Init => relist = Some(Vec::new()),
        Event::InitApply(role) => relist.get_or_insert_with(Vec::new).push(role),
        Event::InitDone => access.replace_roles(relist.take().unwrap_or_default()),
        Event::Apply(role) => access.apply_role(&role),
        Event::Delete(role) => access.delete_role(&role.name_any()),
    }
}

fn binding_handler(
    access: Arc<AccessControl>,
) -> impl FnMut(Event<ClusterRoleBinding>) + Send + 'static {
    let mut relist: Option<Vec<ClusterRoleBinding>> = None;
    move |event| match event {
        Event::Init => relist = Some(Vec::new()),
        Event::InitApply(binding) => relist.get_or_insert_with(Vec::new).push(binding),
        Event::InitDone => access.replace_bindings(relist.take().unwrap_or_default()),
        Event::Apply(binding) => access.apply_binding(&binding),
        Event::Delete(binding) => access.delete_binding(&binding.name_any()),
    }
}
