//! Read-only access to the cached set of ManagedClusters
//!
//! Production uses a kube reflector store fed by a watcher; the watcher also
//! emits change notifications so a single cluster's transition does not wait
//! for the next timer tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::TryStreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_common::crd::ManagedCluster;

/// Snapshot access to known clusters
pub trait ClusterLister: Send + Sync {
    /// Every cluster currently known
    fn list(&self) -> Vec<Arc<ManagedCluster>>;

    /// Look a cluster up by object name
    fn get(&self, name: &str) -> Option<Arc<ManagedCluster>>;
}

impl ClusterLister for Store<ManagedCluster> {
    fn list(&self) -> Vec<Arc<ManagedCluster>> {
        self.state()
    }

    fn get(&self, name: &str) -> Option<Arc<ManagedCluster>> {
        Store::get(self, &ObjectRef::new(name))
    }
}

/// A cluster object changed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterChange {
    /// Created or updated
    Applied(String),
    /// Removed from the API
    Deleted(String),
    /// The watcher finished a full relist
    Resynced,
}

/// Start a reflector over all ManagedClusters
///
/// Returns the store, plus the task driving it. Each observed event is
/// forwarded on `changes`; the task exits when `shutdown` fires or the
/// receiver goes away.
pub fn reflect_clusters(
    api: Api<ManagedCluster>,
    changes: mpsc::Sender<ClusterChange>,
    shutdown: CancellationToken,
) -> (Store<ManagedCluster>, JoinHandle<()>) {
    let (reader, writer) = reflector::store();

    let handle = tokio::spawn(async move {
        let mut stream = Box::pin(
            watcher::watcher(api, watcher::Config::default())
                .default_backoff()
                .reflect(writer),
        );

        info!("ManagedCluster reflector started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.try_next() => event,
            };

            let change = match event {
                Ok(Some(Event::Apply(cluster))) => ClusterChange::Applied(cluster.name_any()),
                Ok(Some(Event::Delete(cluster))) => ClusterChange::Deleted(cluster.name_any()),
                Ok(Some(Event::InitDone)) => ClusterChange::Resynced,
                Ok(Some(Event::Init | Event::InitApply(_))) => continue,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "ManagedCluster watch error");
                    continue;
                }
            };

            debug!(?change, "ManagedCluster changed");
            if changes.send(change).await.is_err() {
                debug!("change receiver closed, stopping reflector");
                break;
            }
        }
        info!("ManagedCluster reflector stopped");
    });

    (reader, handle)
}

/// Lister over a plain in-memory map
///
/// Used where no apiserver is available: tests, dry runs and tools that
/// load clusters from files.
#[derive(Debug, Default)]
pub struct StaticLister {
    clusters: RwLock<BTreeMap<String, Arc<ManagedCluster>>>,
}

impl StaticLister {
    /// Create a lister holding the given clusters
    pub fn new(clusters: impl IntoIterator<Item = ManagedCluster>) -> Self {
        let lister = Self::default();
        for cluster in clusters {
            lister.upsert(cluster);
        }
        lister
    }

    /// Insert or replace a cluster, keyed by name
    pub fn upsert(&self, cluster: ManagedCluster) {
        self.clusters
            .write()
            .insert(cluster.name_any(), Arc::new(cluster));
    }

    /// Drop a cluster
    pub fn remove(&self, name: &str) -> Option<Arc<ManagedCluster>> {
        self.clusters.write().remove(name)
    }
}

impl ClusterLister for StaticLister {
    fn list(&self) -> Vec<Arc<ManagedCluster>> {
        self.clusters.read().values().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<Arc<ManagedCluster>> {
        self.clusters.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_common::crd::ManagedClusterSpec;

    fn cluster(name: &str) -> ManagedCluster {
        ManagedCluster::new(name, ManagedClusterSpec::default())
    }

    #[test]
    fn test_static_lister_upsert_and_remove() {
        let lister = StaticLister::new([cluster("b"), cluster("a")]);
        let names: Vec<String> = lister.list().iter().map(|c| c.name_any()).collect();
        assert_eq!(names, ["a", "b"]);

        let mut updated = cluster("a");
        updated.spec.display_name = Some("renamed".to_string());
        lister.upsert(updated);
        assert_eq!(lister.list().len(), 2);
        assert_eq!(
            lister.get("a").and_then(|c| c.spec.display_name.clone()),
            Some("renamed".to_string())
        );

        assert!(lister.remove("a").is_some());
        assert!(lister.get("a").is_none());
        assert!(lister.remove("a").is_none());
    }

    #[test]
    fn test_reflector_store_lists_written_objects() {
        let (reader, mut writer) = reflector::store::<ManagedCluster>();
        writer.apply_watcher_event(&Event::Apply(cluster("c-1")));
        writer.apply_watcher_event(&Event::Apply(cluster("c-2")));

        let lister: &dyn ClusterLister = &reader;
        assert_eq!(lister.list().len(), 2);
        assert!(lister.get("c-1").is_some());

        writer.apply_watcher_event(&Event::Delete(cluster("c-1")));
        assert!(lister.get("c-1").is_none());
    }
}
