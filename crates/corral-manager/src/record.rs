//! The runtime bundle installed for one managed cluster

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use corral_common::crd::ConnectionSnapshot;

use crate::access::AccessControl;
use crate::controllers::ClusterClients;
use crate::rest_config::RestConfig;

/// Derived clients plus the cancellable background work for one cluster
///
/// Owned by the [`Manager`](crate::Manager) registry. Cancelling the token
/// stops every task started on behalf of the record; a cancelled record is
/// never handed out again.
#[derive(Debug)]
pub struct ClusterRecord {
    uid: String,
    name: String,
    snapshot: ConnectionSnapshot,
    clients: Arc<ClusterClients>,
    access: Arc<AccessControl>,
    token: CancellationToken,
    ready: AtomicBool,
}

impl ClusterRecord {
    pub(crate) fn new(
        uid: String,
        name: String,
        snapshot: ConnectionSnapshot,
        clients: ClusterClients,
    ) -> Self {
        Self {
            uid,
            name,
            snapshot,
            clients: Arc::new(clients),
            access: Arc::new(AccessControl::new()),
            token: CancellationToken::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// Registry key
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Cluster object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection material the clients were built from
    pub fn snapshot(&self) -> &ConnectionSnapshot {
        &self.snapshot
    }

    /// Client bundle; the same `Arc` for the life of the record
    pub fn clients(&self) -> &Arc<ClusterClients> {
        &self.clients
    }

    /// Derived configuration
    pub fn rest_config(&self) -> &RestConfig {
        &self.clients.rest_config
    }

    /// Authorization evaluator fed by this record's controllers
    pub fn access_control(&self) -> &Arc<AccessControl> {
        &self.access
    }

    /// Token scoping every task started for this record
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the record has been stopped
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether controllers finished starting and the record was not stopped since
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.is_cancelled()
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}
