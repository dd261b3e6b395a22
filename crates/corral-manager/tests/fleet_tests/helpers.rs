//! Simulated replicas and cluster fixtures

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{Request, Response};
use kube::client::Body;
use tokio_util::sync::CancellationToken;

use corral_common::crd::{
    ClusterDriver, Condition, ConditionStatus, ManagedCluster, ManagedClusterSpec,
    ManagedClusterStatus, CONDITION_PROVISIONED,
};
use corral_common::Result;
use corral_manager::{
    AccessControl, ClientFactory, ClusterClients, ClusterControllers, ClusterStatusWriter,
    ClusterSync, DirectDialerFactory, Manager, ManagerConfig, PeerSet, PeerState, RestConfig,
    RestConfigBuilder, SecretLookup, StaticLister, SyncConfig,
};

/// Secrets always resolve to the same token
struct FixedToken;

#[async_trait]
impl SecretLookup for FixedToken {
    async fn token(&self, _namespace: &str, _name: &str) -> Result<Option<String>> {
        Ok(Some("sa-token".to_string()))
    }
}

/// Clients over a mock service nobody answers
struct OfflineClients;

impl ClientFactory for OfflineClients {
    fn client(&self, _rest: &RestConfig) -> Result<kube::Client> {
        let (service, _handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        Ok(kube::Client::new(service, "default"))
    }
}

/// Controllers that sync immediately
struct InstantControllers;

#[async_trait]
impl ClusterControllers for InstantControllers {
    async fn probe(&self, _clients: &ClusterClients) -> Result<()> {
        Ok(())
    }

    async fn start(
        &self,
        _clients: Arc<ClusterClients>,
        access: Arc<AccessControl>,
        _token: CancellationToken,
    ) -> Result<()> {
        access.mark_synced();
        Ok(())
    }
}

struct IgnoreStatus;

#[async_trait]
impl ClusterStatusWriter for IgnoreStatus {
    async fn mark_unavailable(&self, _cluster_name: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// One server replica
pub struct Replica {
    pub id: String,
    pub manager: Arc<Manager>,
    pub sync: Arc<ClusterSync>,
}

impl Replica {
    /// Replica in clustered mode, waiting for its first peer set
    pub fn clustered(id: &str, lister: &Arc<StaticLister>) -> Self {
        Self::with_peers(id, PeerState::clustered(id), lister)
    }

    /// Replica without peer membership
    pub fn standalone(lister: &Arc<StaticLister>) -> Self {
        Self::with_peers("solo", PeerState::standalone(), lister)
    }

    fn with_peers(id: &str, peers: PeerState, lister: &Arc<StaticLister>) -> Self {
        let builder = RestConfigBuilder::new(
            kube::Config::new("https://management.local:6443".parse().unwrap()),
            Arc::new(DirectDialerFactory),
            Arc::new(FixedToken),
        );
        let manager = Manager::new(
            ManagerConfig {
                probe_interval: Duration::from_millis(10),
                ..ManagerConfig::default()
            },
            builder,
            Arc::new(OfflineClients),
            Arc::new(InstantControllers),
            Arc::new(IgnoreStatus),
            Arc::clone(lister) as _,
        );
        let sync = ClusterSync::new(
            Arc::clone(&manager),
            Arc::clone(lister) as _,
            peers,
            SyncConfig::default(),
        );
        Self {
            id: id.to_string(),
            manager,
            sync,
        }
    }

    /// Push a membership of `ids` as seen by this replica
    pub async fn set_peers(&self, ids: &[&str]) {
        self.sync
            .set_peers(PeerSet::new(self.id.as_str(), ids.iter().copied(), true, true))
            .await
            .expect("sync pass");
    }

    /// Whether this replica holds a live record for `uid`
    pub fn holds(&self, uid: &str) -> bool {
        self.manager.record(uid).is_some()
    }
}

/// Base64 PEM of a throwaway self-signed certificate, the same on every call
pub fn ca_b64() -> String {
    static CA: OnceLock<String> = OnceLock::new();
    CA.get_or_init(|| {
        let cert = rcgen::generate_simple_self_signed(vec!["kubernetes".to_string()])
            .expect("self-signed cert");
        STANDARD.encode(cert.cert.pem())
    })
    .clone()
}

/// Imported cluster with complete connection material but not yet provisioned
pub fn pending_cluster(name: &str, uid: &str) -> ManagedCluster {
    let mut c = ManagedCluster::new(
        name,
        ManagedClusterSpec {
            display_name: None,
            driver: ClusterDriver::Imported,
        },
    );
    c.metadata.uid = Some(uid.to_string());
    c.status = Some(ManagedClusterStatus {
        api_endpoint: "https://10.1.0.1:6443".to_string(),
        ca_cert: ca_b64(),
        service_account_token_secret: format!("{name}-token"),
        conditions: Vec::new(),
    });
    c
}

/// Imported cluster ready to be started
pub fn provisioned_cluster(name: &str, uid: &str) -> ManagedCluster {
    let mut c = pending_cluster(name, uid);
    if let Some(status) = c.status.as_mut() {
        status.conditions.push(Condition::new(
            CONDITION_PROVISIONED,
            ConditionStatus::True,
            "Provisioned",
            "",
        ));
    }
    c
}
