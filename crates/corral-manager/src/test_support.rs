//! Fixtures shared by the unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{Request, Response};
use kube::client::Body;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use corral_common::crd::{
    ClusterDriver, Condition, ConditionStatus, ManagedCluster, ManagedClusterSpec,
    ManagedClusterStatus, CONDITION_PROVISIONED,
};
use corral_common::{Error, Result};

use crate::access::AccessControl;
use crate::controllers::{ClusterClients, ClusterControllers};
use crate::lister::StaticLister;
use crate::manager::{Manager, ManagerConfig};
use crate::rest_config::{MockClientFactory, MockSecretLookup, RestConfigBuilder};
use crate::status::{ClusterStatusWriter, MockClusterStatusWriter};
use crate::tunnel::{Dialer, DirectDialer, MockDialerFactory};

/// Base64 PEM of a throwaway self-signed certificate, the same on every call
pub(crate) fn ca_b64() -> String {
    static CA: OnceLock<String> = OnceLock::new();
    CA.get_or_init(|| {
        let cert = rcgen::generate_simple_self_signed(vec!["kubernetes".to_string()])
            .expect("self-signed cert");
        STANDARD.encode(cert.cert.pem())
    })
    .clone()
}

/// A provisioned imported cluster whose token secret is `<name>-token`
pub(crate) fn provisioned_cluster(name: &str, uid: &str, endpoint: &str) -> ManagedCluster {
    let mut c = ManagedCluster::new(
        name,
        ManagedClusterSpec {
            display_name: None,
            driver: ClusterDriver::Imported,
        },
    );
    c.metadata.uid = Some(uid.to_string());
    c.status = Some(ManagedClusterStatus {
        api_endpoint: endpoint.to_string(),
        ca_cert: ca_b64(),
        service_account_token_secret: format!("{name}-token"),
        conditions: vec![Condition::new(
            CONDITION_PROVISIONED,
            ConditionStatus::True,
            "Provisioned",
            "",
        )],
    });
    c
}

/// Client over a mock service; requests fail because nothing answers
pub(crate) fn mock_client() -> kube::Client {
    let (service, _handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    kube::Client::new(service, "default")
}

/// Poll `cond` until it holds, failing the test after a few seconds
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Controllers double with switchable failure modes
#[derive(Default)]
pub(crate) struct FakeControllers {
    pub probes: AtomicUsize,
    pub starts: AtomicUsize,
    pub exited: AtomicUsize,
    pub fail_probe: AtomicBool,
    pub hang_probe: AtomicBool,
    pub fail_start: AtomicBool,
    pub hang_start: AtomicBool,
}

#[async_trait]
impl ClusterControllers for Arc<FakeControllers> {
    async fn probe(&self, clients: &ClusterClients) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(Error::internal(format!("{} unreachable", clients.cluster)));
        }
        if self.hang_probe.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn start(
        &self,
        clients: Arc<ClusterClients>,
        access: Arc<AccessControl>,
        token: CancellationToken,
    ) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        // Stand-in for the watch tasks real controllers spawn
        let this = Arc::clone(self);
        let watch_token = token.clone();
        tokio::spawn(async move {
            watch_token.cancelled().await;
            this.exited.fetch_add(1, Ordering::SeqCst);
        });

        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::startup(&clients.cluster, "informer failed"));
        }
        if self.hang_start.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        access.mark_synced();
        Ok(())
    }
}

/// Status writer remembering every call
#[derive(Default)]
pub(crate) struct RecordingStatus {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingStatus {
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ClusterStatusWriter for RecordingStatus {
    async fn mark_unavailable(&self, cluster_name: &str, message: &str) -> Result<()> {
        self.calls
            .lock()
            .push((cluster_name.to_string(), message.to_string()));
        Ok(())
    }
}

/// A manager wired to fakes
pub(crate) struct Harness {
    pub manager: Arc<Manager>,
    pub controllers: Arc<FakeControllers>,
    pub lister: Arc<StaticLister>,
    pub status: Arc<RecordingStatus>,
    client_builds: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        let status = Arc::new(RecordingStatus::default());
        Self::build(Arc::clone(&status) as Arc<dyn ClusterStatusWriter>, status)
    }

    /// Use a mockall status writer with the given expectations
    pub fn with_status(setup: impl FnOnce(&mut MockClusterStatusWriter)) -> Self {
        let mut mock = MockClusterStatusWriter::new();
        setup(&mut mock);
        Self::build(Arc::new(mock), Arc::new(RecordingStatus::default()))
    }

    fn build(writer: Arc<dyn ClusterStatusWriter>, status: Arc<RecordingStatus>) -> Self {
        let mut secrets = MockSecretLookup::new();
        secrets
            .expect_token()
            .returning(|_, _| Ok(Some("sa-token".to_string())));

        let mut dialers = MockDialerFactory::new();
        dialers
            .expect_cluster_dialer()
            .returning(|_| Ok(Arc::new(DirectDialer) as Arc<dyn Dialer>));

        let client_builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&client_builds);
        let mut clients = MockClientFactory::new();
        clients.expect_client().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(mock_client())
        });

        let management = kube::Config::new("https://management.local:6443".parse().unwrap());
        let builder = RestConfigBuilder::new(management, Arc::new(dialers), Arc::new(secrets));

        let controllers = Arc::new(FakeControllers::default());
        let lister = Arc::new(StaticLister::default());
        let config = ManagerConfig {
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(500),
            startup_timeout: Duration::from_millis(200),
            ..ManagerConfig::default()
        };
        let manager = Manager::new(
            config,
            builder,
            Arc::new(clients),
            Arc::new(Arc::clone(&controllers)),
            writer,
            Arc::clone(&lister) as _,
        );

        Self {
            manager,
            controllers,
            lister,
            status,
            client_builds,
        }
    }

    pub fn client_builds(&self) -> usize {
        self.client_builds.load(Ordering::SeqCst)
    }
}
