//! Client configuration for downstream clusters
//!
//! [`RestConfigBuilder`] turns the connection material on a ManagedCluster
//! into a `kube::Config` plus the dialer that reaches it. Incomplete material
//! is not an error: the builder answers `Ok(None)` and the next sync pass
//! tries again. Malformed material is a [`Error::Build`] naming the step
//! that failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hyper_util::rt::TokioExecutor;
use k8s_openapi::api::core::v1::Secret;
use kube::client::ConfigExt;
use kube::{Api, ResourceExt};
use secrecy::SecretString;
use tower::ServiceBuilder;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use corral_common::crd::ManagedCluster;
use corral_common::{Error, Result, CORRAL_SYSTEM_NAMESPACE, TOKEN_SECRET_KEY};

use crate::tunnel::{BoxError, Dialer, DialerFactory, TunnelConnector};

/// Read timeout on downstream connections
pub const DOWNSTREAM_READ_TIMEOUT: Duration = Duration::from_secs(45);

/// Bound on each external call made while building a config, and on each dial
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(10);

/// How requests reach the cluster
#[derive(Clone)]
pub enum Transport {
    /// The management plane's own client; no tunnel
    Management,
    /// Every connection is opened through this dialer
    Tunnel(Arc<dyn Dialer>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Management => write!(f, "Management"),
            Transport::Tunnel(_) => write!(f, "Tunnel"),
        }
    }
}

/// A derived client configuration
#[derive(Clone, Debug)]
pub struct RestConfig {
    /// Endpoint, CA roots, credentials and timeouts
    pub config: kube::Config,
    /// How connections are opened
    pub transport: Transport,
}

impl RestConfig {
    /// Whether this config targets the management cluster itself
    pub fn is_management(&self) -> bool {
        matches!(self.transport, Transport::Management)
    }
}

/// Resolves service account tokens referenced by clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretLookup: Send + Sync {
    /// Token stored under the `token` key of the Secret; `None` when the Secret or key is absent
    async fn token(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// [`SecretLookup`] reading Secrets from the management cluster
#[derive(Clone)]
pub struct KubeSecretLookup {
    client: kube::Client,
}

impl KubeSecretLookup {
    /// Create a lookup over the management client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretLookup for KubeSecretLookup {
    async fn token(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let Some(bytes) = secret.data.and_then(|mut d| d.remove(TOKEN_SECRET_KEY)) else {
            return Ok(None);
        };
        String::from_utf8(bytes.0)
            .map(Some)
            .map_err(|e| Error::validation_for_field(name, TOKEN_SECRET_KEY, e.to_string()))
    }
}

/// Derives [`RestConfig`]s for ManagedClusters
pub struct RestConfigBuilder {
    management: kube::Config,
    dialers: Arc<dyn DialerFactory>,
    secrets: Arc<dyn SecretLookup>,
    call_timeout: Duration,
}

impl RestConfigBuilder {
    /// Create a builder
    ///
    /// `management` is returned unchanged for the local cluster.
    pub fn new(
        management: kube::Config,
        dialers: Arc<dyn DialerFactory>,
        secrets: Arc<dyn SecretLookup>,
    ) -> Self {
        Self {
            management,
            dialers,
            secrets,
            call_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    /// Override the bound on secret lookups and dials
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Build the config for a cluster
    ///
    /// Returns `Ok(None)` when the cluster is not yet connectable: not
    /// provisioned, or endpoint, CA, token reference or token still empty.
    pub async fn build(&self, cluster: &ManagedCluster) -> Result<Option<RestConfig>> {
        let name = cluster.name_any();

        if cluster.is_local() {
            return Ok(Some(RestConfig {
                config: self.management.clone(),
                transport: Transport::Management,
            }));
        }

        let snapshot = cluster.connection_snapshot();
        if !cluster.is_provisioned() || !snapshot.is_complete() {
            debug!(cluster = %name, "connection material incomplete");
            return Ok(None);
        }

        let uri: http::Uri = snapshot
            .api_endpoint
            .parse()
            .map_err(|e| Error::build(&name, "endpoint", format!("{e}")))?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(Error::build(
                &name,
                "endpoint",
                format!("{} is not an absolute URL", snapshot.api_endpoint),
            ));
        }

        let roots = decode_ca_bundle(&snapshot.ca_cert).map_err(|m| Error::build(&name, "ca", m))?;

        let token = tokio::time::timeout(
            self.call_timeout,
            self.secrets
                .token(CORRAL_SYSTEM_NAMESPACE, &snapshot.service_account_token_secret),
        )
        .await
        .map_err(|_| Error::build(&name, "token", "timed out reading token secret"))?
        .map_err(|e| Error::build(&name, "token", e.to_string()))?;
        let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
            debug!(cluster = %name, secret = %snapshot.service_account_token_secret, "token not populated yet");
            return Ok(None);
        };

        let dialer = tokio::time::timeout(self.call_timeout, self.dialers.cluster_dialer(&name))
            .await
            .map_err(|_| Error::build(&name, "dialer", "timed out waiting for dialer"))?
            .map_err(|e| Error::build(&name, "dialer", e.to_string()))?;

        let mut config = kube::Config::new(uri);
        config.root_cert = Some(roots);
        config.auth_info.token = Some(SecretString::from(token.trim().to_string()));
        config.read_timeout = Some(DOWNSTREAM_READ_TIMEOUT);
        config.connect_timeout = Some(self.call_timeout);

        Ok(Some(RestConfig {
            config,
            transport: Transport::Tunnel(dialer),
        }))
    }
}

/// Decode a base64 PEM bundle into DER certificates, validating each one
pub fn decode_ca_bundle(ca_cert: &str) -> std::result::Result<Vec<Vec<u8>>, String> {
    let pem_bytes = STANDARD
        .decode(ca_cert.trim())
        .map_err(|e| format!("CA is not valid base64: {e}"))?;

    let mut roots = Vec::new();
    for pem in x509_parser::pem::Pem::iter_from_buffer(&pem_bytes) {
        let pem = pem.map_err(|e| format!("CA is not valid PEM: {e}"))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        x509_parser::parse_x509_certificate(&pem.contents)
            .map_err(|e| format!("CA certificate does not parse: {e}"))?;
        roots.push(pem.contents);
    }

    if roots.is_empty() {
        return Err("CA bundle contains no certificates".to_string());
    }
    Ok(roots)
}

/// Turns a [`RestConfig`] into a client
#[cfg_attr(test, automock)]
pub trait ClientFactory: Send + Sync {
    /// Build a client; never performs I/O
    fn client(&self, rest: &RestConfig) -> Result<kube::Client>;
}

/// Builds tunneled clients, reusing the management client for the local cluster
#[derive(Clone)]
pub struct TunnelClientFactory {
    management: kube::Client,
}

impl TunnelClientFactory {
    /// Create a factory around the management client
    pub fn new(management: kube::Client) -> Self {
        Self { management }
    }
}

impl ClientFactory for TunnelClientFactory {
    fn client(&self, rest: &RestConfig) -> Result<kube::Client> {
        match &rest.transport {
            Transport::Management => Ok(self.management.clone()),
            Transport::Tunnel(dialer) => tunneled_client(&rest.config, Arc::clone(dialer)),
        }
    }
}

/// kube client whose connections are all opened by `dialer`, with TLS on top
///
/// The config's connect timeout bounds each dial and its read timeout bounds
/// every read on a dialed stream, TLS handshake included.
pub fn tunneled_client(config: &kube::Config, dialer: Arc<dyn Dialer>) -> Result<kube::Client> {
    let dial_timeout = config.connect_timeout.unwrap_or(DEFAULT_BUILD_TIMEOUT);
    let connector =
        TunnelConnector::new(dialer, dial_timeout).with_read_timeout(config.read_timeout);
    let https = config.rustls_https_connector_with_connector(connector)?;

    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .map_err(BoxError::from)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(kube::Client::new(service, config.default_namespace.clone()))
}
