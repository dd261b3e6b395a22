//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster is a downstream Kubernetes cluster administered by the
//! management plane. Its status carries the connection material needed to
//! build a client for it: API endpoint, CA bundle and a reference to the
//! Secret holding a service account token.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition, ConditionStatus, CONDITION_PROVISIONED};

/// How a downstream cluster came to be managed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterDriver {
    /// The management cluster itself; reached with the management client, never tunneled
    Local,
    /// An existing cluster registered by running the agent on it
    #[default]
    Imported,
    /// A cluster provisioned by the management plane
    Provisioned,
}

impl std::fmt::Display for ClusterDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Imported => write!(f, "imported"),
            Self::Provisioned => write!(f, "provisioned"),
        }
    }
}

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Display","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driver"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.apiEndpoint"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Human-friendly name; mutable, never used as an identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// How the cluster is managed
    #[serde(default)]
    pub driver: ClusterDriver,
}

/// Status for a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// URL of the downstream API server as seen through the tunnel
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_endpoint: String,

    /// Base64-encoded PEM CA bundle of the downstream API server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,

    /// Name of the Secret (in the corral system namespace) holding the service account token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_token_secret: String,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Connection material copied out of a ManagedCluster
///
/// Two snapshots compare equal exactly when a client built from one can be
/// reused for the other.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionSnapshot {
    /// Downstream API endpoint
    pub api_endpoint: String,
    /// Base64-encoded CA bundle
    pub ca_cert: String,
    /// Token Secret reference
    pub service_account_token_secret: String,
    /// Cluster driver at snapshot time
    pub driver: ClusterDriver,
}

impl ConnectionSnapshot {
    /// Whether endpoint, CA and token reference are all populated
    pub fn is_complete(&self) -> bool {
        !self.api_endpoint.is_empty()
            && !self.ca_cert.is_empty()
            && !self.service_account_token_secret.is_empty()
    }
}

impl ManagedCluster {
    /// Stable identity used as the registry key and hash input
    ///
    /// Objects that were never persisted have no uid; they fall back to the name
    /// so they can still be exercised in tests and dry runs.
    pub fn cluster_uid(&self) -> String {
        self.uid().unwrap_or_else(|| self.name_any())
    }

    /// Whether the cluster is being deleted
    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether this object represents the management cluster itself
    pub fn is_local(&self) -> bool {
        self.spec.driver == ClusterDriver::Local
    }

    /// Whether the Provisioned condition is True
    ///
    /// The local cluster is provisioned by definition.
    pub fn is_provisioned(&self) -> bool {
        if self.is_local() {
            return true;
        }
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, CONDITION_PROVISIONED))
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Snapshot of the connection material currently on the object
    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        let status = self.status.clone().unwrap_or_default();
        ConnectionSnapshot {
            api_endpoint: status.api_endpoint,
            ca_cert: status.ca_cert,
            service_account_token_secret: status.service_account_token_secret,
            driver: self.spec.driver,
        }
    }
}
