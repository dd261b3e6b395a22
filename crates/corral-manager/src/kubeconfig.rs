//! Kubeconfig documents that reach a downstream cluster through the management server

use serde::{Deserialize, Serialize};

use corral_common::{Error, Result};

/// Name used for the single cluster, user and context entries
const ENTRY_NAME: &str = "default";
const USER_NAME: &str = "user";

/// Kubeconfig structure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Connection settings
    pub cluster: ClusterEntry,
}

/// Cluster connection settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// Skip server certificate verification
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
}

/// User entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// Credentials
    pub user: UserEntry,
}

/// User credentials
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Bearer token
    pub token: String,
}

/// Context entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Cluster and user references
    pub context: ContextEntry,
}

/// Context references
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Cluster entry name
    pub cluster: String,
    /// User entry name
    pub user: String,
}

impl Kubeconfig {
    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
    }
}

/// Kubeconfig for `cluster_name` proxied by the management server on `https_port`
///
/// The management server terminates TLS with a certificate issued for its
/// public name, not `localhost`, so verification is skipped.
pub fn kubeconfig_for(cluster_name: &str, token: &str, https_port: u16) -> Kubeconfig {
    Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: ENTRY_NAME.to_string(),
            cluster: ClusterEntry {
                server: format!("https://localhost:{https_port}/k8s/clusters/{cluster_name}"),
                insecure_skip_tls_verify: true,
            },
        }],
        users: vec![NamedUser {
            name: USER_NAME.to_string(),
            user: UserEntry {
                token: token.to_string(),
            },
        }],
        contexts: vec![NamedContext {
            name: ENTRY_NAME.to_string(),
            context: ContextEntry {
                cluster: ENTRY_NAME.to_string(),
                user: USER_NAME.to_string(),
            },
        }],
        current_context: ENTRY_NAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_at_cluster_proxy_path() {
        let kc = kubeconfig_for("c-abc12", "secret-token", 9443);
        assert_eq!(
            kc.clusters[0].cluster.server,
            "https://localhost:9443/k8s/clusters/c-abc12"
        );
        assert_eq!(kc.users[0].user.token, "secret-token");
        assert_eq!(kc.current_context, "default");
        assert_eq!(kc.contexts[0].context.user, kc.users[0].name);
    }

    #[test]
    fn test_yaml_uses_kubeconfig_field_names() {
        let yaml = kubeconfig_for("c1", "t", 8443).to_yaml().unwrap();
        assert!(yaml.contains("apiVersion: v1") || yaml.contains("api-version: v1"));
        assert!(yaml.contains("current-context: default"));
        assert!(yaml.contains("insecure-skip-tls-verify: true"));

        let parsed: Kubeconfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, kubeconfig_for("c1", "t", 8443));
    }
}
