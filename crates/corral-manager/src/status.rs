//! Writes back to the ManagedCluster status

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::Api;
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use corral_common::crd::{
    find_condition, set_condition, Condition, ConditionStatus, ManagedCluster, CONDITION_READY,
};
use corral_common::retry::{retry_with_backoff, RetryConfig};
use corral_common::{Result, FIELD_MANAGER};

/// Reason set on the Ready condition when the manager gives up on a cluster
pub const REASON_UNAVAILABLE: &str = "Unavailable";

/// Records cluster health on the cluster object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStatusWriter: Send + Sync {
    /// Set `Ready=False` on the cluster unless it is already false
    async fn mark_unavailable(&self, cluster_name: &str, message: &str) -> Result<()>;
}

/// [`ClusterStatusWriter`] patching the status subresource on the management cluster
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: kube::Client,
    retry: RetryConfig,
}

impl KubeStatusWriter {
    /// Create a writer over the management client
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    async fn patch_ready_false(&self, name: &str, message: &str) -> Result<()> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        let cluster = api.get_status(name).await?;

        let mut conditions = cluster.status.map(|s| s.conditions).unwrap_or_default();
        if find_condition(&conditions, CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::False)
        {
            debug!(cluster = %name, "already marked unavailable");
            return Ok(());
        }

        set_condition(
            &mut conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                REASON_UNAVAILABLE,
                message,
            ),
        );
        let patch = json!({ "status": { "conditions": conditions } });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
        info!(cluster = %name, %message, "marked cluster unavailable");
        Ok(())
    }
}

#[async_trait]
impl ClusterStatusWriter for KubeStatusWriter {
    async fn mark_unavailable(&self, cluster_name: &str, message: &str) -> Result<()> {
        retry_with_backoff(&self.retry, "mark_unavailable", || {
            self.patch_ready_false(cluster_name, message)
        })
        .await
    }
}
