//! Error types for corral
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants that concern a single downstream cluster carry its name so a
//! failed sync pass can be read straight from the logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for corral operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a cluster object or configuration value
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "status.apiEndpoint")
        field: Option<String>,
    },

    /// Failed to derive a client configuration for a downstream cluster
    #[error("failed to build client config for {cluster} [{stage}]: {message}")]
    Build {
        /// Name of the downstream cluster
        cluster: String,
        /// Build step that failed (endpoint, ca, dialer, token)
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// The requested cluster or project scope does not exist
    #[error("cluster not found: {cluster}")]
    ClusterNotFound {
        /// Cluster name or id that was looked up
        cluster: String,
    },

    /// The cluster exists but has no usable record right now
    #[error("cluster {cluster} is unavailable: {message}")]
    ClusterUnavailable {
        /// Name of the downstream cluster
        cluster: String,
        /// Why no record could be produced
        message: String,
    },

    /// Downstream controllers failed after the record was installed
    #[error("controller startup failed for {cluster}: {message}")]
    Startup {
        /// Name of the downstream cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "sync", "registry", "resolver")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a build error for a cluster at the given stage
    pub fn build(
        cluster: impl Into<String>,
        stage: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Build {
            cluster: cluster.into(),
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a cluster or project scope
    pub fn cluster_not_found(cluster: impl Into<String>) -> Self {
        Self::ClusterNotFound {
            cluster: cluster.into(),
        }
    }

    /// Create a retryable unavailable error
    pub fn cluster_unavailable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a controller startup error
    pub fn startup(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Startup {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Build and startup failures are retried by the next sync pass.
    /// A missing scope is final; an unavailable cluster is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Build { .. } => true,
            Error::ClusterNotFound { .. } => false,
            Error::ClusterUnavailable { .. } => true,
            Error::Startup { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// HTTP status an API layer should answer with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ClusterNotFound { .. } => 404,
            Error::ClusterUnavailable { .. } => 503,
            Error::Validation { .. } => 422,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code,
            _ => 500,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. }
            | Error::Build { cluster, .. }
            | Error::ClusterNotFound { cluster }
            | Error::ClusterUnavailable { cluster, .. }
            | Error::Startup { cluster, .. } => Some(cluster),
            Error::Kube { .. } | Error::Serialization { .. } | Error::Internal { .. } => None,
        }
    }
}

/// Errors collected from one pass over many clusters
///
/// A failure on one cluster never stops the pass; every error is kept
/// and reported together once the pass completes.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more failure
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// Whether no failure was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The recorded failures, in the order they happened
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when empty, otherwise `Err(self)`
    pub fn into_result(self) -> std::result::Result<(), AggregateError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} cluster(s) failed to sync", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl From<Error> for AggregateError {
    fn from(error: Error) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a bad endpoint surfaces with the cluster and the failing step
    #[test]
    fn story_build_errors_name_the_cluster_and_stage() {
        let err = Error::build("prod-east", "endpoint", "relative URL without a base");
        assert!(err.to_string().contains("prod-east"));
        assert!(err.to_string().contains("[endpoint]"));
        assert_eq!(err.cluster(), Some("prod-east"));

        // The next sync pass retries the build
        assert!(err.is_retryable());
    }

    /// Story: the API layer can tell "no such cluster" from "try again"
    #[test]
    fn story_lookup_errors_are_distinguishable() {
        let missing = Error::cluster_not_found("c-missing");
        let busy = Error::cluster_unavailable("c-busy", "record not ready");

        assert!(!missing.is_retryable());
        assert!(busy.is_retryable());
        assert_eq!(missing.status_code(), 404);
        assert_eq!(busy.status_code(), 503);
        assert!(matches!(missing, Error::ClusterNotFound { .. }));
        assert!(matches!(busy, Error::ClusterUnavailable { .. }));
    }

    #[test]
    fn test_kube_errors_retry_only_outside_4xx() {
        let conflict = Error::from(api_error(409));
        assert!(!conflict.is_retryable());
        assert_eq!(conflict.status_code(), 409);

        let server = Error::from(api_error(503));
        assert!(server.is_retryable());
        assert_eq!(server.cluster(), None);
    }

    #[test]
    fn test_validation_with_field() {
        let err = Error::validation_for_field("c1", "status.caCert", "not base64");
        match &err {
            Error::Validation { field, cluster, .. } => {
                assert_eq!(field.as_deref(), Some("status.caCert"));
                assert_eq!(cluster, "c1");
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn test_default_context_constant() {
        let err = Error::internal("unexpected state");
        match &err {
            Error::Internal { context, .. } => assert_eq!(context, UNKNOWN_CONTEXT),
            _ => panic!("Expected Internal variant"),
        }
        assert!(err.to_string().contains("[unknown]"));

        let err = Error::internal_with_context("sync", "lister closed");
        assert!(err.to_string().contains("[sync]"));
    }

    #[test]
    fn test_serialization_is_not_retryable() {
        let err = Error::serialization_for_kind("ManagedCluster", "missing field 'spec'");
        match &err {
            Error::Serialization { kind, .. } => {
                assert_eq!(kind.as_deref(), Some("ManagedCluster"));
            }
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_aggregate_collects_in_order() {
        let mut agg = AggregateError::new();
        assert!(agg.is_empty());

        agg.push(Error::build("a", "ca", "bad pem"));
        agg.push(Error::build("b", "dialer", "no tunnel session"));

        assert_eq!(agg.len(), 2);
        assert_eq!(agg.errors()[0].cluster(), Some("a"));
        assert_eq!(agg.errors()[1].cluster(), Some("b"));

        let msg = agg.to_string();
        assert!(msg.starts_with("2 cluster(s) failed to sync: "));
        assert!(msg.contains("bad pem; "));
        assert!(msg.contains("no tunnel session"));
    }

    #[test]
    fn test_aggregate_into_result() {
        assert!(AggregateError::new().into_result().is_ok());

        let agg = AggregateError::from(Error::startup("c", "timeout syncing controllers"));
        let err = agg.into_result().unwrap_err();
        assert_eq!(err.len(), 1);
    }
}
