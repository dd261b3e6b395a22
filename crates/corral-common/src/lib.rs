//! Common types for corral: the ManagedCluster CRD, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::{AggregateError, Error};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for corral system resources (token secrets, operator)
pub const CORRAL_SYSTEM_NAMESPACE: &str = "corral-system";

/// Key inside a service account token Secret holding the bearer token
pub const TOKEN_SECRET_KEY: &str = "token";

/// Field manager recorded on status patches
pub const FIELD_MANAGER: &str = "corral-manager";

/// Default HTTPS port of the management server
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
