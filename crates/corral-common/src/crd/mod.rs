//! Custom Resource Definitions for corral
//!
//! The management plane tracks downstream clusters as `ManagedCluster` objects.

mod cluster;
mod types;

pub use cluster::{
    ClusterDriver, ConnectionSnapshot, ManagedCluster, ManagedClusterSpec, ManagedClusterStatus,
};
pub use types::{
    find_condition, set_condition, Condition, ConditionStatus, CONDITION_PROVISIONED,
    CONDITION_READY,
};
