//! Corral manager - ownership and lifecycle of downstream cluster clients
//!
//! This crate is the control-plane core of the management server:
//!
//! - **Ownership**: [`PeerSet`] and the CRC32 sharding rule deciding which
//!   replica runs controllers for each cluster
//! - **Sync loop**: [`ClusterSync`] reconciles every known cluster on peer
//!   changes, cluster changes and a timer
//! - **Registry**: [`Manager`] holds one live [`ClusterRecord`] per cluster
//!   with idempotent start, restart on change, and stop
//! - **Client configs**: [`RestConfigBuilder`] derives tunneled clients from
//!   a cluster's connection material
//! - **Request scopes**: [`ContextResolver`] hands out the handles for the
//!   cluster or project a request targets

#![deny(missing_docs)]

pub mod access;
pub mod controllers;
pub mod kubeconfig;
pub mod lister;
pub mod manager;
pub mod peers;
pub mod record;
pub mod resolver;
pub mod rest_config;
pub mod status;
pub mod sync;
pub mod tunnel;

#[cfg(test)]
mod test_support;

pub use access::{AccessControl, ResourceAttributes, UserInfo};
pub use controllers::{ClusterClients, ClusterControllers, RbacControllers};
pub use kubeconfig::{kubeconfig_for, Kubeconfig};
pub use lister::{reflect_clusters, ClusterChange, ClusterLister, StaticLister};
pub use manager::{Manager, ManagerConfig, RecordInfo};
pub use peers::{shard_index, Membership, PeerSet, PeerState};
pub use record::ClusterRecord;
pub use resolver::{ContextResolver, ManagementHandles, RequestScope, StorageContext};
pub use rest_config::{
    ClientFactory, KubeSecretLookup, RestConfig, RestConfigBuilder, SecretLookup, Transport,
    TunnelClientFactory,
};
pub use status::{ClusterStatusWriter, KubeStatusWriter};
pub use sync::{ClusterSync, SyncConfig};
pub use tunnel::{Dialer, DialerFactory, DirectDialer, DirectDialerFactory, TunnelConnector};
