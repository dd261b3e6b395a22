//! Replica membership and cluster ownership
//!
//! Every replica runs the same pure function over the same canonical peer
//! list, so replicas agree on which of them owns a cluster without talking to
//! each other. The peer list is canonical because [`PeerSet::new`] always
//! inserts the local id, sorts, and dedups.

use std::sync::Arc;

use parking_lot::RwLock;

/// Snapshot of the replica fleet as seen by this replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSet {
    self_id: String,
    ids: Vec<String>,
    leader: bool,
    ready: bool,
}

impl PeerSet {
    /// Build a canonical peer set
    ///
    /// `self_id` is always part of `ids`, whether or not the notifier included it.
    pub fn new<I, S>(self_id: impl Into<String>, ids: I, leader: bool, ready: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let self_id = self_id.into();
        let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        ids.push(self_id.clone());
        ids.sort_unstable();
        ids.dedup();
        Self {
            self_id,
            ids,
            leader,
            ready,
        }
    }

    /// Membership before the first notification arrives
    pub fn pending(self_id: impl Into<String>) -> Self {
        Self::new(self_id, Vec::<String>::new(), false, false)
    }

    /// This replica's identity
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// All replica identities, sorted
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Whether this replica is the elected leader
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Whether the membership information is valid
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether this replica owns the cluster with the given uid
    pub fn is_owner(&self, cluster_uid: &str) -> bool {
        if !self.ready || self.ids.is_empty() {
            return false;
        }
        // A lone replica that is not leader may be a stale survivor of a
        // leadership change; it must not claim everything.
        if self.ids.len() == 1 && !self.leader {
            return false;
        }
        self.owner(cluster_uid) == Some(self.self_id.as_str())
    }

    /// Id of the replica that owns the cluster, if any replica is known
    pub fn owner(&self, cluster_uid: &str) -> Option<&str> {
        if self.ids.is_empty() {
            return None;
        }
        self.ids
            .get(shard_index(cluster_uid, self.ids.len()))
            .map(String::as_str)
    }
}

/// Index in `0..n` selected for `cluster_uid` by CRC32 (IEEE) range partitioning
///
/// `n` must be non-zero.
pub fn shard_index(cluster_uid: &str, n: usize) -> usize {
    let mut h = crc32fast::hash(cluster_uid.as_bytes());
    if h == u32::MAX {
        h -= 1;
    }
    ((u64::from(h) * n as u64) >> 32) as usize
}

/// How this replica takes part in ownership decisions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Membership {
    /// No peer membership configured: this replica owns every cluster
    Standalone,
    /// Ownership is sharded across the peer set
    Clustered(PeerSet),
}

impl Membership {
    /// Ownership decision for one cluster
    pub fn is_owner(&self, cluster_uid: &str) -> bool {
        match self {
            Membership::Standalone => true,
            Membership::Clustered(peers) => peers.is_owner(cluster_uid),
        }
    }
}

#[derive(Debug)]
struct Versioned {
    version: u64,
    membership: Arc<Membership>,
}

/// Shared, versioned view of the current membership
///
/// Readers take a cheap `Arc` snapshot and never hold the lock across I/O.
/// Only the sync loop replaces the value, behind its own serialization.
#[derive(Clone, Debug)]
pub struct PeerState {
    inner: Arc<RwLock<Versioned>>,
}

impl PeerState {
    fn with(membership: Membership) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 0,
                membership: Arc::new(membership),
            })),
        }
    }

    /// Non-clustered mode: every cluster is owned here
    pub fn standalone() -> Self {
        Self::with(Membership::Standalone)
    }

    /// Clustered mode, not ready until the first peer set is pushed
    pub fn clustered(self_id: impl Into<String>) -> Self {
        Self::with(Membership::Clustered(PeerSet::pending(self_id)))
    }

    /// Current membership snapshot
    pub fn membership(&self) -> Arc<Membership> {
        Arc::clone(&self.inner.read().membership)
    }

    /// Number of replacements applied so far
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Ownership decision against the current snapshot
    pub fn is_owner(&self, cluster_uid: &str) -> bool {
        self.membership().is_owner(cluster_uid)
    }

    /// Replace the membership wholesale, returning the new version
    pub(crate) fn replace(&self, peers: PeerSet) -> u64 {
        let mut inner = self.inner.write();
        inner.version += 1;
        inner.membership = Arc::new(Membership::Clustered(peers));
        inner.version
    }
}
