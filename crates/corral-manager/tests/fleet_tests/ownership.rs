//! How a fleet of replicas splits clusters

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use corral_manager::{shard_index, PeerSet, StaticLister};

use super::helpers::*;

const FLEET: [&str; 3] = ["a", "b", "c"];

/// First `cluster-N` uid that lands on `index` in a fleet of `n`
fn uid_at_index(index: usize, n: usize) -> String {
    (0..)
        .map(|i| format!("cluster-{i}"))
        .find(|uid| shard_index(uid, n) == index)
        .expect("some uid hashes to every index")
}

fn random_uids(count: usize) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    (0..count)
        .map(|_| {
            let (hi, lo): (u64, u64) = (rng.gen(), rng.gen());
            format!("{hi:016x}-{lo:016x}")
        })
        .collect()
}

#[tokio::test]
async fn only_the_shard_owner_installs_a_record() {
    let lister = Arc::new(StaticLister::default());
    let uid = uid_at_index(1, FLEET.len());
    lister.upsert(provisioned_cluster("c-one", &uid));

    let replicas: Vec<Replica> = FLEET.iter().map(|id| Replica::clustered(id, &lister)).collect();
    for replica in &replicas {
        replica.set_peers(&FLEET).await;
    }

    let holders: Vec<&str> = replicas
        .iter()
        .filter(|r| r.holds(&uid))
        .map(|r| r.id.as_str())
        .collect();
    assert_eq!(holders, ["b"]);
}

#[tokio::test]
async fn replicas_own_nothing_before_membership_is_known() {
    let lister = Arc::new(StaticLister::default());
    lister.upsert(provisioned_cluster("c-one", "uid-one"));
    let replica = Replica::clustered("a", &lister);

    replica.sync.sync_all().await.unwrap();
    assert!(!replica.holds("uid-one"));
}

#[tokio::test]
async fn departing_replica_clusters_move_within_one_pass() {
    let lister = Arc::new(StaticLister::default());
    let uids: Vec<String> = (0..30).map(|i| format!("uid-{i:02}")).collect();
    for (i, uid) in uids.iter().enumerate() {
        lister.upsert(provisioned_cluster(&format!("c-{i:02}"), uid));
    }

    let replicas: Vec<Replica> = FLEET.iter().map(|id| Replica::clustered(id, &lister)).collect();
    for replica in &replicas {
        replica.set_peers(&FLEET).await;
    }
    let held_by_c: Vec<&String> = uids.iter().filter(|uid| replicas[2].holds(uid)).collect();
    assert!(!held_by_c.is_empty(), "c should own some of 30 clusters");

    // c leaves; a and b learn the new membership
    replicas[2].manager.stop_all();
    let survivors = &replicas[..2];
    for replica in survivors {
        replica.set_peers(&["a", "b"]).await;
    }

    for uid in &uids {
        let holders = survivors.iter().filter(|r| r.holds(uid)).count();
        assert_eq!(holders, 1, "{uid} should have exactly one owner");
    }
    for uid in held_by_c {
        let expected = ["a", "b"][shard_index(uid, 2)];
        let owner = survivors.iter().find(|r| r.holds(uid)).map(|r| r.id.as_str());
        assert_eq!(owner, Some(expected));
    }
}

#[test]
fn every_uid_has_exactly_one_owner_and_shares_are_even() {
    let uids = random_uids(10_000);

    for n in 1..=10usize {
        let ids: Vec<String> = (0..n).map(|i| format!("replica-{i}")).collect();
        let fleet: Vec<PeerSet> = ids
            .iter()
            .map(|id| PeerSet::new(id.as_str(), ids.iter().cloned(), true, true))
            .collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for uid in &uids {
            let owners: Vec<&str> = fleet
                .iter()
                .filter(|peers| peers.is_owner(uid))
                .map(|peers| peers.self_id())
                .collect();
            assert_eq!(owners.len(), 1, "{uid} in a fleet of {n}");
            *counts.entry(owners[0]).or_default() += 1;
        }

        let expected = uids.len() as f64 / n as f64;
        for id in &ids {
            let got = counts.get(id.as_str()).copied().unwrap_or(0) as f64;
            assert!(
                (got - expected).abs() <= expected * 0.2,
                "{id} owns {got} of {} with {n} replicas",
                uids.len()
            );
        }
    }
}

#[test]
fn ownership_is_deterministic_across_replicas() {
    let uids = random_uids(200);
    let first = PeerSet::new("b", ["c", "a"], false, true);
    let second = PeerSet::new("b", ["a", "b", "c", "a"], false, true);

    for uid in &uids {
        assert_eq!(first.is_owner(uid), second.is_owner(uid));
        assert_eq!(first.owner(uid), second.owner(uid));
        assert_eq!(first.is_owner(uid), first.is_owner(uid));
    }
}
