//! A cluster's life on a single replica

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;

use corral_manager::StaticLister;

use super::helpers::*;

#[tokio::test]
async fn standalone_replica_starts_cluster_once_provisioned() {
    let lister = Arc::new(StaticLister::default());
    let replica = Replica::standalone(&lister);

    lister.upsert(pending_cluster("c-east", "uid-east"));
    replica.sync.sync_all().await.unwrap();
    assert!(!replica.holds("uid-east"));

    lister.upsert(provisioned_cluster("c-east", "uid-east"));
    replica.sync.sync_all().await.unwrap();
    assert!(replica.holds("uid-east"));
}

#[tokio::test]
async fn deletion_stops_the_record_on_the_next_pass() {
    let lister = Arc::new(StaticLister::default());
    let replica = Replica::standalone(&lister);
    lister.upsert(provisioned_cluster("c-east", "uid-east"));
    replica.sync.sync_all().await.unwrap();
    let record = replica.manager.record("uid-east").expect("record");

    let mut deleting = provisioned_cluster("c-east", "uid-east");
    deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
    lister.upsert(deleting);
    replica.sync.sync_all().await.unwrap();

    assert!(record.is_cancelled());
    assert!(!replica.holds("uid-east"));
    assert!(replica.manager.rest_config("uid-east").is_err());
}

#[tokio::test]
async fn rotated_token_secret_restarts_the_record() {
    let lister = Arc::new(StaticLister::default());
    let replica = Replica::standalone(&lister);
    lister.upsert(provisioned_cluster("c-east", "uid-east"));
    replica.sync.sync_all().await.unwrap();
    let before = replica.manager.record("uid-east").expect("record");

    // A fresh object carrying the same material is left alone
    lister.upsert(provisioned_cluster("c-east", "uid-east"));
    replica.sync.sync_all().await.unwrap();
    let same = replica.manager.record("uid-east").expect("record");
    assert!(Arc::ptr_eq(&before, &same));

    // Only the secret reference moves
    let mut rotated = provisioned_cluster("c-east", "uid-east");
    if let Some(status) = rotated.status.as_mut() {
        status.service_account_token_secret = "c-east-token-2".to_string();
    }
    lister.upsert(rotated);
    replica.sync.sync_all().await.unwrap();

    let after = replica.manager.record("uid-east").expect("record");
    assert!(before.is_cancelled());
    assert!(!Arc::ptr_eq(&before, &after));
}
