use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use modeldeploy::errors::DeployError;
use modeldeploy::filesys::dir::Dir;
use modeldeploy::lease::{FileLeases, InProcessLeases, LeaseRegistry};

const TTL: Duration = Duration::from_secs(600);

#[tokio::test]
async fn test_file_lease_conflict_and_release() {
    let dir = Dir::create_temp_dir("modeldeploy-leases").await.unwrap();
    let leases = FileLeases::new(dir.clone());

    let lease = assert_ok!(leases.acquire("i-0abc123", TTL).await);
    assert_eq!(leases.current("i-0abc123").await.unwrap(), Some(lease.clone()));

    let err = assert_err!(leases.acquire("i-0abc123", TTL).await);
    assert!(matches!(err, DeployError::LeaseConflict { .. }));
    assert_eq!(err.exit_code(), 3);

    // Other instances are independent
    assert_ok!(leases.acquire("i-0def456", TTL).await);

    assert_ok!(leases.release(&lease).await);
    assert_eq!(leases.current("i-0abc123").await.unwrap(), None);
    assert_ok!(leases.acquire("i-0abc123", TTL).await);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_file_lease_expired_takeover() {
    let dir = Dir::create_temp_dir("modeldeploy-leases").await.unwrap();
    let leases = FileLeases::new(dir.clone());

    let stale = assert_ok!(leases.acquire("i-0abc123", Duration::ZERO).await);
    let fresh = assert_ok!(leases.acquire("i-0abc123", TTL).await);
    assert_ne!(stale.holder_id, fresh.holder_id);

    // The stale holder must not remove the new marker
    assert_ok!(leases.release(&stale).await);
    assert_eq!(leases.current("i-0abc123").await.unwrap(), Some(fresh.clone()));

    assert_ok!(leases.release(&fresh).await);
    assert_eq!(leases.current("i-0abc123").await.unwrap(), None);

    dir.delete().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_lease_takeover_race_has_one_winner() {
    let dir = Dir::create_temp_dir("modeldeploy-leases").await.unwrap();
    let stale = assert_ok!(FileLeases::new(dir.clone()).acquire("i-0abc123", Duration::ZERO).await);

    let mut contenders = Vec::new();
    for _ in 0..8 {
        let leases = FileLeases::new(dir.clone());
        contenders.push(tokio::spawn(async move { leases.acquire("i-0abc123", TTL).await }));
    }

    let mut winners = Vec::new();
    for contender in contenders {
        match contender.await.unwrap() {
            Ok(lease) => winners.push(lease),
            Err(e) => assert!(matches!(e, DeployError::LeaseConflict { .. }), "{:?}", e),
        }
    }
    assert_eq!(winners.len(), 1);

    let leases = FileLeases::new(dir.clone());
    assert_eq!(leases.current("i-0abc123").await.unwrap(), Some(winners[0].clone()));

    // A late release from the stale holder leaves the winner in place
    assert_ok!(leases.release(&stale).await);
    assert_eq!(leases.current("i-0abc123").await.unwrap(), Some(winners[0].clone()));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_file_lease_unreadable_marker_is_conflict() {
    let dir = Dir::create_temp_dir("modeldeploy-leases").await.unwrap();
    dir.file("i-0abc123.lease").write_atomic(b"not json").await.unwrap();
    let leases = FileLeases::new(dir.clone());

    let err = assert_err!(leases.acquire("i-0abc123", TTL).await);
    assert_eq!(err.kind(), "LeaseConflictError");

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_in_process_leases() {
    let leases = InProcessLeases::new();
    let shared = leases.clone();

    let lease = assert_ok!(leases.acquire("i-1", TTL).await);
    assert_err!(shared.acquire("i-1", TTL).await);
    assert_eq!(shared.holder("i-1"), Some(lease.clone()));

    assert_ok!(shared.release(&lease).await);
    assert!(leases.holder("i-1").is_none());

    let expired = assert_ok!(leases.acquire("i-2", Duration::ZERO).await);
    let taken = assert_ok!(shared.acquire("i-2", TTL).await);
    assert_ok!(leases.release(&expired).await);
    assert_eq!(leases.holder("i-2"), Some(taken));
}
