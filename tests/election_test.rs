mod common;

use std::time::{Duration, Instant};

use klite::client::ClientError;
use klite::election::{LeaderElectionConfig, LeaderElector};
use klite::Client;
use tokio_util::sync::CancellationToken;

fn elector(client: &Client, identity: &str, lease_secs: u64) -> LeaderElector {
    let mut config = LeaderElectionConfig::new("test-lock", identity);
    config.lease_duration = Duration::from_secs(lease_secs);
    LeaderElector::new(client.clone(), config)
}

#[tokio::test]
async fn first_candidate_acquires_and_holds_the_lease() {
    let (_url, client) = common::spawn_server_with_client().await;
    let a = elector(&client, "candidate-a", 15);
    let b = elector(&client, "candidate-b", 15);

    a.try_acquire_or_renew().await.unwrap();
    let lease = client.get_lease("test-lock").await.unwrap().unwrap();
    assert_eq!(lease.spec.holder_identity.as_deref(), Some("candidate-a"));
    let first_renew = lease.spec.renew_time;

    // B cannot take an unexpired lease.
    assert!(b.try_acquire_or_renew().await.is_err());
    let lease = client.get_lease("test-lock").await.unwrap().unwrap();
    assert_eq!(lease.spec.holder_identity.as_deref(), Some("candidate-a"));
    assert_eq!(lease.spec.lease_transitions, None);

    // A renews in place; holder and transition count are untouched.
    a.try_acquire_or_renew().await.unwrap();
    let lease = client.get_lease("test-lock").await.unwrap().unwrap();
    assert_eq!(lease.spec.holder_identity.as_deref(), Some("candidate-a"));
    assert_eq!(lease.spec.lease_transitions, None);
    assert!(lease.spec.renew_time >= first_renew);
}

#[tokio::test]
async fn expired_leases_are_stolen_with_a_transition_bump() {
    let (_url, client) = common::spawn_server_with_client().await;

    // A zero-second lease expires the moment it is written.
    let a = elector(&client, "candidate-a", 0);
    let b = elector(&client, "candidate-b", 15);

    a.try_acquire_or_renew().await.unwrap();
    b.try_acquire_or_renew().await.unwrap();

    let lease = client.get_lease("test-lock").await.unwrap().unwrap();
    assert_eq!(lease.spec.holder_identity.as_deref(), Some("candidate-b"));
    assert_eq!(lease.spec.lease_transitions, Some(1));
    assert_eq!(lease.spec.lease_duration_seconds, Some(15));
}

#[tokio::test]
async fn run_stops_leading_on_the_first_renew_failure() {
    let (_url, client) = common::spawn_server_with_client().await;

    let mut config = LeaderElectionConfig::new("test-lock", "candidate-a");
    config.retry_period = Duration::from_millis(100);
    let elector = LeaderElector::new(client.clone(), config);

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let parent = CancellationToken::new();

    let elector_parent = parent.clone();
    let task = tokio::spawn(async move {
        let callback_tx = events_tx.clone();
        elector
            .run(elector_parent, move |leading| {
                let tx = callback_tx.clone();
                async move {
                    let _ = tx.send("started");
                    leading.cancelled().await;
                    let _ = tx.send("cancelled");
                }
            })
            .await;
    });

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("leadership was never acquired")
        .unwrap();
    assert_eq!(event, "started");

    // Hand the lease to someone else so the next renew attempt fails. The
    // incumbent may renew concurrently, so retry on write conflicts.
    let stolen_at = loop {
        let mut lease = client.get_lease("test-lock").await.unwrap().unwrap();
        lease.spec.holder_identity = Some("intruder".to_string());
        lease.spec.acquire_time = Some(chrono::Utc::now());
        lease.spec.renew_time = Some(chrono::Utc::now());
        lease.spec.lease_duration_seconds = Some(60);
        match client.update_lease(&lease).await {
            Ok(()) => break Instant::now(),
            Err(ClientError::Conflict) => continue,
            Err(err) => panic!("failed to steal lease: {err}"),
        }
    };

    // The very first failed renew must cancel the callback's token; there
    // is no grace window.
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("leadership was not released on renew failure")
        .unwrap();
    assert_eq!(event, "cancelled");
    assert!(stolen_at.elapsed() < Duration::from_secs(2));

    parent.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
}

#[tokio::test]
async fn at_most_one_identity_holds_an_unexpired_lease() {
    let (_url, client) = common::spawn_server_with_client().await;

    let candidates: Vec<LeaderElector> = (0..4)
        .map(|i| elector(&client, &format!("candidate-{i}"), 15))
        .collect();

    let mut winners = 0;
    for candidate in &candidates {
        if candidate.try_acquire_or_renew().await.is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let lease = client.get_lease("test-lock").await.unwrap().unwrap();
    let expiry = lease.spec.expiry().unwrap();
    assert!(chrono::Utc::now() < expiry);
}
