mod common;

use common::{id, ScriptedStore};
use tidepool::records::status_key;
use tidepool::tidepool_store::StoreError;
use tidepool::{MatchOutcome, Matcher, Records, StatusObservation, StatusRecord};

async fn searching(records: &Records, raw: &str) {
    records
        .write_status(&id(raw), &StatusRecord::Searching)
        .await
        .unwrap();
}

async fn record(records: &Records, raw: &str) -> StatusRecord {
    match records.read_status(&id(raw)).await.unwrap() {
        StatusObservation::Record(record) => record,
        other => panic!("{raw} has no usable record: {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn simultaneous_claims_both_go_through() {
    let store = ScriptedStore::new();
    let records = Records::new(store.clone());
    searching(&records, "alice").await;
    searching(&records, "bob").await;
    // Both snapshots are taken before either claim is written.
    store.gate_scans(2);

    let alice = Matcher::new(records.clone(), id("alice"));
    let bob = Matcher::new(records.clone(), id("bob"));
    let (from_alice, from_bob) = tokio::join!(alice.find_next_match(), bob.find_next_match());

    assert_eq!(from_alice.unwrap(), MatchOutcome::Claimed(id("bob")));
    assert_eq!(from_bob.unwrap(), MatchOutcome::Claimed(id("alice")));

    // No compare-and-set: last write wins per key. bob passes the gate last
    // and writes first; alice's claim then overwrites both keys, so the later
    // claimer ends up the offerer and the pair is consistent.
    assert_eq!(
        record(&records, "alice").await,
        StatusRecord::Offered { partner: id("bob") }
    );
    assert_eq!(
        record(&records, "bob").await,
        StatusRecord::Received { partner: id("alice") }
    );
}

#[test_timeout::tokio_timeout_test(secs = 5)]
async fn unavailable_pool_query_means_waiting() {
    let store = ScriptedStore::new();
    let records = Records::new(store.clone());
    searching(&records, "alice").await;
    searching(&records, "bob").await;
    store.fail_scans(true);

    let outcome = Matcher::new(records.clone(), id("alice"))
        .find_next_match()
        .await
        .unwrap();

    assert_eq!(outcome, MatchOutcome::Waiting);
    assert_eq!(record(&records, "bob").await, StatusRecord::Searching);
    assert_eq!(record(&records, "alice").await, StatusRecord::Searching);
}

#[test_timeout::tokio_timeout_test(secs = 5)]
async fn rejected_claim_is_surfaced_and_retry_succeeds() {
    let store = ScriptedStore::new();
    let records = Records::new(store.clone());
    searching(&records, "alice").await;
    searching(&records, "bob").await;
    store.fail_sets(&status_key(&id("bob")), 1);

    let alice = Matcher::new(records.clone(), id("alice"));
    let err = alice.find_next_match().await.unwrap_err();
    assert!(matches!(err, StoreError::Rejected { .. }), "{err:?}");
    assert_eq!(record(&records, "bob").await, StatusRecord::Searching);

    assert_eq!(
        alice.find_next_match().await.unwrap(),
        MatchOutcome::Claimed(id("bob"))
    );
    assert_eq!(
        record(&records, "bob").await,
        StatusRecord::Received { partner: id("alice") }
    );
    assert_eq!(
        record(&records, "alice").await,
        StatusRecord::Offered { partner: id("bob") }
    );
}

#[test_timeout::tokio_timeout_test(secs = 5)]
async fn claims_follow_scan_order_and_skip_busy_participants() {
    let store = ScriptedStore::new();
    let records = Records::new(store.clone());
    records
        .write_status(&id("amy"), &StatusRecord::Connected { partner: None })
        .await
        .unwrap();
    searching(&records, "carl").await;
    searching(&records, "dana").await;
    searching(&records, "zed").await;

    let outcome = Matcher::new(records.clone(), id("zed"))
        .find_next_match()
        .await
        .unwrap();

    assert_eq!(outcome, MatchOutcome::Claimed(id("carl")));
    assert_eq!(record(&records, "dana").await, StatusRecord::Searching);
}
