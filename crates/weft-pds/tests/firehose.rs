//! End-to-end firehose tests: hosts with in-memory storage, real collector
//! tasks, and subscribers at various cursors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ipld_core::ipld::Ipld;
use weft_pds::event::Payload;
use weft_pds::{FirehoseConfig, Frame, HostError, RepoHost, Subscription};
use weft_repo::mst::dag_cbor_cid;
use weft_repo::{Did, MemoryStorage, Write};

fn test_record(text: &str) -> Ipld {
    let mut map = BTreeMap::new();
    map.insert("foo".to_string(), Ipld::String(text.to_string()));
    Ipld::Map(map)
}

fn test_host(config: FirehoseConfig) -> RepoHost<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    RepoHost::new(storage, key, config)
}

fn small_config() -> FirehoseConfig {
    FirehoseConfig {
        new_events_timeout: Duration::from_millis(200),
        ..FirehoseConfig::default()
    }
}

fn user() -> Did {
    Did::new("did:web:user.com").unwrap()
}

async fn next_frame(sub: &mut Subscription<MemoryStorage>) -> Arc<Frame> {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream error")
        .expect("stream ended unexpectedly")
}

/// Collect the seqs of the next `count` event frames, skipping info frames.
async fn collect_seqs(sub: &mut Subscription<MemoryStorage>, count: usize) -> Vec<i64> {
    let mut seqs = Vec::new();
    while seqs.len() < count {
        let frame = next_frame(sub).await;
        if let Some(seq) = frame.seq() {
            seqs.push(seq);
        }
    }
    seqs
}

#[tokio::test]
async fn test_basic_write_reaches_live_subscriber() {
    let host = test_host(small_config());
    host.create_repo(user(), None, None).await.unwrap(); // seq 1
    host.start().await;

    let genesis_data = {
        let latest = host.get_latest_commit(&user()).await.unwrap();
        let head: cid::Cid = latest.cid.parse().unwrap();
        let block = weft_repo::RepoStorage::read(&**host.storage(), &head)
            .await
            .unwrap()
            .unwrap();
        weft_repo::Commit::from_cbor(&block.encoded).unwrap().data
    };

    let mut sub = host.subscribe(None).await.unwrap();

    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("bar"))])
        .await
        .unwrap();

    let frame = next_frame(&mut sub).await;
    assert_eq!(frame.header.op, 1);
    assert_eq!(frame.header.t.as_deref(), Some("#commit"));

    let Payload::Commit(payload) = &frame.payload else {
        panic!("expected commit payload");
    };

    assert_eq!(payload.seq, 2);
    assert_eq!(payload.repo, "did:web:user.com");
    assert_eq!(payload.ops.len(), 1);
    assert_eq!(payload.ops[0].action, "create");
    assert_eq!(payload.ops[0].path, "co.ll/t1");
    assert_eq!(
        payload.ops[0].cid,
        Some(dag_cbor_cid(&test_record("bar")).unwrap())
    );
    assert_eq!(payload.ops[0].prev, None);
    assert_eq!(payload.prev_data, Some(genesis_data));
    assert!(!payload.rebase);
    assert!(!payload.too_big);
    assert!(payload.blobs.is_empty());
    assert!(payload.since.is_none());
    assert!(!payload.blocks.is_empty());
}

#[tokio::test]
async fn test_delete_round_trip_restores_root() {
    let host = test_host(small_config());
    host.create_repo(user(), None, None).await.unwrap();

    let first = host
        .apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("one"))])
        .await
        .unwrap();
    let r1 = first.data;

    host.apply_writes(&user(), &[Write::create("co.ll", "t2", test_record("two"))])
        .await
        .unwrap();
    let after_delete = host
        .apply_writes(&user(), &[Write::delete("co.ll", "t2")])
        .await
        .unwrap();

    assert_eq!(after_delete.data, r1);
}

#[tokio::test]
async fn test_backfill_and_handoff() {
    let config = FirehoseConfig {
        preload_window: 1,
        new_events_timeout: Duration::from_millis(200),
        ..FirehoseConfig::default()
    };
    let host = test_host(config);

    // Three events before the collector starts
    host.create_repo(user(), None, None).await.unwrap(); // seq 1
    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("1"))])
        .await
        .unwrap(); // seq 2
    host.apply_writes(&user(), &[Write::create("co.ll", "t2", test_record("2"))])
        .await
        .unwrap(); // seq 3

    host.start().await;

    // One event after
    host.apply_writes(&user(), &[Write::create("co.ll", "t3", test_record("3"))])
        .await
        .unwrap(); // seq 4

    // Cursor below the rollback window: manual backfill, then handoff
    let mut sub = host.subscribe(Some(1)).await.unwrap();

    // Behind-window subscribers get an OutdatedCursor preamble
    let preamble = next_frame(&mut sub).await;
    assert_eq!(preamble.header.t.as_deref(), Some("#info"));

    let seqs = collect_seqs(&mut sub, 4).await;
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_multiple_subscribers_rollback_advance() {
    let config = FirehoseConfig {
        rollback_window: 4,
        ..FirehoseConfig::default()
    };
    let host = test_host(config);

    // Eight events: genesis + seven writes
    host.create_repo(user(), None, None).await.unwrap();
    for i in 0..7 {
        host.apply_writes(
            &user(),
            &[Write::create("co.ll", format!("t{i}"), test_record("x"))],
        )
        .await
        .unwrap();
    }

    // Preload keeps only the last four events in memory
    host.start_with_limit(Some(0)).await;

    let mut a = host.subscribe(Some(6)).await.unwrap();
    assert_eq!(collect_seqs(&mut a, 3).await, vec![6, 7, 8]);

    let mut b = host.subscribe(Some(5)).await.unwrap();
    assert_eq!(collect_seqs(&mut b, 4).await, vec![5, 6, 7, 8]);

    // A cursor behind the window is announced as outdated, then served the
    // full remaining stream from durable storage
    let mut c = host.subscribe(Some(2)).await.unwrap();
    let preamble = next_frame(&mut c).await;
    assert_eq!(preamble.header.t.as_deref(), Some("#info"));
    assert_eq!(collect_seqs(&mut c, 7).await, vec![2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn test_future_cursor() {
    let host = test_host(small_config());

    // last_seq = 4
    host.create_repo(user(), None, None).await.unwrap();
    for i in 0..3 {
        host.apply_writes(
            &user(),
            &[Write::create("co.ll", format!("t{i}"), test_record("x"))],
        )
        .await
        .unwrap();
    }

    host.start_with_limit(Some(0)).await;

    let mut sub = host.subscribe(Some(999)).await.unwrap();
    let frame = next_frame(&mut sub).await;

    assert_eq!(frame.header.op, -1);
    assert_eq!(frame.header.t, None);
    let Payload::Error(error) = &frame.payload else {
        panic!("expected error payload");
    };
    assert_eq!(error.error, "FutureCursor");
    assert_eq!(
        error.message,
        "Cursor 999 is past our current sequence number 4"
    );

    // Terminal: the stream ends after the error frame
    assert!(sub.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cursor_zero_receives_full_backfill() {
    let config = FirehoseConfig {
        preload_window: 1,
        new_events_timeout: Duration::from_millis(200),
        ..FirehoseConfig::default()
    };
    let host = test_host(config);

    host.create_repo(user(), None, None).await.unwrap();
    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("1"))])
        .await
        .unwrap();
    host.apply_writes(&user(), &[Write::create("co.ll", "t2", test_record("2"))])
        .await
        .unwrap();

    host.start_with_limit(Some(0)).await;

    let mut sub = host.subscribe(Some(0)).await.unwrap();
    let seqs = collect_seqs(&mut sub, 3).await;
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_tombstone_event_and_status() {
    let host = test_host(small_config());
    host.create_repo(user(), None, None).await.unwrap();
    host.start().await;

    let mut sub = host.subscribe(None).await.unwrap();

    let seq = host.tombstone_repo(&user()).await.unwrap();
    assert_eq!(seq, 2);

    let frame = next_frame(&mut sub).await;
    assert_eq!(frame.header.op, 1);
    assert_eq!(frame.header.t.as_deref(), Some("#tombstone"));
    let Payload::Lifecycle(Ipld::Map(payload)) = &frame.payload else {
        panic!("expected lifecycle payload");
    };
    assert_eq!(payload.get("seq"), Some(&Ipld::Integer(2)));
    assert_eq!(
        payload.get("did"),
        Some(&Ipld::String("did:web:user.com".to_string()))
    );
    assert!(payload.contains_key("time"));
    assert!(!payload.contains_key("$type"));

    let status = host.get_repo_status(&user()).await.unwrap();
    assert_eq!(status.did, "did:web:user.com");
    assert!(!status.active);
    assert_eq!(status.status.as_deref(), Some("deactivated"));

    // Content reads refuse
    let err = host.get_repo(&user(), None).await.unwrap_err();
    assert!(matches!(err, HostError::RepoDeactivated(_)));

    // Writes refuse too
    let err = host
        .apply_writes(&user(), &[Write::create("co.ll", "t9", test_record("x"))])
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::RepoDeactivated(_)));
}

#[tokio::test]
async fn test_skipped_seq_within_window_is_waited_for_then_skipped() {
    let config = FirehoseConfig {
        new_events_timeout: Duration::from_millis(100),
        wait_for_skipped_seq_window: 1_000,
        ..FirehoseConfig::default()
    };
    let host = test_host(config);

    host.create_repo(user(), None, None).await.unwrap(); // seq 1
    host.start().await;

    let mut sub = host.subscribe(None).await.unwrap();

    // Allocate a seq that never gets a commit (aborted transaction), then
    // commit under the next one.
    weft_repo::RepoStorage::allocate_seq(
        &**host.storage(),
        weft_repo::SUBSCRIBE_REPOS_NSID,
    )
    .await
    .unwrap(); // seq 2, burned
    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("x"))])
        .await
        .unwrap(); // seq 3

    // The collector waits out the gap, then proceeds past it permanently.
    let frame = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("collector never gave up on the gap")
        .unwrap()
        .unwrap();
    assert_eq!(frame.seq(), Some(3));
}

#[tokio::test]
async fn test_skipped_seq_older_than_window_is_not_waited_for() {
    let config = FirehoseConfig {
        // Long timeout: if the collector waited, this test would time out
        new_events_timeout: Duration::from_secs(30),
        wait_for_skipped_seq_window: 0,
        ..FirehoseConfig::default()
    };
    let host = test_host(config);

    host.create_repo(user(), None, None).await.unwrap(); // seq 1
    host.start().await;

    let mut sub = host.subscribe(None).await.unwrap();

    weft_repo::RepoStorage::allocate_seq(
        &**host.storage(),
        weft_repo::SUBSCRIBE_REPOS_NSID,
    )
    .await
    .unwrap(); // seq 2, burned
    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("x"))])
        .await
        .unwrap(); // seq 3

    let frame = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("collector should skip an old gap without waiting")
        .unwrap()
        .unwrap();
    assert_eq!(frame.seq(), Some(3));
}

#[tokio::test]
async fn test_two_subscribers_see_identical_frames() {
    let host = test_host(small_config());
    host.create_repo(user(), None, None).await.unwrap();
    host.start().await;

    let mut a = host.subscribe(None).await.unwrap();
    let mut b = host.subscribe(None).await.unwrap();

    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("x"))])
        .await
        .unwrap();

    let fa = next_frame(&mut a).await;
    let fb = next_frame(&mut b).await;

    assert_eq!(fa.to_bytes().unwrap(), fb.to_bytes().unwrap());
}

#[tokio::test]
async fn test_dropped_subscriber_is_removed() {
    let host = test_host(small_config());
    host.create_repo(user(), None, None).await.unwrap();
    host.start().await;

    let sub = host.subscribe(None).await.unwrap();
    drop(sub);

    // The stream keeps working for everyone else
    let mut live = host.subscribe(None).await.unwrap();
    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("x"))])
        .await
        .unwrap();
    assert_eq!(next_frame(&mut live).await.seq(), Some(2));
}

#[tokio::test]
async fn test_lifecycle_identity_and_account_events() {
    let host = test_host(small_config());
    host.create_repo(user(), None, None).await.unwrap();
    host.start().await;

    let mut sub = host.subscribe(None).await.unwrap();

    host.emit_identity_event(&user(), "user.com").await.unwrap(); // seq 2
    host.emit_account_event(&user(), false, Some("suspended"))
        .await
        .unwrap(); // seq 3

    let identity = next_frame(&mut sub).await;
    assert_eq!(identity.header.t.as_deref(), Some("#identity"));
    let Payload::Lifecycle(Ipld::Map(map)) = &identity.payload else {
        panic!("expected lifecycle payload");
    };
    assert_eq!(
        map.get("handle"),
        Some(&Ipld::String("user.com".to_string()))
    );

    let account = next_frame(&mut sub).await;
    assert_eq!(account.header.t.as_deref(), Some("#account"));
    let Payload::Lifecycle(Ipld::Map(map)) = &account.payload else {
        panic!("expected lifecycle payload");
    };
    assert_eq!(map.get("active"), Some(&Ipld::Bool(false)));
    assert_eq!(
        map.get("status"),
        Some(&Ipld::String("suspended".to_string()))
    );
}

#[tokio::test]
async fn test_commit_frame_blocks_verify_against_root() {
    // The commit frame's CAR must contain the commit block and enough MST
    // node blocks to resolve each op against the new root.
    let host = test_host(small_config());
    host.create_repo(user(), None, None).await.unwrap();
    host.start().await;

    let mut sub = host.subscribe(None).await.unwrap();
    let commit = host
        .apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("x"))])
        .await
        .unwrap();

    let frame = next_frame(&mut sub).await;
    let Payload::Commit(payload) = &frame.payload else {
        panic!("expected commit payload");
    };

    let parsed = weft_repo::car::parse_car_bytes(&payload.blocks).await.unwrap();
    assert_eq!(parsed.root, commit.cid);
    assert!(parsed.blocks.contains_key(&commit.cid));
    assert!(parsed.blocks.contains_key(&commit.data), "new MST root missing");
    let record_cid = commit.ops[0].cid.unwrap();
    assert!(parsed.blocks.contains_key(&record_cid), "record block missing");
}
