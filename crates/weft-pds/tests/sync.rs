//! Wire method tests: CAR exports, status queries, pagination.

use std::collections::BTreeMap;
use std::sync::Arc;

use ipld_core::ipld::Ipld;
use weft_pds::{FirehoseConfig, HostError, RepoHost};
use weft_repo::car::parse_car_bytes;
use weft_repo::mst::dag_cbor_cid;
use weft_repo::{Did, MemoryStorage, Tid, Write};

fn test_record(text: &str) -> Ipld {
    let mut map = BTreeMap::new();
    map.insert("foo".to_string(), Ipld::String(text.to_string()));
    Ipld::Map(map)
}

fn test_host() -> RepoHost<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    RepoHost::new(storage, key, FirehoseConfig::default())
}

fn user() -> Did {
    Did::new("did:web:user.com").unwrap()
}

#[tokio::test]
async fn test_get_repo_full_export() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();
    let commit = host
        .apply_writes(
            &user(),
            &[
                Write::create("co.ll", "t1", test_record("one")),
                Write::create("co.ll", "t2", test_record("two")),
            ],
        )
        .await
        .unwrap();

    let car = host.get_repo(&user(), None).await.unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();

    assert_eq!(parsed.root, commit.cid);
    assert!(parsed.blocks.contains_key(&commit.cid));
    assert!(parsed.blocks.contains_key(&commit.data));
    assert!(
        parsed
            .blocks
            .contains_key(&dag_cbor_cid(&test_record("one")).unwrap())
    );
    assert!(
        parsed
            .blocks
            .contains_key(&dag_cbor_cid(&test_record("two")).unwrap())
    );
}

#[tokio::test]
async fn test_get_repo_since_is_incremental() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();
    let first = host
        .apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("one"))])
        .await
        .unwrap();
    let second = host
        .apply_writes(&user(), &[Write::create("co.ll", "t2", test_record("two"))])
        .await
        .unwrap();

    // Everything the second commit introduced, nothing the first did
    let car = host.get_repo(&user(), Some(&second.rev)).await.unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();

    assert_eq!(parsed.root, second.cid);
    assert!(parsed.blocks.contains_key(&second.cid));
    let second_record = dag_cbor_cid(&test_record("two")).unwrap();
    let first_record = dag_cbor_cid(&test_record("one")).unwrap();
    assert!(parsed.blocks.contains_key(&second_record));
    assert!(!parsed.blocks.contains_key(&first_record));
    assert!(!parsed.blocks.contains_key(&first.cid));

    // A since of seq 1 includes both commits' blocks
    let car = host.get_repo(&user(), Some(&Tid::from_seq(1))).await.unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();
    assert!(parsed.blocks.contains_key(&first_record));
    assert!(parsed.blocks.contains_key(&second_record));
}

#[tokio::test]
async fn test_get_repo_unknown_did() {
    let host = test_host();
    let err = host.get_repo(&user(), None).await.unwrap_err();
    assert!(matches!(err, HostError::RepoNotFound(_)));
}

#[tokio::test]
async fn test_get_latest_commit() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();
    let commit = host
        .apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("one"))])
        .await
        .unwrap();

    let latest = host.get_latest_commit(&user()).await.unwrap();
    assert_eq!(latest.cid, commit.cid.to_string());
    assert_eq!(latest.rev, commit.rev);
}

#[tokio::test]
async fn test_get_record_proof() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();
    host.apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("one"))])
        .await
        .unwrap();

    let car = host.get_record_proof(&user(), "co.ll", "t1").await.unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();

    let record_cid = dag_cbor_cid(&test_record("one")).unwrap();
    assert_eq!(parsed.root, record_cid);
    assert_eq!(parsed.blocks.len(), 1);

    let bytes = parsed.blocks.get(&record_cid).unwrap();
    let decoded: Ipld = serde_ipld_dagcbor::from_slice(bytes).unwrap();
    assert_eq!(decoded, test_record("one"));
}

#[tokio::test]
async fn test_get_record_missing() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();

    let err = host
        .get_record_proof(&user(), "co.ll", "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::BlockNotFound(_)));
}

#[tokio::test]
async fn test_get_blocks() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();
    let commit = host
        .apply_writes(&user(), &[Write::create("co.ll", "t1", test_record("one"))])
        .await
        .unwrap();

    let record_cid = dag_cbor_cid(&test_record("one")).unwrap();
    let car = host
        .get_blocks(&user(), &[commit.cid, record_cid])
        .await
        .unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();

    assert_eq!(parsed.blocks.len(), 2);
    assert!(parsed.blocks.contains_key(&commit.cid));
    assert!(parsed.blocks.contains_key(&record_cid));
}

#[tokio::test]
async fn test_get_blocks_missing_cid_fails() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();

    let absent = dag_cbor_cid(&test_record("never written")).unwrap();
    let err = host.get_blocks(&user(), &[absent]).await.unwrap_err();
    assert!(matches!(err, HostError::BlockNotFound(_)));
}

#[tokio::test]
async fn test_list_repos_pagination() {
    let host = test_host();
    for i in 0..5 {
        let did = Did::new(format!("did:web:user{i}.com")).unwrap();
        host.create_repo(did, None, None).await.unwrap();
    }

    let page1 = host.list_repos(None, 2).await.unwrap();
    assert_eq!(page1.repos.len(), 2);
    assert_eq!(page1.repos[0].did, "did:web:user0.com");
    assert!(page1.repos.iter().all(|r| r.active));
    assert!(page1.cursor.is_some());

    let page2 = host.list_repos(page1.cursor.as_deref(), 2).await.unwrap();
    assert_eq!(page2.repos.len(), 2);
    assert_eq!(page2.repos[0].did, "did:web:user2.com");

    let page3 = host
        .list_repos(page2.cursor.as_deref(), 2)
        .await
        .unwrap();
    assert_eq!(page3.repos.len(), 1);
    assert_eq!(page3.repos[0].did, "did:web:user4.com");
    assert!(page3.cursor.is_none());
}

#[tokio::test]
async fn test_list_repos_shows_tombstoned_status() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();
    host.tombstone_repo(&user()).await.unwrap();

    let page = host.list_repos(None, 10).await.unwrap();
    assert_eq!(page.repos.len(), 1);
    assert!(!page.repos[0].active);
    assert_eq!(page.repos[0].status.as_deref(), Some("deactivated"));
}

#[tokio::test]
async fn test_repo_status_active() {
    let host = test_host();
    host.create_repo(user(), None, None).await.unwrap();

    let status = host.get_repo_status(&user()).await.unwrap();
    assert_eq!(status.did, "did:web:user.com");
    assert!(status.active);
    assert!(status.status.is_none());
}
