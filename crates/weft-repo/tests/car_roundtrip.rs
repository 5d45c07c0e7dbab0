//! Cross-module integration: commit a repo, export it as a CAR, import the
//! CAR into a fresh store, and read everything back.

use std::collections::BTreeMap;
use std::sync::Arc;

use ipld_core::ipld::Ipld;
use weft_repo::car::{export_repo_car_bytes, parse_car_bytes};
use weft_repo::{Did, MemoryStorage, Repo, RepoStorage, Write};

fn record(n: i64) -> Ipld {
    let mut map = BTreeMap::new();
    map.insert("text".to_string(), Ipld::String(format!("post #{n}")));
    map.insert("n".to_string(), Ipld::Integer(n as i128));
    Ipld::Map(map)
}

#[tokio::test]
async fn test_export_import_roundtrip() {
    let storage = Arc::new(MemoryStorage::new());
    let did = Did::new("did:web:user.com").unwrap();
    let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);

    let mut repo = Repo::create(storage.clone(), did.clone(), &key, None, None)
        .await
        .unwrap();

    let writes: Vec<Write> = (0..30i64)
        .map(|i| Write::create("app.bsky.feed.post", format!("rkey{i:02}"), record(i)))
        .collect();
    repo.apply_writes(&writes, &key).await.unwrap();

    // Export everything reachable from the head
    let car = export_repo_car_bytes(*repo.head_cid(), repo.mst())
        .await
        .unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();
    assert_eq!(parsed.root, *repo.head_cid());

    // Import into a fresh store and load the repo from the CAR root
    let mirror = Arc::new(MemoryStorage::new());
    mirror.put_many(parsed.blocks, 0).await.unwrap();

    let loaded = Repo::load(mirror, parsed.root).await.unwrap();
    assert_eq!(loaded.did(), &did);
    assert_eq!(loaded.head(), repo.head());

    for i in 0..30i64 {
        let got = loaded
            .get_record("app.bsky.feed.post", &format!("rkey{i:02}"))
            .await
            .unwrap();
        assert_eq!(got, Some(record(i)));
    }

    // The mirrored tree reproduces the same root CID
    assert_eq!(
        loaded.mst().root().await.unwrap(),
        repo.mst().root().await.unwrap()
    );
}

#[tokio::test]
async fn test_export_after_updates_and_deletes() {
    let storage = Arc::new(MemoryStorage::new());
    let did = Did::new("did:web:user.com").unwrap();
    let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);

    let mut repo = Repo::create(storage.clone(), did, &key, None, None)
        .await
        .unwrap();

    repo.apply_writes(
        &[
            Write::create("co.ll", "keep", record(1)),
            Write::create("co.ll", "gone", record(2)),
        ],
        &key,
    )
    .await
    .unwrap();
    repo.apply_writes(
        &[
            Write::update("co.ll", "keep", record(10)),
            Write::delete("co.ll", "gone"),
        ],
        &key,
    )
    .await
    .unwrap();

    let car = export_repo_car_bytes(*repo.head_cid(), repo.mst())
        .await
        .unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();

    let mirror = Arc::new(MemoryStorage::new());
    mirror.put_many(parsed.blocks, 0).await.unwrap();
    let loaded = Repo::load(mirror, parsed.root).await.unwrap();

    assert_eq!(
        loaded.get_record("co.ll", "keep").await.unwrap(),
        Some(record(10))
    );
    assert_eq!(loaded.get_record("co.ll", "gone").await.unwrap(), None);
}
