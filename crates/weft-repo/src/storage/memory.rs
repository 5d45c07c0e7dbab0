//! In-memory storage implementation

use crate::error::{RepoError, Result};
use crate::mst::util::{compute_cid, encode_dag_cbor};
use crate::repo::CommitData;
use crate::storage::{Block, Event, RepoRecord, RepoStorage, SUBSCRIBE_REPOS_NSID};
use crate::types::Did;
use bytes::Bytes;
use cid::Cid;
use ipld_core::ipld::Ipld;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::{Arc, RwLock};

/// In-memory storage over three BTreeMap "tables" (blocks, repos, sequences)
/// plus the event log.
///
/// Useful for testing and single-process deployments. All trait operations
/// take the inner lock once, which makes `apply_commit` trivially atomic and
/// `allocate_seq` linearisable.
///
/// Uses `Bytes` for cheap reference-counted block payloads.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Block table: CID → (encoded, seq), both write-once
    blocks: BTreeMap<Cid, Block>,
    /// Event log keyed by seq
    events: BTreeMap<i64, Event>,
    /// Repo table keyed by DID
    repos: BTreeMap<Did, RepoRecord>,
    /// Sequence table: NSID → next value
    sequences: BTreeMap<SmolStr, i64>,
}

impl Inner {
    /// First write wins; differing bytes for the same CID violate the
    /// write-once discipline.
    fn put_block(&mut self, cid: Cid, encoded: Bytes, seq: i64) -> Result<()> {
        if let Some(existing) = self.blocks.get(&cid) {
            if existing.encoded != encoded {
                return Err(RepoError::readonly("block", cid));
            }
            return Ok(());
        }
        self.blocks.insert(cid, Block { encoded, seq });
        Ok(())
    }

    fn next_seq(&mut self, nsid: &str) -> i64 {
        let next = self.sequences.entry(SmolStr::new(nsid)).or_insert(1);
        let seq = *next;
        *next += 1;
        seq
    }
}

impl MemoryStorage {
    /// Create new empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks stored
    pub fn block_count(&self) -> usize {
        self.inner.read().unwrap().blocks.len()
    }

    /// Store a single pre-encoded block outside the event stream. Test helper.
    pub async fn put_block(&self, cid: Cid, encoded: impl Into<Bytes>) -> Result<()> {
        self.inner.write().unwrap().put_block(cid, encoded.into(), 0)
    }
}

impl RepoStorage for MemoryStorage {
    async fn read(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self.inner.read().unwrap().blocks.get(cid).cloned())
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.inner.read().unwrap().blocks.contains_key(cid))
    }

    async fn read_many(&self, cids: &[Cid]) -> Result<(BTreeMap<Cid, Ipld>, Vec<Cid>)> {
        let (blocks, missing) = self.read_blocks(cids).await?;
        let mut found = BTreeMap::new();
        for (cid, block) in blocks {
            found.insert(cid, block.decode()?);
        }
        Ok((found, missing))
    }

    async fn read_blocks(&self, cids: &[Cid]) -> Result<(BTreeMap<Cid, Block>, Vec<Cid>)> {
        let inner = self.inner.read().unwrap();
        let mut found = BTreeMap::new();
        let mut missing = Vec::new();
        for cid in cids {
            match inner.blocks.get(cid) {
                Some(block) => {
                    found.insert(*cid, block.clone());
                }
                None => missing.push(*cid),
            }
        }
        Ok((found, missing))
    }

    async fn write(&self, value: &Ipld) -> Result<Cid> {
        let encoded = encode_dag_cbor(value)?;
        let cid = compute_cid(&encoded)?;

        let mut inner = self.inner.write().unwrap();
        let seq = inner.next_seq(SUBSCRIBE_REPOS_NSID);
        inner.put_block(cid, Bytes::from(encoded), seq)?;
        Ok(cid)
    }

    async fn write_event(&self, record: Ipld) -> Result<(i64, Cid)> {
        let Ipld::Map(mut map) = record else {
            return Err(RepoError::invalid("lifecycle event record must be a map"));
        };

        let mut inner = self.inner.write().unwrap();
        let seq = inner.next_seq(SUBSCRIBE_REPOS_NSID);
        map.insert("seq".to_string(), Ipld::Integer(seq as i128));

        let record = Ipld::Map(map);
        let encoded = encode_dag_cbor(&record)?;
        let cid = compute_cid(&encoded)?;

        inner.put_block(cid, Bytes::from(encoded), seq)?;
        inner.events.insert(seq, Event::Lifecycle { seq, record });
        Ok((seq, cid))
    }

    async fn put_many(&self, blocks: BTreeMap<Cid, Bytes>, seq: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for (cid, encoded) in blocks {
            inner.put_block(cid, encoded, seq)?;
        }
        Ok(())
    }

    async fn apply_commit(&self, commit: CommitData) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        // Serialisability per repo: the commit must extend the stored head.
        match (inner.repos.get(&commit.did), commit.prev) {
            (Some(row), Some(prev)) if row.head != prev => {
                return Err(RepoError::commit_conflict(format!(
                    "prev {} does not match head {} for {}",
                    prev, row.head, commit.did
                )));
            }
            (Some(row), None) => {
                return Err(RepoError::commit_conflict(format!(
                    "genesis commit for existing repo {} at head {}",
                    commit.did, row.head
                )));
            }
            (None, Some(prev)) => {
                return Err(RepoError::commit_conflict(format!(
                    "commit with prev {} for unknown repo {}",
                    prev, commit.did
                )));
            }
            _ => {}
        }

        // Validate write-once before touching anything so a conflicting block
        // leaves no partial state.
        for (cid, encoded) in &commit.blocks {
            if let Some(existing) = inner.blocks.get(cid) {
                if existing.encoded != *encoded {
                    return Err(RepoError::readonly("block", cid));
                }
            }
        }

        for (cid, encoded) in &commit.blocks {
            inner.put_block(*cid, encoded.clone(), commit.seq)?;
        }

        match inner.repos.entry(commit.did.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().head = commit.cid;
            }
            Entry::Vacant(entry) => {
                entry.insert(RepoRecord {
                    did: commit.did.clone(),
                    handles: Vec::new(),
                    head: commit.cid,
                    active: true,
                    status: None,
                });
            }
        }

        inner.events.insert(commit.seq, Event::Commit(commit));
        Ok(())
    }

    async fn allocate_seq(&self, nsid: &str) -> Result<i64> {
        Ok(self.inner.write().unwrap().next_seq(nsid))
    }

    async fn last_seq(&self, nsid: &str) -> Result<i64> {
        let inner = self.inner.read().unwrap();
        Ok(inner.sequences.get(nsid).map(|next| next - 1).unwrap_or(0))
    }

    async fn read_events_by_seq(&self, start: i64) -> Result<Vec<Event>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.events.range(start.max(1)..).map(|(_, e)| e.clone()).collect())
    }

    async fn create_repo(&self, repo: &RepoRecord) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .repos
            .insert(repo.did.clone(), repo.clone());
        Ok(())
    }

    async fn load_repo(&self, did: &Did) -> Result<Option<RepoRecord>> {
        Ok(self.inner.read().unwrap().repos.get(did).cloned())
    }

    async fn load_repo_by_handle(&self, handle: &str) -> Result<Option<RepoRecord>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .repos
            .values()
            .find(|r| r.handles.iter().any(|h| h == handle))
            .cloned())
    }

    async fn list_repos(&self) -> Result<Vec<RepoRecord>> {
        Ok(self.inner.read().unwrap().repos.values().cloned().collect())
    }

    async fn tombstone_repo(&self, did: &Did) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .repos
            .get_mut(did)
            .ok_or_else(|| RepoError::not_found("repo", did))?;
        row.active = false;
        row.status = Some(SmolStr::new("deactivated"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mst::util::dag_cbor_cid;

    fn record(n: i64) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Ipld::Integer(n as i128));
        Ipld::Map(map)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let store = MemoryStorage::new();
        let value = record(1);

        let cid = store.write(&value).await.unwrap();
        let block = store.read(&cid).await.unwrap().unwrap();

        assert_eq!(block.seq, 1);
        assert_eq!(block.decode().unwrap(), value);
        assert!(store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_many_reports_missing() {
        let store = MemoryStorage::new();
        let cid1 = store.write(&record(1)).await.unwrap();
        let fake = dag_cbor_cid(&record(99)).unwrap();

        let (found, missing) = store.read_many(&[cid1, fake]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec![fake]);
    }

    #[tokio::test]
    async fn test_seq_allocation_monotonic() {
        let store = MemoryStorage::new();
        assert_eq!(store.last_seq(SUBSCRIBE_REPOS_NSID).await.unwrap(), 0);

        let a = store.allocate_seq(SUBSCRIBE_REPOS_NSID).await.unwrap();
        let b = store.allocate_seq(SUBSCRIBE_REPOS_NSID).await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(store.last_seq(SUBSCRIBE_REPOS_NSID).await.unwrap(), 2);

        // Independent namespaces
        assert_eq!(store.allocate_seq("other.stream").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_once_rejects_conflicting_bytes() {
        let store = MemoryStorage::new();
        let cid = store.write(&record(1)).await.unwrap();

        let err = store
            .put_block(cid, Bytes::from_static(b"different"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::RepoErrorKind::ReadonlyViolation
        ));
    }

    #[tokio::test]
    async fn test_rewrite_identical_block_keeps_seq() {
        let store = MemoryStorage::new();
        let value = record(1);
        let cid = store.write(&value).await.unwrap();
        let original_seq = store.read(&cid).await.unwrap().unwrap().seq;

        // Same bytes again: no-op, seq unchanged
        store.write(&value).await.unwrap();
        assert_eq!(store.read(&cid).await.unwrap().unwrap().seq, original_seq);
    }

    #[tokio::test]
    async fn test_write_event_injects_seq() {
        let store = MemoryStorage::new();
        let mut map = BTreeMap::new();
        map.insert(
            "$type".to_string(),
            Ipld::String("com.atproto.sync.subscribeRepos#tombstone".to_string()),
        );
        map.insert("did".to_string(), Ipld::String("did:web:user.com".to_string()));

        let (seq, cid) = store.write_event(Ipld::Map(map)).await.unwrap();
        assert_eq!(seq, 1);

        let block = store.read(&cid).await.unwrap().unwrap();
        assert_eq!(block.seq, 1);

        let events = store.read_events_by_seq(0).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Lifecycle { seq, record } => {
                assert_eq!(*seq, 1);
                let Ipld::Map(map) = record else { panic!("not a map") };
                assert_eq!(map.get("seq"), Some(&Ipld::Integer(1)));
            }
            _ => panic!("expected lifecycle event"),
        }
    }

    #[tokio::test]
    async fn test_tombstone_repo() {
        let store = MemoryStorage::new();
        let did = Did::new("did:web:user.com").unwrap();
        let head = dag_cbor_cid(&record(1)).unwrap();

        store
            .create_repo(&RepoRecord {
                did: did.clone(),
                handles: vec![SmolStr::new("user.com")],
                head,
                active: true,
                status: None,
            })
            .await
            .unwrap();

        store.tombstone_repo(&did).await.unwrap();

        let row = store.load_repo(&did).await.unwrap().unwrap();
        assert!(!row.active);
        assert_eq!(row.status.as_deref(), Some("deactivated"));

        // lookup by handle still works
        let by_handle = store.load_repo_by_handle("user.com").await.unwrap();
        assert!(by_handle.is_some());
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let store1 = MemoryStorage::new();
        let store2 = store1.clone();

        let cid = store1.write(&record(1)).await.unwrap();
        assert!(store2.has(&cid).await.unwrap());
    }
}
