//! Repository operations: the signed commit chain over MST roots.
//!
//! A [`Repo`] owns a loaded head commit and the MST it points at. Writes are
//! applied as atomic batches: the new tree is built functionally, unstored
//! blocks are gathered, a commit is signed under a freshly allocated seq, and
//! everything is persisted together through [`RepoStorage::apply_commit`].

use crate::commit::{Commit, SigningKey};
use crate::error::{RepoError, Result};
use crate::mst::util::{compute_cid, encode_dag_cbor};
use crate::mst::{Diff, Mst};
use crate::storage::{RepoRecord, RepoStorage, SUBSCRIBE_REPOS_NSID};
use crate::types::{Did, Tid};
use bytes::Bytes;
use cid::Cid;
use ipld_core::ipld::Ipld;
use smol_str::{SmolStr, format_smolstr};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Kind of mutation a write performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Create a new record (error if the key exists)
    Create,
    /// Replace an existing record
    Update,
    /// Remove an existing record
    Delete,
}

impl Action {
    /// Lowercase wire name ("create", "update", "delete")
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// A single record write within a batch
#[derive(Debug, Clone)]
pub struct Write {
    /// What to do
    pub action: Action,
    /// Collection NSID
    pub collection: SmolStr,
    /// Record key within the collection
    pub rkey: SmolStr,
    /// Record body; required for create/update, ignored for delete
    pub record: Option<Ipld>,
}

impl Write {
    /// Create a new record
    pub fn create(collection: impl Into<SmolStr>, rkey: impl Into<SmolStr>, record: Ipld) -> Self {
        Self {
            action: Action::Create,
            collection: collection.into(),
            rkey: rkey.into(),
            record: Some(record),
        }
    }

    /// Replace an existing record
    pub fn update(collection: impl Into<SmolStr>, rkey: impl Into<SmolStr>, record: Ipld) -> Self {
        Self {
            action: Action::Update,
            collection: collection.into(),
            rkey: rkey.into(),
            record: Some(record),
        }
    }

    /// Delete an existing record
    pub fn delete(collection: impl Into<SmolStr>, rkey: impl Into<SmolStr>) -> Self {
        Self {
            action: Action::Delete,
            collection: collection.into(),
            rkey: rkey.into(),
            record: None,
        }
    }

    /// The record's MST key, `<collection>/<rkey>`
    pub fn path(&self) -> SmolStr {
        format_smolstr!("{}/{}", self.collection, self.rkey)
    }
}

/// A committed record operation, as carried by commit events
///
/// `cid` is None for deletes. `prev_cid` carries the record CID present
/// before the write for updates and deletes, so downstream consumers can
/// validate inductively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOp {
    /// Operation kind
    pub action: Action,
    /// `<collection>/<rkey>` path
    pub path: SmolStr,
    /// New record CID (None for deletes)
    pub cid: Option<Cid>,
    /// Record CID before the write (updates and deletes only)
    pub prev_cid: Option<Cid>,
}

/// Everything a commit writes, ready for atomic persistence
///
/// Contains the signed commit block and every other new block (records and
/// MST nodes), all tagged with the commit's sequence number.
#[derive(Debug, Clone)]
pub struct CommitData {
    /// Commit block CID
    pub cid: Cid,
    /// Repo the commit belongs to
    pub did: Did,
    /// Commit revision (seq as TID)
    pub rev: Tid,
    /// Sequence number shared by every block in this commit
    pub seq: i64,
    /// Previous commit CID (None for genesis)
    pub prev: Option<Cid>,
    /// New MST root CID
    pub data: Cid,
    /// Previous MST root CID (None for genesis)
    pub prev_data: Option<Cid>,
    /// New blocks to persist: commit, records, and changed MST nodes
    pub blocks: BTreeMap<Cid, Bytes>,
    /// Record operations in this commit
    pub ops: Vec<CommitOp>,
}

/// Callback invoked after each commit is persisted (firehose notify hook)
pub type CommitCallback = Box<dyn Fn(&CommitData) + Send + Sync>;

/// A loaded repository: head commit plus the MST it points at
pub struct Repo<S: RepoStorage> {
    storage: Arc<S>,
    mst: Mst<S>,
    head: Commit,
    head_cid: Cid,
    handle: Option<SmolStr>,
    callback: Option<CommitCallback>,
}

impl<S: RepoStorage + Sync + 'static> Repo<S> {
    /// Format a genesis commit for a new repository
    ///
    /// Builds an empty MST, applies any initial writes (creates only), signs
    /// the commit with `prev = None`, and returns the CommitData ready to
    /// persist. Nothing is written to storage.
    pub async fn format_init_commit<K>(
        storage: Arc<S>,
        did: Did,
        signing_key: &K,
        initial_writes: Option<&[Write]>,
    ) -> Result<CommitData>
    where
        K: SigningKey + ?Sized,
    {
        let mut mst = Mst::new(storage.clone());
        let mut blocks = BTreeMap::new();
        let mut ops = Vec::new();

        if let Some(writes) = initial_writes {
            for write in writes {
                if write.action != Action::Create {
                    return Err(RepoError::invalid_commit(
                        "initial commit can only contain creates",
                    ));
                }
                let record = write
                    .record
                    .as_ref()
                    .ok_or_else(|| RepoError::invalid_commit("create without a record"))?;

                let encoded = encode_dag_cbor(record)?;
                let cid = compute_cid(&encoded)?;
                blocks.insert(cid, Bytes::from(encoded));

                let path = write.path();
                mst = mst.add(&path, cid).await?;
                ops.push(CommitOp {
                    action: Action::Create,
                    path,
                    cid: Some(cid),
                    prev_cid: None,
                });
            }
        }

        let (data, mst_blocks) = mst.collect_blocks().await?;
        blocks.extend(mst_blocks);

        let seq = storage.allocate_seq(SUBSCRIBE_REPOS_NSID).await?;
        let rev = Tid::from_seq(seq);
        let commit = Commit::new_unsigned(did.clone(), data, rev.clone(), None).sign(signing_key)?;

        let commit_cbor = commit.to_cbor()?;
        let commit_cid = compute_cid(&commit_cbor)?;
        blocks.insert(commit_cid, Bytes::from(commit_cbor));

        Ok(CommitData {
            cid: commit_cid,
            did,
            rev,
            seq,
            prev: None,
            data,
            prev_data: None,
            blocks,
            ops,
        })
    }

    /// Persist a genesis commit and load the repository from it
    pub async fn create_from_commit(
        storage: Arc<S>,
        commit_data: CommitData,
        handle: Option<SmolStr>,
    ) -> Result<Self> {
        let commit_cid = commit_data.cid;
        let did = commit_data.did.clone();
        storage.apply_commit(commit_data).await?;

        storage
            .create_repo(&RepoRecord {
                did,
                handles: handle.iter().cloned().collect(),
                head: commit_cid,
                active: true,
                status: None,
            })
            .await?;

        let mut repo = Self::load(storage, commit_cid).await?;
        repo.handle = handle;
        Ok(repo)
    }

    /// Create a new repository with a signed genesis commit
    pub async fn create<K>(
        storage: Arc<S>,
        did: Did,
        signing_key: &K,
        handle: Option<SmolStr>,
        initial_writes: Option<&[Write]>,
    ) -> Result<Self>
    where
        K: SigningKey + ?Sized,
    {
        let commit =
            Self::format_init_commit(storage.clone(), did, signing_key, initial_writes).await?;
        Self::create_from_commit(storage, commit, handle).await
    }

    /// Load a repository from a commit CID
    ///
    /// The MST root is loaded lazily from `commit.data`.
    pub async fn load(storage: Arc<S>, commit_cid: Cid) -> Result<Self> {
        let block = storage
            .read(&commit_cid)
            .await?
            .ok_or_else(|| RepoError::not_found("commit", commit_cid))?;

        let commit = Commit::from_cbor(&block.encoded)?;
        let mst = Mst::load(storage.clone(), commit.data);

        debug!(did = %commit.did, commit = %commit_cid, "loaded repo");

        Ok(Self {
            storage,
            mst,
            head: commit,
            head_cid: commit_cid,
            handle: None,
            callback: None,
        })
    }

    /// Load a repository at its current head, by DID
    pub async fn load_did(storage: Arc<S>, did: &Did) -> Result<Self> {
        let row = storage
            .load_repo(did)
            .await?
            .ok_or_else(|| RepoError::not_found("repo", did))?;

        let mut repo = Self::load(storage, row.head).await?;
        repo.handle = row.handles.first().cloned();
        Ok(repo)
    }

    /// Set the commit callback, invoked after every `apply_writes`
    pub fn set_callback(&mut self, callback: impl Fn(&CommitData) + Send + Sync + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Repo DID
    pub fn did(&self) -> &Did {
        &self.head.did
    }

    /// Head commit
    pub fn head(&self) -> &Commit {
        &self.head
    }

    /// Head commit CID
    pub fn head_cid(&self) -> &Cid {
        &self.head_cid
    }

    /// Primary handle, if any
    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    /// The current MST
    pub fn mst(&self) -> &Mst<S> {
        &self.mst
    }

    /// Reference to the underlying storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Read a record by collection and rkey
    pub async fn get_record(&self, collection: &str, rkey: &str) -> Result<Option<Ipld>> {
        let key = format_smolstr!("{collection}/{rkey}");
        match self.mst.get(&key).await? {
            Some(cid) => {
                let block = self
                    .storage
                    .read(&cid)
                    .await?
                    .ok_or_else(|| RepoError::not_found("record block", cid))?;
                Ok(Some(block.decode()?))
            }
            None => Ok(None),
        }
    }

    /// All records, as {collection: {rkey: record}}
    pub async fn get_contents(&self) -> Result<BTreeMap<SmolStr, BTreeMap<SmolStr, Ipld>>> {
        let leaves = self.mst.leaves().await?;
        let cids: Vec<Cid> = leaves.iter().map(|(_, cid)| *cid).collect();
        let (found, missing) = self.storage.read_many(&cids).await?;

        if let Some(cid) = missing.first() {
            return Err(RepoError::not_found("record block", cid));
        }

        let mut contents: BTreeMap<SmolStr, BTreeMap<SmolStr, Ipld>> = BTreeMap::new();
        for (key, cid) in leaves {
            let (collection, rkey) = key
                .split_once('/')
                .ok_or_else(|| RepoError::invalid_key(key.as_str()))?;
            if let Some(record) = found.get(&cid) {
                contents
                    .entry(SmolStr::new(collection))
                    .or_default()
                    .insert(SmolStr::new(rkey), record.clone());
            }
        }

        Ok(contents)
    }

    /// Build a signed commit for a batch of writes, without persisting
    ///
    /// Applies each write in order to a functional copy of the tree, gathers
    /// unstored blocks (changed MST nodes, new records, and any block that
    /// was removed and re-added within the batch), allocates the commit seq,
    /// and signs. The repo's in-memory state is not touched; callers go
    /// through [`Repo::apply_commit`] to advance it.
    pub async fn format_commit<K>(&self, writes: &[Write], signing_key: &K) -> Result<CommitData>
    where
        K: SigningKey + ?Sized,
    {
        let mut mst = self.mst.clone();
        let mut record_blocks = BTreeMap::new();
        let mut ops = Vec::new();

        for write in writes {
            let path = write.path();

            match write.action {
                Action::Create | Action::Update => {
                    let record = write.record.as_ref().ok_or_else(|| {
                        RepoError::invalid_commit(format!(
                            "{} without a record: {path}",
                            write.action.as_str()
                        ))
                    })?;
                    let encoded = encode_dag_cbor(record)?;
                    let cid = compute_cid(&encoded)?;
                    record_blocks.insert(cid, Bytes::from(encoded));

                    if write.action == Action::Create {
                        mst = mst.add(&path, cid).await?;
                        ops.push(CommitOp {
                            action: Action::Create,
                            path,
                            cid: Some(cid),
                            prev_cid: None,
                        });
                    } else {
                        let prev_cid = mst
                            .get(&path)
                            .await?
                            .ok_or_else(|| RepoError::key_missing(&path))?;
                        mst = mst.update(&path, cid).await?;
                        ops.push(CommitOp {
                            action: Action::Update,
                            path,
                            cid: Some(cid),
                            prev_cid: Some(prev_cid),
                        });
                    }
                }
                Action::Delete => {
                    let prev_cid = mst
                        .get(&path)
                        .await?
                        .ok_or_else(|| RepoError::key_missing(&path))?;
                    mst = mst.delete(&path).await?;
                    ops.push(CommitOp {
                        action: Action::Delete,
                        path,
                        cid: None,
                        prev_cid: Some(prev_cid),
                    });
                }
            }
        }

        let data = mst.root().await?;
        let diff = Diff::of(&mst, &self.mst).await?;

        let mut blocks = diff.new_mst_blocks.clone();
        blocks.extend(record_blocks);

        // Re-read any blocks that were removed and then re-added within this
        // batch so the commit still carries them.
        let missing: Vec<Cid> = diff
            .new_cids()
            .into_iter()
            .filter(|cid| !blocks.contains_key(cid))
            .collect();
        if !missing.is_empty() {
            let (found, not_found) = self.storage.read_blocks(&missing).await?;
            if let Some(cid) = not_found.first() {
                return Err(RepoError::not_found("commit block source", cid));
            }
            for (cid, block) in found {
                blocks.insert(cid, block.encoded);
            }
        }

        let seq = self.storage.allocate_seq(SUBSCRIBE_REPOS_NSID).await?;
        let rev = Tid::from_seq(seq);
        let commit = Commit::new_unsigned(
            self.head.did.clone(),
            data,
            rev.clone(),
            Some(self.head_cid),
        )
        .sign(signing_key)?;

        let commit_cbor = commit.to_cbor()?;
        let commit_cid = compute_cid(&commit_cbor)?;
        blocks.insert(commit_cid, Bytes::from(commit_cbor));

        Ok(CommitData {
            cid: commit_cid,
            did: self.head.did.clone(),
            rev,
            seq,
            prev: Some(self.head_cid),
            data,
            prev_data: Some(self.head.data),
            blocks,
            ops,
        })
    }

    /// Atomically persist a formatted commit and advance the in-memory head
    ///
    /// On storage failure (`CommitConflict` among others) the repo's
    /// in-memory state is left unchanged.
    pub async fn apply_commit(&mut self, commit_data: CommitData) -> Result<Cid> {
        let commit_cid = commit_data.cid;
        let data = commit_data.data;

        self.storage.apply_commit(commit_data).await?;

        let block = self
            .storage
            .read(&commit_cid)
            .await?
            .ok_or_else(|| RepoError::not_found("commit block", commit_cid))?;
        self.head = Commit::from_cbor(&block.encoded)?;
        self.head_cid = commit_cid;
        self.mst = Mst::load(self.storage.clone(), data);

        Ok(commit_cid)
    }

    /// Apply a batch of writes as one commit
    ///
    /// Formats, signs, persists, advances the head, and invokes the commit
    /// callback. Any precondition or storage failure aborts before the repo
    /// state advances.
    pub async fn apply_writes<K>(&mut self, writes: &[Write], signing_key: &K) -> Result<CommitData>
    where
        K: SigningKey + ?Sized,
    {
        let commit_data = self.format_commit(writes, signing_key).await?;
        self.apply_commit(commit_data.clone()).await?;

        if let Some(callback) = &self.callback {
            callback(&commit_data);
        }

        Ok(commit_data)
    }
}
