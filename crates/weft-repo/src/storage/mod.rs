//! Block storage abstraction: CID-keyed blocks with sequence tagging, the
//! event log, and repo rows.

use crate::error::{RepoError, Result};
use crate::repo::CommitData;
use crate::types::Did;
use bytes::Bytes;
use cid::Cid;
use ipld_core::ipld::Ipld;
use smol_str::SmolStr;
use std::collections::BTreeMap;

/// NSID of the event stream all commit sequence numbers are allocated under
pub const SUBSCRIBE_REPOS_NSID: &str = "com.atproto.sync.subscribeRepos";

/// A stored block: encoded bytes plus the sequence number assigned at first
/// write. Both are write-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Canonical DAG-CBOR bytes
    pub encoded: Bytes,
    /// Sequence number assigned when the block was first written. Blocks
    /// written outside the event stream (bulk imports) carry 0.
    pub seq: i64,
}

impl Block {
    /// Decode the block's DAG-CBOR payload
    pub fn decode(&self) -> Result<Ipld> {
        serde_ipld_dagcbor::from_slice(&self.encoded).map_err(|e| RepoError::serialization(e))
    }
}

/// A repo row: metadata only, blocks live in the block table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRecord {
    /// Repo DID (row key)
    pub did: Did,
    /// Handles currently pointing at this repo
    pub handles: Vec<SmolStr>,
    /// Head commit CID
    pub head: Cid,
    /// False once tombstoned
    pub active: bool,
    /// Status string for inactive repos, e.g. "deactivated"
    pub status: Option<SmolStr>,
}

/// An entry in the event log, identified by seq.
#[derive(Debug, Clone)]
pub enum Event {
    /// A commit: the commit block, its ops, and every block written with it
    Commit(CommitData),
    /// A non-commit lifecycle record (`#identity`, `#account`, `#tombstone`, ...)
    Lifecycle {
        /// Sequence number of the event
        seq: i64,
        /// The decoded record, including its `$type` tag
        record: Ipld,
    },
}

impl Event {
    /// Sequence number of this event
    pub fn seq(&self) -> i64 {
        match self {
            Event::Commit(commit) => commit.seq,
            Event::Lifecycle { seq, .. } => *seq,
        }
    }
}

/// Async storage trait for repos: blocks, the event log, sequences, and repo
/// rows.
///
/// Implementations must make `apply_commit` atomic and serialisable with
/// respect to other `apply_commit` calls for the same repo: either all of
/// {blocks, head update, repo row, event log entry} become visible together,
/// or none do. `allocate_seq` is linearisable globally.
///
/// Clone is required so the MST can share storage references across tree
/// operations.
#[trait_variant::make(Send)]
pub trait RepoStorage: Clone {
    /// Read a block by CID. Returns `None` if not stored.
    async fn read(&self, cid: &Cid) -> Result<Option<Block>>;

    /// Check whether a block is stored without reading it
    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Read many blocks, decoded. Returns (found, missing).
    async fn read_many(&self, cids: &[Cid]) -> Result<(BTreeMap<Cid, Ipld>, Vec<Cid>)>;

    /// Read many blocks with their encoded bytes and seqs. Returns
    /// (found, missing).
    async fn read_blocks(&self, cids: &[Cid]) -> Result<(BTreeMap<Cid, Block>, Vec<Cid>)>;

    /// Encode and store a single value under a freshly allocated seq in the
    /// event-stream namespace. Returns its CID.
    async fn write(&self, value: &Ipld) -> Result<Cid>;

    /// Store a lifecycle event record (a map carrying `$type`). Allocates a
    /// fresh seq, adds it to the record under `"seq"`, stores the encoded
    /// block, and registers the event in the log. Returns (seq, cid).
    async fn write_event(&self, record: Ipld) -> Result<(i64, Cid)>;

    /// Store pre-encoded blocks under an explicit seq, outside any commit.
    ///
    /// First write wins: a block that already exists keeps its original bytes
    /// and seq; differing bytes are a `ReadonlyViolation`.
    async fn put_many(&self, blocks: BTreeMap<Cid, Bytes>, seq: i64) -> Result<()>;

    /// Atomically apply a commit: persist every new block under the commit's
    /// seq, advance the repo head (creating the repo row for a genesis
    /// commit), and append the commit to the event log.
    ///
    /// Fails with `CommitConflict` when the commit's `prev` does not match
    /// the stored head (or a genesis commit targets an existing repo).
    async fn apply_commit(&self, commit: CommitData) -> Result<()>;

    /// Allocate the next sequence number for an event stream
    async fn allocate_seq(&self, nsid: &str) -> Result<i64>;

    /// The most recently allocated sequence number (0 if none)
    async fn last_seq(&self, nsid: &str) -> Result<i64>;

    /// Read events with `seq >= start` in ascending seq order
    async fn read_events_by_seq(&self, start: i64) -> Result<Vec<Event>>;

    /// Store a repo row
    async fn create_repo(&self, repo: &RepoRecord) -> Result<()>;

    /// Load a repo row by DID
    async fn load_repo(&self, did: &Did) -> Result<Option<RepoRecord>>;

    /// Load a repo row by handle
    async fn load_repo_by_handle(&self, handle: &str) -> Result<Option<RepoRecord>>;

    /// All repo rows, ordered by DID
    async fn list_repos(&self) -> Result<Vec<RepoRecord>>;

    /// Mark a repo inactive with status "deactivated"
    async fn tombstone_repo(&self, did: &Did) -> Result<()>;
}

pub mod memory;

pub use memory::MemoryStorage;
