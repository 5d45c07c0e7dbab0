//! Sync wire methods: repo export, block fetches, and status queries.
//!
//! Outputs use wire-exact field names; multi-block responses are CAR bytes.

use std::collections::BTreeMap;

use bytes::Bytes;
use cid::Cid;
use smol_str::{SmolStr, format_smolstr};

use weft_repo::car::{export_repo_car_bytes, write_car_bytes};
use weft_repo::mst::WalkItem;
use weft_repo::{Commit, Did, Repo, RepoRecord, RepoStorage, Tid};

use crate::error::{HostError, Result};
use crate::firehose::Subscription;
use crate::host::RepoHost;

/// `getLatestCommit` output
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LatestCommit {
    /// Head commit CID, base32
    pub cid: String,
    /// Head commit revision
    pub rev: Tid,
}

/// `getRepoStatus` output
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RepoStatus {
    /// Repo DID
    pub did: String,
    /// Whether the repo is active
    pub active: bool,
    /// Status string for inactive repos
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One entry in a `listRepos` page
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RepoInfo {
    /// Repo DID
    pub did: String,
    /// Head commit CID, base32
    pub head: String,
    /// Head commit revision
    pub rev: Tid,
    /// Whether the repo is active
    pub active: bool,
    /// Status string for inactive repos
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// `listRepos` output
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RepoPage {
    /// Repos in this page, ordered by DID
    pub repos: Vec<RepoInfo>,
    /// Cursor for the next page, when more repos remain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl<S: RepoStorage + Send + Sync + 'static> RepoHost<S> {
    async fn active_repo_row(&self, did: &Did) -> Result<RepoRecord> {
        let row = self
            .storage()
            .load_repo(did)
            .await?
            .ok_or_else(|| HostError::RepoNotFound(did.to_string()))?;
        if !row.active {
            return Err(HostError::RepoDeactivated(did.to_string()));
        }
        Ok(row)
    }

    /// `getRepo`: export a repo as a CAR with roots = [head commit CID].
    ///
    /// Without `since`, every reachable block is included. With `since`, only
    /// reachable blocks introduced by commits with `seq >= since` are kept
    /// (an incremental diff against the caller's mirror).
    pub async fn get_repo(&self, did: &Did, since: Option<&Tid>) -> Result<Vec<u8>> {
        let row = self.active_repo_row(did).await?;
        let repo = Repo::load(self.storage().clone(), row.head).await?;

        let Some(since) = since else {
            return Ok(export_repo_car_bytes(row.head, repo.mst()).await?);
        };

        // Reachable CIDs: the head commit, every MST node, every record
        let mut cids = vec![row.head];
        for item in repo.mst().walk().await.map_err(HostError::Repo)? {
            match item {
                WalkItem::Node(cid) => cids.push(cid),
                WalkItem::Leaf { cid, .. } => cids.push(cid),
            }
        }

        // A block's seq is the seq of the commit that introduced it
        let since_seq = since.micros() as i64;
        let (found, _missing) = self.storage().read_blocks(&cids).await?;
        let blocks: BTreeMap<Cid, Bytes> = found
            .into_iter()
            .filter(|(_, block)| block.seq >= since_seq)
            .map(|(cid, block)| (cid, block.encoded))
            .collect();

        Ok(write_car_bytes(vec![row.head], blocks).await?)
    }

    /// `getLatestCommit`: the head commit's CID and revision
    pub async fn get_latest_commit(&self, did: &Did) -> Result<LatestCommit> {
        let row = self.active_repo_row(did).await?;
        let block = self
            .storage()
            .read(&row.head)
            .await?
            .ok_or_else(|| HostError::BlockNotFound(row.head.to_string()))?;
        let commit = Commit::from_cbor(&block.encoded)?;

        Ok(LatestCommit {
            cid: row.head.to_string(),
            rev: commit.rev,
        })
    }

    /// `getRecord`: a CAR whose root and single block are the record
    pub async fn get_record_proof(
        &self,
        did: &Did,
        collection: &str,
        rkey: &str,
    ) -> Result<Vec<u8>> {
        let row = self.active_repo_row(did).await?;
        let repo = Repo::load(self.storage().clone(), row.head).await?;

        let key = format_smolstr!("{collection}/{rkey}");
        let cid = repo
            .mst()
            .get(&key)
            .await?
            .ok_or_else(|| HostError::BlockNotFound(key.to_string()))?;

        let block = self
            .storage()
            .read(&cid)
            .await?
            .ok_or_else(|| HostError::BlockNotFound(cid.to_string()))?;

        let mut blocks = BTreeMap::new();
        blocks.insert(cid, block.encoded);
        Ok(write_car_bytes(vec![cid], blocks).await?)
    }

    /// `getBlocks`: a CAR containing exactly the requested blocks
    ///
    /// Fails with `BlockNotFound` if any requested CID is missing.
    pub async fn get_blocks(&self, did: &Did, cids: &[Cid]) -> Result<Vec<u8>> {
        self.active_repo_row(did).await?;

        let (found, missing) = self.storage().read_blocks(cids).await?;
        if let Some(cid) = missing.first() {
            return Err(HostError::BlockNotFound(cid.to_string()));
        }

        let blocks = found
            .into_iter()
            .map(|(cid, block)| (cid, block.encoded))
            .collect();
        Ok(write_car_bytes(cids.to_vec(), blocks).await?)
    }

    /// `getRepoStatus`: active flag and status string
    pub async fn get_repo_status(&self, did: &Did) -> Result<RepoStatus> {
        let row = self
            .storage()
            .load_repo(did)
            .await?
            .ok_or_else(|| HostError::RepoNotFound(did.to_string()))?;

        Ok(RepoStatus {
            did: row.did.to_string(),
            active: row.active,
            status: row.status.as_ref().map(SmolStr::to_string),
        })
    }

    /// `listRepos`: page through hosted repos, ordered by DID
    pub async fn list_repos(&self, cursor: Option<&str>, limit: usize) -> Result<RepoPage> {
        let rows = self.storage().list_repos().await?;

        let mut repos = Vec::new();
        for row in rows {
            if cursor.is_some_and(|cursor| row.did.as_str() <= cursor) {
                continue;
            }
            if repos.len() == limit {
                break;
            }

            let block = self
                .storage()
                .read(&row.head)
                .await?
                .ok_or_else(|| HostError::BlockNotFound(row.head.to_string()))?;
            let commit = Commit::from_cbor(&block.encoded)?;

            repos.push(RepoInfo {
                did: row.did.to_string(),
                head: row.head.to_string(),
                rev: commit.rev,
                active: row.active,
                status: row.status.as_ref().map(SmolStr::to_string),
            });
        }

        let cursor = (repos.len() == limit)
            .then(|| repos.last().map(|r| r.did.clone()))
            .flatten();

        Ok(RepoPage { repos, cursor })
    }

    /// `subscribeRepos`: the firehose subscribe entry point
    pub async fn subscribe_repos(&self, cursor: Option<i64>) -> Result<Subscription<S>> {
        self.subscribe(cursor).await
    }
}
