//! The repo host: owns storage, key material, and the firehose.
//!
//! One `RepoHost` serves all repos under a single authority. It replaces any
//! notion of process-wide state: tests build a fresh host per case, and
//! everything the host needs is passed in explicitly.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use ipld_core::ipld::Ipld;
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tracing::info;

use weft_repo::commit::{SigningKey, VerifyingKey};
use weft_repo::{CommitData, Did, Repo, RepoStorage, Write};

use crate::config::FirehoseConfig;
use crate::error::{HostError, Result};
use crate::event::EVENT_TYPE_PREFIX;
use crate::firehose::{Firehose, Subscription};

/// A host for repos under one authority.
///
/// Owns the storage backend, the signing key, the firehose collector and its
/// subscriber set. Writes to any one repo are serialised by the host.
pub struct RepoHost<S: RepoStorage> {
    storage: Arc<S>,
    signing_key: Arc<dyn SigningKey + Send + Sync>,
    firehose: Firehose<S>,
    repos: Mutex<HashMap<Did, Repo<S>>>,
}

impl<S: RepoStorage + Send + Sync + 'static> RepoHost<S> {
    /// Create a host over the given storage and signing key
    pub fn new(
        storage: Arc<S>,
        signing_key: impl SigningKey + Send + Sync + 'static,
        config: FirehoseConfig,
    ) -> Self {
        let firehose = Firehose::new(storage.clone(), config);
        Self {
            storage,
            signing_key: Arc::new(signing_key),
            firehose,
            repos: Mutex::new(HashMap::new()),
        }
    }

    /// The storage backend
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The firehose handle
    pub fn firehose(&self) -> &Firehose<S> {
        &self.firehose
    }

    /// Public half of the host signing key
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.public_key()
    }

    /// Start the firehose collector and wait for it to preload
    pub async fn start(&self) {
        self.firehose.start().await
    }

    /// Start the collector with an event limit (tests only)
    pub async fn start_with_limit(&self, limit: Option<usize>) {
        self.firehose.start_with_limit(limit).await
    }

    /// Subscribe to the event stream
    pub async fn subscribe(&self, cursor: Option<i64>) -> Result<Subscription<S>> {
        self.firehose.subscribe(cursor).await
    }

    /// Create a new repo with a signed genesis commit
    pub async fn create_repo(
        &self,
        did: Did,
        handle: Option<SmolStr>,
        initial_writes: Option<&[Write]>,
    ) -> Result<()> {
        let mut repos = self.repos.lock().await;

        let mut repo = Repo::create(
            self.storage.clone(),
            did.clone(),
            &*self.signing_key,
            handle,
            initial_writes,
        )
        .await?;

        info!(did = %did, head = %repo.head_cid(), "created repo");

        let firehose = self.firehose.clone();
        repo.set_callback(move |_| firehose.notify());

        repos.insert(did, repo);
        self.firehose.notify();
        Ok(())
    }

    /// Apply a batch of writes to a repo as one commit
    ///
    /// The host serialises writers; the commit callback notifies the
    /// firehose collector once the commit is durable.
    pub async fn apply_writes(&self, did: &Did, writes: &[Write]) -> Result<CommitData> {
        let mut repos = self.repos.lock().await;

        let repo = match repos.entry(did.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let row = self
                    .storage
                    .load_repo(did)
                    .await?
                    .ok_or_else(|| HostError::RepoNotFound(did.to_string()))?;
                if !row.active {
                    return Err(HostError::RepoDeactivated(did.to_string()));
                }

                let mut repo = Repo::load_did(self.storage.clone(), did).await?;
                let firehose = self.firehose.clone();
                repo.set_callback(move |_| firehose.notify());
                entry.insert(repo)
            }
        };

        let commit = repo.apply_writes(writes, &*self.signing_key).await?;
        Ok(commit)
    }

    /// Tombstone a repo: mark it inactive and emit a `#tombstone` event
    ///
    /// Returns the event's sequence number.
    pub async fn tombstone_repo(&self, did: &Did) -> Result<i64> {
        let mut repos = self.repos.lock().await;

        self.storage
            .load_repo(did)
            .await?
            .ok_or_else(|| HostError::RepoNotFound(did.to_string()))?;

        self.storage.tombstone_repo(did).await?;
        repos.remove(did);

        let seq = self.emit_lifecycle_event("#tombstone", did, BTreeMap::new()).await?;
        info!(did = %did, seq, "tombstoned repo");
        Ok(seq)
    }

    /// Emit an `#identity` event announcing a handle change
    pub async fn emit_identity_event(&self, did: &Did, handle: &str) -> Result<i64> {
        let mut extra = BTreeMap::new();
        extra.insert("handle".to_string(), Ipld::String(handle.to_string()));
        self.emit_lifecycle_event("#identity", did, extra).await
    }

    /// Emit an `#account` event announcing an account status change
    pub async fn emit_account_event(
        &self,
        did: &Did,
        active: bool,
        status: Option<&str>,
    ) -> Result<i64> {
        let mut extra = BTreeMap::new();
        extra.insert("active".to_string(), Ipld::Bool(active));
        if let Some(status) = status {
            extra.insert("status".to_string(), Ipld::String(status.to_string()));
        }
        self.emit_lifecycle_event("#account", did, extra).await
    }

    async fn emit_lifecycle_event(
        &self,
        fragment: &str,
        did: &Did,
        extra: BTreeMap<String, Ipld>,
    ) -> Result<i64> {
        let mut record = extra;
        record.insert(
            "$type".to_string(),
            Ipld::String(format!("{EVENT_TYPE_PREFIX}{fragment}")),
        );
        record.insert("did".to_string(), Ipld::String(did.to_string()));
        record.insert(
            "time".to_string(),
            Ipld::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );

        let (seq, _cid) = self.storage.write_event(Ipld::Map(record)).await?;
        self.firehose.notify();
        Ok(seq)
    }
}
