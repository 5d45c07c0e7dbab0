//! Event frames for the `subscribeRepos` stream.
//!
//! Every frame is a (header, payload) pair; the wire form is the
//! concatenation of the canonical CBOR encodings of the two. Commit events
//! carry a CAR of the commit's new blocks plus MST covering-proof blocks;
//! non-commit lifecycle events pass through with their `$type` rewritten to
//! its short `#fragment` form in the header.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use cid::Cid;
use ipld_core::ipld::Ipld;
use smol_str::SmolStr;
use tracing::debug;

use weft_repo::car::write_car_bytes;
use weft_repo::storage::Event;
use weft_repo::{Commit, CommitData, Mst, RepoError, RepoStorage, Tid};

use crate::error::Result;

/// NSID prefix every lifecycle event `$type` must carry
pub const EVENT_TYPE_PREFIX: &str = "com.atproto.sync.subscribeRepos";

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EventHeader {
    /// 1 for messages, -1 for terminal errors
    pub op: i64,

    /// Message type fragment ("#commit", "#tombstone", "#info", ...);
    /// absent on error frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<SmolStr>,
}

/// A commit event payload (`t = "#commit"`)
///
/// Field names are wire-exact. `since` is always null here: the previous
/// commit's rev is not tracked by the event log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommitPayload {
    /// Repo DID
    pub repo: SmolStr,

    /// Record operations in this commit
    pub ops: Vec<PayloadOp>,

    /// Commit block CID
    pub commit: Cid,

    /// CAR bytes: roots = [commit CID], blocks = the commit's new blocks
    /// plus MST covering-proof blocks
    #[serde(with = "weft_repo::commit::serde_bytes_helper")]
    pub blocks: Bytes,

    /// Emission timestamp, ISO-8601 UTC
    pub time: String,

    /// Sequence number of this event
    pub seq: i64,

    /// Commit revision (seq as TID, clock id 0)
    pub rev: Tid,

    /// Always null
    pub since: Option<Tid>,

    /// Always false (rebases are not performed)
    pub rebase: bool,

    /// Always false
    #[serde(rename = "tooBig")]
    pub too_big: bool,

    /// Blob CIDs referenced by this commit (blob storage is external)
    pub blobs: Vec<Cid>,

    /// The previous commit's MST root, or null when the previous commit
    /// block is unavailable
    #[serde(rename = "prevData")]
    pub prev_data: Option<Cid>,
}

/// A record operation inside a commit payload
#[derive(Debug, Clone, serde::Serialize)]
pub struct PayloadOp {
    /// "create", "update", or "delete"
    pub action: SmolStr,

    /// `<collection>/<rkey>` path
    pub path: SmolStr,

    /// New record CID; explicit null for deletes
    pub cid: Option<Cid>,

    /// Record CID before the write; omitted for creates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<Cid>,
}

/// `#info` frame payload
#[derive(Debug, Clone, serde::Serialize)]
pub struct InfoPayload {
    /// Info name, e.g. "OutdatedCursor"
    pub name: SmolStr,
}

/// Terminal error frame payload (`header.op = -1`)
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    /// Error name, e.g. "FutureCursor"
    pub error: SmolStr,
    /// Human-readable message
    pub message: String,
}

/// Frame payload: what follows the header on the wire
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Commit event
    Commit(CommitPayload),
    /// Lifecycle event record, minus its `$type`
    Lifecycle(Ipld),
    /// Informational frame
    Info(InfoPayload),
    /// Terminal error frame
    Error(ErrorPayload),
}

/// One stream frame: header plus payload
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: EventHeader,
    /// Frame payload
    pub payload: Payload,
    seq: Option<i64>,
}

impl Frame {
    /// Build a commit frame
    pub fn commit(payload: CommitPayload) -> Self {
        let seq = payload.seq;
        Self {
            header: EventHeader {
                op: 1,
                t: Some(SmolStr::new_static("#commit")),
            },
            payload: Payload::Commit(payload),
            seq: Some(seq),
        }
    }

    /// Build a lifecycle frame from a type fragment and record
    pub fn lifecycle(fragment: SmolStr, seq: i64, record: Ipld) -> Self {
        Self {
            header: EventHeader {
                op: 1,
                t: Some(fragment),
            },
            payload: Payload::Lifecycle(record),
            seq: Some(seq),
        }
    }

    /// Build an `#info` frame
    pub fn info(name: &'static str) -> Self {
        Self {
            header: EventHeader {
                op: 1,
                t: Some(SmolStr::new_static("#info")),
            },
            payload: Payload::Info(InfoPayload {
                name: SmolStr::new_static(name),
            }),
            seq: None,
        }
    }

    /// Build a terminal error frame
    pub fn error(error: &'static str, message: String) -> Self {
        Self {
            header: EventHeader { op: -1, t: None },
            payload: Payload::Error(ErrorPayload {
                error: SmolStr::new_static(error),
                message,
            }),
            seq: None,
        }
    }

    /// Sequence number, for event frames
    pub fn seq(&self) -> Option<i64> {
        self.seq
    }

    /// Wire encoding: canonical CBOR of the header followed by canonical
    /// CBOR of the payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes =
            serde_ipld_dagcbor::to_vec(&self.header).map_err(|e| RepoError::serialization(e))?;
        bytes.extend(
            serde_ipld_dagcbor::to_vec(&self.payload).map_err(|e| RepoError::serialization(e))?,
        );
        Ok(bytes)
    }
}

/// Render a stored event as a stream frame.
///
/// Commit events gather covering-proof MST blocks (the node path from root to
/// each affected key, in both the old and new trees when both exist) on top
/// of the commit's own blocks, and serialise everything as a CAR rooted at
/// the commit CID.
pub async fn process_event<S: RepoStorage + Sync + 'static>(
    storage: &Arc<S>,
    event: &Event,
) -> Result<Frame> {
    match event {
        Event::Lifecycle { seq, record } => lifecycle_frame(*seq, record),
        Event::Commit(commit) => commit_frame(storage, commit).await,
    }
}

fn lifecycle_frame(seq: i64, record: &Ipld) -> Result<Frame> {
    let Ipld::Map(map) = record else {
        return Err(RepoError::invalid("lifecycle event record must be a map").into());
    };

    let type_tag = match map.get("$type") {
        Some(Ipld::String(t)) => t.as_str(),
        _ => return Err(RepoError::invalid("lifecycle event record has no $type").into()),
    };
    let fragment = type_tag.strip_prefix(EVENT_TYPE_PREFIX).ok_or_else(|| {
        RepoError::invalid(format!("unexpected lifecycle event type: {type_tag}"))
    })?;
    if !fragment.starts_with('#') {
        return Err(RepoError::invalid(format!("unexpected lifecycle event type: {type_tag}")).into());
    }

    let mut payload = map.clone();
    payload.remove("$type");

    Ok(Frame::lifecycle(
        SmolStr::new(fragment),
        seq,
        Ipld::Map(payload),
    ))
}

async fn commit_frame<S: RepoStorage + Sync + 'static>(
    storage: &Arc<S>,
    commit: &CommitData,
) -> Result<Frame> {
    let mut blocks = commit.blocks.clone();

    // Covering proofs against the new tree, for every affected key
    let new_tree = Mst::load(storage.clone(), commit.data);
    for op in &commit.ops {
        new_tree.blocks_for_path(&op.path, &mut blocks).await?;
    }

    // The previous commit's data CID goes into prevData; a missing or
    // undecodable block degrades to null rather than failing the event
    let prev_data = match commit.prev {
        Some(prev_cid) => match storage.read(&prev_cid).await? {
            Some(block) => match Commit::from_cbor(&block.encoded) {
                Ok(prev_commit) => Some(prev_commit.data),
                Err(e) => {
                    debug!(%prev_cid, error = %e, "previous commit block undecodable");
                    None
                }
            },
            None => {
                debug!(%prev_cid, "previous commit block missing");
                None
            }
        },
        None => None,
    };

    // Old-tree covering proofs, when the old tree exists
    if let Some(prev_data) = prev_data {
        let old_tree = Mst::load(storage.clone(), prev_data);
        for op in &commit.ops {
            old_tree.blocks_for_path(&op.path, &mut blocks).await?;
        }
    }

    let car = write_car_bytes(vec![commit.cid], blocks).await?;

    let ops = commit
        .ops
        .iter()
        .map(|op| PayloadOp {
            action: SmolStr::new_static(op.action.as_str()),
            path: op.path.clone(),
            cid: op.cid,
            prev: op.prev_cid,
        })
        .collect();

    Ok(Frame::commit(CommitPayload {
        repo: SmolStr::new(commit.did.as_str()),
        ops,
        commit: commit.cid,
        blocks: Bytes::from(car),
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        seq: commit.seq,
        rev: Tid::from_seq(commit.seq),
        since: None,
        rebase: false,
        too_big: false,
        blobs: Vec::new(),
        prev_data,
    }))
}
