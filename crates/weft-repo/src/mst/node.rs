//! MST node model.
//!
//! The in-memory shape mirrors the wire form: a node is an optional left
//! subtree followed by ordered (leaf, optional right subtree) pairs. Two
//! subtree pointers can never be adjacent in this representation, so the
//! invariant holds by construction rather than by runtime checks.
//!
//! Children are [`Link`]s: either a CID into storage (unchanged, fetched on
//! demand) or a freshly built node shared behind an `Arc`. Tree mutations
//! rebuild only the nodes along the touched path; everything else stays a
//! `Stored` link and keeps its CID and encoded bytes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use serde_bytes::ByteBuf;
use smol_str::SmolStr;

use super::util::{common_prefix_len, compute_cid, encode_dag_cbor, validate_key};
use crate::error::{MstError, RepoError, Result};
use crate::storage::RepoStorage;

/// A leaf plus the subtree holding every key between it and the next leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    /// Full record key (`<collection>/<rkey>`)
    pub key: SmolStr,
    /// Record value CID
    pub value: Cid,
    /// Subtree with keys greater than `key` and less than the next leaf
    pub right: Option<Link>,
}

/// A materialised MST node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Node {
    /// Subtree with keys less than the first leaf
    pub left: Option<Link>,
    /// Leaves in ascending key order, each with its right subtree
    pub entries: Vec<Entry>,
}

/// Child pointer: persisted (by CID) or freshly built (in memory)
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Link {
    /// Node lives in storage; unchanged since it was loaded
    Stored(Cid),
    /// Node built by a mutation; CID computed on demand
    Fresh(Arc<Node>),
}

impl Node {
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when the node holds nothing at all (not even a pass-through child)
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.left.is_none()
    }

    /// Index of the first leaf with key >= `key`
    pub fn position(&self, key: &str) -> usize {
        self.entries.partition_point(|e| e.key.as_str() < key)
    }

    /// The subtree sitting immediately before leaf index `idx`
    pub fn child_before(&self, idx: usize) -> Option<&Link> {
        if idx == 0 {
            self.left.as_ref()
        } else {
            self.entries[idx - 1].right.as_ref()
        }
    }

    /// The node's last subtree (after the final leaf, or `left` if leafless)
    pub fn tail_child(&self) -> Option<&Link> {
        match self.entries.last() {
            Some(entry) => entry.right.as_ref(),
            None => self.left.as_ref(),
        }
    }
}

impl Link {
    /// Resolve this link's CID, serialising fresh nodes as needed
    pub fn cid<'a, S: RepoStorage + Sync + 'static>(
        &'a self,
        storage: &'a Arc<S>,
    ) -> Pin<Box<dyn Future<Output = Result<Cid>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Link::Stored(cid) => Ok(*cid),
                Link::Fresh(node) => compute_cid(&encode_node(storage, node).await?),
            }
        })
    }

    /// Materialise the node behind this link
    pub async fn node<S: RepoStorage + Sync + 'static>(
        &self,
        storage: &Arc<S>,
    ) -> Result<Arc<Node>> {
        match self {
            Link::Fresh(node) => Ok(node.clone()),
            Link::Stored(cid) => {
                let block = storage
                    .read(cid)
                    .await?
                    .ok_or_else(|| RepoError::not_found("MST node", cid))?;
                let wire: WireNode = serde_ipld_dagcbor::from_slice(&block.encoded)
                    .map_err(|e| RepoError::serialization(e))?;
                Ok(Arc::new(decode_node(&wire)?))
            }
        }
    }

    /// This link's node as (CID, encoded bytes): raw bytes from storage for
    /// stored links, a fresh serialisation otherwise
    pub async fn block<S: RepoStorage + Sync + 'static>(
        &self,
        storage: &Arc<S>,
    ) -> Result<(Cid, Bytes)> {
        match self {
            Link::Stored(cid) => {
                let block = storage
                    .read(cid)
                    .await?
                    .ok_or_else(|| RepoError::not_found("MST node", cid))?;
                Ok((*cid, block.encoded))
            }
            Link::Fresh(node) => {
                let encoded = encode_node(storage, node).await?;
                Ok((compute_cid(&encoded)?, Bytes::from(encoded)))
            }
        }
    }
}

// ============================================================================
// Wire form
// ============================================================================

/// Serialized entry: `{k: suffix bytes, p: shared prefix length, t: right
/// subtree, v: value}`. Declared in canonical DAG-CBOR key order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct WireEntry {
    /// Key bytes after the shared prefix (CBOR byte string)
    #[serde(rename = "k")]
    pub suffix: ByteBuf,

    /// Bytes shared with the previous entry's key; 0 for the first entry
    #[serde(rename = "p")]
    pub prefix: u8,

    /// Right subtree CID; explicit null when absent
    #[serde(rename = "t")]
    pub subtree: Option<Cid>,

    /// Record value CID
    #[serde(rename = "v")]
    pub value: Cid,
}

/// Serialized node: `{e: [entries], l: left subtree}`, canonical key order.
/// Every optional field serialises as explicit null; skipping would change
/// the bytes and therefore the CID.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct WireNode {
    /// Prefix-compressed entries
    #[serde(rename = "e")]
    pub entries: Vec<WireEntry>,

    /// Left subtree CID; explicit null when absent
    #[serde(rename = "l")]
    pub left: Option<Cid>,
}

/// Assemble the wire form of a node from its resolved child CIDs
pub(crate) fn build_wire(
    node: &Node,
    left: Option<Cid>,
    subtrees: &[Option<Cid>],
) -> Result<WireNode> {
    let mut entries = Vec::with_capacity(node.entries.len());
    let mut prev: &[u8] = b"";

    for (entry, subtree) in node.entries.iter().zip(subtrees) {
        let key = entry.key.as_bytes();
        let shared = common_prefix_len(prev, key);
        entries.push(WireEntry {
            suffix: ByteBuf::from(key[shared..].to_vec()),
            prefix: u8::try_from(shared)
                .map_err(|_| MstError::InvalidNode(format!("shared prefix {shared} too long")))?,
            subtree: *subtree,
            value: entry.value,
        });
        prev = key;
    }

    Ok(WireNode {
        entries,
        left,
    })
}

/// Canonical encoding of a node, resolving child CIDs (which may serialise
/// further fresh nodes)
pub(crate) fn encode_node<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: &'a Node,
) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>> {
    Box::pin(async move {
        let left = match &node.left {
            Some(link) => Some(link.cid(storage).await?),
            None => None,
        };

        let mut subtrees = Vec::with_capacity(node.entries.len());
        for entry in &node.entries {
            subtrees.push(match &entry.right {
                Some(link) => Some(link.cid(storage).await?),
                None => None,
            });
        }

        encode_dag_cbor(&build_wire(node, left, &subtrees)?)
    })
}

/// Rebuild a node from its wire form, reconstructing and validating keys
pub(crate) fn decode_node(wire: &WireNode) -> Result<Node> {
    let mut entries = Vec::with_capacity(wire.entries.len());
    let mut prev: Vec<u8> = Vec::new();

    for entry in &wire.entries {
        let shared = entry.prefix as usize;
        if shared > prev.len() {
            return Err(MstError::InvalidNode(format!(
                "shared prefix {shared} exceeds previous key length {}",
                prev.len()
            ))
            .into());
        }

        let mut key_bytes = prev[..shared].to_vec();
        key_bytes.extend_from_slice(&entry.suffix);
        let key = String::from_utf8(key_bytes)
            .map_err(|e| MstError::InvalidNode(format!("key is not UTF-8: {e}")))?;
        validate_key(&key)?;

        entries.push(Entry {
            key: SmolStr::new(&key),
            value: entry.value,
            right: entry.subtree.map(Link::Stored),
        });
        prev = key.into_bytes();
    }

    Ok(Node {
        left: wire.left.map(Link::Stored),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DAG_CBOR_CID_CODEC, SHA2_256_CODE};

    fn test_cid(n: u8) -> Cid {
        let mh = multihash::Multihash::wrap(SHA2_256_CODE, &[n; 32]).unwrap();
        Cid::new_v1(DAG_CBOR_CID_CODEC, mh)
    }

    fn leaf(key: &str, n: u8) -> Entry {
        Entry {
            key: SmolStr::new(key),
            value: test_cid(n),
            right: None,
        }
    }

    #[test]
    fn test_wire_roundtrip_compresses_prefixes() {
        let node = Node {
            left: None,
            entries: vec![leaf("co.ll/aaa", 1), leaf("co.ll/aab", 2), leaf("co.ll/b", 3)],
        };

        let wire = build_wire(&node, None, &[None, None, None]).unwrap();

        assert_eq!(wire.entries[0].prefix, 0);
        assert_eq!(wire.entries[0].suffix.as_ref(), b"co.ll/aaa");
        assert_eq!(wire.entries[1].prefix, 8);
        assert_eq!(wire.entries[1].suffix.as_ref(), b"b");
        assert_eq!(wire.entries[2].prefix, 6);
        assert_eq!(wire.entries[2].suffix.as_ref(), b"b");

        let decoded = decode_node(&wire).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_decode_rejects_overlong_prefix() {
        let wire = WireNode {
            entries: vec![WireEntry {
                suffix: ByteBuf::from(b"co.ll/a".to_vec()),
                prefix: 3, // no previous key to share with
                subtree: None,
                value: test_cid(1),
            }],
            left: None,
        };

        assert!(decode_node(&wire).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_key() {
        let wire = WireNode {
            entries: vec![WireEntry {
                suffix: ByteBuf::from(b"no-slash-here".to_vec()),
                prefix: 0,
                subtree: None,
                value: test_cid(1),
            }],
            left: None,
        };

        assert!(decode_node(&wire).is_err());
    }

    #[test]
    fn test_position_and_children() {
        let sub = Link::Stored(test_cid(9));
        let node = Node {
            left: Some(sub.clone()),
            entries: vec![
                Entry {
                    key: SmolStr::new("co.ll/b"),
                    value: test_cid(1),
                    right: Some(Link::Stored(test_cid(8))),
                },
                leaf("co.ll/d", 2),
            ],
        };

        assert_eq!(node.position("co.ll/a"), 0);
        assert_eq!(node.position("co.ll/b"), 0);
        assert_eq!(node.position("co.ll/c"), 1);
        assert_eq!(node.position("co.ll/z"), 2);

        assert_eq!(node.child_before(0), Some(&sub));
        assert_eq!(node.child_before(1), Some(&Link::Stored(test_cid(8))));
        assert_eq!(node.child_before(2), None);
        assert_eq!(node.tail_child(), None);
    }
}
