//! Structural diff between two MST states.
//!
//! Both trees are unrolled into ordered span queues (leaves interleaved with
//! subtree links) and merge-joined by key. When both queues front a subtree
//! with the same CID, the whole subtree is skipped unloaded; a mismatched
//! subtree is expanded in place, splicing its spans at the front of the
//! queue. Expansion on both sides realigns trees of different heights, so no
//! layer bookkeeping is needed.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use smol_str::SmolStr;

use super::node::Link;
use super::tree::Mst;
use crate::error::Result;
use crate::storage::RepoStorage;

/// A record update within a [`Diff`]: previous and new value CIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffUpdate {
    /// CID the key pointed at in the old tree
    pub prev: Cid,
    /// CID the key points at in the new tree
    pub cid: Cid,
}

/// Diff between two MST states
///
/// Represents the changes needed to transform the old tree into the new one.
/// Subtrees with identical CIDs in both trees are skipped without being
/// loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Records present in new but not old, keyed by leaf key
    pub adds: BTreeMap<SmolStr, Cid>,

    /// Records present in both with different CIDs, keyed by leaf key
    pub updates: BTreeMap<SmolStr, DiffUpdate>,

    /// Records present in old but not new, keyed by leaf key
    pub deletes: BTreeMap<SmolStr, Cid>,

    /// MST node blocks reachable from the new tree but not the old,
    /// serialised during the walk so commits can carry them
    pub new_mst_blocks: BTreeMap<Cid, Bytes>,

    /// MST node CIDs reachable from the old tree but not the new
    pub removed_mst_blocks: Vec<Cid>,
}

impl Diff {
    /// Compute the diff that transforms `old` into `new`.
    pub async fn of<S: RepoStorage + Sync + 'static>(new: &Mst<S>, old: &Mst<S>) -> Result<Diff> {
        let storage = new.storage();
        let mut diff = Diff::default();

        let mut old_spans = VecDeque::from([Span::Sub(old.root_link().clone())]);
        let mut new_spans = VecDeque::from([Span::Sub(new.root_link().clone())]);

        loop {
            match (old_spans.front().cloned(), new_spans.front().cloned()) {
                (None, None) => break,

                // Two subtrees head to head: skip both when identical,
                // otherwise open both and compare their contents.
                (Some(Span::Sub(a)), Some(Span::Sub(b))) => {
                    if a.cid(storage).await? == b.cid(storage).await? {
                        old_spans.pop_front();
                        new_spans.pop_front();
                    } else {
                        expand_old(storage, &mut old_spans, &a, &mut diff).await?;
                        expand_new(storage, &mut new_spans, &b, &mut diff).await?;
                    }
                }

                // A lone subtree (facing a leaf or an exhausted side) has no
                // chance to match; open it and keep merging.
                (Some(Span::Sub(a)), _) => {
                    expand_old(storage, &mut old_spans, &a, &mut diff).await?;
                }
                (_, Some(Span::Sub(b))) => {
                    expand_new(storage, &mut new_spans, &b, &mut diff).await?;
                }

                // Leaf against leaf: ordinary merge-join by key.
                (
                    Some(Span::Leaf {
                        key: old_key,
                        cid: old_cid,
                    }),
                    Some(Span::Leaf {
                        key: new_key,
                        cid: new_cid,
                    }),
                ) => match old_key.cmp(&new_key) {
                    std::cmp::Ordering::Equal => {
                        if old_cid != new_cid {
                            diff.updates.insert(
                                old_key,
                                DiffUpdate {
                                    prev: old_cid,
                                    cid: new_cid,
                                },
                            );
                        }
                        old_spans.pop_front();
                        new_spans.pop_front();
                    }
                    std::cmp::Ordering::Less => {
                        diff.deletes.insert(old_key, old_cid);
                        old_spans.pop_front();
                    }
                    std::cmp::Ordering::Greater => {
                        diff.adds.insert(new_key, new_cid);
                        new_spans.pop_front();
                    }
                },

                (Some(Span::Leaf { key, cid }), None) => {
                    diff.deletes.insert(key, cid);
                    old_spans.pop_front();
                }
                (None, Some(Span::Leaf { key, cid })) => {
                    diff.adds.insert(key, cid);
                    new_spans.pop_front();
                }
            }
        }

        // A node can sit at slightly different positions in the two walks
        // and get expanded on both sides; such nodes are shared, not
        // changed, and must not count as created or removed.
        let added: HashSet<Cid> = diff.new_mst_blocks.keys().copied().collect();
        let removed: HashSet<Cid> = diff.removed_mst_blocks.iter().copied().collect();
        let shared: HashSet<Cid> = added.intersection(&removed).copied().collect();

        diff.new_mst_blocks.retain(|cid, _| !shared.contains(cid));
        diff.removed_mst_blocks.retain(|cid| !shared.contains(cid));

        Ok(diff)
    }

    /// Check if diff is empty (no record changes)
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Count total record operations
    pub fn op_count(&self) -> usize {
        self.adds.len() + self.updates.len() + self.deletes.len()
    }

    /// CIDs reachable from the new tree but not the old: new/updated record
    /// CIDs plus newly created MST node CIDs.
    pub fn new_cids(&self) -> HashSet<Cid> {
        let mut cids: HashSet<Cid> = self.adds.values().copied().collect();
        cids.extend(self.updates.values().map(|u| u.cid));
        cids.extend(self.new_mst_blocks.keys().copied());
        cids
    }

    /// CIDs reachable from the old tree but not the new: deleted/replaced
    /// record CIDs plus dropped MST node CIDs.
    pub fn removed_cids(&self) -> HashSet<Cid> {
        let mut cids: HashSet<Cid> = self.deletes.values().copied().collect();
        cids.extend(self.updates.values().map(|u| u.prev));
        cids.extend(self.removed_mst_blocks.iter().copied());
        cids
    }
}

/// One element of an unrolled tree: a leaf or a not-yet-opened subtree
#[derive(Debug, Clone)]
enum Span {
    Leaf { key: SmolStr, cid: Cid },
    Sub(Link),
}

/// Replace the subtree at the queue front with its contents, in order
async fn splice_front<S: RepoStorage + Sync + 'static>(
    storage: &Arc<S>,
    spans: &mut VecDeque<Span>,
    link: &Link,
) -> Result<()> {
    spans.pop_front();

    let node = link.node(storage).await?;
    // Push in reverse so the spliced spans come out front-first in order
    for idx in (0..=node.entries.len()).rev() {
        if let Some(entry) = node.entries.get(idx) {
            spans.push_front(Span::Leaf {
                key: entry.key.clone(),
                cid: entry.value,
            });
        }
        if let Some(child) = node.child_before(idx) {
            spans.push_front(Span::Sub(child.clone()));
        }
    }

    Ok(())
}

/// Open an old-side subtree: its node is no longer reachable from new
async fn expand_old<S: RepoStorage + Sync + 'static>(
    storage: &Arc<S>,
    spans: &mut VecDeque<Span>,
    link: &Link,
    diff: &mut Diff,
) -> Result<()> {
    diff.removed_mst_blocks.push(link.cid(storage).await?);
    splice_front(storage, spans, link).await
}

/// Open a new-side subtree: its node block is part of the change set
async fn expand_new<S: RepoStorage + Sync + 'static>(
    storage: &Arc<S>,
    spans: &mut VecDeque<Span>,
    link: &Link,
    diff: &mut Diff,
) -> Result<()> {
    let (cid, bytes) = link.block(storage).await?;
    diff.new_mst_blocks.insert(cid, bytes);
    splice_front(storage, spans, link).await
}
