//! Merkle Search Tree operations.
//!
//! A [`Mst`] is a handle on a root [`Link`]. Mutations rebuild the nodes on
//! the path to the affected key and return a new handle; untouched subtrees
//! stay `Stored` links, so they keep their CIDs and their encoded bytes in
//! storage. Keys are placed by hash: a key's layer is the count of leading
//! 2-bit zero chunks of its SHA-256, and a node only ever holds leaves of
//! one layer, with subtrees one layer down between them.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use smol_str::SmolStr;

use super::node::{Entry, Link, Node, WireNode, build_wire, decode_node};
use super::util::{compute_cid, encode_dag_cbor, layer_for_key, validate_key};
use crate::error::{RepoError, Result};
use crate::storage::RepoStorage;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One stop in a depth-first pre-order traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkItem {
    /// An inner MST node, by CID
    Node(Cid),
    /// A leaf: record key and value CID
    Leaf {
        /// Record key
        key: SmolStr,
        /// Record value CID
        cid: Cid,
    },
}

/// Immutable Merkle Search Tree over a block store.
///
/// Deterministic: any set of (key, value) pairs has exactly one tree shape
/// and therefore one root CID, regardless of insertion order.
#[derive(Clone)]
pub struct Mst<S: RepoStorage> {
    storage: Arc<S>,
    root: Link,
}

impl<S: RepoStorage> std::fmt::Debug for Mst<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mst").field("root", &self.root).finish_non_exhaustive()
    }
}

impl<S: RepoStorage + Sync + 'static> Mst<S> {
    /// Create an empty tree
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            root: Link::Fresh(Arc::new(Node::empty())),
        }
    }

    /// Open a tree stored under the given root CID
    ///
    /// Nodes are fetched from storage as operations descend into them.
    pub fn load(storage: Arc<S>, root: Cid) -> Self {
        Self {
            storage,
            root: Link::Stored(root),
        }
    }

    /// Root CID (serialises any freshly built nodes along the way)
    pub async fn root(&self) -> Result<Cid> {
        self.root.cid(&self.storage).await
    }

    /// Shared reference to the block storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub(crate) fn root_link(&self) -> &Link {
        &self.root
    }

    async fn root_node(&self) -> Result<Arc<Node>> {
        self.root.node(&self.storage).await
    }

    fn with_root(&self, root: Node) -> Self {
        Self {
            storage: self.storage.clone(),
            root: Link::Fresh(Arc::new(root)),
        }
    }

    /// Look up a key's value CID
    pub async fn get(&self, key: &str) -> Result<Option<Cid>> {
        validate_key(key)?;
        lookup(&self.storage, self.root_node().await?, key).await
    }

    /// Add a new key (returns a new tree)
    ///
    /// The key is planted at the layer its hash dictates, splitting whatever
    /// subtree straddles it; if the layer is above the current root, the
    /// tree grows upward first. Fails with `KeyExists` if the key is
    /// already present.
    pub async fn add(&self, key: &str, value: Cid) -> Result<Self> {
        validate_key(key)?;

        let root = self.root_node().await?;
        let root_layer = node_layer(&self.storage, &root).await?;
        let key_layer = layer_for_key(key);

        if key_layer <= root_layer {
            let new_root = insert(&self.storage, root, root_layer, key, key_layer, value).await?;
            return Ok(self.with_root(new_root));
        }

        // The key sits above the root: cut the whole tree around it and
        // bridge the intermediate layers with pass-through nodes.
        let (mut lo, mut hi) = split(&self.storage, Some(self.root.clone()), key).await?;
        for _ in root_layer + 1..key_layer {
            lo = lo.map(passthrough);
            hi = hi.map(passthrough);
        }

        Ok(self.with_root(Node {
            left: lo,
            entries: vec![Entry {
                key: SmolStr::new(key),
                value,
                right: hi,
            }],
        }))
    }

    /// Replace an existing key's value (returns a new tree)
    ///
    /// Fails with `KeyMissing` if the key is not present. The tree shape is
    /// untouched; only the path to the leaf is rebuilt.
    pub async fn update(&self, key: &str, value: Cid) -> Result<Self> {
        validate_key(key)?;
        let new_root = replace(&self.storage, self.root_node().await?, key, value).await?;
        Ok(self.with_root(new_root))
    }

    /// Delete a key (returns a new tree)
    ///
    /// The subtrees on either side of the removed leaf are merged, and
    /// pass-through roots left behind are trimmed away. Fails with
    /// `KeyMissing` if the key is not present.
    pub async fn delete(&self, key: &str) -> Result<Self> {
        validate_key(key)?;

        let mut root = remove(&self.storage, self.root_node().await?, key).await?;

        // Trim: a root holding nothing but a single subtree pointer adds no
        // information; its child is the real root.
        while root.entries.is_empty() {
            match root.left.take() {
                Some(link) => root = (*link.node(&self.storage).await?).clone(),
                None => break,
            }
        }

        Ok(self.with_root(root))
    }

    /// All leaves in ascending key order
    pub async fn leaves(&self) -> Result<Vec<(SmolStr, Cid)>> {
        self.list(None, None).await
    }

    /// Leaves with `after < key < before` (half-open on `before`), in order
    ///
    /// Subtrees whose covering range falls outside the bounds are skipped
    /// without being loaded.
    pub async fn list(
        &self,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<(SmolStr, Cid)>> {
        let mut out = Vec::new();
        collect_range(&self.storage, self.root_node().await?, after, before, &mut out).await?;
        Ok(out)
    }

    /// Leaves whose keys start with `prefix`, in order
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<(SmolStr, Cid)>> {
        let mut out = Vec::new();
        collect_prefix(&self.storage, self.root_node().await?, prefix, &mut out).await?;
        Ok(out)
    }

    /// Depth-first pre-order traversal: every node and leaf, parents first
    pub async fn walk(&self) -> Result<Vec<WalkItem>> {
        let mut out = Vec::new();
        walk_link(&self.storage, &self.root, &mut out).await?;
        Ok(out)
    }

    /// Serialise every freshly built node, returning (root CID, blocks)
    ///
    /// Subtrees behind `Stored` links are already persisted and are not
    /// revisited.
    pub async fn collect_blocks(&self) -> Result<(Cid, BTreeMap<Cid, Bytes>)> {
        let mut blocks = BTreeMap::new();
        let root = collect_fresh(&self.storage, &self.root, &mut blocks).await?;
        Ok((root, blocks))
    }

    /// Persist all unstored node blocks
    ///
    /// Convenience for tests and bulk imports; blocks written here sit
    /// outside the event stream (seq 0). Returns the root CID.
    pub async fn persist(&self) -> Result<Cid> {
        let (root, blocks) = self.collect_blocks().await?;
        if !blocks.is_empty() {
            self.storage.put_many(blocks, 0).await?;
        }
        Ok(root)
    }

    /// Serialise the nodes on the path from the root toward `key` into `out`
    ///
    /// These are the covering-proof blocks: enough nodes for a receiver to
    /// verify the key's inclusion (or absence, when the path ends without
    /// it) against this tree's root. Record blocks are not included.
    pub async fn blocks_for_path(&self, key: &str, out: &mut BTreeMap<Cid, Bytes>) -> Result<()> {
        let mut link = self.root.clone();
        loop {
            let (cid, bytes) = link.block(&self.storage).await?;
            let wire: WireNode = serde_ipld_dagcbor::from_slice(&bytes)
                .map_err(|e| RepoError::serialization(e))?;
            out.insert(cid, bytes);

            let node = decode_node(&wire)?;
            let idx = node.position(key);
            if node.entries.get(idx).is_some_and(|e| e.key.as_str() == key) {
                return Ok(());
            }
            match node.child_before(idx) {
                Some(child) => link = child.clone(),
                None => return Ok(()),
            }
        }
    }

    /// CIDs on the merkle path to a key: the root, intermediate nodes, and
    /// the record CID when the key exists (its absence proves non-existence)
    pub async fn cids_for_path(&self, key: &str) -> Result<Vec<Cid>> {
        validate_key(key)?;

        let mut cids = Vec::new();
        let mut link = self.root.clone();
        loop {
            cids.push(link.cid(&self.storage).await?);

            let node = link.node(&self.storage).await?;
            let idx = node.position(key);
            if let Some(entry) = node.entries.get(idx) {
                if entry.key.as_str() == key {
                    cids.push(entry.value);
                    return Ok(cids);
                }
            }
            match node.child_before(idx) {
                Some(child) => link = child.clone(),
                None => return Ok(cids),
            }
        }
    }
}

/// Wrap a subtree in a leafless node one layer up
fn passthrough(link: Link) -> Link {
    Link::Fresh(Arc::new(Node {
        left: Some(link),
        entries: Vec::new(),
    }))
}

/// A node's layer: taken from its first leaf, or one above its child for
/// pass-through nodes. The empty tree is layer 0.
fn node_layer<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: &'a Node,
) -> BoxFuture<'a, Result<usize>> {
    Box::pin(async move {
        if let Some(entry) = node.entries.first() {
            return Ok(layer_for_key(&entry.key));
        }
        match &node.left {
            Some(link) => {
                let child = link.node(storage).await?;
                Ok(node_layer(storage, &child).await? + 1)
            }
            None => Ok(0),
        }
    })
}

fn lookup<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: Arc<Node>,
    key: &'a str,
) -> BoxFuture<'a, Result<Option<Cid>>> {
    Box::pin(async move {
        let idx = node.position(key);
        if let Some(entry) = node.entries.get(idx) {
            if entry.key.as_str() == key {
                return Ok(Some(entry.value));
            }
        }
        match node.child_before(idx) {
            Some(link) => {
                let child = link.node(storage).await?;
                lookup(storage, child, key).await
            }
            None => Ok(None),
        }
    })
}

/// Insert a leaf at the layer its hash dictates. `layer` is the layer of
/// `node`; `key_layer <= layer` (upward growth is handled at the root).
fn insert<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: Arc<Node>,
    layer: usize,
    key: &'a str,
    key_layer: usize,
    value: Cid,
) -> BoxFuture<'a, Result<Node>> {
    Box::pin(async move {
        let idx = node.position(key);
        if let Some(entry) = node.entries.get(idx) {
            if entry.key.as_str() == key {
                return Err(RepoError::key_exists(key));
            }
        }

        let mut entries = node.entries.clone();
        let mut left = node.left.clone();

        if key_layer == layer {
            // The leaf lands here; whatever subtree straddles the key gets
            // cut in two around it.
            let (lo, hi) = split(storage, node.child_before(idx).cloned(), key).await?;
            entries.insert(
                idx,
                Entry {
                    key: SmolStr::new(key),
                    value,
                    right: hi,
                },
            );
            if idx == 0 {
                left = lo;
            } else {
                entries[idx - 1].right = lo;
            }
        } else {
            // The leaf belongs further down; descend (or create) the
            // subtree in front of the insertion point.
            let child = match node.child_before(idx) {
                Some(link) => link.node(storage).await?,
                None => Arc::new(Node::empty()),
            };
            let new_child = insert(storage, child, layer - 1, key, key_layer, value).await?;
            let link = Some(Link::Fresh(Arc::new(new_child)));
            if idx == 0 {
                left = link;
            } else {
                entries[idx - 1].right = link;
            }
        }

        Ok(Node { left, entries })
    })
}

/// Cut a subtree into the parts below and above `key` (which it must not
/// contain). Either side may come back empty.
fn split<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    link: Option<Link>,
    key: &'a str,
) -> BoxFuture<'a, Result<(Option<Link>, Option<Link>)>> {
    Box::pin(async move {
        let Some(link) = link else {
            return Ok((None, None));
        };

        let node = link.node(storage).await?;
        let idx = node.position(key);

        // The child under the cut point straddles the key; split it too.
        let (lo_child, hi_child) = split(storage, node.child_before(idx).cloned(), key).await?;

        let lo = if idx == 0 {
            lo_child
        } else {
            let mut entries = node.entries[..idx].to_vec();
            entries[idx - 1].right = lo_child;
            Some(Link::Fresh(Arc::new(Node {
                left: node.left.clone(),
                entries,
            })))
        };

        let hi = if idx == node.entries.len() {
            hi_child
        } else {
            Some(Link::Fresh(Arc::new(Node {
                left: hi_child,
                entries: node.entries[idx..].to_vec(),
            })))
        };

        Ok((lo, hi))
    })
}

fn replace<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: Arc<Node>,
    key: &'a str,
    value: Cid,
) -> BoxFuture<'a, Result<Node>> {
    Box::pin(async move {
        let idx = node.position(key);
        let mut entries = node.entries.clone();
        let mut left = node.left.clone();

        if let Some(entry) = entries.get_mut(idx) {
            if entry.key.as_str() == key {
                entry.value = value;
                return Ok(Node { left, entries });
            }
        }

        match node.child_before(idx) {
            Some(link) => {
                let child = link.node(storage).await?;
                let new_child = replace(storage, child, key, value).await?;
                let link = Some(Link::Fresh(Arc::new(new_child)));
                if idx == 0 {
                    left = link;
                } else {
                    entries[idx - 1].right = link;
                }
                Ok(Node { left, entries })
            }
            None => Err(RepoError::key_missing(key)),
        }
    })
}

fn remove<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: Arc<Node>,
    key: &'a str,
) -> BoxFuture<'a, Result<Node>> {
    Box::pin(async move {
        let idx = node.position(key);
        let mut entries = node.entries.clone();
        let mut left = node.left.clone();

        if node.entries.get(idx).is_some_and(|e| e.key.as_str() == key) {
            // The subtrees on either side of the leaf cover adjacent key
            // ranges once it is gone; fuse them into one.
            let fused = merge(
                storage,
                node.child_before(idx).cloned(),
                node.entries[idx].right.clone(),
            )
            .await?;

            entries.remove(idx);
            if idx == 0 {
                left = fused;
            } else {
                entries[idx - 1].right = fused;
            }
            return Ok(Node { left, entries });
        }

        match node.child_before(idx) {
            Some(link) => {
                let child = link.node(storage).await?;
                let new_child = remove(storage, child, key).await?;
                let link = if new_child.is_empty() {
                    None
                } else {
                    Some(Link::Fresh(Arc::new(new_child)))
                };
                if idx == 0 {
                    left = link;
                } else {
                    entries[idx - 1].right = link;
                }
                Ok(Node { left, entries })
            }
            None => Err(RepoError::key_missing(key)),
        }
    })
}

/// Fuse two subtrees covering adjacent key ranges (everything in `b` above
/// everything in `a`) into one; their facing edge children fuse recursively.
fn merge<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    a: Option<Link>,
    b: Option<Link>,
) -> BoxFuture<'a, Result<Option<Link>>> {
    Box::pin(async move {
        let (a, b) = match (a, b) {
            (None, b) => return Ok(b),
            (a, None) => return Ok(a),
            (Some(a), Some(b)) => (a.node(storage).await?, b.node(storage).await?),
        };

        let bridge = merge(storage, a.tail_child().cloned(), b.left.clone()).await?;

        let mut entries = a.entries.clone();
        let left = match entries.last_mut() {
            Some(last) => {
                last.right = bridge;
                a.left.clone()
            }
            None => bridge,
        };
        entries.extend(b.entries.iter().cloned());

        Ok(Some(Link::Fresh(Arc::new(Node { left, entries }))))
    })
}

fn collect_range<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: Arc<Node>,
    after: Option<&'a str>,
    before: Option<&'a str>,
    out: &'a mut Vec<(SmolStr, Cid)>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for idx in 0..=node.entries.len() {
            if let Some(child) = node.child_before(idx) {
                // The child covers (previous leaf, next leaf); skip it when
                // that interval cannot intersect the requested range.
                let upper = node.entries.get(idx).map(|e| e.key.as_str());
                let lower = (idx > 0).then(|| node.entries[idx - 1].key.as_str());

                let below_range = matches!((after, upper), (Some(a), Some(u)) if u <= a);
                let above_range = matches!((before, lower), (Some(b), Some(l)) if l >= b);

                if !below_range && !above_range {
                    let child = child.node(storage).await?;
                    collect_range(storage, child, after, before, out).await?;
                }
            }

            if let Some(entry) = node.entries.get(idx) {
                let key = entry.key.as_str();
                if before.is_some_and(|b| key >= b) {
                    // Leaves are sorted; nothing further can qualify
                    return Ok(());
                }
                if after.is_none_or(|a| key > a) {
                    out.push((entry.key.clone(), entry.value));
                }
            }
        }

        Ok(())
    })
}

fn collect_prefix<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    node: Arc<Node>,
    prefix: &'a str,
    out: &'a mut Vec<(SmolStr, Cid)>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for idx in 0..=node.entries.len() {
            if let Some(child) = node.child_before(idx) {
                // All keys in the child are below the next leaf; if that
                // bound never reaches the prefix, neither can they.
                let upper = node.entries.get(idx).map(|e| e.key.as_str());
                if !matches!(upper, Some(u) if u <= prefix) {
                    let child = child.node(storage).await?;
                    collect_prefix(storage, child, prefix, out).await?;
                }
            }

            if let Some(entry) = node.entries.get(idx) {
                let key = entry.key.as_str();
                if key.starts_with(prefix) {
                    out.push((entry.key.clone(), entry.value));
                } else if key > prefix {
                    // Past the contiguous block of prefixed keys
                    return Ok(());
                }
            }
        }

        Ok(())
    })
}

fn walk_link<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    link: &'a Link,
    out: &'a mut Vec<WalkItem>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        out.push(WalkItem::Node(link.cid(storage).await?));

        let node = link.node(storage).await?;
        for idx in 0..=node.entries.len() {
            if let Some(child) = node.child_before(idx) {
                walk_link(storage, child, out).await?;
            }
            if let Some(entry) = node.entries.get(idx) {
                out.push(WalkItem::Leaf {
                    key: entry.key.clone(),
                    cid: entry.value,
                });
            }
        }

        Ok(())
    })
}

fn collect_fresh<'a, S: RepoStorage + Sync + 'static>(
    storage: &'a Arc<S>,
    link: &'a Link,
    out: &'a mut BTreeMap<Cid, Bytes>,
) -> BoxFuture<'a, Result<Cid>> {
    Box::pin(async move {
        match link {
            Link::Stored(cid) => Ok(*cid),
            Link::Fresh(node) => {
                // Children first, so their CIDs are known for the wire form
                let left = match &node.left {
                    Some(link) => Some(collect_fresh(storage, link, out).await?),
                    None => None,
                };
                let mut subtrees = Vec::with_capacity(node.entries.len());
                for entry in &node.entries {
                    subtrees.push(match &entry.right {
                        Some(link) => Some(collect_fresh(storage, link, out).await?),
                        None => None,
                    });
                }

                let encoded = encode_dag_cbor(&build_wire(node, left, &subtrees)?)?;
                let cid = compute_cid(&encoded)?;
                out.insert(cid, Bytes::from(encoded));
                Ok(cid)
            }
        }
    })
}
