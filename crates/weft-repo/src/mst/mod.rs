//! Merkle Search Tree: deterministic, ordered key→CID index over block storage

pub mod diff;
pub(crate) mod node;
pub mod tree;
pub mod util;

pub use diff::{Diff, DiffUpdate};
pub use tree::{Mst, WalkItem};
pub use util::{dag_cbor_cid, layer_for_key, validate_key};
