//! AT Protocol repository engine
//!
//! This crate provides the storage-facing half of a personal data server:
//!
//! - **MST (Merkle Search Tree)**: Immutable, deterministic key→CID index
//!   with structural sharing between versions
//! - **Commits**: Signed commit chain over MST roots, with low-S ECDSA
//!   signatures (secp256k1 and P-256)
//! - **Storage**: Pluggable block storage with sequence tagging, the event
//!   log, and repo rows; in-memory implementation included
//! - **CAR I/O**: Export and import repositories in CAR (Content Addressable
//!   aRchive) format
//!
//! # Design Philosophy
//!
//! - MST mutations are functional: unchanged subtrees keep their CIDs and
//!   cached encodings
//! - Commits persist atomically with every block they introduce, all under
//!   one sequence number
//! - No process-wide state: storage handles and signing keys are passed
//!   explicitly
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_repo::{MemoryStorage, Repo, Write};
//! use weft_repo::types::Did;
//! use std::sync::Arc;
//!
//! # async fn example() -> weft_repo::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
//! let did = Did::new("did:web:user.example")?;
//!
//! let mut repo = Repo::create(storage, did, &key, None, None).await?;
//! repo.apply_writes(&[Write::create("app.bsky.feed.post", "abc123", record)], &key)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CAR (Content Addressable aRchive) utilities
pub mod car;
/// Commit structures, signing, and signature verification
pub mod commit;
pub mod error;
/// Merkle Search Tree implementation
pub mod mst;
/// Repository operations over the commit chain
pub mod repo;
/// Block storage abstraction
pub mod storage;
/// Identifier types (DIDs, TIDs)
pub mod types;

pub use commit::{Commit, SigningKey, VerifyingKey};
pub use error::{RepoError, RepoErrorKind, Result};
pub use mst::{Diff, Mst};
pub use repo::{Action, CommitData, CommitOp, Repo, Write};
pub use storage::{Block, Event, MemoryStorage, RepoRecord, RepoStorage, SUBSCRIBE_REPOS_NSID};
pub use types::{Did, Tid};

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR_CID_CODEC: u64 = 0x71;

/// Multihash code for SHA2-256 (0x12)
pub const SHA2_256_CODE: u64 = 0x12;
