//! Personal data server host layer
//!
//! Builds on [`weft_repo`]'s repository engine to provide:
//!
//! - **RepoHost**: a value owning storage, key material, and the firehose;
//!   no process-wide state
//! - **Firehose**: the totally ordered `subscribeRepos` event stream, with a
//!   bounded in-memory rollback window, durable backfill, and per-subscriber
//!   queues
//! - **Sync wire methods**: `getRepo`, `getLatestCommit`, `getRecord`,
//!   `getBlocks`, `getRepoStatus`, `listRepos`, `subscribeRepos`
//!
//! The outer RPC surface (routing, request parsing, auth) and the identity
//! subsystem are external; this crate consumes a DID, a signing key, and a
//! storage backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use weft_pds::{FirehoseConfig, RepoHost};
//! use weft_repo::{MemoryStorage, Write, types::Did};
//!
//! # async fn example() -> weft_pds::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
//! let host = RepoHost::new(storage, key, FirehoseConfig::from_env());
//!
//! host.start().await;
//! host.create_repo(Did::new("did:web:user.example")?, None, None).await?;
//!
//! let mut sub = host.subscribe(Some(0)).await?;
//! while let Some(frame) = sub.next().await? {
//!     println!("{:?}", frame.header);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// Firehose tuning knobs
pub mod config;
pub mod error;
/// Stream frames and event rendering
pub mod event;
/// The sequenced event fan-out
pub mod firehose;
/// The repo host
pub mod host;
/// Sync wire methods
pub mod sync;

pub use config::FirehoseConfig;
pub use error::{HostError, Result};
pub use event::{EventHeader, Frame, Payload};
pub use firehose::{Firehose, Subscription};
pub use host::RepoHost;
pub use sync::{LatestCommit, RepoInfo, RepoPage, RepoStatus};
