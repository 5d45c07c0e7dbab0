//! CAR assembly: varint-prefixed CBOR header `{roots, version: 1}` followed
//! by `(varint length, CID, bytes)` blocks.

use bytes::Bytes;
use cid::Cid;
use iroh_car::{CarHeader, CarWriter};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::{RepoError, Result};
use crate::mst::tree::WalkItem;
use crate::mst::Mst;
use crate::storage::RepoStorage;

/// Serialise blocks as CAR bytes under the given header roots
///
/// Blocks are emitted in sorted CID order (BTreeMap) for determinism.
pub async fn write_car_bytes(roots: Vec<Cid>, blocks: BTreeMap<Cid, Bytes>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer = CarWriter::new(CarHeader::new_v1(roots), &mut out);

    for (cid, data) in blocks {
        writer
            .write(cid, data.as_ref())
            .await
            .map_err(|e| RepoError::car(e))?;
    }
    writer.finish().await.map_err(|e| RepoError::car(e))?;
    out.flush().await.map_err(|e| RepoError::io(e))?;

    Ok(out)
}

/// Write blocks to a CAR file
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: Vec<Cid>,
    blocks: BTreeMap<Cid, Bytes>,
) -> Result<()> {
    let car = write_car_bytes(roots, blocks).await?;
    tokio::fs::write(path, car).await.map_err(|e| RepoError::io(e))
}

/// Export a committed repo (commit block, MST nodes, records) as CAR bytes
/// rooted at the commit CID
///
/// Every reachable block must already be persisted; a missing one is an
/// error rather than a silent hole in the archive.
pub async fn export_repo_car_bytes<S: RepoStorage + Sync + 'static>(
    commit_cid: Cid,
    mst: &Mst<S>,
) -> Result<Vec<u8>> {
    let storage = mst.storage();

    let mut cids = vec![commit_cid];
    for item in mst.walk().await? {
        match item {
            WalkItem::Node(cid) => cids.push(cid),
            WalkItem::Leaf { cid, .. } => cids.push(cid),
        }
    }

    let (found, missing) = storage.read_blocks(&cids).await?;
    if let Some(cid) = missing.first() {
        return Err(RepoError::not_found("repo block", cid));
    }

    let blocks = found
        .into_iter()
        .map(|(cid, block)| (cid, block.encoded))
        .collect();
    write_car_bytes(vec![commit_cid], blocks).await
}

/// Export a committed repo to a CAR file
pub async fn export_repo_car<S: RepoStorage + Sync + 'static>(
    path: impl AsRef<Path>,
    commit_cid: Cid,
    mst: &Mst<S>,
) -> Result<()> {
    let car = export_repo_car_bytes(commit_cid, mst).await?;
    tokio::fs::write(path, car).await.map_err(|e| RepoError::io(e))
}
