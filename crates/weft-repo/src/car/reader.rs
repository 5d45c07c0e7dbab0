//! CAR parsing: just enough to take apart repo exports and firehose frames.

use bytes::Bytes;
use cid::Cid;
use iroh_car::CarReader;
use n0_future::stream::StreamExt;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::AsyncRead;

use crate::error::{RepoError, Result};

/// A CAR taken apart: the first header root plus every block
#[derive(Debug, Clone)]
pub struct ParsedCar {
    /// The first root CID from the CAR header
    pub root: Cid,
    /// All blocks in the CAR, keyed by CID
    pub blocks: BTreeMap<Cid, Bytes>,
}

/// Pull the header roots and every block out of a CAR source
async fn drain<R>(source: R) -> Result<(Vec<Cid>, BTreeMap<Cid, Bytes>)>
where
    R: AsyncRead + Send + Unpin,
{
    let reader = CarReader::new(source)
        .await
        .map_err(|e| RepoError::car_parse(e))?;
    let roots = reader.header().roots().to_vec();

    let mut blocks = BTreeMap::new();
    let stream = reader.stream();
    n0_future::pin!(stream);
    while let Some(block) = stream.next().await {
        let (cid, data) = block.map_err(|e| RepoError::car_parse(e))?;
        blocks.insert(cid, Bytes::from(data));
    }

    Ok((roots, blocks))
}

/// Parse in-memory CAR bytes (firehose frames, wire responses)
pub async fn parse_car_bytes(data: &[u8]) -> Result<ParsedCar> {
    let (roots, blocks) = drain(data).await?;
    let root = roots
        .into_iter()
        .next()
        .ok_or_else(|| RepoError::invalid("CAR data has no roots"))?;
    Ok(ParsedCar { root, blocks })
}

/// Read a CAR file from disk
pub async fn read_car(path: impl AsRef<Path>) -> Result<ParsedCar> {
    let file = tokio::fs::File::open(path).await.map_err(|e| RepoError::io(e))?;
    let (roots, blocks) = drain(file).await?;
    let root = roots
        .into_iter()
        .next()
        .ok_or_else(|| RepoError::invalid("CAR file has no roots"))?;
    Ok(ParsedCar { root, blocks })
}
