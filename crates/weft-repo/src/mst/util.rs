//! Canonical encoding, content addresses, key grammar, and layer placement.

use cid::Cid;
use sha2::{Digest, Sha256};

use crate::error::{MstError, RepoError, Result};
use crate::{DAG_CBOR_CID_CODEC, SHA2_256_CODE};

/// Wrap already-encoded DAG-CBOR bytes as a CIDv1 (dag-cbor + sha2-256)
pub fn compute_cid(encoded: &[u8]) -> Result<Cid> {
    let digest = Sha256::digest(encoded);
    let multihash = multihash::Multihash::wrap(SHA2_256_CODE, &digest)
        .map_err(|e| RepoError::invalid_cid(e.to_string()))?;
    Ok(Cid::new_v1(DAG_CBOR_CID_CODEC, multihash))
}

/// Canonical DAG-CBOR encoding of a serializable value
pub fn encode_dag_cbor<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| RepoError::serialization(e))
}

/// Canonical derivation of a value's content address: encode as DAG-CBOR,
/// hash with SHA-256, wrap as CIDv1. Equality of derived CIDs is the
/// equality relation on records.
pub fn dag_cbor_cid<T: serde::Serialize>(value: &T) -> Result<Cid> {
    compute_cid(&encode_dag_cbor(value)?)
}

/// The layer a key lives at: the count of leading 2-bit zero chunks in
/// SHA-256 of the key, giving a fanout of ~4.
///
/// Each digest byte holds four 2-bit chunks, most significant first: a zero
/// byte contributes four chunks, a nonzero byte contributes however many of
/// its high chunks are zero, and counting stops there.
pub fn layer_for_key(key: &str) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut layer = 0;

    for byte in digest {
        if byte == 0 {
            layer += 4;
            continue;
        }
        if byte < 0x04 {
            layer += 3;
        } else if byte < 0x10 {
            layer += 2;
        } else if byte < 0x40 {
            layer += 1;
        }
        break;
    }

    layer
}

fn valid_key_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

/// Validate MST key format
///
/// Keys have the exact form `<collection>/<rkey>` where both segments match
/// `[A-Za-z0-9_:.-]+`. Max length: 256 bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }

    if key.len() > 256 {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: 256,
        }
        .into());
    }

    let Some((collection, rkey)) = key.split_once('/') else {
        return Err(MstError::InvalidKey {
            key: key.to_string(),
        }
        .into());
    };

    if !valid_key_segment(collection) || !valid_key_segment(rkey) || rkey.contains('/') {
        return Err(MstError::InvalidKey {
            key: key.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Length of the byte prefix two keys share
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_valid() {
        assert!(validate_key("app.bsky.feed.post/abc123").is_ok());
        assert!(validate_key("foo.bar/test-key_2024").is_ok());
        assert!(validate_key("co.ll/t1").is_ok());
    }

    #[test]
    fn test_validate_key_empty() {
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_validate_key_missing_segment() {
        assert!(validate_key("noslash").is_err());
        assert!(validate_key("/rkey").is_err());
        assert!(validate_key("collection/").is_err());
        assert!(validate_key("a/b/c").is_err());
    }

    #[test]
    fn test_validate_key_length_boundary() {
        // exactly 256 bytes is allowed
        let key = format!("co.ll/{}", "a".repeat(250));
        assert_eq!(key.len(), 256);
        assert!(validate_key(&key).is_ok());

        // 257 bytes is not
        let key = format!("co.ll/{}", "a".repeat(251));
        assert_eq!(key.len(), 257);
        assert!(validate_key(&key).is_err());
    }

    #[test]
    fn test_validate_key_invalid_chars() {
        assert!(validate_key("co.ll/key with spaces").is_err());
        assert!(validate_key("co.ll/key@invalid").is_err());
        assert!(validate_key("co.ll/key#hash").is_err());
        assert!(validate_key("co.ll/key~tilde").is_err());
    }

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(b"hello", b"help"), 3);
        assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
        assert_eq!(common_prefix_len(b"abc", b"def"), 0);
        assert_eq!(common_prefix_len(b"", b"test"), 0);
    }

    #[test]
    fn test_layer_for_key_stable() {
        let layer = layer_for_key("app.bsky.feed.post/test");
        assert!(layer < 128);
        assert_eq!(layer, layer_for_key("app.bsky.feed.post/test"));
    }

    #[test]
    fn test_layer_counts_two_bit_chunks() {
        // Brute-force a few keys and cross-check against a bit-level count
        for i in 0..64 {
            let key = format!("co.ll/probe{i}");
            let digest = Sha256::digest(key.as_bytes());

            let mut expected = 0;
            'bits: for byte in digest {
                for shift in [6u8, 4, 2, 0] {
                    if (byte >> shift) & 0b11 == 0 {
                        expected += 1;
                    } else {
                        break 'bits;
                    }
                }
            }

            assert_eq!(layer_for_key(&key), expected, "key {key}");
        }
    }

    #[test]
    fn test_dag_cbor_cid_deterministic() {
        use std::collections::BTreeMap;
        let mut a = BTreeMap::new();
        a.insert("foo", "bar");
        let mut b = BTreeMap::new();
        b.insert("foo", "bar");
        assert_eq!(dag_cbor_cid(&a).unwrap(), dag_cbor_cid(&b).unwrap());

        let mut c = BTreeMap::new();
        c.insert("foo", "baz");
        assert_ne!(dag_cbor_cid(&a).unwrap(), dag_cbor_cid(&c).unwrap());
    }
}
