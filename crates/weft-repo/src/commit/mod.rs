//! Signed repository commits.
//!
//! A commit binds a DID to an MST root and the previous commit, signed with
//! the repo's active signing key. Signing is deterministic ECDSA over the
//! canonical DAG-CBOR encoding of the commit with `sig` absent, with the
//! low-S mitigation applied unconditionally.

pub mod serde_bytes_helper;

use crate::error::{CommitError, RepoError, Result};
use crate::mst::util::{compute_cid, encode_dag_cbor};
use crate::types::{Did, Tid};
use bytes::Bytes;
use cid::Cid;

/// Supported repo format version
pub const COMMIT_VERSION: i64 = 3;

/// Repository commit object
///
/// Stored as a block, identified by its CID. Field declaration order is the
/// canonical DAG-CBOR map order (length-first, then bytewise), with and
/// without `sig`, so serialization never reorders keys.
///
/// `prev` serializes as explicit `null` for the genesis commit; `sig` is
/// omitted entirely while unsigned.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    /// Repository DID
    pub did: Did,

    /// Revision TID (the commit's sequence number, as a TID with clock id 0)
    pub rev: Tid,

    /// Signature bytes (raw 64-byte r||s), absent while unsigned
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes_helper::opt"
    )]
    pub sig: Option<Bytes>,

    /// MST root CID
    pub data: Cid,

    /// Previous commit CID (None for the genesis commit)
    pub prev: Option<Cid>,

    /// Commit version
    pub version: i64,
}

impl Commit {
    /// Create new unsigned commit (version 3, no sig)
    pub fn new_unsigned(did: Did, data: Cid, rev: Tid, prev: Option<Cid>) -> Self {
        Self {
            did,
            rev,
            sig: None,
            data,
            prev,
            version: COMMIT_VERSION,
        }
    }

    /// Sign this commit with a key
    pub fn sign(mut self, key: &(impl SigningKey + ?Sized)) -> Result<Self> {
        let unsigned = self.unsigned_bytes()?;
        self.sig = Some(key.sign_bytes(&unsigned)?);
        Ok(self)
    }

    /// Get unsigned commit bytes (for signing/verification)
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.sig = None;
        encode_dag_cbor(&unsigned)
    }

    /// Serialize to DAG-CBOR
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        encode_dag_cbor(self)
    }

    /// Deserialize from DAG-CBOR
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        serde_ipld_dagcbor::from_slice(data)
            .map_err(|e| CommitError::Serialization(Box::new(e)).into())
    }

    /// Compute CID of this commit
    pub fn to_cid(&self) -> Result<Cid> {
        compute_cid(&self.to_cbor()?)
    }

    /// Verify the signature against a public key.
    ///
    /// Returns `Ok(false)` for a signature of the wrong length or one that
    /// fails verification. Fails with `NotSigned` if the commit has no `sig`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<bool> {
        let sig = self.sig.as_ref().ok_or_else(RepoError::not_signed)?;
        let unsigned = self.unsigned_bytes()?;
        Ok(key.verify(&unsigned, sig))
    }

    /// Like [`Commit::verify`], but a failed check is an error
    pub fn ensure_signed_by(&self, key: &VerifyingKey) -> Result<()> {
        if self.verify(key)? {
            Ok(())
        } else {
            Err(RepoError::signature_invalid())
        }
    }
}

/// Trait for commit signing keys.
///
/// Implemented for `k256::ecdsa::SigningKey` (secp256k1, the supported
/// profile) and `p256::ecdsa::SigningKey`. `sign_bytes` must produce a
/// low-S signature: after computing `(r, s)`, if `s > n/2` where `n` is the
/// curve order, `s` is replaced with `n − s` before serialising as raw
/// 64-byte `r||s`.
pub trait SigningKey {
    /// Sign the given data and return the 64-byte low-S signature
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes>;

    /// The corresponding public key
    fn public_key(&self) -> VerifyingKey;
}

/// Public key for commit signature verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyingKey {
    /// secp256k1 public key
    Secp256k1(k256::ecdsa::VerifyingKey),
    /// NIST P-256 public key
    P256(p256::ecdsa::VerifyingKey),
}

impl VerifyingKey {
    /// Verify a raw 64-byte `r||s` signature over `data`.
    ///
    /// Returns `false` (never panics or errors) on wrong length, malformed
    /// scalars, or verification failure.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        if sig.len() != 64 {
            return false;
        }

        match self {
            VerifyingKey::Secp256k1(vk) => {
                use k256::ecdsa::signature::Verifier;
                match k256::ecdsa::Signature::from_slice(sig) {
                    Ok(sig) => vk.verify(data, &sig).is_ok(),
                    Err(_) => false,
                }
            }
            VerifyingKey::P256(vk) => {
                use p256::ecdsa::signature::Verifier;
                match p256::ecdsa::Signature::from_slice(sig) {
                    Ok(sig) => vk.verify(data, &sig).is_ok(),
                    Err(_) => false,
                }
            }
        }
    }

    /// Compressed SEC1 encoding of the public key
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            VerifyingKey::Secp256k1(vk) => vk.to_encoded_point(true).as_bytes().to_vec(),
            VerifyingKey::P256(vk) => vk.to_encoded_point(true).as_bytes().to_vec(),
        }
    }
}

impl SigningKey for k256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use k256::ecdsa::signature::Signer;
        let sig: k256::ecdsa::Signature = Signer::sign(self, data);
        // Low-S mitigation: fold s into the lower half of the scalar range
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> VerifyingKey {
        VerifyingKey::Secp256k1(*self.verifying_key())
    }
}

impl SigningKey for p256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::Signature = Signer::sign(self, data);
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> VerifyingKey {
        VerifyingKey::P256(*self.verifying_key())
    }
}
