//! Identifier types shared across the repository engine: DIDs and TIDs.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use smol_str::{SmolStr, SmolStrBuilder};

use crate::error::{RepoError, Result};

const S32_CHARS: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Base32-sortable encoding of a 64-bit value, fixed 13 characters.
fn s32_encode(mut i: u64) -> SmolStr {
    let mut buf = [0u8; 13];
    for slot in buf.iter_mut().rev() {
        *slot = S32_CHARS[(i & 0x1F) as usize];
        i >>= 5;
    }
    let mut s = SmolStrBuilder::new();
    for b in buf {
        s.push(b as char);
    }
    s.finish()
}

/// Base32-sortable decode; `None` if any character is outside the alphabet.
fn s32_decode(s: &str) -> Option<u64> {
    let mut i: u64 = 0;
    for c in s.bytes() {
        let v = S32_CHARS.iter().position(|&x| x == c)?;
        i = (i << 5) | v as u64;
    }
    Some(i)
}

/// Timestamp Identifier: 13-character base32-sortable microsecond timestamp
/// with a 10-bit clock id suffix. Lexicographic order matches timestamp order.
///
/// See: <https://atproto.com/specs/tid>
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Tid(SmolStr);

impl Tid {
    /// Parse a TID from a string.
    pub fn new(tid: impl AsRef<str>) -> Result<Self> {
        let tid = tid.as_ref();
        if tid.len() != 13 {
            return Err(RepoError::invalid(format!("TID must be 13 chars: {tid}"))
                .with_context("parsing TID".to_string()));
        }
        if !tid.bytes().all(|b| S32_CHARS.contains(&b)) {
            return Err(RepoError::invalid(format!("invalid TID characters: {tid}")));
        }
        // High bit of the 64-bit value must be zero, so the first character
        // is restricted to 234567abcdefghij.
        if tid.as_bytes()[0] > b'j' {
            return Err(RepoError::invalid(format!("TID out of range: {tid}")));
        }
        Ok(Self(SmolStr::new(tid)))
    }

    /// Build a TID from a microsecond timestamp and clock id.
    pub fn from_micros(micros: u64, clock_id: u16) -> Self {
        let packed = (micros << 10) & 0x7FFF_FFFF_FFFF_FC00 | (clock_id as u64 & 0x3FF);
        Self(s32_encode(packed))
    }

    /// Build a TID from a wall-clock time and clock id.
    pub fn from_datetime(time: chrono::DateTime<chrono::Utc>, clock_id: u16) -> Self {
        Self::from_micros(time.timestamp_micros().max(0) as u64, clock_id)
    }

    /// Render a sequence number as a TID with clock id 0.
    ///
    /// Used for commit `rev` fields, where the revision tracks the commit's
    /// sequence number. Ordering by seq and ordering by TID agree.
    pub fn from_seq(seq: i64) -> Self {
        Self::from_micros(seq as u64, 0)
    }

    /// The microsecond timestamp field of this TID.
    pub fn micros(&self) -> u64 {
        s32_decode(self.0.as_str()).unwrap_or(0) >> 10
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for Tid {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = SmolStr::deserialize(deserializer)?;
        Tid::new(&s).map_err(D::Error::custom)
    }
}

/// Monotonic TID source.
///
/// Guarantees each TID is at least 1µs after the previous one from the same
/// ticker, so TIDs never move backwards if the system clock drifts.
#[derive(Debug, Default)]
pub struct Ticker {
    last_micros: u64,
    clock_id: u16,
}

impl Ticker {
    /// New ticker with clock id 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// New ticker with an explicit clock id (bottom 10 bits used).
    pub fn with_clock_id(clock_id: u16) -> Self {
        Self {
            last_micros: 0,
            clock_id,
        }
    }

    /// Next monotonic TID.
    pub fn next(&mut self) -> Tid {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        self.last_micros = now.max(self.last_micros + 1);
        Tid::from_micros(self.last_micros, self.clock_id)
    }
}

/// Decentralised Identifier naming a repo, e.g. `did:plc:abc123` or
/// `did:web:user.example`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

impl Did {
    /// Parse a DID, validating the `did:<method>:<id>` shape.
    pub fn new(did: impl AsRef<str>) -> Result<Self> {
        let did = did.as_ref();
        let rest = did
            .strip_prefix("did:")
            .ok_or_else(|| RepoError::invalid(format!("DID must start with did: {did}")))?;

        let (method, id) = rest
            .split_once(':')
            .ok_or_else(|| RepoError::invalid(format!("DID missing method or id: {did}")))?;

        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(RepoError::invalid(format!("invalid DID method: {did}")));
        }
        if id.is_empty() {
            return Err(RepoError::invalid(format!("empty DID identifier: {did}")));
        }

        Ok(Self(SmolStr::new(did)))
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The DID method, e.g. `plc` or `web`.
    pub fn method(&self) -> &str {
        self.0.as_str()[4..]
            .split(':')
            .next()
            .unwrap_or("")
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for Did {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = SmolStr::deserialize(deserializer)?;
        Did::new(&s).map_err(D::Error::custom)
    }
}
