//! Room-entry digests.
//!
//! A locked room stores the SHA-256 hex digest of its key, never the key.
//! The local comparison is advisory: a mismatch rejects immediately without
//! touching the network, a match only means "attempt the join" and the
//! backend's connect endpoint stays the authority.

use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;

use crate::model::{Room, UserRef};

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

pub const KEY_MISMATCH: &str = "Key mismatch.";
pub const KEY_REQUIRED: &str = "This room is locked, a key is required.";

/// Lowercase hex SHA-256 digest of a candidate key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// 64 lowercase hex characters.
    pub fn is_well_formed(s: &str) -> bool {
        s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hash the candidate exactly as given: no trimming, no case folding.
pub fn compute_digest(candidate: &str) -> Digest {
    Digest(format!("{:x}", Sha256::digest(candidate.as_bytes())))
}

/// True only when `compute_digest(candidate)` equals `stored` byte for byte.
pub fn verify(candidate: &str, stored: &str) -> bool {
    let computed = compute_digest(candidate);
    // ct_eq on slices of different length is simply unequal
    computed.as_str().as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Outcome of the local gate in front of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Public room; join directly.
    Open,
    /// The host never needs the key of their own room.
    HostBypass,
    /// Locked room and no key was supplied.
    KeyRequired,
    /// Local digest matched. Still only an attempt.
    Attempt,
    /// Local digest did not match. Do not call the backend.
    Reject,
}

impl Admission {
    pub fn may_attempt(&self) -> bool {
        matches!(self, Admission::Open | Admission::HostBypass | Admission::Attempt)
    }
}

pub fn check(room: &Room, user: &UserRef, candidate: Option<&str>) -> Admission {
    if room.key.is_empty() {
        return Admission::Open;
    }
    if room.host.id == user.id {
        return Admission::HostBypass;
    }
    match candidate {
        None => Admission::KeyRequired,
        Some(key) if verify(key, &room.key) => Admission::Attempt,
        Some(_) => Admission::Reject,
    }
}
