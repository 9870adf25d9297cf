//! Key primitives (spec §4.1, component C1).
//!
//! Keys are Curve25519 scalars, encoded for storage and for WireGuard
//! config text as 32-byte base64 (44 characters, trailing `=`). Generation
//! always goes through a CSPRNG; there is deliberately no seeded/deterministic
//! path (§4.1: "no deterministic/seeded modes"). Derivation is pure and
//! total over any validated private key.

use core::fmt;

use base64::prelude::*;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::MeshError;

/// A Curve25519 private key (WireGuard `PrivateKey`).
///
/// Zeroized on drop. Equality and hashing are only ever performed on the
/// raw bytes, never on derived material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Generate a new random private key. Backed by `getrandom` via
    /// `x25519_dalek`; this is the crate's only key-generation path.
    #[must_use]
    pub fn random() -> PrivateKey {
        Self(StaticSecret::random())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&"<redacted>").finish()
    }
}

impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.as_bytes()))
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl From<[u8; 32]> for PrivateKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }
}

impl TryFrom<&str> for PrivateKey {
    type Error = MeshError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self(StaticSecret::from(decode_key(value)?)))
    }
}

impl TryFrom<String> for PrivateKey {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

/// A Curve25519 public key (WireGuard `PublicKey`). Also used as the value
/// of `permanent_guid` (§3: "= first public key ever observed for this
/// entity").
#[derive(Clone, PartialEq, Eq, Hash, Zeroize)]
pub struct PublicKey(#[zeroize(skip)] XPublicKey);

impl PublicKey {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_string()).finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.as_bytes()))
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(XPublicKey::from(bytes))
    }
}

impl TryFrom<&str> for PublicKey {
    type Error = MeshError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self(XPublicKey::from(decode_key(value)?)))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<&PrivateKey> for PublicKey {
    fn from(value: &PrivateKey) -> Self {
        Self(XPublicKey::from(&value.0))
    }
}

/// A WireGuard `PresharedKey`. Same shape and encoding as [`PrivateKey`],
/// but never has a corresponding public key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; 32]);

impl PresharedKey {
    #[must_use]
    pub fn random() -> Self {
        Self(PrivateKey::random().to_bytes())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PresharedKey").field(&"<redacted>").finish()
    }
}

impl fmt::Display for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl From<[u8; 32]> for PresharedKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&str> for PresharedKey {
    type Error = MeshError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self(decode_key(value)?))
    }
}

fn decode_key(value: &str) -> Result<[u8; 32], MeshError> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|e| MeshError::MalformedKey(format!("{value}: not valid base64 ({e})")))?
        .try_into()
        .map_err(|bytes: Vec<u8>| {
            MeshError::MalformedKey(format!(
                "decoded key is {} bytes, expected 32",
                bytes.len()
            ))
        })
}

/// `generate_keypair() -> (priv, pub)` (§4.1).
#[must_use]
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let private = PrivateKey::random();
    let public = PublicKey::from(&private);
    (private, public)
}

/// `derive_public(priv) -> pub` (§4.1). Pure, total, no I/O.
#[must_use]
pub fn derive_public(private: &PrivateKey) -> PublicKey {
    PublicKey::from(private)
}

/// `validate_private(s) -> bool` (§4.1).
#[must_use]
pub fn validate_private(s: &str) -> bool {
    PrivateKey::try_from(s).is_ok()
}

/// `validate_public(s) -> bool` (§4.1).
#[must_use]
pub fn validate_public(s: &str) -> bool {
    PublicKey::try_from(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_public_is_pure_and_matches_generated_pair() {
        let (private, public) = generate_keypair();
        assert_eq!(derive_public(&private), public);
    }

    #[test]
    fn roundtrip_through_base64() {
        let (private, public) = generate_keypair();
        let private2 = PrivateKey::try_from(private.to_string().as_str()).unwrap();
        let public2 = PublicKey::try_from(public.to_string().as_str()).unwrap();
        assert_eq!(private, private2);
        assert_eq!(public, public2);
    }

    #[test]
    fn rejects_short_and_long_keys() {
        assert!(!validate_public("dG9vc2hvcnQ="));
        assert!(!validate_private(""));
        assert!(!validate_public(&BASE64_STANDARD.encode([0u8; 33])));
    }

    #[test]
    fn rejects_non_base64() {
        assert!(!validate_public("not base64 at all!!"));
    }
}
