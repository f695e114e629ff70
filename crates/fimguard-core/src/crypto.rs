//! HMAC-SHA256 authentication tags and the sealed-file framing used by every
//! persisted artifact (record store, audit segments, safe mode state).
//!
//! Sealed layout:
//!
//! ```text
//! <64 lowercase hex chars: HMAC-SHA256(key, body)>\n<body bytes>
//! ```
//!
//! The tag covers the exact body bytes, so any change to the file, including
//! whitespace, is detected without relying on a canonical re-serialization.

use crate::error::GuardError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

pub const TAG_HEX_LEN: usize = 64;

/// Signing key material. The raw bytes are zeroed on drop.
#[derive(Clone)]
pub struct SecretKey {
    raw: Zeroizing<Vec<u8>>,
    template: HmacSha256,
}

impl SecretKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, GuardError> {
        let raw = Zeroizing::new(bytes.into());
        if raw.is_empty() {
            return Err(GuardError::Config("secret key must not be empty".into()));
        }
        let template = <HmacSha256 as Mac>::new_from_slice(&raw)
            .map_err(|e| GuardError::Config(format!("secret key rejected: {e}")))?;
        Ok(Self { raw, template })
    }

    pub fn from_passphrase(passphrase: &str) -> Result<Self, GuardError> {
        Self::new(passphrase.as_bytes().to_vec())
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub(crate) fn mac(&self) -> HmacSha256 {
        self.template.clone()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(<{} bytes>)", self.raw.len())
    }
}

/// Incremental tag computation. Cloning is cheap and lets callers extend a
/// running tag (e.g. the active audit segment) without rehashing the prefix.
#[derive(Clone)]
pub struct TagState(HmacSha256);

impl TagState {
    pub fn new(key: &SecretKey) -> Self {
        Self(key.mac())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize_hex(&self) -> String {
        hex::encode(self.0.clone().finalize().into_bytes())
    }
}

pub fn sign(key: &SecretKey, bytes: &[u8]) -> String {
    let mut mac = key.mac();
    mac.update(bytes);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex tag. Only canonical lowercase hex is
/// accepted so that a case flip in the stored tag cannot verify.
pub fn verify(key: &SecretKey, bytes: &[u8], tag_hex: &str) -> bool {
    if tag_hex.len() != TAG_HEX_LEN
        || !tag_hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return false;
    }
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    let mut mac = key.mac();
    mac.update(bytes);
    mac.verify_slice(&tag).is_ok()
}

/// Compare two secrets without leaking the position of the first mismatch.
pub fn secrets_match(key: &SecretKey, expected: &str, presented: &str) -> bool {
    let expected_tag = sign(key, expected.as_bytes());
    verify(key, presented.as_bytes(), &expected_tag)
}

pub fn seal(key: &SecretKey, body: &[u8]) -> Vec<u8> {
    seal_with_tag(&sign(key, body), body)
}

pub fn seal_with_tag(tag_hex: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TAG_HEX_LEN + 1 + body.len());
    out.extend_from_slice(tag_hex.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

/// Why a sealed buffer was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    Malformed,
    TagMismatch,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::Malformed => write!(f, "malformed sealed header"),
            OpenError::TagMismatch => write!(f, "authentication tag mismatch"),
        }
    }
}

/// Split a sealed buffer and authenticate its body. Returns `(tag, body)`.
pub fn open<'a>(key: &SecretKey, sealed: &'a [u8]) -> Result<(&'a str, &'a [u8]), OpenError> {
    if sealed.len() < TAG_HEX_LEN + 1 || sealed[TAG_HEX_LEN] != b'\n' {
        return Err(OpenError::Malformed);
    }
    let tag = std::str::from_utf8(&sealed[..TAG_HEX_LEN]).map_err(|_| OpenError::Malformed)?;
    let body = &sealed[TAG_HEX_LEN + 1..];
    if verify(key, body, tag) {
        Ok((tag, body))
    } else {
        Err(OpenError::TagMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::from_passphrase("correct horse battery staple").unwrap()
    }

    #[test]
    fn sealed_roundtrip_opens() {
        let sealed = seal(&key(), br#"{"version":1,"records":{}}"#);
        let (_, body) = open(&key(), &sealed).unwrap();
        assert_eq!(body, br#"{"version":1,"records":{}}"#);
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let body = br#"{"version":7,"records":{"/w/a.txt":{"digest":"ab","size":3}}}"#;
        let sealed = seal(&key(), body);
        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut flipped = sealed.clone();
                flipped[byte] ^= 1 << bit;
                assert!(
                    open(&key(), &flipped).is_err(),
                    "flip of bit {bit} in byte {byte} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = seal(&key(), b"payload");
        let other = SecretKey::from_passphrase("another key entirely").unwrap();
        assert_eq!(open(&other, &sealed), Err(OpenError::TagMismatch));
    }

    #[test]
    fn uppercase_tag_does_not_verify() {
        let tag = sign(&key(), b"payload");
        assert!(verify(&key(), b"payload", &tag));
        assert!(!verify(&key(), b"payload", &tag.to_uppercase()));
    }

    #[test]
    fn incremental_tag_matches_one_shot() {
        let mut state = TagState::new(&key());
        state.update(b"line one\n");
        state.update(b"line two\n");
        assert_eq!(state.finalize_hex(), sign(&key(), b"line one\nline two\n"));
    }

    #[test]
    fn empty_key_is_a_config_error() {
        assert!(matches!(SecretKey::new(Vec::new()), Err(GuardError::Config(_))));
    }

    #[test]
    fn secrets_match_is_exact() {
        assert!(secrets_match(&key(), "admin-token", "admin-token"));
        assert!(!secrets_match(&key(), "admin-token", "admin-tokem"));
        assert!(!secrets_match(&key(), "admin-token", ""));
    }
}
