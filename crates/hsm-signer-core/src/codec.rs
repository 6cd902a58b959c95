//! Base64 and SHA-256 helpers plus the PKCS#1 v1.5 DigestInfo payload handed to
//! `CKM_RSA_PKCS`.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{SignerError, SignerResult};

/// DER-encoded DigestInfo header for SHA-256 (RFC 3447, section 9.2 note 1).
pub const SHA256_DIGEST_INFO_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];

pub const SHA256_DIGEST_LEN: usize = 32;

pub const SIGNING_PAYLOAD_LEN: usize = SHA256_DIGEST_INFO_PREFIX.len() + SHA256_DIGEST_LEN;

pub fn encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decodes into a buffer that is wiped when dropped.
pub fn decode(value: &str) -> SignerResult<Zeroizing<Vec<u8>>> {
    B64.decode(value.trim())
        .map(Zeroizing::new)
        .map_err(|e| SignerError::InvalidHash(e.to_string()))
}

pub fn sha256(bytes: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
    Sha256::digest(bytes).into()
}

/// 19-byte DigestInfo header followed by a 32-byte SHA-256 digest.
pub struct SigningPayload {
    bytes: [u8; SIGNING_PAYLOAD_LEN],
}

impl SigningPayload {
    pub fn new() -> Self {
        let mut payload = Self {
            bytes: [0u8; SIGNING_PAYLOAD_LEN],
        };
        payload.reset();
        payload
    }

    /// Restores the prefix and zeroes the digest region.
    pub fn reset(&mut self) {
        let (prefix, digest) = self.bytes.split_at_mut(SHA256_DIGEST_INFO_PREFIX.len());
        prefix.copy_from_slice(&SHA256_DIGEST_INFO_PREFIX);
        digest.zeroize();
    }

    pub fn set_digest(&mut self, digest: &[u8; SHA256_DIGEST_LEN]) {
        self.reset();
        self.bytes[SHA256_DIGEST_INFO_PREFIX.len()..].copy_from_slice(digest);
    }

    pub fn digest(&self) -> &[u8] {
        &self.bytes[SHA256_DIGEST_INFO_PREFIX.len()..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for SigningPayload {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SigningPayload {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}
