//! Secret handling: the reversible transform applied to configured PINs and
//! passwords, and the fixed-capacity PIN buffer handed to `C_Login`.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    codec,
    error::{SignerError, SignerResult},
};

/// Maximum PIN length accepted by the vendor client library.
pub const MAX_PIN_SIZE: usize = 64;

const NONCE_LEN: usize = 12;

/// Process-wide reversible transform used to recover configured secrets.
pub trait SecretTransform: Send + Sync {
    fn reveal(&self, sealed: &str) -> SignerResult<Zeroizing<Vec<u8>>>;
}

/// Identity transform, for deployments that keep secrets in clear text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSecrets;

impl SecretTransform for PlainSecrets {
    fn reveal(&self, sealed: &str) -> SignerResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(sealed.as_bytes().to_vec()))
    }
}

/// AES-256-GCM sealing. Sealed values are `base64(nonce || ciphertext)`.
pub struct SealedSecrets {
    cipher: Aes256Gcm,
}

impl SealedSecrets {
    pub fn new(key: &[u8]) -> SignerResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| SignerError::config("secret key must be 32 bytes"))?;
        Ok(Self { cipher })
    }

    /// Builds the transform from a base64-encoded 32-byte key.
    pub fn from_base64(key: &str) -> SignerResult<Self> {
        let key = codec::decode(key).map_err(|_| SignerError::config("secret key is not base64"))?;
        Self::new(&key)
    }

    pub fn seal(&self, secret: &[u8]) -> SignerResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), secret)
            .map_err(|_| SignerError::provider("unable to seal secret"))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(codec::encode(&sealed))
    }
}

impl SecretTransform for SealedSecrets {
    fn reveal(&self, sealed: &str) -> SignerResult<Zeroizing<Vec<u8>>> {
        let raw = codec::decode(sealed).map_err(|_| SignerError::config("sealed secret is not base64"))?;
        if raw.len() <= NONCE_LEN {
            return Err(SignerError::config("sealed secret is truncated"));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| SignerError::config("unable to unseal secret"))
    }
}

/// Decrypted user PIN. Never formatted, compared or resized; wiped on drop.
pub struct PinBuffer {
    bytes: [u8; MAX_PIN_SIZE],
    len: usize,
    valid: bool,
}

impl PinBuffer {
    /// Reveals `sealed` once. A PIN that cannot be revealed, is empty or is
    /// longer than [`MAX_PIN_SIZE`] yields an invalid buffer.
    pub fn reveal(sealed: &str, transform: &dyn SecretTransform) -> Self {
        let mut pin = Self::invalid();
        if let Ok(plain) = transform.reveal(sealed) {
            if !plain.is_empty() && plain.len() <= MAX_PIN_SIZE {
                pin.bytes[..plain.len()].copy_from_slice(&plain);
                pin.len = plain.len();
                pin.valid = true;
            }
        }
        pin
    }

    pub fn invalid() -> Self {
        Self {
            bytes: [0u8; MAX_PIN_SIZE],
            len: 0,
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.len > 0 && self.len <= MAX_PIN_SIZE
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn expose(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Copy restricted to the secret itself, used when recycling a provider.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            bytes: self.bytes,
            len: self.len,
            valid: self.valid,
        }
    }
}

impl Drop for PinBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
        self.len = 0;
        self.valid = false;
    }
}
