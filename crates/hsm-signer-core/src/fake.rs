//! Software signer for hosts without an HSM attached.
//!
//! The provider is configured with a JSON map
//! `{ "<label>": { "key": "<path or PEM>", "pwd": "<sealed password>" } }`.
//! Passwords are revealed at load time and kept base64-encoded until a
//! signature needs them.

use std::{collections::BTreeMap, fs, sync::Arc};

use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer},
    RsaPrivateKey,
};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    codec,
    error::{SignerError, SignerResult},
    provider::{guarded_call, ProviderBase, ProviderKind, SigningProvider},
    secret::SecretTransform,
};

const PEM_MARKER: &str = "-----BEGIN";

#[derive(Deserialize)]
struct KeyEntry {
    key: String,
    #[serde(default)]
    pwd: String,
}

struct LoadedKey {
    key: String,
    /// Revealed password, base64-encoded.
    pwd: Zeroizing<String>,
}

pub struct FakeProvider {
    base: ProviderBase,
    config: String,
    transform: Arc<dyn SecretTransform>,
    keys: BTreeMap<String, LoadedKey>,
}

impl FakeProvider {
    pub fn new(
        application: impl Into<String>,
        config: impl Into<String>,
        transform: Arc<dyn SecretTransform>,
    ) -> Self {
        Self {
            base: ProviderBase::new(application),
            config: config.into(),
            transform,
            keys: BTreeMap::new(),
        }
    }

    pub fn key_labels(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

#[derive(Default)]
struct SignScratch {
    decoded: Option<Zeroizing<Vec<u8>>>,
}

impl SigningProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Fake
    }

    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ProviderBase {
        &mut self.base
    }

    fn load(&mut self) -> SignerResult<()> {
        self.keys.clear();
        let parsed: BTreeMap<String, KeyEntry> = serde_json::from_str(&self.config)
            .map_err(|e| SignerError::config(format!("malformed key map: {e}")))?;
        let mut keys = BTreeMap::new();
        for (label, entry) in parsed {
            let password = if entry.pwd.is_empty() {
                Zeroizing::new(Vec::new())
            } else {
                self.transform.reveal(&entry.pwd)?
            };
            keys.insert(
                label,
                LoadedKey {
                    key: entry.key,
                    pwd: Zeroizing::new(codec::encode(&password)),
                },
            );
        }
        self.keys = keys;
        info!(
            application = %self.base.application(),
            keys = self.keys.len(),
            "software signer loaded"
        );
        Ok(())
    }

    fn sign(&mut self, key: &str, hash: &str) -> SignerResult<String> {
        if !self.base.certificates().contains_key(key) {
            return Err(SignerError::CertificateNotFound(key.to_string()));
        }
        let keys = &self.keys;
        let mut scratch = SignScratch::default();
        let signature = guarded_call(
            &mut scratch,
            |scratch| {
                let entry = keys
                    .get(key)
                    .ok_or_else(|| SignerError::config(format!("no key configured for {key}")))?;
                let password = codec::decode(&entry.pwd)
                    .map_err(|_| SignerError::config(format!("corrupted password for {key}")))?;
                let data = scratch.decoded.insert(codec::decode(hash)?);
                let private_key = read_private_key(&entry.key, &password)?;
                let signature = SigningKey::<Sha256>::new(private_key)
                    .try_sign(data.as_slice())
                    .map_err(SignerError::provider)?;
                Ok(codec::encode(&signature.to_vec()))
            },
            |scratch| scratch.decoded = None,
        )?;
        assert!(scratch.decoded.is_none(), "decode buffer survived cleanup");
        debug!(key, "software signature produced");
        Ok(signature)
    }

    fn unload(&mut self) {
        self.keys.clear();
    }

    fn recycled(&self) -> Box<dyn SigningProvider> {
        Box::new(Self {
            base: self.base.recycled(),
            config: self.config.clone(),
            transform: Arc::clone(&self.transform),
            keys: BTreeMap::new(),
        })
    }
}

/// Loads an RSA key from inline PEM or from a PEM file. Encrypted PKCS#8 is
/// decrypted with `password`; PKCS#1 and plain PKCS#8 are read as is.
fn read_private_key(reference: &str, password: &[u8]) -> SignerResult<RsaPrivateKey> {
    let pem = if reference.trim_start().starts_with(PEM_MARKER) {
        Zeroizing::new(reference.to_string())
    } else {
        Zeroizing::new(fs::read_to_string(reference).map_err(|e| {
            SignerError::config(format!("unable to read private key {reference}: {e}"))
        })?)
    };
    let key = if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
        RsaPrivateKey::from_pkcs8_encrypted_pem(&pem, password).map_err(|e| e.to_string())
    } else if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|e| e.to_string())
    } else {
        RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| e.to_string())
    };
    key.map_err(|e| SignerError::config(format!("invalid private key: {e}")))
}
