#![allow(dead_code)]

use std::{fs, sync::OnceLock};

use hsm_signer::codec;
use rsa::{
    pkcs1v15::{Signature, VerifyingKey},
    pkcs8::{EncodePrivateKey, LineEnding},
    signature::Verifier,
    RsaPrivateKey,
};
use sha2::Sha256;
use tempfile::TempDir;

pub const LABEL: &str = "invoice-signer";

pub fn private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa keygen"))
}

pub fn private_key_pem() -> String {
    private_key()
        .to_pkcs8_pem(LineEnding::LF)
        .expect("pkcs8 pem")
        .to_string()
}

/// Shared-resources directory holding one certificate per label.
pub fn certificates(labels: &[&str]) -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    for label in labels {
        fs::write(
            dir.path().join(format!("{label}.crt")),
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
        )
        .expect("write certificate");
    }
    dir
}

pub fn assert_verifies(signature_b64: &str, message: &[u8]) {
    let verifying_key = VerifyingKey::<Sha256>::new(private_key().to_public_key());
    let raw = codec::decode(signature_b64).expect("signature is base64");
    let signature = Signature::try_from(raw.as_slice()).expect("signature length");
    verifying_key
        .verify(message, &signature)
        .expect("signature verifies");
}
