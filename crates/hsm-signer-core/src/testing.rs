//! Shared fixtures for unit tests.

use std::sync::OnceLock;

use rsa::{
    pkcs8::{EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};

pub(crate) const CERTIFICATE_PEM: &str =
    "-----BEGIN CERTIFICATE-----\nMIIBfake\n-----END CERTIFICATE-----\n";

pub(crate) fn private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa keygen"))
}

pub(crate) fn private_key_pem() -> String {
    private_key()
        .to_pkcs8_pem(LineEnding::LF)
        .expect("pkcs8 pem")
        .to_string()
}

pub(crate) fn encrypted_private_key_pem(password: &[u8]) -> String {
    let der = private_key().to_pkcs8_der().expect("pkcs8 der");
    let info = pkcs8::PrivateKeyInfo::try_from(der.as_bytes()).expect("private key info");
    let params = pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(
        2048,
        b"hsm-signer-salt!",
        &[7u8; 16],
    )
    .expect("pbes2 params");
    info.encrypt_with_params(params, password)
        .expect("encrypt")
        .to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
        .expect("pem")
        .to_string()
}

pub(crate) fn fake_config(label: &str, key: &str, pwd: &str) -> String {
    serde_json::json!({ label: { "key": key, "pwd": pwd } }).to_string()
}
