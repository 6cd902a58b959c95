mod common;

use std::path::PathBuf;

use common::{assert_verifies, certificates, private_key, private_key_pem, LABEL};
use cryptoki_sys::CKR_SESSION_HANDLE_INVALID;
use hsm_signer::{
    codec, mock::MockToken, ErrorKind, ProviderConfig, ProviderKind, ProviderManager,
    SealedSecrets, SignerConfig, SignerError, DEFAULT_SLOT_ID,
};

fn fake_config(shared_dir: PathBuf) -> SignerConfig {
    let keys = serde_json::json!({ LABEL: { "key": private_key_pem(), "pwd": "" } });
    SignerConfig {
        application: "broker".into(),
        shared_dir,
        secret_key: None,
        singleton: true,
        provider: ProviderConfig::Fake {
            config: keys.to_string(),
        },
    }
}

fn hardware_config(shared_dir: PathBuf, pin: &str, reuse_session: bool) -> SignerConfig {
    SignerConfig {
        application: "broker".into(),
        shared_dir,
        secret_key: None,
        singleton: true,
        provider: ProviderConfig::Hardware {
            slot_id: DEFAULT_SLOT_ID,
            pin: pin.into(),
            reuse_session,
            library_path: None,
        },
    }
}

fn token() -> MockToken {
    MockToken::new(DEFAULT_SLOT_ID, "1234").with_key(LABEL, private_key().clone())
}

#[test]
fn fake_provider_end_to_end() {
    let certs = certificates(&[LABEL]);
    let config = fake_config(certs.path().to_path_buf());
    let mut manager = ProviderManager::new();
    manager
        .startup(&config.shared_dir, config.factory().unwrap())
        .unwrap();
    assert_eq!(manager.provider().map(|p| p.kind()), Some(ProviderKind::Fake));

    let signature = manager.sign(LABEL, &codec::encode(b"hello")).unwrap();
    assert_verifies(&signature, b"hello");

    let err = manager
        .sign("unknown-label", &codec::encode(b"hello"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    manager.shutdown();
    let err = manager.sign(LABEL, &codec::encode(b"hello")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn fake_batch_signs_in_order() {
    let certs = certificates(&[LABEL]);
    let config = fake_config(certs.path().to_path_buf());
    let mut manager = ProviderManager::new();
    manager
        .startup(&config.shared_dir, config.factory().unwrap())
        .unwrap();

    let messages: [&[u8]; 3] = [b"one", b"two", b"three"];
    let hashes: Vec<String> = messages.iter().map(|m| codec::encode(m)).collect();
    let signatures = manager.sign_batch(LABEL, &hashes).unwrap();
    assert_eq!(signatures.len(), 3);
    for (signature, message) in signatures.iter().zip(messages) {
        assert_verifies(signature, message);
    }

    let mut broken = hashes.clone();
    broken.insert(1, "%%%".into());
    let err = manager.sign_batch(LABEL, &broken).unwrap_err();
    assert!(matches!(err, SignerError::InvalidHash(_)));
}

#[test]
fn hardware_provider_through_manager() {
    let certs = certificates(&[LABEL]);
    let token = token();
    let config = hardware_config(certs.path().to_path_buf(), "1234", true);
    let mut manager = ProviderManager::new();
    manager
        .startup(
            &config.shared_dir,
            config.factory_with_loader(token.loader()).unwrap(),
        )
        .unwrap();

    for message in [&b"first"[..], b"second", b"third"] {
        let signature = manager.sign(LABEL, &codec::encode(message)).unwrap();
        assert_verifies(&signature, message);
    }
    let counters = token.counters();
    assert_eq!(counters.initialize, 1);
    assert_eq!(counters.login, 1);
    assert_eq!(counters.sign, 3);

    drop(manager);
    assert_eq!(token.counters().live_libraries, 0);
    assert_eq!(token.open_sessions(), 0);
}

#[test]
fn stale_session_recovers_after_recycle() {
    let certs = certificates(&[LABEL]);
    let token = token();
    let config = hardware_config(certs.path().to_path_buf(), "1234", true);
    let mut manager = ProviderManager::new();
    manager
        .startup(
            &config.shared_dir,
            config.factory_with_loader(token.loader()).unwrap(),
        )
        .unwrap();
    manager.sign(LABEL, &codec::encode(b"warm-up")).unwrap();

    token.invalidate_sessions();
    let err = manager.sign(LABEL, &codec::encode(b"payload")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provider);
    assert_eq!(err.native_code(), Some(CKR_SESSION_HANDLE_INVALID));

    manager.recycle().unwrap();
    let signature = manager.sign(LABEL, &codec::encode(b"payload")).unwrap();
    assert_verifies(&signature, b"payload");
    assert_eq!(token.counters().login, 2);
    assert_eq!(token.counters().live_libraries, 1);
}

#[test]
fn failed_startup_load_is_retried_by_recycle() {
    let certs = certificates(&[LABEL]);
    let token = token();
    token.fail_load("library not installed");
    let config = hardware_config(certs.path().to_path_buf(), "1234", true);
    let mut manager = ProviderManager::new();
    let err = manager
        .startup(
            &config.shared_dir,
            config.factory_with_loader(token.loader()).unwrap(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provider);
    assert!(manager.is_started());
    assert_eq!(
        manager.sign(LABEL, &codec::encode(b"x")).unwrap_err().kind(),
        ErrorKind::Provider
    );

    token.clear_failures();
    manager.recycle().unwrap();
    manager.sign(LABEL, &codec::encode(b"x")).unwrap();
}

#[test]
fn sealed_pin_is_revealed_once_and_survives_recycle() {
    let certs = certificates(&[LABEL]);
    let token = token();
    let key = [42u8; 32];
    let sealed_pin = SealedSecrets::new(&key).unwrap().seal(b"1234").unwrap();
    let mut config = hardware_config(certs.path().to_path_buf(), &sealed_pin, false);
    config.secret_key = Some(codec::encode(&key));

    let mut manager = ProviderManager::new();
    manager
        .startup(
            &config.shared_dir,
            config.factory_with_loader(token.loader()).unwrap(),
        )
        .unwrap();
    manager.sign(LABEL, &codec::encode(b"x")).unwrap();
    manager.recycle().unwrap();
    manager.sign(LABEL, &codec::encode(b"y")).unwrap();
    assert_eq!(token.counters().login, 2);
    assert_eq!(token.open_sessions(), 0);

    config.secret_key = Some(codec::encode(&[7u8; 32]));
    let mut other = ProviderManager::new();
    other
        .startup(
            &config.shared_dir,
            config.factory_with_loader(token.loader()).unwrap(),
        )
        .unwrap();
    let err = other.sign(LABEL, &codec::encode(b"x")).unwrap_err();
    assert!(matches!(err, SignerError::InvalidPin));
}

#[test]
fn certificate_reload_follows_the_shared_directory() {
    let first = certificates(&["alpha", "beta"]);
    let second = certificates(&["gamma"]);
    let token = token();
    let config = hardware_config(first.path().to_path_buf(), "1234", true);
    let mut manager = ProviderManager::new();
    manager
        .startup(
            first.path(),
            config.factory_with_loader(token.loader()).unwrap(),
        )
        .unwrap();
    let names: Vec<_> = manager
        .provider()
        .unwrap()
        .certificates()
        .keys()
        .cloned()
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    manager.shutdown();
    manager
        .startup(
            second.path(),
            config.factory_with_loader(token.loader()).unwrap(),
        )
        .unwrap();
    let names: Vec<_> = manager
        .provider()
        .unwrap()
        .certificates()
        .keys()
        .cloned()
        .collect();
    assert_eq!(names, vec!["gamma"]);
}
