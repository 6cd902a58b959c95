//! Host configuration and the provider factory built from it.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    cryptoki::{CryptokiLoader, LibraryLoader, SlotId},
    error::{SignerError, SignerResult},
    fake::FakeProvider,
    hardware::{HardwareProvider, DEFAULT_SLOT_ID},
    manager::ProviderFactory,
    provider::SigningProvider,
    secret::{PlainSecrets, SealedSecrets, SecretTransform},
};

/// Environment variable holding the base64 AES-256 key for sealed secrets.
pub const SECRET_KEY_ENV: &str = "HSM_SIGNER_SECRET_KEY";

#[derive(Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Owning application name, reported in logs.
    pub application: String,
    /// Directory scanned for `*.crt` certificates.
    pub shared_dir: PathBuf,
    /// Base64 AES-256 key. Without it, configured secrets are used as is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// When false (the default), the provider is recycled before every
    /// request.
    #[serde(default)]
    pub singleton: bool,
    pub provider: ProviderConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Fake {
        /// JSON key map: `{ "<label>": { "key": ..., "pwd": ... } }`.
        config: String,
    },
    Hardware {
        #[serde(default = "default_slot_id")]
        slot_id: SlotId,
        pin: String,
        #[serde(default = "default_true")]
        reuse_session: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        library_path: Option<PathBuf>,
    },
}

fn default_true() -> bool {
    true
}

fn default_slot_id() -> SlotId {
    DEFAULT_SLOT_ID
}

impl SignerConfig {
    pub fn from_toml_str(content: &str) -> SignerResult<Self> {
        toml::from_str(content).map_err(|e| SignerError::config(format!("invalid configuration: {e}")))
    }

    pub fn load(path: &Path) -> SignerResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SignerError::config(format!("unable to read configuration {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn transform(&self) -> SignerResult<Arc<dyn SecretTransform>> {
        let transform: Arc<dyn SecretTransform> = match &self.secret_key {
            Some(key) => Arc::new(SealedSecrets::from_base64(key)?),
            None => Arc::new(PlainSecrets),
        };
        Ok(transform)
    }

    /// Loader for the configured vendor library, or the platform default.
    pub fn loader(&self) -> Arc<dyn CryptokiLoader> {
        match &self.provider {
            ProviderConfig::Hardware {
                library_path: Some(path),
                ..
            } => Arc::new(LibraryLoader::new(path)),
            _ => Arc::new(LibraryLoader::default()),
        }
    }

    pub fn factory(&self) -> SignerResult<ProviderFactory> {
        self.factory_with_loader(self.loader())
    }

    /// Same as [`factory`](Self::factory) with an explicit cryptoki loader
    /// for hardware providers.
    pub fn factory_with_loader(&self, loader: Arc<dyn CryptokiLoader>) -> SignerResult<ProviderFactory> {
        let transform = self.transform()?;
        let application = self.application.clone();
        let factory = match &self.provider {
            ProviderConfig::Fake { config } => {
                let config = Zeroizing::new(config.clone());
                ProviderFactory::from_fn(move || {
                    Ok(Box::new(FakeProvider::new(
                        application.clone(),
                        config.as_str(),
                        Arc::clone(&transform),
                    )) as Box<dyn SigningProvider>)
                })
            }
            ProviderConfig::Hardware {
                slot_id,
                pin,
                reuse_session,
                ..
            } => {
                let (slot_id, reuse_session) = (*slot_id, *reuse_session);
                let pin = Zeroizing::new(pin.clone());
                ProviderFactory::from_fn(move || {
                    Ok(Box::new(HardwareProvider::new(
                        application.clone(),
                        slot_id,
                        &pin,
                        reuse_session,
                        transform.as_ref(),
                        Arc::clone(&loader),
                    )) as Box<dyn SigningProvider>)
                })
            }
        };
        Ok(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, provider::ProviderKind};

    #[test]
    fn hardware_defaults() {
        let config = SignerConfig::from_toml_str(
            r#"
            application = "broker"
            shared_dir = "/etc/hsm-signer/certs"

            [provider]
            kind = "hardware"
            pin = "1234"
            "#,
        )
        .unwrap();
        assert!(!config.singleton);
        assert!(config.secret_key.is_none());
        match &config.provider {
            ProviderConfig::Hardware {
                slot_id,
                reuse_session,
                library_path,
                ..
            } => {
                assert_eq!(*slot_id, 3);
                assert!(*reuse_session);
                assert!(library_path.is_none());
            }
            ProviderConfig::Fake { .. } => panic!("expected hardware provider"),
        }
    }

    #[test]
    fn fake_factory_builds_fake_provider() {
        let config = SignerConfig::from_toml_str(
            r#"
            application = "broker"
            shared_dir = "certs"
            singleton = true

            [provider]
            kind = "fake"
            config = '{}'
            "#,
        )
        .unwrap();
        assert!(config.singleton);
        let factory = config.factory().unwrap();
        let provider = factory.create().unwrap();
        assert_eq!(provider.kind(), ProviderKind::Fake);
        assert_eq!(provider.application(), "broker");
        assert_eq!(factory.clone_existing(provider.as_ref()).unwrap().kind(), ProviderKind::Fake);
    }

    #[test]
    fn library_path_override() {
        let config = SignerConfig::from_toml_str(
            r#"
            application = "broker"
            shared_dir = "certs"

            [provider]
            kind = "hardware"
            slot_id = 7
            pin = "1234"
            reuse_session = false
            library_path = "/opt/luna/libCryptoki2.so"
            "#,
        )
        .unwrap();
        assert_eq!(config.loader().describe(), "/opt/luna/libCryptoki2.so");
        let provider = config.factory().unwrap().create().unwrap();
        assert_eq!(provider.kind(), ProviderKind::Hardware);
    }

    #[test]
    fn bad_secret_key_and_unknown_kind_are_configuration_errors() {
        let err = SignerConfig::from_toml_str(
            r#"
            application = "broker"
            shared_dir = "certs"
            [provider]
            kind = "cloud"
            "#,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let config = SignerConfig::from_toml_str(
            r#"
            application = "broker"
            shared_dir = "certs"
            secret_key = "c2hvcnQ="
            [provider]
            kind = "fake"
            config = '{}'
            "#,
        )
        .unwrap();
        assert_eq!(config.factory().err().unwrap().kind(), ErrorKind::Configuration);
    }
}
