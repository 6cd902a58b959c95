//! HSM signer core library: the signing-provider contract, a software signer,
//! a PKCS#11 signer for SafeNet Luna devices and the lifecycle manager that
//! owns the active provider. Hosts (the CLI, web front ends) interact
//! exclusively with [`ProviderManager`] and [`SignerConfig`].

pub mod codec;
pub mod config;
pub mod cryptoki;
pub mod error;
pub mod fake;
pub mod hardware;
pub mod manager;
pub mod mock;
pub mod provider;
pub mod secret;

#[cfg(test)]
mod testing;

pub use config::{ProviderConfig, SignerConfig, SECRET_KEY_ENV};
pub use cryptoki::{Cryptoki, CryptokiLoader, LibraryLoader, CKU_CRYPTO_USER, DEFAULT_LIBRARY_PATH};
pub use error::{ErrorKind, SignerError, SignerResult};
pub use fake::FakeProvider;
pub use hardware::{HardwareProvider, DEFAULT_SLOT_ID, FIND_BATCH_SIZE};
pub use manager::{ProviderFactory, ProviderManager};
pub use provider::{guarded_call, Certificates, ProviderBase, ProviderKind, SigningProvider};
pub use secret::{PinBuffer, PlainSecrets, SealedSecrets, SecretTransform, MAX_PIN_SIZE};
