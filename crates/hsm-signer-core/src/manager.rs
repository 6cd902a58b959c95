//! Process-wide owner of the active signing provider.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{
    error::{SignerError, SignerResult},
    provider::SigningProvider,
};

type CreateFn = dyn Fn() -> SignerResult<Box<dyn SigningProvider>> + Send + Sync;
type CloneFn = dyn Fn(&dyn SigningProvider) -> SignerResult<Box<dyn SigningProvider>> + Send + Sync;

/// Builds providers for the manager: one callable for a brand-new instance and
/// one that derives a clean instance from an existing one.
pub struct ProviderFactory {
    create: Box<CreateFn>,
    clone: Box<CloneFn>,
}

impl ProviderFactory {
    pub fn new<C, K>(create: C, clone: K) -> Self
    where
        C: Fn() -> SignerResult<Box<dyn SigningProvider>> + Send + Sync + 'static,
        K: Fn(&dyn SigningProvider) -> SignerResult<Box<dyn SigningProvider>> + Send + Sync + 'static,
    {
        Self {
            create: Box::new(create),
            clone: Box::new(clone),
        }
    }

    /// Factory whose clone step is [`SigningProvider::recycled`].
    pub fn from_fn<C>(create: C) -> Self
    where
        C: Fn() -> SignerResult<Box<dyn SigningProvider>> + Send + Sync + 'static,
    {
        Self::new(create, |existing| Ok(existing.recycled()))
    }

    pub fn create(&self) -> SignerResult<Box<dyn SigningProvider>> {
        (self.create)()
    }

    pub fn clone_existing(&self, existing: &dyn SigningProvider) -> SignerResult<Box<dyn SigningProvider>> {
        (self.clone)(existing)
    }
}

/// Holds at most one provider. Callers serialize access; every mutating
/// operation takes `&mut self`.
#[derive(Default)]
pub struct ProviderManager {
    shared_dir: Option<PathBuf>,
    factory: Option<ProviderFactory>,
    provider: Option<Box<dyn SigningProvider>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.provider.is_some()
    }

    pub fn provider(&self) -> Option<&dyn SigningProvider> {
        self.provider.as_deref()
    }

    /// Installs a provider from `factory` and loads it.
    ///
    /// If certificates or `load` fail, the provider stays installed and the
    /// error is returned; a later [`recycle`](Self::recycle) retries.
    pub fn startup(&mut self, shared_dir: impl Into<PathBuf>, factory: ProviderFactory) -> SignerResult<()> {
        if self.provider.is_some() {
            return Err(SignerError::usage("provider manager already started"));
        }
        let shared_dir = shared_dir.into();
        let provider = factory.create()?;
        info!(
            application = %provider.application(),
            kind = ?provider.kind(),
            shared_dir = %shared_dir.display(),
            "starting signing provider"
        );
        self.shared_dir = Some(shared_dir);
        self.factory = Some(factory);
        let provider = self.provider.insert(provider);
        Self::prepare(provider.as_mut(), self.shared_dir.as_deref())
    }

    /// Replaces the active provider with a clean clone of itself.
    pub fn recycle(&mut self) -> SignerResult<()> {
        let (Some(current), Some(factory)) = (self.provider.as_deref(), self.factory.as_ref()) else {
            return Ok(());
        };
        let fresh = factory.clone_existing(current)?;
        if let Some(mut old) = self.provider.take() {
            old.unload();
        }
        info!(application = %fresh.application(), "recycling signing provider");
        let provider = self.provider.insert(fresh);
        Self::prepare(provider.as_mut(), self.shared_dir.as_deref())
    }

    pub fn shutdown(&mut self) {
        let Some(mut provider) = self.provider.take() else {
            return;
        };
        provider.unload();
        self.factory = None;
        self.shared_dir = None;
        info!(application = %provider.application(), "signing provider shut down");
    }

    pub fn sign(&mut self, key: &str, hash: &str) -> SignerResult<String> {
        let provider = self
            .provider
            .as_deref_mut()
            .ok_or_else(|| SignerError::usage("sign called before startup"))?;
        provider.sign(key, hash)
    }

    /// Signs every hash in order; the first failure fails the whole batch.
    pub fn sign_batch<S: AsRef<str>>(&mut self, key: &str, hashes: &[S]) -> SignerResult<Vec<String>> {
        hashes.iter().map(|hash| self.sign(key, hash.as_ref())).collect()
    }

    fn prepare(provider: &mut dyn SigningProvider, shared_dir: Option<&Path>) -> SignerResult<()> {
        if let Some(dir) = shared_dir {
            provider.load_shared_resources(dir)?;
        }
        provider.load().inspect_err(|err| {
            warn!(application = %provider.application(), error = %err, "provider failed to load");
        })
    }
}

impl Drop for ProviderManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
