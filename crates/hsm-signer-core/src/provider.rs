//! The signing-provider contract shared by the software and PKCS#11 signers.

use std::{
    collections::BTreeMap,
    fs,
    panic::{self, AssertUnwindSafe},
    path::Path,
};

use tracing::{debug, warn};

use crate::error::{SignerError, SignerResult};

/// Certificate name (file stem) to PEM text.
pub type Certificates = BTreeMap<String, String>;

const CERTIFICATE_EXTENSION: &str = "crt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Fake,
    Hardware,
}

/// Identity and shared resources every provider carries.
#[derive(Debug, Clone)]
pub struct ProviderBase {
    application: String,
    certificates: Certificates,
}

impl ProviderBase {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            certificates: Certificates::new(),
        }
    }

    /// Copy restricted to identity; certificates are reloaded by the caller.
    pub fn recycled(&self) -> Self {
        Self::new(self.application.clone())
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn certificates(&self) -> &Certificates {
        &self.certificates
    }

    /// Replaces the certificate map with the `*.crt` files found directly in
    /// `directory`.
    pub fn load_certificates(&mut self, directory: &Path) -> SignerResult<()> {
        self.certificates.clear();
        let entries = fs::read_dir(directory).map_err(|e| {
            SignerError::config(format!(
                "unable to read shared resources directory {}: {e}",
                directory.display()
            ))
        })?;
        let mut loaded = Certificates::new();
        for entry in entries {
            let path = entry.map_err(SignerError::config)?.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(CERTIFICATE_EXTENSION)
            {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                warn!(path = %path.display(), "skipping certificate with non UTF-8 name");
                continue;
            };
            let pem = fs::read_to_string(&path).map_err(|e| {
                SignerError::config(format!("unable to read {}: {e}", path.display()))
            })?;
            loaded.insert(name.to_string(), pem);
        }
        debug!(
            application = %self.application,
            directory = %directory.display(),
            count = loaded.len(),
            "loaded shared certificates"
        );
        self.certificates = loaded;
        Ok(())
    }
}

/// Capability contract implemented by every signer.
///
/// `load` must be idempotent, `unload` must never fail and may be called any
/// number of times. `sign` takes a key label and a base64 hash input and
/// returns a base64 signature.
pub trait SigningProvider: Send {
    fn kind(&self) -> ProviderKind;

    fn base(&self) -> &ProviderBase;

    fn base_mut(&mut self) -> &mut ProviderBase;

    fn load(&mut self) -> SignerResult<()>;

    fn sign(&mut self, key: &str, hash: &str) -> SignerResult<String>;

    fn unload(&mut self);

    /// Fresh instance with the same identity and secrets but no runtime state.
    fn recycled(&self) -> Box<dyn SigningProvider>;

    fn application(&self) -> &str {
        self.base().application()
    }

    fn certificates(&self) -> &Certificates {
        self.base().certificates()
    }

    fn load_shared_resources(&mut self, directory: &Path) -> SignerResult<()> {
        self.base_mut().load_certificates(directory)
    }
}

/// Runs `run`, then `cleanup` exactly once whatever the outcome, and only then
/// hands back the result of `run`. A panic inside `run` is reported as a
/// provider error after cleanup.
pub fn guarded_call<S, T, R, C>(state: &mut S, run: R, cleanup: C) -> SignerResult<T>
where
    R: FnOnce(&mut S) -> SignerResult<T>,
    C: FnOnce(&mut S),
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(&mut *state)));
    cleanup(state);
    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown failure".to_string());
            Err(SignerError::provider(format!("unexpected failure: {reason}")))
        }
    }
}
