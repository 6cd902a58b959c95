//! PKCS#11 signer backed by a SafeNet Luna HSM.
//!
//! The provider owns one library binding, at most one session and the
//! decrypted crypto-user PIN. Hashes are signed with plain `CKM_RSA_PKCS`
//! over a pre-built SHA-256 DigestInfo, which yields the same signature as
//! `CKM_SHA256_RSA_PKCS` over the decoded input.

use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    codec::{self, SigningPayload},
    cryptoki::{
        Cryptoki, CryptokiLoader, ObjectAttribute, ObjectHandle, SessionHandle,
        SlotId, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKM_RSA_PKCS, CKM_SHA256_RSA_PKCS,
        CKO_PRIVATE_KEY, CKU_CRYPTO_USER,
    },
    error::{SignerError, SignerResult},
    provider::{guarded_call, ProviderBase, ProviderKind, SigningProvider},
    secret::{PinBuffer, SecretTransform},
};

pub const DEFAULT_SLOT_ID: SlotId = 3;

/// Handles requested per `C_FindObjects` call.
pub const FIND_BATCH_SIZE: usize = 8;

const PRIVATE_KEY_TEMPLATE: [ObjectAttribute; 3] = [
    ObjectAttribute::Class(CKO_PRIVATE_KEY),
    ObjectAttribute::Token(true),
    ObjectAttribute::Private(true),
];

fn not_loaded() -> SignerError {
    SignerError::provider("cryptoki library not loaded")
}

pub struct HardwareProvider {
    base: ProviderBase,
    slot_id: SlotId,
    reuse_session: bool,
    pin: PinBuffer,
    loader: Arc<dyn CryptokiLoader>,
    library: Option<Box<dyn Cryptoki>>,
    session: Option<SessionHandle>,
    payload: SigningPayload,
}

impl HardwareProvider {
    /// The PIN is revealed here, once. An unrevealable PIN is kept as an
    /// invalid buffer and reported on the first `sign`.
    pub fn new(
        application: impl Into<String>,
        slot_id: SlotId,
        pin: &str,
        reuse_session: bool,
        transform: &dyn SecretTransform,
        loader: Arc<dyn CryptokiLoader>,
    ) -> Self {
        Self {
            base: ProviderBase::new(application),
            slot_id,
            reuse_session,
            pin: PinBuffer::reveal(pin, transform),
            loader,
            library: None,
            session: None,
            payload: SigningPayload::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.library.is_some()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Opens and authenticates a session, or keeps the current one when
    /// reuse is enabled.
    pub fn open_session(&mut self) -> SignerResult<()> {
        if self.reuse_session && self.session.is_some() {
            debug!(slot = self.slot_id, "reusing open session");
            return Ok(());
        }
        self.close_session();
        if !self.pin.is_valid() {
            return Err(SignerError::InvalidPin);
        }
        let library = self.library.as_deref_mut().ok_or_else(not_loaded)?;
        let session = library
            .open_session(self.slot_id, CKF_SERIAL_SESSION | CKF_RW_SESSION)
            .map_err(|rv| SignerError::native("C_OpenSession", rv))?;
        if let Err(rv) = library.login(session, CKU_CRYPTO_USER, self.pin.expose()) {
            if let Err(close_rv) = library.close_session(session) {
                warn!(session, rv = %format!("0x{close_rv:08x}"), "failed to close unauthenticated session");
            }
            return Err(SignerError::native("C_Login", rv));
        }
        debug!(slot = self.slot_id, session, "session opened");
        self.session = Some(session);
        Ok(())
    }

    /// Best effort; the handle is forgotten whatever the library reports.
    pub fn close_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Some(library) = self.library.as_deref_mut() else {
            return;
        };
        match library.close_session(session) {
            Ok(()) => debug!(session, "session closed"),
            Err(rv) => warn!(session, rv = %format!("0x{rv:08x}"), "failed to close session"),
        }
    }

    /// Looks up a private key by exact label in the open session.
    pub fn find_private_key(&mut self, label: &str) -> SignerResult<ObjectHandle> {
        let session = self
            .session
            .ok_or_else(|| SignerError::provider("no open session"))?;
        let library = self.library.as_deref_mut().ok_or_else(not_loaded)?;
        locate_key(library, session, label)
    }
}

fn locate_key(
    library: &mut dyn Cryptoki,
    session: SessionHandle,
    label: &str,
) -> SignerResult<ObjectHandle> {
    library
        .find_objects_init(session, &PRIVATE_KEY_TEMPLATE)
        .map_err(|rv| SignerError::native("C_FindObjectsInit", rv))?;
    let found = scan_for_label(library, session, label.as_bytes());
    let finalized = library.find_objects_final(session);
    match (found, finalized) {
        (Ok(Some(object)), Ok(())) => {
            debug!(label, object, "private key found");
            Ok(object)
        }
        (Ok(None), Ok(())) => Err(SignerError::KeyNotFound(label.to_string())),
        (Ok(_), Err(rv)) => Err(SignerError::native("C_FindObjectsFinal", rv)),
        (Err(err), finalized) => {
            if let Err(rv) = finalized {
                warn!(rv = %format!("0x{rv:08x}"), "failed to finalize object search");
            }
            Err(err)
        }
    }
}

fn scan_for_label(
    library: &mut dyn Cryptoki,
    session: SessionHandle,
    wanted: &[u8],
) -> SignerResult<Option<ObjectHandle>> {
    loop {
        let batch = library
            .find_objects(session, FIND_BATCH_SIZE)
            .map_err(|rv| SignerError::native("C_FindObjects", rv))?;
        if batch.is_empty() {
            return Ok(None);
        }
        for object in batch {
            match library.object_label(session, object) {
                Ok(label) if label == wanted => return Ok(Some(object)),
                Ok(_) => {}
                Err(rv) => {
                    debug!(object, rv = %format!("0x{rv:08x}"), "skipping object with unreadable label")
                }
            }
        }
    }
}

/// Resources a single signature holds while the guarded section runs.
struct SignCall<'p> {
    provider: &'p mut HardwareProvider,
    signature: Option<Vec<u8>>,
}

impl SignCall<'_> {
    fn run(&mut self, label: &str) -> SignerResult<String> {
        self.provider.open_session()?;
        let provider = &mut *self.provider;
        let session = provider
            .session
            .ok_or_else(|| SignerError::provider("no open session"))?;
        let library = provider.library.as_deref_mut().ok_or_else(not_loaded)?;

        library
            .mechanism_info(provider.slot_id, CKM_SHA256_RSA_PKCS)
            .map_err(|rv| SignerError::native("C_GetMechanismInfo", rv))?;
        let key = locate_key(library, session, label)?;
        library
            .sign_init(session, CKM_RSA_PKCS, key)
            .map_err(|rv| SignerError::native("C_SignInit", rv))?;

        let length = library
            .sign(session, provider.payload.as_bytes(), None)
            .map_err(|rv| SignerError::native("C_Sign", rv))?;
        let buffer = self.signature.insert(vec![0u8; length]);
        let written = library
            .sign(session, provider.payload.as_bytes(), Some(buffer.as_mut_slice()))
            .map_err(|rv| SignerError::native("C_Sign", rv))?;
        buffer.truncate(written);
        Ok(codec::encode(buffer))
    }

    fn release(&mut self) {
        self.signature = None;
        if !self.provider.reuse_session {
            self.provider.close_session();
        }
    }
}

impl SigningProvider for HardwareProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hardware
    }

    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ProviderBase {
        &mut self.base
    }

    fn load(&mut self) -> SignerResult<()> {
        if self.library.is_some() {
            debug!(application = %self.base.application(), "cryptoki library already loaded");
            return Ok(());
        }
        let library = self.loader.load()?;
        self.library = Some(library);
        info!(
            application = %self.base.application(),
            slot = self.slot_id,
            library = %self.loader.describe(),
            "hardware signer loaded"
        );
        Ok(())
    }

    fn sign(&mut self, key: &str, hash: &str) -> SignerResult<String> {
        if self.library.is_none() {
            return Err(not_loaded());
        }

        self.payload.reset();
        let mut decoded: Option<Zeroizing<Vec<u8>>> = None;
        let digest = guarded_call(
            &mut decoded,
            |decoded| {
                let bytes = decoded.insert(codec::decode(hash)?);
                Ok(codec::sha256(bytes))
            },
            |decoded| *decoded = None,
        )?;
        self.payload.set_digest(&digest);

        if !self.pin.is_valid() {
            return Err(SignerError::InvalidPin);
        }

        let mut call = SignCall {
            provider: self,
            signature: None,
        };
        let signature = guarded_call(&mut call, |call| call.run(key), |call| call.release())?;
        assert!(call.signature.is_none(), "signature buffer survived cleanup");
        debug!(key, "hardware signature produced");
        Ok(signature)
    }

    fn unload(&mut self) {
        self.close_session();
        if self.library.take().is_some() {
            info!(application = %self.base.application(), "cryptoki library unloaded");
        }
    }

    fn recycled(&self) -> Box<dyn SigningProvider> {
        Box::new(Self {
            base: self.base.recycled(),
            slot_id: self.slot_id,
            reuse_session: self.reuse_session,
            pin: self.pin.duplicate(),
            loader: Arc::clone(&self.loader),
            library: None,
            session: None,
            payload: SigningPayload::new(),
        })
    }
}

impl Drop for HardwareProvider {
    fn drop(&mut self) {
        self.unload();
    }
}
