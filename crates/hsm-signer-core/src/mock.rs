//! In-memory PKCS#11 token.
//!
//! [`MockToken`] owns the shared token state; [`MockToken::loader`] hands out
//! a [`CryptokiLoader`] whose libraries all talk to that state. The token
//! signs with real RSA keys, counts every call and can be told to fail any
//! named PKCS#11 function with a chosen return code.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_RV, CK_USER_TYPE, CKF_SERIAL_SESSION,
    CKF_SIGN, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKR_ATTRIBUTE_SENSITIVE, CKR_BUFFER_TOO_SMALL,
    CKR_FUNCTION_FAILED, CKR_KEY_HANDLE_INVALID, CKR_KEY_TYPE_INCONSISTENT, CKR_MECHANISM_INVALID,
    CKR_OBJECT_HANDLE_INVALID, CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED,
    CKR_PIN_INCORRECT, CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED,
    CKR_SLOT_ID_INVALID, CKR_USER_NOT_LOGGED_IN, CKR_USER_TYPE_INVALID,
};
use parking_lot::Mutex;
use rsa::{traits::PublicKeyParts, Pkcs1v15Sign, RsaPrivateKey};

use crate::{
    cryptoki::{
        Cryptoki, CryptokiLoader, MechanismInfo, NativeResult, ObjectAttribute, ObjectHandle,
        SessionHandle, SlotId, CKM_RSA_PKCS, CKM_SHA256_RSA_PKCS, CKU_CRYPTO_USER,
    },
    error::{SignerError, SignerResult},
};

/// Snapshot of the calls the token has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub initialize: usize,
    pub open_session: usize,
    pub login: usize,
    pub close_session: usize,
    pub find_init: usize,
    pub find_batches: usize,
    pub find_final: usize,
    pub sign: usize,
    /// Libraries handed out by the loader and not yet dropped.
    pub live_libraries: usize,
}

struct MockObject {
    class: CK_OBJECT_CLASS,
    label: Option<Vec<u8>>,
    key: Option<RsaPrivateKey>,
}

struct MockState {
    slot: SlotId,
    pin: Vec<u8>,
    mechanisms: BTreeSet<CK_MECHANISM_TYPE>,
    objects: BTreeMap<ObjectHandle, MockObject>,
    next_handle: ObjectHandle,
    sessions: BTreeSet<SessionHandle>,
    logged_in: BTreeSet<SessionHandle>,
    finds: BTreeMap<SessionHandle, VecDeque<ObjectHandle>>,
    signs: BTreeMap<SessionHandle, ObjectHandle>,
    failures: BTreeMap<&'static str, CK_RV>,
    load_failure: Option<String>,
    counters: MockCounters,
}

impl MockState {
    fn allocate_handle(&mut self) -> ObjectHandle {
        self.next_handle += 1;
        self.next_handle
    }

    fn check(&self, function: &'static str) -> NativeResult<()> {
        match self.failures.get(function) {
            Some(rv) => Err(*rv),
            None => Ok(()),
        }
    }

    fn session(&self, session: SessionHandle) -> NativeResult<()> {
        if self.sessions.contains(&session) {
            Ok(())
        } else {
            Err(CKR_SESSION_HANDLE_INVALID)
        }
    }
}

#[derive(Clone)]
pub struct MockToken {
    state: Arc<Mutex<MockState>>,
}

impl MockToken {
    /// Empty token on `slot` whose crypto user logs in with `pin`.
    pub fn new(slot: SlotId, pin: &str) -> Self {
        let state = MockState {
            slot,
            pin: pin.as_bytes().to_vec(),
            mechanisms: [CKM_RSA_PKCS, CKM_SHA256_RSA_PKCS].into_iter().collect(),
            objects: BTreeMap::new(),
            next_handle: 0,
            sessions: BTreeSet::new(),
            logged_in: BTreeSet::new(),
            finds: BTreeMap::new(),
            signs: BTreeMap::new(),
            failures: BTreeMap::new(),
            load_failure: None,
            counters: MockCounters::default(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_key(self, label: &str, key: RsaPrivateKey) -> Self {
        self.add_object(CKO_PRIVATE_KEY, Some(label.as_bytes()), Some(key));
        self
    }

    /// Private-key object without key material, to pad the search space.
    pub fn with_decoy(self, label: &str) -> Self {
        self.add_object(CKO_PRIVATE_KEY, Some(label.as_bytes()), None);
        self
    }

    /// Private-key object whose label cannot be read.
    pub fn with_sensitive_label(self) -> Self {
        self.add_object(CKO_PRIVATE_KEY, None, None);
        self
    }

    pub fn with_public_object(self, label: &str) -> Self {
        self.add_object(CKO_PUBLIC_KEY, Some(label.as_bytes()), None);
        self
    }

    fn add_object(&self, class: CK_OBJECT_CLASS, label: Option<&[u8]>, key: Option<RsaPrivateKey>) {
        let mut state = self.state.lock();
        let handle = state.allocate_handle();
        state.objects.insert(
            handle,
            MockObject {
                class,
                label: label.map(<[u8]>::to_vec),
                key,
            },
        );
    }

    /// Makes every later call to `function` return `rv`.
    pub fn fail(&self, function: &'static str, rv: CK_RV) {
        self.state.lock().failures.insert(function, rv);
    }

    pub fn fail_load(&self, reason: &str) {
        self.state.lock().load_failure = Some(reason.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.load_failure = None;
    }

    pub fn remove_mechanism(&self, mechanism: CK_MECHANISM_TYPE) {
        self.state.lock().mechanisms.remove(&mechanism);
    }

    /// Drops every open session, as a device reset would.
    pub fn invalidate_sessions(&self) {
        let mut state = self.state.lock();
        state.sessions.clear();
        state.logged_in.clear();
        state.finds.clear();
        state.signs.clear();
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn counters(&self) -> MockCounters {
        self.state.lock().counters
    }

    pub fn loader(&self) -> Arc<MockLoader> {
        Arc::new(MockLoader {
            token: self.clone(),
        })
    }
}

pub struct MockLoader {
    token: MockToken,
}

impl CryptokiLoader for MockLoader {
    fn load(&self) -> SignerResult<Box<dyn Cryptoki>> {
        let mut state = self.token.state.lock();
        if let Some(reason) = &state.load_failure {
            return Err(SignerError::Library {
                path: self.describe(),
                reason: reason.clone(),
            });
        }
        state
            .check("C_Initialize")
            .map_err(|rv| SignerError::native("C_Initialize", rv))?;
        state.counters.initialize += 1;
        state.counters.live_libraries += 1;
        Ok(Box::new(MockCryptoki {
            token: self.token.clone(),
        }))
    }

    fn describe(&self) -> String {
        "mock-token".to_string()
    }
}

struct MockCryptoki {
    token: MockToken,
}

impl Drop for MockCryptoki {
    fn drop(&mut self) {
        let mut state = self.token.state.lock();
        state.counters.live_libraries = state.counters.live_libraries.saturating_sub(1);
    }
}

impl Cryptoki for MockCryptoki {
    fn open_session(&mut self, slot: SlotId, flags: CK_FLAGS) -> NativeResult<SessionHandle> {
        let mut state = self.token.state.lock();
        state.counters.open_session += 1;
        state.check("C_OpenSession")?;
        if slot != state.slot {
            return Err(CKR_SLOT_ID_INVALID);
        }
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(CKR_SESSION_PARALLEL_NOT_SUPPORTED);
        }
        let session = state.allocate_handle();
        state.sessions.insert(session);
        Ok(session)
    }

    fn login(&mut self, session: SessionHandle, user: CK_USER_TYPE, pin: &[u8]) -> NativeResult<()> {
        let mut state = self.token.state.lock();
        state.counters.login += 1;
        state.check("C_Login")?;
        state.session(session)?;
        if user != CKU_CRYPTO_USER {
            return Err(CKR_USER_TYPE_INVALID);
        }
        if pin != state.pin.as_slice() {
            return Err(CKR_PIN_INCORRECT);
        }
        state.logged_in.insert(session);
        Ok(())
    }

    fn close_session(&mut self, session: SessionHandle) -> NativeResult<()> {
        let mut state = self.token.state.lock();
        state.counters.close_session += 1;
        state.check("C_CloseSession")?;
        state.logged_in.remove(&session);
        state.finds.remove(&session);
        state.signs.remove(&session);
        if state.sessions.remove(&session) {
            Ok(())
        } else {
            Err(CKR_SESSION_HANDLE_INVALID)
        }
    }

    fn mechanism_info(
        &self,
        slot: SlotId,
        mechanism: CK_MECHANISM_TYPE,
    ) -> NativeResult<MechanismInfo> {
        let state = self.token.state.lock();
        state.check("C_GetMechanismInfo")?;
        if slot != state.slot {
            return Err(CKR_SLOT_ID_INVALID);
        }
        if !state.mechanisms.contains(&mechanism) {
            return Err(CKR_MECHANISM_INVALID);
        }
        Ok(MechanismInfo {
            min_key_size: 1024,
            max_key_size: 4096,
            flags: CKF_SIGN,
        })
    }

    fn find_objects_init(
        &mut self,
        session: SessionHandle,
        template: &[ObjectAttribute],
    ) -> NativeResult<()> {
        let mut state = self.token.state.lock();
        state.counters.find_init += 1;
        state.check("C_FindObjectsInit")?;
        state.session(session)?;
        if !state.logged_in.contains(&session) {
            return Err(CKR_USER_NOT_LOGGED_IN);
        }
        if state.finds.contains_key(&session) {
            return Err(CKR_OPERATION_ACTIVE);
        }
        let class = template.iter().find_map(|attribute| match attribute {
            ObjectAttribute::Class(class) => Some(*class),
            _ => None,
        });
        let matches = state
            .objects
            .iter()
            .filter(|(_, object)| class.map_or(true, |class| object.class == class))
            .map(|(handle, _)| *handle)
            .collect();
        state.finds.insert(session, matches);
        Ok(())
    }

    fn find_objects(&mut self, session: SessionHandle, max: usize) -> NativeResult<Vec<ObjectHandle>> {
        let mut state = self.token.state.lock();
        state.counters.find_batches += 1;
        state.check("C_FindObjects")?;
        state.session(session)?;
        let pending = state
            .finds
            .get_mut(&session)
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)?;
        let take = max.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    fn find_objects_final(&mut self, session: SessionHandle) -> NativeResult<()> {
        let mut state = self.token.state.lock();
        state.counters.find_final += 1;
        state.check("C_FindObjectsFinal")?;
        state.session(session)?;
        state
            .finds
            .remove(&session)
            .map(|_| ())
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)
    }

    fn object_label(&self, session: SessionHandle, object: ObjectHandle) -> NativeResult<Vec<u8>> {
        let state = self.token.state.lock();
        state.check("C_GetAttributeValue")?;
        state.session(session)?;
        let object = state.objects.get(&object).ok_or(CKR_OBJECT_HANDLE_INVALID)?;
        object.label.clone().ok_or(CKR_ATTRIBUTE_SENSITIVE)
    }

    fn sign_init(
        &mut self,
        session: SessionHandle,
        mechanism: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> NativeResult<()> {
        let mut state = self.token.state.lock();
        state.check("C_SignInit")?;
        state.session(session)?;
        if mechanism != CKM_RSA_PKCS {
            return Err(CKR_MECHANISM_INVALID);
        }
        let object = state.objects.get(&key).ok_or(CKR_KEY_HANDLE_INVALID)?;
        if object.key.is_none() {
            return Err(CKR_KEY_TYPE_INCONSISTENT);
        }
        if state.signs.contains_key(&session) {
            return Err(CKR_OPERATION_ACTIVE);
        }
        state.signs.insert(session, key);
        Ok(())
    }

    /// Any result other than a successful length query or
    /// `CKR_BUFFER_TOO_SMALL` ends the active operation.
    fn sign(
        &mut self,
        session: SessionHandle,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> NativeResult<usize> {
        let mut state = self.token.state.lock();
        state.session(session)?;
        let handle = *state
            .signs
            .get(&session)
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)?;
        let key = state
            .objects
            .get(&handle)
            .and_then(|object| object.key.as_ref());
        let outcome = match (state.check("C_Sign"), key) {
            (Err(rv), _) => Err(rv),
            (Ok(()), None) => Err(CKR_KEY_HANDLE_INVALID),
            (Ok(()), Some(key)) => {
                let length = key.size();
                let Some(output) = signature else {
                    return Ok(length);
                };
                if output.len() < length {
                    return Err(CKR_BUFFER_TOO_SMALL);
                }
                key.sign(Pkcs1v15Sign::new_unprefixed(), data)
                    .map(|produced| {
                        output[..produced.len()].copy_from_slice(&produced);
                        produced.len()
                    })
                    .map_err(|_| CKR_FUNCTION_FAILED)
            }
        };
        state.signs.remove(&session);
        if outcome.is_ok() {
            state.counters.sign += 1;
        }
        outcome
    }
}
