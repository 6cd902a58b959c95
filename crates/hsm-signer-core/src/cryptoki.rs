//! Safe seam over the PKCS#11 function table.
//!
//! [`Cryptoki`] exposes exactly the calls the hardware signer needs, each
//! returning the native `CK_RV` on failure. [`LibraryLoader`] binds it to a
//! vendor shared library through `C_GetFunctionList`; tests bind it to the
//! in-memory token in [`crate::mock`].

use std::{
    path::{Path, PathBuf},
    ptr,
};

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_BYTE_PTR, CK_FLAGS, CK_FUNCTION_LIST,
    CK_FUNCTION_LIST_PTR_PTR, CK_MECHANISM, CK_MECHANISM_INFO, CK_MECHANISM_TYPE,
    CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG,
    CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE, CK_VOID_PTR, CKA_CLASS, CKA_LABEL, CKA_PRIVATE,
    CKA_TOKEN, CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_FUNCTION_NOT_SUPPORTED, CKR_OK,
    CK_FALSE, CK_TRUE,
};
use libloading::Library;
use tracing::{debug, info};

use crate::error::{SignerError, SignerResult};

pub use cryptoki_sys::{
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKM_RSA_PKCS, CKM_SHA256_RSA_PKCS, CKO_PRIVATE_KEY,
};

pub type SlotId = CK_SLOT_ID;
pub type SessionHandle = CK_SESSION_HANDLE;
pub type ObjectHandle = CK_OBJECT_HANDLE;
pub type NativeResult<T> = Result<T, CK_RV>;

/// SafeNet vendor user type for the crypto user role (`CKU_VENDOR_DEFINED | 1`).
pub const CKU_CRYPTO_USER: CK_USER_TYPE = 0x8000_0001;

#[cfg(target_os = "macos")]
pub const DEFAULT_LIBRARY_PATH: &str = "/usr/local/safenet/lunaclient/lib/libCryptoki2_64.so";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_LIBRARY_PATH: &str = "/usr/safenet/lunaclient/lib/libCryptoki2_64.so";

/// Search template entries understood by [`Cryptoki::find_objects_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAttribute {
    Class(CK_OBJECT_CLASS),
    Token(bool),
    Private(bool),
}

impl ObjectAttribute {
    fn attribute_type(&self) -> CK_ATTRIBUTE_TYPE {
        match self {
            ObjectAttribute::Class(_) => CKA_CLASS,
            ObjectAttribute::Token(_) => CKA_TOKEN,
            ObjectAttribute::Private(_) => CKA_PRIVATE,
        }
    }

    fn value_bytes(&self) -> Vec<u8> {
        let flag = |value: bool| -> CK_BBOOL { if value { CK_TRUE } else { CK_FALSE } };
        match self {
            ObjectAttribute::Class(class) => class.to_ne_bytes().to_vec(),
            ObjectAttribute::Token(value) | ObjectAttribute::Private(value) => vec![flag(*value)],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: CK_ULONG,
    pub max_key_size: CK_ULONG,
    pub flags: CK_FLAGS,
}

/// The subset of the PKCS#11 function table used for signing.
pub trait Cryptoki: Send {
    fn open_session(&mut self, slot: SlotId, flags: CK_FLAGS) -> NativeResult<SessionHandle>;

    fn login(&mut self, session: SessionHandle, user: CK_USER_TYPE, pin: &[u8]) -> NativeResult<()>;

    fn close_session(&mut self, session: SessionHandle) -> NativeResult<()>;

    fn mechanism_info(&self, slot: SlotId, mechanism: CK_MECHANISM_TYPE)
        -> NativeResult<MechanismInfo>;

    fn find_objects_init(
        &mut self,
        session: SessionHandle,
        template: &[ObjectAttribute],
    ) -> NativeResult<()>;

    /// Returns at most `max` handles; an empty batch ends the search.
    fn find_objects(&mut self, session: SessionHandle, max: usize) -> NativeResult<Vec<ObjectHandle>>;

    fn find_objects_final(&mut self, session: SessionHandle) -> NativeResult<()>;

    fn object_label(&self, session: SessionHandle, object: ObjectHandle) -> NativeResult<Vec<u8>>;

    fn sign_init(
        &mut self,
        session: SessionHandle,
        mechanism: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> NativeResult<()>;

    /// With `signature == None` only the required length is reported.
    /// Otherwise the signature is written and its length returned.
    fn sign(
        &mut self,
        session: SessionHandle,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> NativeResult<usize>;
}

/// Produces a bound, initialized [`Cryptoki`] for [`crate::hardware::HardwareProvider::load`].
pub trait CryptokiLoader: Send + Sync {
    fn load(&self) -> SignerResult<Box<dyn Cryptoki>>;

    fn describe(&self) -> String;
}

/// Loads the vendor library from disk.
#[derive(Debug, Clone)]
pub struct LibraryLoader {
    path: PathBuf,
}

impl LibraryLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new(DEFAULT_LIBRARY_PATH)
    }
}

type GetFunctionList = unsafe extern "C" fn(CK_FUNCTION_LIST_PTR_PTR) -> CK_RV;

impl CryptokiLoader for LibraryLoader {
    fn load(&self) -> SignerResult<Box<dyn Cryptoki>> {
        let path = self.path.display().to_string();
        // SAFETY: loading a PKCS#11 module runs its initializers; the path is
        // operator-configured and trusted.
        let library = unsafe { Library::new(&self.path) }.map_err(|e| SignerError::Library {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut functions: *mut CK_FUNCTION_LIST = ptr::null_mut();
        // SAFETY: the symbol type matches the PKCS#11 declaration of C_GetFunctionList.
        let rv = unsafe {
            let get_function_list = library
                .get::<GetFunctionList>(b"C_GetFunctionList\0")
                .map_err(|e| {
                    SignerError::provider(format!(
                        "unable to obtain functions list handle from '{path}': {e}"
                    ))
                })?;
            get_function_list(&mut functions)
        };
        if rv != CKR_OK {
            return Err(SignerError::native("C_GetFunctionList", rv));
        }
        if functions.is_null() {
            return Err(SignerError::provider("C_GetFunctionList returned no table"));
        }

        let native = NativeCryptoki {
            functions,
            _library: library,
        };
        // SAFETY: `functions` was just returned by the library and outlives `native`.
        let initialize = unsafe { (*native.functions).C_Initialize }
            .ok_or_else(|| SignerError::native("C_Initialize", CKR_FUNCTION_NOT_SUPPORTED))?;
        // SAFETY: a null argument requests default (single-threaded) initialization.
        match unsafe { initialize(ptr::null_mut()) } {
            CKR_OK => {}
            CKR_CRYPTOKI_ALREADY_INITIALIZED => {
                debug!(library = %path, "cryptoki already initialized in this process");
            }
            rv => return Err(SignerError::native("C_Initialize", rv)),
        }
        info!(library = %path, "cryptoki library loaded");
        Ok(Box::new(native))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Function table bound to a loaded library. Dropping it unloads the library.
pub struct NativeCryptoki {
    functions: *const CK_FUNCTION_LIST,
    _library: Library,
}

// SAFETY: the table is only used through `&mut self` or `&self` by one owner at
// a time, and PKCS#11 modules may be called from any thread.
unsafe impl Send for NativeCryptoki {}

/// Resolves `$name` from the table and calls it, mapping the return code.
macro_rules! ck_call {
    ($self:ident, $name:ident ( $($arg:expr),* $(,)? )) => {{
        // SAFETY: `functions` stays valid for as long as `_library` is loaded.
        let function = unsafe { (*$self.functions).$name }.ok_or(CKR_FUNCTION_NOT_SUPPORTED)?;
        // SAFETY: arguments follow the PKCS#11 contract of the called function.
        match unsafe { function($($arg),*) } {
            CKR_OK => Ok(()),
            rv => Err(rv),
        }
    }};
}

impl Cryptoki for NativeCryptoki {
    fn open_session(&mut self, slot: SlotId, flags: CK_FLAGS) -> NativeResult<SessionHandle> {
        let mut session: CK_SESSION_HANDLE = 0;
        ck_call!(self, C_OpenSession(slot, flags, ptr::null_mut(), None, &mut session))?;
        Ok(session)
    }

    fn login(&mut self, session: SessionHandle, user: CK_USER_TYPE, pin: &[u8]) -> NativeResult<()> {
        ck_call!(
            self,
            C_Login(session, user, pin.as_ptr() as CK_BYTE_PTR, pin.len() as CK_ULONG)
        )
    }

    fn close_session(&mut self, session: SessionHandle) -> NativeResult<()> {
        ck_call!(self, C_CloseSession(session))
    }

    fn mechanism_info(
        &self,
        slot: SlotId,
        mechanism: CK_MECHANISM_TYPE,
    ) -> NativeResult<MechanismInfo> {
        let mut info = CK_MECHANISM_INFO {
            ulMinKeySize: 0,
            ulMaxKeySize: 0,
            flags: 0,
        };
        ck_call!(self, C_GetMechanismInfo(slot, mechanism, &mut info))?;
        Ok(MechanismInfo {
            min_key_size: info.ulMinKeySize,
            max_key_size: info.ulMaxKeySize,
            flags: info.flags,
        })
    }

    fn find_objects_init(
        &mut self,
        session: SessionHandle,
        template: &[ObjectAttribute],
    ) -> NativeResult<()> {
        let mut values: Vec<Vec<u8>> = template.iter().map(ObjectAttribute::value_bytes).collect();
        let mut attributes: Vec<CK_ATTRIBUTE> = template
            .iter()
            .zip(values.iter_mut())
            .map(|(attribute, value)| CK_ATTRIBUTE {
                type_: attribute.attribute_type(),
                pValue: value.as_mut_ptr() as CK_VOID_PTR,
                ulValueLen: value.len() as CK_ULONG,
            })
            .collect();
        ck_call!(
            self,
            C_FindObjectsInit(session, attributes.as_mut_ptr(), attributes.len() as CK_ULONG)
        )
    }

    fn find_objects(&mut self, session: SessionHandle, max: usize) -> NativeResult<Vec<ObjectHandle>> {
        let mut handles: Vec<CK_OBJECT_HANDLE> = vec![0; max];
        let mut count: CK_ULONG = 0;
        ck_call!(
            self,
            C_FindObjects(session, handles.as_mut_ptr(), max as CK_ULONG, &mut count)
        )?;
        handles.truncate((count as usize).min(max));
        Ok(handles)
    }

    fn find_objects_final(&mut self, session: SessionHandle) -> NativeResult<()> {
        ck_call!(self, C_FindObjectsFinal(session))
    }

    fn object_label(&self, session: SessionHandle, object: ObjectHandle) -> NativeResult<Vec<u8>> {
        let mut attribute = CK_ATTRIBUTE {
            type_: CKA_LABEL,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        };
        ck_call!(self, C_GetAttributeValue(session, object, &mut attribute, 1))?;
        if attribute.ulValueLen == CK_UNAVAILABLE_INFORMATION {
            return Err(cryptoki_sys::CKR_ATTRIBUTE_TYPE_INVALID);
        }
        let mut label = vec![0u8; attribute.ulValueLen as usize];
        attribute.pValue = label.as_mut_ptr() as CK_VOID_PTR;
        ck_call!(self, C_GetAttributeValue(session, object, &mut attribute, 1))?;
        label.truncate(attribute.ulValueLen as usize);
        Ok(label)
    }

    fn sign_init(
        &mut self,
        session: SessionHandle,
        mechanism: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> NativeResult<()> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        ck_call!(self, C_SignInit(session, &mut mechanism, key))
    }

    fn sign(
        &mut self,
        session: SessionHandle,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> NativeResult<usize> {
        let (output, mut length) = match signature {
            Some(buffer) => (buffer.as_mut_ptr(), buffer.len() as CK_ULONG),
            None => (ptr::null_mut(), 0),
        };
        ck_call!(
            self,
            C_Sign(
                session,
                data.as_ptr() as CK_BYTE_PTR,
                data.len() as CK_ULONG,
                output,
                &mut length,
            )
        )?;
        Ok(length as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_provider_error() {
        let loader = LibraryLoader::new("/nonexistent/libCryptoki2_64.so");
        let err = match loader.load() {
            Ok(_) => panic!("library should not load"),
            Err(err) => err,
        };
        assert!(matches!(err, SignerError::Library { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Provider);
        assert!(err.to_string().contains("/nonexistent/libCryptoki2_64.so"));
    }

    #[test]
    fn template_values_are_native_encoded() {
        let class = ObjectAttribute::Class(CKO_PRIVATE_KEY);
        assert_eq!(class.attribute_type(), CKA_CLASS);
        assert_eq!(class.value_bytes(), CKO_PRIVATE_KEY.to_ne_bytes().to_vec());
        assert_eq!(ObjectAttribute::Token(true).value_bytes(), vec![CK_TRUE]);
        assert_eq!(ObjectAttribute::Private(false).value_bytes(), vec![CK_FALSE]);
    }

    #[test]
    fn default_path_targets_luna_client() {
        assert!(LibraryLoader::default()
            .path()
            .ends_with("lunaclient/lib/libCryptoki2_64.so"));
    }
}
