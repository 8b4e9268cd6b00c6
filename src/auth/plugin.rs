//! External auth plugin loading
//!
//! Speaks the mosquitto auth-plugin version 2 C ABI: a shared object
//! exporting `mosquitto_auth_plugin_version` plus the init/cleanup,
//! security-init/cleanup, ACL-check, password-check and PSK entry points.
//! The plugin fills an opaque `user_data` pointer on init which is passed
//! back on every later call, together with a `{key, value}` option array
//! derived from the broker configuration.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::sync::atomic::{AtomicPtr, Ordering};

use libloading::{Library, Symbol};
use tracing::info;

use super::{AclAccess, AuthError, AuthResult};

/// The only plugin ABI version this broker accepts.
pub const SUPPORTED_PLUGIN_VERSION: c_int = 2;

/// One configuration option handed to the plugin, mosquitto layout.
#[repr(C)]
struct AuthOpt {
    key: *mut c_char,
    value: *mut c_char,
}

type PluginVersionFn = unsafe extern "C" fn() -> c_int;
type PluginInitFn = unsafe extern "C" fn(*mut *mut c_void, *mut AuthOpt, c_int) -> c_int;
type PluginCleanupFn = unsafe extern "C" fn(*mut c_void, *mut AuthOpt, c_int) -> c_int;
type SecurityInitFn = unsafe extern "C" fn(*mut c_void, *mut AuthOpt, c_int, bool) -> c_int;
type SecurityCleanupFn = unsafe extern "C" fn(*mut c_void, *mut AuthOpt, c_int, bool) -> c_int;
type AclCheckFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *const c_char, c_int) -> c_int;
type UnpwdCheckFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int;
type PskKeyGetFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *mut c_char, c_int) -> c_int;

/// A loaded version-2 auth plugin.
///
/// The raw function pointers stay valid for as long as `_lib` is alive, which
/// is the lifetime of this struct.
#[derive(Debug)]
pub struct AuthPlugin {
    user_data: AtomicPtr<c_void>,
    init_fn: PluginInitFn,
    cleanup_fn: PluginCleanupFn,
    security_init_fn: SecurityInitFn,
    security_cleanup_fn: SecurityCleanupFn,
    acl_check_fn: AclCheckFn,
    unpwd_check_fn: UnpwdCheckFn,
    psk_key_get_fn: PskKeyGetFn,
    /// Owned storage for the option array handed to the plugin
    opts: Vec<(CString, CString)>,
    _lib: Library,
}

impl AuthPlugin {
    /// dlopen the shared object and resolve the full version-2 symbol table.
    /// Any failure here is fatal: a partially resolved plugin must never run.
    pub fn load(path: &Path, opts: &[(String, String)]) -> Result<Self, AuthError> {
        info!(path = %path.display(), "loading auth plugin");

        let lib = unsafe { Library::new(path) }.map_err(|e| {
            AuthError::Fatal(format!(
                "error loading auth plugin {}: {}",
                path.display(),
                e
            ))
        })?;

        let converted_opts = opts
            .iter()
            .map(|(key, value)| {
                let key = CString::new(key.as_str())
                    .map_err(|_| AuthError::Fatal("auth plugin option key contains NUL".into()))?;
                let value = CString::new(value.as_str()).map_err(|_| {
                    AuthError::Fatal("auth plugin option value contains NUL".into())
                })?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, AuthError>>()?;

        unsafe {
            let version = *symbol::<PluginVersionFn>(&lib, "mosquitto_auth_plugin_version")?;
            let reported = version();
            if reported != SUPPORTED_PLUGIN_VERSION {
                return Err(AuthError::Fatal(format!(
                    "only mosquitto auth plugin version {} is supported, plugin reports {}",
                    SUPPORTED_PLUGIN_VERSION, reported
                )));
            }

            let init_fn = *symbol::<PluginInitFn>(&lib, "mosquitto_auth_plugin_init")?;
            let cleanup_fn = *symbol::<PluginCleanupFn>(&lib, "mosquitto_auth_plugin_cleanup")?;
            let security_init_fn =
                *symbol::<SecurityInitFn>(&lib, "mosquitto_auth_security_init")?;
            let security_cleanup_fn =
                *symbol::<SecurityCleanupFn>(&lib, "mosquitto_auth_security_cleanup")?;
            let acl_check_fn = *symbol::<AclCheckFn>(&lib, "mosquitto_auth_acl_check")?;
            let unpwd_check_fn = *symbol::<UnpwdCheckFn>(&lib, "mosquitto_auth_unpwd_check")?;
            let psk_key_get_fn = *symbol::<PskKeyGetFn>(&lib, "mosquitto_auth_psk_key_get")?;

            Ok(Self {
                user_data: AtomicPtr::new(std::ptr::null_mut()),
                init_fn,
                cleanup_fn,
                security_init_fn,
                security_cleanup_fn,
                acl_check_fn,
                unpwd_check_fn,
                psk_key_get_fn,
                opts: converted_opts,
                _lib: lib,
            })
        }
    }

    fn build_opts(&self) -> Vec<AuthOpt> {
        self.opts
            .iter()
            .map(|(key, value)| AuthOpt {
                key: key.as_ptr() as *mut c_char,
                value: value.as_ptr() as *mut c_char,
            })
            .collect()
    }

    /// Let the plugin allocate its state; it is not supposed to load
    /// authentication data yet, that happens in `security_init`.
    pub fn init(&self) -> Result<(), AuthError> {
        let mut opts = self.build_opts();
        let mut data = self.user_data.load(Ordering::Acquire);
        let rc =
            unsafe { (self.init_fn)(&mut data, opts.as_mut_ptr(), opts.len() as c_int) };
        if rc != 0 {
            return Err(AuthError::Fatal("error initialising auth plugin".into()));
        }
        self.user_data.store(data, Ordering::Release);
        Ok(())
    }

    pub fn cleanup(&self) -> Result<(), AuthError> {
        let mut opts = self.build_opts();
        let rc = unsafe {
            (self.cleanup_fn)(
                self.user_data.load(Ordering::Acquire),
                opts.as_mut_ptr(),
                opts.len() as c_int,
            )
        };
        if rc != 0 {
            return Err(AuthError::Plugin("error cleaning up auth plugin".into()));
        }
        Ok(())
    }

    /// Load users, ACL tables and the like inside the plugin.
    pub fn security_init(&self, reloading: bool) -> Result<(), AuthError> {
        let mut opts = self.build_opts();
        let rc = unsafe {
            (self.security_init_fn)(
                self.user_data.load(Ordering::Acquire),
                opts.as_mut_ptr(),
                opts.len() as c_int,
                reloading,
            )
        };
        if rc != 0 {
            return Err(AuthError::Plugin(
                "plugin security init returned an error".into(),
            ));
        }
        Ok(())
    }

    pub fn security_cleanup(&self, reloading: bool) -> Result<(), AuthError> {
        let mut opts = self.build_opts();
        let rc = unsafe {
            (self.security_cleanup_fn)(
                self.user_data.load(Ordering::Acquire),
                opts.as_mut_ptr(),
                opts.len() as c_int,
                reloading,
            )
        };
        if rc != 0 {
            return Err(AuthError::Plugin(
                "plugin security cleanup returned an error".into(),
            ));
        }
        Ok(())
    }

    pub fn acl_check(
        &self,
        client_id: &str,
        username: &str,
        topic: &str,
        access: AclAccess,
    ) -> AuthResult {
        let (Ok(client_id), Ok(username), Ok(topic)) = (
            CString::new(client_id),
            CString::new(username),
            CString::new(topic),
        ) else {
            return AuthResult::Error;
        };

        let rc = unsafe {
            (self.acl_check_fn)(
                self.user_data.load(Ordering::Acquire),
                client_id.as_ptr(),
                username.as_ptr(),
                topic.as_ptr(),
                access as c_int,
            )
        };
        AuthResult::from_plugin_code(rc)
    }

    pub fn unpwd_check(&self, username: &str, password: &str) -> AuthResult {
        let (Ok(username), Ok(password)) = (CString::new(username), CString::new(password))
        else {
            return AuthResult::Error;
        };

        let rc = unsafe {
            (self.unpwd_check_fn)(
                self.user_data.load(Ordering::Acquire),
                username.as_ptr(),
                password.as_ptr(),
            )
        };
        AuthResult::from_plugin_code(rc)
    }

    /// Ask the plugin for the pre-shared key of an identity, as a hex string.
    pub fn psk_key_get(&self, hint: &str, identity: &str) -> Option<String> {
        let (Ok(hint), Ok(identity)) = (CString::new(hint), CString::new(identity)) else {
            return None;
        };

        let mut buf = vec![0u8; 512];
        let rc = unsafe {
            (self.psk_key_get_fn)(
                self.user_data.load(Ordering::Acquire),
                hint.as_ptr(),
                identity.as_ptr(),
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as c_int,
            )
        };
        if rc != 0 {
            return None;
        }

        CStr::from_bytes_until_nul(&buf)
            .ok()
            .and_then(|key| key.to_str().ok())
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }
}

fn symbol<'lib, T>(lib: &'lib Library, name: &str) -> Result<Symbol<'lib, T>, AuthError> {
    unsafe { lib.get(name.as_bytes()) }
        .map_err(|e| AuthError::Fatal(format!("auth plugin symbol {name} not found: {e}")))
}
