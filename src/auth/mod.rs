//! Authentication
//!
//! Two credential sources compose: an internal mosquitto-style password file
//! with salted SHA-512 digests, and an optional externally loaded policy
//! plugin. The password file answers first; only a positive verdict is
//! forwarded to the plugin. ACL questions go to the plugin alone.

pub mod password_file;
pub mod plugin;

pub use password_file::{parse_password_file, PasswordEntry};
pub use plugin::AuthPlugin;

use std::ffi::c_int;
use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use tracing::{error, info};

use crate::config::Settings;


/// Verdict of a credential or ACL check. Values match the mosquitto plugin
/// return codes so plugin results map over directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthResult {
    Success = 0,
    /// The plugin failed to answer; callers deny and log
    Error = 1,
    LoginDenied = 11,
    AclDenied = 12,
}

impl AuthResult {
    fn from_plugin_code(code: c_int) -> Self {
        match code {
            0 => AuthResult::Success,
            11 => AuthResult::LoginDenied,
            12 => AuthResult::AclDenied,
            _ => AuthResult::Error,
        }
    }
}

impl fmt::Display for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthResult::Success => "success",
            AuthResult::Error => "error in check",
            AuthResult::LoginDenied => "login denied",
            AuthResult::AclDenied => "ACL denied",
        };
        f.write_str(s)
    }
}

/// Kind of topic access an ACL check asks about, mosquitto encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AclAccess {
    Read = 1,
    Write = 2,
}

/// Authentication subsystem errors.
#[derive(Debug)]
pub enum AuthError {
    /// Plugin load or symbol resolution failed; startup must abort
    Fatal(String),
    /// The plugin refused an init, reload or cleanup call
    Plugin(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal(msg) => write!(f, "fatal auth error: {}", msg),
            Self::Plugin(msg) => write!(f, "auth plugin error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub struct Authenticator {
    password_file: Option<PathBuf>,
    allow_anonymous: bool,
    serialize_init: bool,
    serialize_checks: bool,
    /// Current password file mapping; replaced wholesale on reload
    entries: RwLock<Option<AHashMap<String, PasswordEntry>>>,
    /// ctime of the file at the last successful load, second resolution
    last_load_ctime: Mutex<Option<i64>>,
    unreadable_logged: AtomicBool,
    plugin: Option<AuthPlugin>,
    initialized: AtomicBool,
    quitting: AtomicBool,
    /// Serializes plugin init/security-init across workers when configured
    init_lock: Mutex<()>,
    /// Serializes per-request plugin checks when configured
    checks_lock: Mutex<()>,
}

impl Authenticator {
    /// Build the authenticator, loading the external plugin when one is
    /// configured. A missing or incompatible plugin is a startup failure.
    pub fn new(settings: &Settings) -> Result<Self, AuthError> {
        let plugin = match &settings.auth.plugin_path {
            Some(path) => {
                let mut opts: Vec<(String, String)> = settings
                    .auth
                    .plugin_opts
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                opts.sort();
                Some(AuthPlugin::load(path, &opts)?)
            }
            None => None,
        };

        Ok(Self {
            password_file: settings.auth.password_file.clone(),
            allow_anonymous: settings.auth.allow_anonymous,
            serialize_init: settings.auth.plugin_serialize_init,
            serialize_checks: settings.auth.plugin_serialize_checks,
            entries: RwLock::new(None),
            last_load_ctime: Mutex::new(None),
            unreadable_logged: AtomicBool::new(false),
            plugin,
            initialized: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            checks_lock: Mutex::new(()),
        })
    }

    /// Flag a shutdown in progress so late init/reload calls become no-ops.
    pub fn set_quitting(&self) {
        self.quitting.store(true, Ordering::SeqCst);
    }

    /// Plugin memory init. No-op without a plugin or while quitting.
    pub fn init(&self) -> Result<(), AuthError> {
        let Some(plugin) = &self.plugin else {
            return Ok(());
        };

        let _guard = self.serialize_init.then(|| self.init_lock.lock());
        if self.quitting.load(Ordering::SeqCst) {
            return Ok(());
        }

        plugin.init()
    }

    /// Have the plugin load its users and ACL tables.
    pub fn security_init(&self, reloading: bool) -> Result<(), AuthError> {
        let Some(plugin) = &self.plugin else {
            return Ok(());
        };

        let _guard = self.serialize_init.then(|| self.init_lock.lock());
        if self.quitting.load(Ordering::SeqCst) {
            return Ok(());
        }

        plugin.security_init(reloading)?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn security_cleanup(&self, reloading: bool) -> Result<(), AuthError> {
        let Some(plugin) = &self.plugin else {
            return Ok(());
        };

        self.initialized.store(false, Ordering::SeqCst);
        plugin.security_cleanup(reloading)
    }

    /// Reload the plugin's security data. On failure later checks fail
    /// because the plugin state is unknown.
    pub fn reload(&self) {
        let result = self
            .security_cleanup(true)
            .and_then(|()| self.security_init(true));
        if let Err(err) = result {
            error!(%err, "error reloading auth plugin; security checks will now fail");
        }
    }

    /// Shutdown-path teardown; failures are logged, not raised.
    pub fn cleanup(&self) {
        let Some(plugin) = &self.plugin else {
            return;
        };

        if let Err(err) = self.security_cleanup(false) {
            error!(%err, "error during auth plugin security cleanup");
        }
        if let Err(err) = plugin.cleanup() {
            error!(%err, "error cleaning up auth plugin");
        }
    }

    /// Username/password verdict: password file first, then the plugin, but
    /// only when the file said yes.
    pub fn unpwd_check(&self, username: &str, password: &str) -> AuthResult {
        let first = self.check_password_file(username, password);
        if first != AuthResult::Success {
            return first;
        }

        let Some(plugin) = &self.plugin else {
            return first;
        };

        if !self.initialized.load(Ordering::SeqCst) {
            error!(
                %username,
                "username+password check with plugin wanted, but initialization failed"
            );
            return AuthResult::Error;
        }

        let _guard = self.serialize_checks.then(|| self.checks_lock.lock());
        let result = plugin.unpwd_check(username, password);
        if result == AuthResult::Error {
            error!(%username, "username+password check by plugin returned an error");
        }
        result
    }

    /// ACL verdict; answered by the plugin only, success when none is
    /// installed.
    pub fn acl_check(
        &self,
        client_id: &str,
        username: &str,
        topic: &str,
        access: AclAccess,
    ) -> AuthResult {
        let Some(plugin) = &self.plugin else {
            return AuthResult::Success;
        };

        if !self.initialized.load(Ordering::SeqCst) {
            error!("ACL check wanted, but plugin initialization failed; cannot perform check");
            return AuthResult::Error;
        }

        let _guard = self.serialize_checks.then(|| self.checks_lock.lock());
        let result = plugin.acl_check(client_id, username, topic, access);
        if result == AuthResult::Error {
            error!(%topic, "ACL check by plugin returned an error");
        }
        result
    }

    /// PSK lookup, plugin-only.
    pub fn psk_key_get(&self, hint: &str, identity: &str) -> Option<String> {
        let plugin = self.plugin.as_ref()?;
        if !self.initialized.load(Ordering::SeqCst) {
            return None;
        }
        let _guard = self.serialize_checks.then(|| self.checks_lock.lock());
        plugin.psk_key_get(hint, identity)
    }

    fn check_password_file(&self, username: &str, password: &str) -> AuthResult {
        if self.password_file.is_none() {
            return AuthResult::Success;
        }

        let entries = self.entries.read();
        let Some(entries) = entries.as_ref() else {
            // configured but never successfully loaded
            return AuthResult::LoginDenied;
        };

        match entries.get(username) {
            Some(entry) => {
                let mut hasher = Sha512::new();
                hasher.update(password.as_bytes());
                hasher.update(&entry.salt);
                let digest = hasher.finalize();

                if bool::from(digest.as_slice().ct_eq(entry.digest.as_slice())) {
                    AuthResult::Success
                } else {
                    AuthResult::LoginDenied
                }
            }
            None => {
                if self.allow_anonymous {
                    AuthResult::Success
                } else {
                    AuthResult::LoginDenied
                }
            }
        }
    }

    /// Called on startup and then on a periodic tick: stat the password file
    /// and reload it when its change time moved. An unreadable file keeps the
    /// previous mapping and is logged once until it becomes readable again.
    pub fn load_password_file(&self) {
        let Some(path) = &self.password_file else {
            return;
        };

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                if !self.unreadable_logged.swap(true, Ordering::SeqCst) {
                    error!(
                        path = %path.display(),
                        %err,
                        "passwd file is not there or not readable"
                    );
                }
                return;
            }
        };
        self.unreadable_logged.store(false, Ordering::SeqCst);

        let ctime = metadata.ctime();
        if *self.last_load_ctime.lock() == Some(ctime) {
            return;
        }

        info!(path = %path.display(), "change detected in passwd file, reloading");

        match fs::read_to_string(path) {
            Ok(content) => {
                let fresh = parse_password_file(&content);
                *self.entries.write() = Some(fresh);
                *self.last_load_ctime.lock() = Some(ctime);
            }
            Err(err) => {
                error!(
                    path = %path.display(),
                    %err,
                    "error loading passwd file; authentication keeps the previous data"
                );
            }
        }
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    pub fn has_plugin(&self) -> bool {
        self.plugin.is_some()
    }
}
