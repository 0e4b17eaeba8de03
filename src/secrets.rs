//! Credential storage.
//!
//! Passwords, private keys and key passphrases are looked up by a
//! `(service, key)` pair, where the key is derived from the server's display
//! name through [`SecretKind`].

use std::collections::HashMap;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::error::SecretError;

/// Which credential of a server is being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Password,
    PrivateKey,
    Passphrase,
}

impl SecretKind {
    fn prefix(&self) -> &'static str {
        match self {
            SecretKind::Password => "sftpPassword",
            SecretKind::PrivateKey => "sftpKey",
            SecretKind::Passphrase => "sftpPhrase",
        }
    }

    /// Store key for the server named `server_name`
    pub fn key_for(&self, server_name: &str) -> String {
        format!("{}{}", self.prefix(), server_name)
    }
}

/// Backend holding credentials.
///
/// Implementations must be cheap to call from async code; lookups happen
/// once per connection attempt.
pub trait SecretStore: Send + Sync {
    fn get(&self, service: &str, key: &str) -> Result<Option<SecretString>, SecretError>;
    fn set(&self, service: &str, key: &str, value: SecretString) -> Result<(), SecretError>;
    fn delete(&self, service: &str, key: &str) -> Result<(), SecretError>;
}

/// Process-local store, used by tests and as the fallback on platforms
/// without a keychain backend.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<(String, String), SecretString>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(self, service: &str, key: &str, value: &str) -> Self {
        self.entries.lock().insert(
            (service.to_string(), key.to_string()),
            SecretString::from(value.to_string()),
        );
        self
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<SecretString>, SecretError> {
        Ok(self
            .entries
            .lock()
            .get(&(service.to_string(), key.to_string()))
            .map(|s| SecretString::from(s.expose_secret().to_string())))
    }

    fn set(&self, service: &str, key: &str, value: SecretString) -> Result<(), SecretError> {
        self.entries
            .lock()
            .insert((service.to_string(), key.to_string()), value);
        Ok(())
    }

    fn delete(&self, service: &str, key: &str) -> Result<(), SecretError> {
        self.entries
            .lock()
            .remove(&(service.to_string(), key.to_string()));
        Ok(())
    }
}

/// OS keychain backed store
#[cfg(any(target_os = "linux", target_os = "macos"))]
#[derive(Default)]
pub struct KeyringSecretStore;

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl KeyringSecretStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(service: &str, key: &str) -> Result<keyring::Entry, SecretError> {
        keyring::Entry::new(service, key).map_err(|e| SecretError::Access {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl SecretStore for KeyringSecretStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<SecretString>, SecretError> {
        let entry = Self::entry(service, key)?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(SecretString::from(secret))),
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("Keychain: no entry for {}", key);
                Ok(None)
            }
            Err(keyring::Error::PlatformFailure(e)) | Err(keyring::Error::NoStorageAccess(e)) => {
                Err(SecretError::Unavailable(e.to_string()))
            }
            Err(e) => Err(SecretError::Access {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn set(&self, service: &str, key: &str, value: SecretString) -> Result<(), SecretError> {
        let entry = Self::entry(service, key)?;
        entry
            .set_password(value.expose_secret())
            .map_err(|e| SecretError::Access {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn delete(&self, service: &str, key: &str) -> Result<(), SecretError> {
        let entry = Self::entry(service, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretError::Access {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
