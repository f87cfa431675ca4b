//! Persistent key-value storage for the session.
//!
//! The session manager persists exactly two keys, the serialized `User` and
//! the serialized `Session`. Backends:
//! - `FileStore`: one JSON file per key in the data directory
//! - `EncryptedFileStore`: same layout, sealed with ChaCha20-Poly1305
//! - `KeyringStore`: OS keychain entries
//! - `MemoryStore`: process-local, nothing survives a restart

pub mod encrypted;
pub mod file;
pub mod keychain;
pub mod memory;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::StorageBackend;

pub use self::encrypted::EncryptedFileStore;
pub use self::file::FileStore;
pub use self::keychain::KeyringStore;
pub use self::memory::MemoryStore;

/// Key holding the serialized `User`
pub const USER_KEY: &str = "dashauth.user";

/// Key holding the serialized `Session`
pub const SESSION_KEY: &str = "dashauth.session";

/// String-keyed, string-valued persistent storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Open the configured backend.
pub fn open_store(
    backend: StorageBackend,
    data_dir: &Path,
    passphrase: Option<&str>,
) -> Result<Arc<dyn KeyValueStore>> {
    Ok(match backend {
        StorageBackend::File => Arc::new(FileStore::new(data_dir.to_path_buf())?),
        StorageBackend::Encrypted => {
            let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) else {
                bail!("Encrypted storage requires a passphrase (set DASHAUTH_PASSPHRASE)");
            };
            Arc::new(EncryptedFileStore::new(data_dir.to_path_buf(), passphrase)?)
        }
        StorageBackend::Keyring => Arc::new(KeyringStore::new()),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    })
}

/// Keys become file names, so only allow a conservative character set.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        && !key.starts_with('.');
    if !ok {
        bail!("Invalid storage key: {:?}", key);
    }
    Ok(())
}
