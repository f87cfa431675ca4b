//! File storage sealed with ChaCha20-Poly1305.
//!
//! Each file is `MAGIC | salt | nonce | ciphertext`. The key is derived from
//! the passphrase with Argon2id and the file's own random salt, so every
//! write uses a fresh key and nonce.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::file::{remove_if_exists, write_private};
use super::{validate_key, KeyValueStore};

const MAGIC: &[u8; 4] = b"DAE1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;

pub struct EncryptedFileStore {
    dir: PathBuf,
    passphrase: String,
}

impl EncryptedFileStore {
    pub fn new(dir: PathBuf, passphrase: &str) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
        Ok(Self {
            dir,
            passphrase: passphrase.to_string(),
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.enc", key)))
    }

    fn cipher(&self, salt: &[u8]) -> Result<ChaCha20Poly1305> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| anyhow!("Key derivation failed: {}", e))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher(&salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("Encryption failed"))?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < HEADER_LEN || &sealed[..MAGIC.len()] != MAGIC {
            bail!("Not an encrypted session file");
        }
        let salt = &sealed[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let nonce = &sealed[MAGIC.len() + SALT_LEN..HEADER_LEN];

        self.cipher(salt)?
            .decrypt(Nonce::from_slice(nonce), &sealed[HEADER_LEN..])
            .map_err(|_| anyhow!("Decryption failed: wrong passphrase or tampered file"))
    }
}

impl KeyValueStore for EncryptedFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(&path)
            .with_context(|| format!("Failed to read storage file: {}", key))?;
        let plaintext = self.open(&sealed)?;
        let value = String::from_utf8(plaintext).context("Decrypted value is not UTF-8")?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        let sealed = self.seal(value.as_bytes())?;
        write_private(&path, &sealed)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        remove_if_exists(&path)
    }
}
