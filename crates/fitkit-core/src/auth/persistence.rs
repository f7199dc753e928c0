use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use keyring::Entry;
use rand::RngCore;

use super::store::Credentials;

/// Session file name in the cache directory
pub const SESSION_FILE: &str = "session.json";

/// Keychain service name
const SERVICE_NAME: &str = "fitkit";

/// Keychain account under which the serialized session is stored
const SESSION_ACCOUNT: &str = "session";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Backing medium for the credential store.
pub trait CredentialPersistence: Send + Sync {
    /// Read the persisted session, if any.
    fn load(&self) -> Result<Option<Credentials>>;

    fn save(&self, credentials: &Credentials) -> Result<()>;

    /// Remove the persisted session. Succeeds when nothing is stored.
    fn clear(&self) -> Result<()>;
}

/// Session kept as a JSON file, optionally sealed with a passphrase.
///
/// Sealed files are laid out as `salt || nonce || ciphertext`, with the key
/// derived from the passphrase by Argon2 and the payload encrypted with
/// ChaCha20-Poly1305.
pub struct FilePersistence {
    path: PathBuf,
    passphrase: Option<String>,
}

impl FilePersistence {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            passphrase: None,
        }
    }

    /// Store the session encrypted under `passphrase`.
    pub fn encrypted(path: PathBuf, passphrase: String) -> Self {
        Self {
            path,
            passphrase: Some(passphrase),
        }
    }

    /// Session file inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SESSION_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| anyhow::anyhow!("Failed to derive session key: {}", e))?;
        Ok(key)
    }

    fn seal(passphrase: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = Self::derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow::anyhow!("Failed to encrypt session"))?;

        let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(passphrase: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SALT_LEN + NONCE_LEN {
            anyhow::bail!("Session file is truncated");
        }
        let (salt, rest) = sealed.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let key = Self::derive_key(passphrase, salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("Failed to decrypt session - wrong passphrase?"))
    }
}

impl CredentialPersistence for FilePersistence {
    fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read(&self.path).context("Failed to read session file")?;
        let contents = match self.passphrase {
            Some(ref passphrase) => Self::open(passphrase, &raw)?,
            None => raw,
        };
        let credentials: Credentials =
            serde_json::from_slice(&contents).context("Failed to parse session file")?;
        Ok(Some(credentials))
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(credentials)?;
        let contents = match self.passphrase {
            Some(ref passphrase) => Self::seal(passphrase, &contents)?,
            None => contents,
        };
        std::fs::write(&self.path, contents).context("Failed to write session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// Session kept as a single secret in the OS keychain.
pub struct KeyringPersistence {
    service: String,
    account: String,
}

impl KeyringPersistence {
    pub fn new() -> Self {
        Self::with_account(SESSION_ACCOUNT)
    }

    /// Use a separate keychain account, e.g. one per server.
    pub fn with_account(account: &str) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, &self.account).context("Failed to create keyring entry")
    }
}

impl Default for KeyringPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialPersistence for KeyringPersistence {
    fn load(&self) -> Result<Option<Credentials>> {
        match self.entry()?.get_password() {
            Ok(secret) => {
                let credentials: Credentials = serde_json::from_str(&secret)
                    .context("Failed to parse session from keychain")?;
                Ok(Some(credentials))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        let secret = serde_json::to_string(credentials)?;
        self.entry()?
            .set_password(&secret)
            .context("Failed to store session in keychain")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}
