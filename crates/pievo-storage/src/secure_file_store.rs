use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Component, Path, PathBuf},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use pievo_core::storage::{SecureStore, SecureStoreError};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::key_provider::{KeyMaterial, KeyProvider};

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// AES-GCM encrypted file-backed store implementing the shared `SecureStore` contract.
/// Each entry is one file under `root`, named after the entry key.
pub struct EncryptedFileStore<P: KeyProvider> {
    root: PathBuf,
    key_provider: P,
}

impl<P: KeyProvider> EncryptedFileStore<P> {
    pub fn new(root: impl Into<PathBuf>, key_provider: P) -> Self {
        Self {
            root: root.into(),
            key_provider,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of an entry. Keys must be a single plain file name.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, SecureStoreError> {
        let mut components = Path::new(key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => Err(SecureStoreError::Storage {
                reason: format!("invalid entry name: {key:?}"),
            }),
        }
    }

    async fn cipher(&self) -> Result<Aes256Gcm, SecureStoreError> {
        let key_material =
            self.key_provider
                .get_or_create()
                .await
                .map_err(|e| SecureStoreError::Storage {
                    reason: format!("key provider: {e}"),
                })?;
        build_cipher(&key_material)
    }
}

/// JSON envelope written to disk.
#[derive(Debug, Serialize, Deserialize)]
struct StoredBlob {
    v: u8,
    nonce: String,
    ciphertext: String,
}

#[async_trait]
impl<P: KeyProvider> SecureStore for EncryptedFileStore<P> {
    #[instrument(skip(self, value), fields(len = value.len()))]
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        let path = self.path_for(key)?;
        let cipher = self.cipher().await?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, value)
            .map_err(|e| SecureStoreError::Storage {
                reason: format!("encrypt failed: {e}"),
            })?;

        let blob = StoredBlob {
            v: ENVELOPE_VERSION,
            nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        };

        write_blob(&path, &blob)?;
        debug!(path = %path.display(), "entry written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        let path = self.path_for(key)?;
        // Resolve the key first so a fresh store gets its key file even when the entry is absent.
        let cipher = self.cipher().await?;

        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SecureStoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(err) => return Err(storage_err(err)),
        };

        let decryption_err = |reason: String| SecureStoreError::Decryption {
            key: key.to_string(),
            reason,
        };

        let blob: StoredBlob = serde_json::from_slice(&raw)
            .map_err(|e| decryption_err(format!("malformed envelope: {e}")))?;
        if blob.v != ENVELOPE_VERSION {
            return Err(decryption_err(format!(
                "unsupported envelope version {}",
                blob.v
            )));
        }

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(blob.nonce)
            .map_err(|e| decryption_err(format!("nonce decode failed: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(decryption_err(format!(
                "expected {NONCE_LEN}-byte nonce, got {}",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = URL_SAFE_NO_PAD
            .decode(blob.ciphertext)
            .map_err(|e| decryption_err(format!("ciphertext decode failed: {e}")))?;

        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| decryption_err("authentication tag mismatch".to_string()))
    }
}

fn write_blob(path: &Path, blob: &StoredBlob) -> Result<(), SecureStoreError> {
    let parent = path.parent().ok_or_else(|| SecureStoreError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(blob).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, SecureStoreError> {
    Aes256Gcm::new_from_slice(&material.bytes).map_err(|e| SecureStoreError::Storage {
        reason: format!("cipher init failed: {e}"),
    })
}

fn storage_err<E: ToString>(err: E) -> SecureStoreError {
    SecureStoreError::Storage {
        reason: err.to_string(),
    }
}
