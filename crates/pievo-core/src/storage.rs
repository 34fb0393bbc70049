use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by secure storage implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecureStoreError {
    /// Requested entry does not exist.
    #[error("entry not found for key: {key}")]
    NotFound { key: String },
    /// Ciphertext did not validate against the key (corrupted entry or key mismatch).
    #[error("decryption failed for {key}: {reason}")]
    Decryption { key: String, reason: String },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// Contract for encrypted-at-rest storage of whole documents.
///
/// Every `put` replaces the entry in full; there is no partial update.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Persist a value under a key, overwriting any existing entry.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError>;

    /// Retrieve the value for a key.
    ///
    /// Implementations make sure key material exists before reporting `NotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError>;
}

/// In-memory secure store that simulates encryption for tests.
/// This is not cryptographically secure.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecureStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw (masked) bytes for a key, as they sit in the backing map.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecureStoreError> {
        let mut map = self.inner.lock().map_err(|err| SecureStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;

        map.insert(key.to_string(), mask(value));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, SecureStoreError> {
        let map = self.inner.lock().map_err(|err| SecureStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;

        let masked = map
            .get(key)
            .cloned()
            .ok_or_else(|| SecureStoreError::NotFound {
                key: key.to_string(),
            })?;
        Ok(mask(&masked))
    }
}

const MASK_BYTE: u8 = 0x5A;

// XOR twice restores the original.
fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}
