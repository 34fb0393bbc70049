use std::path::{Path, PathBuf};

use crate::config::Config;
use color_eyre::Result;
use pievo_storage::{key_provider::FileKeyProvider, secure_file_store::EncryptedFileStore};
use tracing::debug;

/// Fixed name of the key file inside the data directory.
pub const KEY_FILE: &str = "ai_key.key";

/// Resolve the data directory: config override, else the working directory.
pub fn data_dir(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(std::env::current_dir()?),
    }
}

/// Build the encrypted store using config overrides.
pub fn store_from_config(config: &Config) -> Result<EncryptedFileStore<FileKeyProvider>> {
    let root = data_dir(config)?;
    debug!(?root, "initializing encrypted store");
    Ok(store_at(root))
}

/// Encrypted store with its key file alongside the data.
pub fn store_at(root: impl AsRef<Path>) -> EncryptedFileStore<FileKeyProvider> {
    let root = root.as_ref();
    EncryptedFileStore::new(root, FileKeyProvider::new(root.join(KEY_FILE)))
}
