use std::{
    fmt, fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use rand::{rngs::OsRng, RngCore};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Key material used for encryption at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Identifier for logging (never log key bytes).
    pub id: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; 32],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file error: {0}")]
    Io(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Provides the store's encryption key, creating it on first use.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError>;
}

/// Key persisted as URL-safe base64 text in a single file. Generated once, never rotated.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key_id(&self) -> String {
        self.path.display().to_string()
    }

    /// `None` when no key file exists yet.
    fn read_existing(&self) -> Result<Option<KeyMaterial>, KeyError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(KeyError::Io(err.to_string())),
        };
        let secret = String::from_utf8(raw).map_err(|e| KeyError::Decode(e.to_string()))?;
        decode_key(self.key_id(), secret.trim()).map(Some)
    }
}

#[async_trait]
impl KeyProvider for FileKeyProvider {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        if let Some(existing) = self.read_existing()? {
            debug!("using existing key file");
            return Ok(existing);
        }

        let material = generate_key(self.key_id());
        if write_key_file(&self.path, &encode_key(&material))? {
            info!("generated new key file");
            return Ok(material);
        }

        debug!("key file appeared concurrently, using it");
        self.read_existing()?
            .ok_or_else(|| KeyError::Io("key file vanished after creation".to_string()))
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl InMemoryKeyProvider {
    /// Provider pinned to known key bytes.
    pub fn with_key(bytes: [u8; 32]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(KeyMaterial {
                id: "memory".to_string(),
                bytes,
            }))),
        }
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let material = generate_key("memory".to_string());
        *guard = Some(material.clone());
        Ok(material)
    }
}

fn generate_key(id: String) -> KeyMaterial {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    KeyMaterial { id, bytes }
}

fn encode_key(material: &KeyMaterial) -> String {
    URL_SAFE.encode(material.bytes)
}

fn decode_key(id: String, secret: &str) -> Result<KeyMaterial, KeyError> {
    let bytes = URL_SAFE
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        KeyError::Decode(format!("expected 32 bytes, got {}", bytes.len()))
    })?;
    Ok(KeyMaterial { id, bytes })
}

/// Publishes the key file in one step, never over an existing one.
/// Returns `false` when another process created it first.
fn write_key_file(path: &Path, encoded: &str) -> Result<bool, KeyError> {
    let io_err = |e: std::io::Error| KeyError::Io(e.to_string());
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }
    tmp.write_all(encoded.as_bytes()).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;

    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(io_err(err.error)),
    }
}
