//! Durable storage for the primary-transport resumption token
//!
//! The token is opaque. On disk it is framed as a fixed magic, a
//! little-endian `u32` length and the token bytes, so truncated or foreign
//! files are detected and reported as absent instead of being handed to the
//! transport.

use crate::error::StoreError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 8] = b"QFRESUM1";
const HEADER_LEN: usize = MAGIC.len() + 4;

/// File-backed resumption token store
///
/// ```rust
/// use quicfall::ResumptionStore;
///
/// # let dir = tempfile::TempDir::new().unwrap();
/// # tokio_test::block_on(async {
/// let store = ResumptionStore::new(dir.path().join("ticket.bin"));
/// assert_eq!(store.load().await, None);
///
/// store.save(b"opaque-ticket").await.unwrap();
/// assert_eq!(store.load().await, Some(b"opaque-ticket".to_vec()));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct ResumptionStore {
    path: PathBuf,
}

impl ResumptionStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `token`, replacing any previous one atomically
    ///
    /// Empty tokens are refused with [`StoreError::EmptyToken`], so `load`
    /// never returns `Some(vec![])`.
    pub async fn save(&self, token: &[u8]) -> Result<(), StoreError> {
        if token.is_empty() {
            return Err(StoreError::EmptyToken);
        }

        let len = u32::try_from(token.len()).map_err(|_| {
            StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                "resumption token larger than 4 GiB",
            ))
        })?;

        let mut framed = Vec::with_capacity(HEADER_LEN + token.len());
        framed.extend_from_slice(MAGIC);
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(token);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = self.staging_path();
        tokio::fs::write(&staging, &framed).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        info!(path = %self.path.display(), bytes = token.len(), "Resumption token saved");
        Ok(())
    }

    /// Previously saved token, or `None` when missing or unreadable
    pub async fn load(&self) -> Option<Vec<u8>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved resumption token");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read resumption token");
                return None;
            }
        };

        match decode(&raw) {
            Some(token) => {
                info!(path = %self.path.display(), bytes = token.len(), "Resumption token loaded");
                Some(token)
            }
            None => {
                warn!(path = %self.path.display(), "Discarding corrupt resumption token");
                None
            }
        }
    }

    /// Remove the stored token; a missing file is not an error
    pub async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn decode(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() <= HEADER_LEN || &raw[..MAGIC.len()] != MAGIC {
        return None;
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&raw[MAGIC.len()..HEADER_LEN]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let body = &raw[HEADER_LEN..];
    (body.len() == len).then(|| body.to_vec())
}
