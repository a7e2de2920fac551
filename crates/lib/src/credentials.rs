//! Credential store: durable blob holding the transport session credentials.
//!
//! Read when connecting and written whenever the transport reports updated credentials.

use crate::transport::Credentials;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store contains invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Stored credentials, or None when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Credentials>, CredentialError>;

    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError>;
}

/// Credentials persisted as a JSON file (e.g. ~/.switchboard/credentials.json).
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        let s = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if s.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&s)?))
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let json = serde_json::to_string_pretty(credentials)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // The target is only ever replaced whole.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Credentials kept in memory only (tests, throwaway sessions).
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: tokio::sync::RwLock<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new(initial: Option<Credentials>) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(initial),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        *self.inner.write().await = Some(credentials.clone());
        Ok(())
    }
}
