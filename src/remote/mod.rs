//! Authoritative blob store shared by every replica.
//!
//! Callers only see the [`RemoteStore`] primitives plus the version marker
//! accessors. Two adapters exist:
//!
//! - `directory`: a plain directory tree (shared volume, local runs, tests)
//! - `gcs`: Google Cloud Storage over its JSON API

mod directory;
mod gcs;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RemoteConfig, RemoteKind};
use crate::token::VersionToken;

pub use directory::DirectoryStore;
pub use gcs::GcsStore;

/// Small object holding the current generation token as plain text.
pub const MARKER_PATH: &str = "version.txt";

/// Canonical index snapshot.
pub const SNAPSHOT_PATH: &str = "index/snapshot.tar.gz";

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("invalid remote path: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote returned {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

pub trait RemoteStore: Send + Sync {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError>;
    fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError>;
    fn delete(&self, remote_path: &str) -> Result<(), RemoteError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;

    /// `Ok(None)` when no marker has been written yet.
    fn read_marker(&self) -> Result<Option<VersionToken>, RemoteError>;
    fn write_marker(&self, token: &VersionToken) -> Result<(), RemoteError>;
}

pub fn create_store(
    config: &RemoteConfig,
    base_path: &Path,
    marker_timeout: Duration,
) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match config.kind {
        RemoteKind::Directory => {
            let root = config
                .path
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| base_path.join("remote"));
            log::info!("using directory remote at {}", root.display());
            Ok(Arc::new(DirectoryStore::new(root)?))
        }
        RemoteKind::Gcs => {
            let bucket = config
                .bucket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("remote.bucket is required for gcs"))?;
            let token = std::env::var(&config.token_env).ok();
            if token.is_none() {
                log::warn!(
                    "{} is not set, gcs requests will be unauthenticated",
                    config.token_env
                );
            }
            log::info!("using gcs remote bucket {bucket}");
            Ok(Arc::new(GcsStore::new(
                &config.endpoint,
                &bucket,
                token,
                Duration::from_secs(config.request_timeout_secs),
                marker_timeout,
            )?))
        }
    }
}
