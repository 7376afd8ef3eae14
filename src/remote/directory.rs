use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::remote::{RemoteError, RemoteStore, MARKER_PATH};
use crate::storage::LocalFiles;
use crate::token::VersionToken;

/// Remote store kept in a directory, e.g. a volume mounted by every replica.
pub struct DirectoryStore {
    files: LocalFiles,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        Ok(Self {
            files: LocalFiles::new(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.files.base_dir
    }
}

fn map_io(remote_path: &str, err: std::io::Error) -> RemoteError {
    match err.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(remote_path.to_string()),
        ErrorKind::InvalidInput => RemoteError::InvalidPath(remote_path.to_string()),
        _ => RemoteError::Io(err),
    }
}

impl RemoteStore for DirectoryStore {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        self.files
            .copy_in(local_path, remote_path)
            .map(|_| ())
            .map_err(RemoteError::Io)
    }

    fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        self.files
            .copy_out(remote_path, local_path)
            .map(|_| ())
            .map_err(|e| map_io(remote_path, e))
    }

    fn delete(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.files
            .delete(remote_path)
            .map_err(|e| map_io(remote_path, e))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        Ok(self.files.list(prefix))
    }

    fn read_marker(&self) -> Result<Option<VersionToken>, RemoteError> {
        match self.files.read(MARKER_PATH) {
            Ok(bytes) => Ok(VersionToken::parse(&String::from_utf8_lossy(&bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RemoteError::Io(e)),
        }
    }

    fn write_marker(&self, token: &VersionToken) -> Result<(), RemoteError> {
        self.files
            .write(MARKER_PATH, token.as_str().as_bytes())
            .map_err(RemoteError::Io)
    }
}
