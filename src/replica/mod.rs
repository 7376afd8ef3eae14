//! Process-local copies of the index.
//!
//! A [`LocalIndexReplica`] is an immutable snapshot loaded from one replica
//! directory and tagged with the token in its manifest. Queries go through
//! a [`ReplicaHandle`], which holds an `Arc` to the active snapshot. A
//! refresh never touches a live snapshot: it opens a new one and swaps the
//! `Arc`, so a query sees either the old or the new generation in full.

mod archive;
mod store;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::semantic::{VectorIndex, VectorStorageError};
use crate::token::VersionToken;

pub use store::ReplicaStore;

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vector storage: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("snapshot archive: {0:#}")]
    Archive(anyhow::Error),

    #[error("inconsistent replica: {0}")]
    Inconsistent(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub token: VersionToken,
    pub chunk_count: usize,
    pub model: String,
    pub dimensions: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LocalIndexReplica {
    manifest: SnapshotManifest,
    dir: PathBuf,
    index: VectorIndex,
}

impl LocalIndexReplica {
    pub fn token(&self) -> &VersionToken {
        &self.manifest.token
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Shared reference to the active replica.
///
/// Owned by the composition root. Readers clone the inner `Arc` and drop
/// the lock immediately; writers replace it.
pub struct ReplicaHandle {
    store: Arc<ReplicaStore>,
    current: RwLock<Option<Arc<LocalIndexReplica>>>,
}

impl ReplicaHandle {
    pub fn new(store: Arc<ReplicaStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    /// The active replica, opening it from disk on first use.
    ///
    /// `None` when there is no usable local replica (missing or corrupt).
    pub fn current(&self) -> Option<Arc<LocalIndexReplica>> {
        if let Some(replica) = self.read_current() {
            return Some(replica);
        }

        let loaded = self.load_from_disk()?;
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        // another thread may have installed a newer replica meanwhile
        if guard.is_none() {
            *guard = Some(Arc::new(loaded));
        }
        guard.clone()
    }

    /// Token of the active replica.
    pub fn token(&self) -> Option<VersionToken> {
        self.current().map(|replica| replica.token().clone())
    }

    /// Swap in a new replica. In-flight readers keep their old `Arc`.
    pub fn install(&self, replica: LocalIndexReplica) -> Arc<LocalIndexReplica> {
        let replica = Arc::new(replica);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(replica.clone());
        replica
    }

    /// Drop the cached replica so the next access re-opens the active one.
    pub fn invalidate(&self) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// Re-open the active replica from disk, replacing the cached one.
    pub fn reload(&self) -> Option<Arc<LocalIndexReplica>> {
        match self.load_from_disk() {
            Some(replica) => Some(self.install(replica)),
            None => {
                self.invalidate();
                None
            }
        }
    }

    fn read_current(&self) -> Option<Arc<LocalIndexReplica>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn load_from_disk(&self) -> Option<LocalIndexReplica> {
        match self.store.load_active() {
            Ok(replica) => replica,
            Err(err) => {
                log::warn!("local replica is unusable, treating it as stale: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Chunk, ChunkMetadata, SourceType};
    use crate::eid::Eid;

    fn index_with(n: usize) -> VectorIndex {
        let mut index = VectorIndex::new(2);
        for i in 1..=n {
            let content_id = Eid::from("doc");
            index
                .insert(
                    Chunk {
                        id: content_id.chunk_id(i),
                        content_id,
                        source_type: SourceType::UserNote,
                        text: format!("chunk {i}"),
                        metadata: ChunkMetadata::default(),
                    },
                    vec![1.0, i as f32],
                )
                .unwrap();
        }
        index
    }

    fn store(dir: &Path) -> Arc<ReplicaStore> {
        Arc::new(ReplicaStore::new(dir.join("replicas"), "test-model", 2).unwrap())
    }

    #[test]
    fn test_current_is_none_without_local_replica() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = ReplicaHandle::new(store(tmp.path()));
        assert!(handle.current().is_none());
        assert_eq!(handle.token(), None);
    }

    #[test]
    fn test_current_opens_committed_replica_lazily() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.commit(&index_with(3), &VersionToken::from("100")).unwrap();

        let handle = ReplicaHandle::new(store);
        let replica = handle.current().unwrap();
        assert_eq!(replica.chunk_count(), 3);
        assert_eq!(replica.token().as_str(), "100");
    }

    #[test]
    fn test_install_swaps_without_touching_old_readers() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let first = store.commit(&index_with(1), &VersionToken::from("1")).unwrap();
        let handle = ReplicaHandle::new(store.clone());
        handle.install(first);

        let reader = handle.current().unwrap();
        let second = store.commit(&index_with(2), &VersionToken::from("2")).unwrap();
        handle.install(second);

        assert_eq!(reader.chunk_count(), 1);
        assert_eq!(handle.current().unwrap().chunk_count(), 2);
    }

    #[test]
    fn test_invalidate_and_reload_pick_up_active_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let handle = ReplicaHandle::new(store.clone());
        store.commit(&index_with(1), &VersionToken::from("1")).unwrap();
        assert_eq!(handle.token().unwrap().as_str(), "1");

        store.commit(&index_with(4), &VersionToken::from("2")).unwrap();
        // still cached
        assert_eq!(handle.token().unwrap().as_str(), "1");

        handle.invalidate();
        assert_eq!(handle.token().unwrap().as_str(), "2");

        store.commit(&index_with(5), &VersionToken::from("3")).unwrap();
        assert_eq!(handle.reload().unwrap().chunk_count(), 5);

        std::fs::remove_file(tmp.path().join("replicas/active.json")).unwrap();
        assert!(handle.reload().is_none());
        assert!(handle.current().is_none());
    }

    #[test]
    fn test_corrupt_replica_reads_as_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let replica = store.commit(&index_with(2), &VersionToken::from("7")).unwrap();
        std::fs::write(replica.dir().join("vectors.bin"), b"garbage").unwrap();

        let handle = ReplicaHandle::new(store);
        assert!(handle.current().is_none());
    }
}
