use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::replica::archive::{pack_snapshot, unpack_snapshot};
use crate::replica::{LocalIndexReplica, ReplicaError, SnapshotManifest};
use crate::semantic::{model_id_hash, VectorIndex, VectorStorage};
use crate::storage::LocalFiles;
use crate::token::VersionToken;

const ACTIVE_STATE: &str = "active.json";
const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.bin";
const STAGING_PREFIX: &str = ".staging-";

/// Which replica directory is current, and the token it holds.
#[derive(Debug, Serialize, Deserialize)]
struct ActiveState {
    token: VersionToken,
    dir: String,
}

/// Replica directories under one root:
///
/// ```text
/// replicas/
///   active.json
///   gen-<token>-<id>/{manifest.json, vectors.bin}
/// ```
///
/// New generations are built in a staging directory and renamed into
/// place before `active.json` is switched to them.
pub struct ReplicaStore {
    files: LocalFiles,
    model_name: String,
    model_id: [u8; 32],
    dimensions: usize,
}

impl ReplicaStore {
    pub fn new(root: impl Into<PathBuf>, model_name: &str, dimensions: usize) -> std::io::Result<Self> {
        Ok(Self {
            files: LocalFiles::new(root)?,
            model_name: model_name.to_string(),
            model_id: model_id_hash(model_name),
            dimensions,
        })
    }

    pub fn root(&self) -> &Path {
        &self.files.base_dir
    }

    pub fn empty_index(&self) -> VectorIndex {
        VectorIndex::new(self.dimensions)
    }

    /// Token recorded in the local state file.
    pub fn active_token(&self) -> Option<VersionToken> {
        self.read_state().ok().flatten().map(|state| state.token)
    }

    /// Open the active replica. `Ok(None)` when none was ever activated.
    pub fn load_active(&self) -> Result<Option<LocalIndexReplica>, ReplicaError> {
        let Some(state) = self.read_state()? else {
            return Ok(None);
        };

        let replica = self.open_dir(&self.files.path(&state.dir)?)?;
        if replica.token() != &state.token {
            return Err(ReplicaError::Inconsistent(format!(
                "state records token {} but {} holds {}",
                state.token,
                state.dir,
                replica.token()
            )));
        }

        Ok(Some(replica))
    }

    /// Write `index` as a new generation tagged `token` and make it active.
    pub fn commit(
        &self,
        index: &VectorIndex,
        token: &VersionToken,
    ) -> Result<LocalIndexReplica, ReplicaError> {
        let staging = self.staging_dir()?;

        let result = (|| -> Result<LocalIndexReplica, ReplicaError> {
            VectorStorage::new(staging.join(VECTORS_FILE)).save(index, &self.model_id)?;

            let manifest = SnapshotManifest {
                token: token.clone(),
                chunk_count: index.len(),
                model: self.model_name.clone(),
                dimensions: self.dimensions,
                created_at: chrono::Utc::now(),
            };
            let manifest_json = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| ReplicaError::Manifest(e.to_string()))?;
            std::fs::write(staging.join(MANIFEST_FILE), manifest_json)?;

            self.open_dir(&staging)
        })();

        self.activate_staged(staging, result)
    }

    /// Install an archive unless it holds `current`, the generation already
    /// served. Returns `None` and leaves the store untouched in that case.
    pub fn install_archive(
        &self,
        archive_path: &Path,
        current: Option<&VersionToken>,
    ) -> Result<Option<LocalIndexReplica>, ReplicaError> {
        let staging = self.staging_dir()?;
        if let Err(err) = unpack_snapshot(archive_path, &staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(ReplicaError::Archive(err));
        }

        if let Some(current) = current {
            let staged = read_manifest(&staging).map(|manifest| manifest.token);
            if staged.as_ref().ok() == Some(current) {
                let _ = std::fs::remove_dir_all(&staging);
                return Ok(None);
            }
        }

        let opened = self.open_dir(&staging);
        self.activate_staged(staging, opened).map(Some)
    }

    /// Pack a replica directory into a temporary archive next to the replicas.
    pub fn pack(&self, replica: &LocalIndexReplica) -> Result<tempfile::NamedTempFile, ReplicaError> {
        let temp = self.temp_file()?;
        let mut file = pack_snapshot(replica.dir(), temp.as_file()).map_err(ReplicaError::Archive)?;
        file.flush()?;
        file.sync_all()?;
        Ok(temp)
    }

    /// Scratch file for downloads, removed on drop.
    pub fn temp_file(&self) -> std::io::Result<tempfile::NamedTempFile> {
        tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(self.root())
    }

    /// Remove every replica directory except `keep`.
    pub fn prune(&self, keep: &Path) {
        let Ok(entries) = std::fs::read_dir(self.root()) else {
            return;
        };

        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.is_dir() && path != keep {
                if let Err(err) = std::fs::remove_dir_all(&path) {
                    log::warn!("failed to remove old replica {}: {err}", path.display());
                }
            }
        }
    }

    fn open_dir(&self, dir: &Path) -> Result<LocalIndexReplica, ReplicaError> {
        let manifest = read_manifest(dir)?;

        let index = VectorStorage::new(dir.join(VECTORS_FILE)).load(&self.model_id, self.dimensions)?;
        if index.len() != manifest.chunk_count {
            return Err(ReplicaError::Inconsistent(format!(
                "manifest lists {} chunks, index holds {}",
                manifest.chunk_count,
                index.len()
            )));
        }

        Ok(LocalIndexReplica {
            manifest,
            dir: dir.to_path_buf(),
            index,
        })
    }

    fn activate_staged(
        &self,
        staging: PathBuf,
        opened: Result<LocalIndexReplica, ReplicaError>,
    ) -> Result<LocalIndexReplica, ReplicaError> {
        let mut replica = match opened {
            Ok(replica) => replica,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        let dir_name = format!("gen-{}-{}", sanitize(replica.token()), Eid::new());
        let final_dir = self.root().join(&dir_name);
        if let Err(err) = std::fs::rename(&staging, &final_dir) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(err.into());
        }
        replica.dir = final_dir;

        let state = ActiveState {
            token: replica.token().clone(),
            dir: dir_name,
        };
        let state_json =
            serde_json::to_vec(&state).map_err(|e| ReplicaError::Manifest(e.to_string()))?;
        if let Err(err) = self.files.write(ACTIVE_STATE, &state_json) {
            let _ = std::fs::remove_dir_all(&replica.dir);
            return Err(err.into());
        }

        self.prune(&replica.dir);
        Ok(replica)
    }

    fn read_state(&self) -> Result<Option<ActiveState>, ReplicaError> {
        if !self.files.exists(ACTIVE_STATE) {
            return Ok(None);
        }
        let raw = self.files.read(ACTIVE_STATE)?;
        let state = serde_json::from_slice(&raw)
            .map_err(|e| ReplicaError::Inconsistent(format!("unreadable {ACTIVE_STATE}: {e}")))?;
        Ok(Some(state))
    }

    fn staging_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.root().join(format!("{STAGING_PREFIX}{}", Eid::new()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn read_manifest(dir: &Path) -> Result<SnapshotManifest, ReplicaError> {
    let raw = std::fs::read(dir.join(MANIFEST_FILE))?;
    serde_json::from_slice(&raw).map_err(|e| ReplicaError::Manifest(e.to_string()))
}

fn sanitize(token: &VersionToken) -> String {
    token
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(40)
        .collect()
}
