//! Scenario tests over real directories: a shared directory remote and one
//! base directory per simulated replica.

mod mutation;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::App;
use crate::config::Config;
use crate::content::{Chunk, ChunkDraft, ChunkMetadata, ContentMetadata, SourceType};
use crate::eid::Eid;
use crate::remote::{DirectoryStore, RemoteError, RemoteStore, SNAPSHOT_PATH};
use crate::replica::ReplicaStore;
use crate::semantic::{EmbeddingClient, EmbeddingError, VectorIndex};
use crate::token::VersionToken;

pub const DIMS: usize = 64;
pub const MODEL: &str = "hash-test";

/// Deterministic embedder: hashed bag of words, normalized. Exact texts can
/// be pinned to chosen vectors.
pub struct HashEmbedder {
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    failing: AtomicBool,
}

impl HashEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pinned: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        self.pinned.lock().unwrap().insert(text.to_string(), vector);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl EmbeddingClient for HashEmbedder {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::EmbeddingFailed("service unavailable".to_string()));
        }
        let pinned = self.pinned.lock().unwrap();
        Ok(texts
            .iter()
            .map(|text| pinned.get(text).cloned().unwrap_or_else(|| hash_vector(text)))
            .collect())
    }
}

pub fn hash_vector(text: &str) -> Vec<f32> {
    use sha2::{Digest, Sha256};

    let mut vector = vec![0.0f32; DIMS];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let digest = Sha256::digest(word.as_bytes());
        let bucket = u16::from_le_bytes([digest[0], digest[1]]) as usize % DIMS;
        let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
    if vector.iter().all(|v| *v == 0.0) {
        vector[0] = 1.0;
    }
    normalize(vector)
}

pub fn normalize(vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    vector.into_iter().map(|v| v / norm).collect()
}

/// Unit vector along `axis`.
pub fn axis(axis: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMS];
    vector[axis] = 1.0;
    vector
}

/// Unit vector between two axes, `weight` towards `a`.
pub fn blend(a: usize, b: usize, weight: f32) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMS];
    vector[a] = weight;
    vector[b] = 1.0 - weight;
    normalize(vector)
}

/// Directory remote with switchable faults.
pub struct FlakyStore {
    inner: DirectoryStore,
    fail_downloads: AtomicBool,
    fail_marker_reads: AtomicBool,
    fail_marker_writes: AtomicBool,
    snapshot_delay_ms: AtomicU64,
    next_snapshot_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: DirectoryStore::new(root).unwrap(),
            fail_downloads: AtomicBool::new(false),
            fail_marker_reads: AtomicBool::new(false),
            fail_marker_writes: AtomicBool::new(false),
            snapshot_delay_ms: AtomicU64::new(0),
            next_snapshot_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_marker_reads(&self, fail: bool) {
        self.fail_marker_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_marker_writes(&self, fail: bool) {
        self.fail_marker_writes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_snapshot_uploads(&self, delay: Duration) {
        self.snapshot_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Slow down only the next snapshot upload.
    pub fn delay_next_snapshot_upload(&self, delay: Duration) {
        self.next_snapshot_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn dropped(path: &str) -> RemoteError {
        RemoteError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            format!("connection reset while transferring {path}"),
        ))
    }
}

impl RemoteStore for FlakyStore {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        if remote_path == SNAPSHOT_PATH {
            let delay = self.snapshot_delay_ms.load(Ordering::SeqCst)
                + self.next_snapshot_delay_ms.swap(0, Ordering::SeqCst);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }
        }
        self.inner.upload(local_path, remote_path)
    }

    fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            // leave a truncated file behind, like a dropped connection would
            std::fs::write(local_path, b"\x1f\x8b\x08\x00partial").map_err(RemoteError::Io)?;
            return Err(Self::dropped(remote_path));
        }
        self.inner.download(remote_path, local_path)
    }

    fn delete(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.inner.delete(remote_path)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        self.inner.list(prefix)
    }

    fn read_marker(&self) -> Result<Option<VersionToken>, RemoteError> {
        if self.fail_marker_reads.load(Ordering::SeqCst) {
            return Err(Self::dropped("version.txt"));
        }
        self.inner.read_marker()
    }

    fn write_marker(&self, token: &VersionToken) -> Result<(), RemoteError> {
        if self.fail_marker_writes.load(Ordering::SeqCst) {
            return Err(Self::dropped("version.txt"));
        }
        self.inner.write_marker(token)
    }
}

/// One simulated replica with its own base directory.
pub struct Node {
    pub app: App,
    pub embedder: Arc<HashEmbedder>,
    pub dir: tempfile::TempDir,
}

pub struct NodeOptions<'a> {
    pub check_interval: Duration,
    pub upload_timeout_secs: u64,
    pub hierarchy: Option<&'a str>,
    pub embedder: Option<Arc<HashEmbedder>>,
}

impl Default for NodeOptions<'_> {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            upload_timeout_secs: 90,
            hierarchy: None,
            embedder: None,
        }
    }
}

pub fn node(remote: Arc<dyn RemoteStore>, options: NodeOptions<'_>) -> Node {
    let dir = tempfile::tempdir().unwrap();
    if let Some(hierarchy) = options.hierarchy {
        std::fs::write(dir.path().join("complete_hierarchy.json"), hierarchy).unwrap();
    }

    let mut config = Config::load_with(dir.path()).unwrap();
    config.sync.check_interval_ms = options.check_interval.as_millis() as u64;
    config.sync.upload_timeout_secs = options.upload_timeout_secs;

    let embedder = options.embedder.unwrap_or_else(HashEmbedder::new);
    let app = App::with_components(config, remote, embedder.clone()).unwrap();
    Node { app, embedder, dir }
}

pub fn chunk(content_id: &str, n: usize, source_type: SourceType, text: &str) -> Chunk {
    let content_id = Eid::from(content_id);
    Chunk {
        id: content_id.chunk_id(n),
        content_id,
        source_type,
        text: text.to_string(),
        metadata: ChunkMetadata {
            title: format!("{text} title"),
            ..Default::default()
        },
    }
}

/// Publish `entries` as the remote generation `token`, the way a writer would.
pub fn seed_remote(remote: &dyn RemoteStore, entries: Vec<(Chunk, Vec<f32>)>, token: &str) {
    let scratch = tempfile::tempdir().unwrap();
    let store = ReplicaStore::new(scratch.path(), MODEL, DIMS).unwrap();

    let mut index = VectorIndex::new(DIMS);
    for (chunk, vector) in entries {
        index.insert(chunk, vector).unwrap();
    }

    let replica = store.commit(&index, &VersionToken::from(token)).unwrap();
    let archive = store.pack(&replica).unwrap();
    remote.upload(archive.path(), SNAPSHOT_PATH).unwrap();
    remote.write_marker(&VersionToken::from(token)).unwrap();
}

/// Ten primary corpus chunks, one per axis.
pub fn ten_primary_chunks() -> Vec<(Chunk, Vec<f32>)> {
    (1..=10)
        .map(|n| {
            let text = format!("reference topic {n}");
            (
                chunk(&format!("part1_ch{n}_topic"), 1, SourceType::Primary, &text),
                axis(10 + n),
            )
        })
        .collect()
}

pub fn drafts(texts: &[&str]) -> Vec<ChunkDraft> {
    texts
        .iter()
        .map(|text| ChunkDraft {
            text: text.to_string(),
            metadata: ChunkMetadata::default(),
        })
        .collect()
}

pub fn note(title: &str) -> ContentMetadata {
    ContentMetadata {
        title: title.to_string(),
        ..Default::default()
    }
}
