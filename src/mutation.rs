//! Write path for user content.
//!
//! A mutation runs in this order:
//! 1. embed (add only), then refresh to the newest generation
//! 2. update local records and summary
//! 3. commit a new local generation
//! 4. mirror records to the remote
//! 5. upload the snapshot, bounded by the upload timeout
//! 6. bump the version marker and refresh
//!
//! Steps after the local commit are best effort. Failures there are logged
//! and reported through `convergence_lagging`, never rolled back.

use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::content::{Chunk, ChunkDraft, ContentMetadata, SourceType};
use crate::eid::Eid;
use crate::records::{RecordError, RecordStore, SummaryItem};
use crate::remote::{RemoteError, RemoteStore, SNAPSHOT_PATH};
use crate::replica::{LocalIndexReplica, ReplicaError};
use crate::semantic::{embed_texts, EmbeddingClient, EmbeddingError, IndexError};
use crate::sync::{Publisher, ReplicaSynchronizer, SyncOutcome};
use crate::token::VersionToken;

static CONTENT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").expect("valid content id pattern"));

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("{0}")]
    InvalidContent(String),

    #[error("content not found: {0}")]
    NotFound(String),

    #[error("cannot delete primary corpus content")]
    Protected,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index update failed: {0}")]
    Index(#[from] IndexError),

    #[error("replica commit failed: {0}")]
    Replica(#[from] ReplicaError),

    #[error("record storage failed: {0}")]
    Records(#[from] RecordError),

    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct MutationStatus {
    pub status: Status,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<Eid>,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<VersionToken>,
    /// Other replicas may keep serving the previous generation for a while.
    pub convergence_lagging: bool,
}

impl MutationStatus {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            content_id: None,
            chunks: 0,
            token: None,
            convergence_lagging: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// One change to the shared corpus.
#[derive(Debug)]
pub enum Mutation {
    Add {
        source_type: SourceType,
        chunks: Vec<ChunkDraft>,
        metadata: ContentMetadata,
    },
    Delete {
        content_id: Eid,
        source_type: SourceType,
    },
}

/// What the tail of a mutation achieved.
struct Published {
    token: VersionToken,
    lagging: bool,
}

pub struct MutationCoordinator {
    sync: Arc<ReplicaSynchronizer>,
    embedder: Arc<dyn EmbeddingClient>,
    records: RecordStore,
    /// Newest snapshot this process uploaded. Held for the whole transfer,
    /// so snapshot uploads run one at a time in token order.
    uploaded: Arc<Mutex<Option<VersionToken>>>,
    upload_timeout: Duration,
    batch_size: usize,
    max_input_chars: usize,
}

impl MutationCoordinator {
    pub fn new(
        sync: Arc<ReplicaSynchronizer>,
        embedder: Arc<dyn EmbeddingClient>,
        records: RecordStore,
        upload_timeout: Duration,
        batch_size: usize,
        max_input_chars: usize,
    ) -> Self {
        Self {
            sync,
            embedder,
            records,
            uploaded: Arc::new(Mutex::new(None)),
            upload_timeout,
            batch_size,
            max_input_chars,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn apply(&self, mutation: Mutation) -> MutationStatus {
        match mutation {
            Mutation::Add {
                source_type,
                chunks,
                metadata,
            } => self.add_content(source_type, chunks, metadata),
            Mutation::Delete {
                content_id,
                source_type,
            } => self.delete_content(&content_id, source_type),
        }
    }

    pub fn add_content(
        &self,
        source_type: SourceType,
        chunks: Vec<ChunkDraft>,
        metadata: ContentMetadata,
    ) -> MutationStatus {
        self.try_add(source_type, chunks, metadata)
            .unwrap_or_else(|err| {
                log::error!("add {source_type} failed: {err}");
                MutationStatus::error(err.to_string())
            })
    }

    pub fn delete_content(&self, content_id: &Eid, source_type: SourceType) -> MutationStatus {
        self.try_delete(content_id, source_type)
            .unwrap_or_else(|err| {
                log::error!("delete {content_id} failed: {err}");
                MutationStatus::error(err.to_string())
            })
    }

    /// Index new content, or regenerate the chunks of an existing content id.
    pub fn try_add(
        &self,
        source_type: SourceType,
        drafts: Vec<ChunkDraft>,
        metadata: ContentMetadata,
    ) -> Result<MutationStatus, MutationError> {
        let content_id = match &metadata.content_id {
            Some(id) => validate_content_id(id)?,
            None => Eid::with_prefix(source_type.as_str()),
        };
        let chunks = build_chunks(&content_id, source_type, drafts, &metadata)?;

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = embed_texts(
            self.embedder.as_ref(),
            &texts,
            self.batch_size,
            self.max_input_chars,
        )?;

        let publisher = self.sync.begin_publish();
        log_refresh("before add", &publisher.refresh());

        let previous_raw = self
            .records
            .load_summary(source_type)?
            .find(&content_id)
            .and_then(|item| item.filename.as_deref())
            .and_then(|filename| RecordStore::raw_path(source_type, &content_id, filename).ok());

        let raw = match &metadata.raw_file {
            Some(path) => {
                let filename = raw_filename(&metadata, path)?;
                let (ident, size) = self
                    .records
                    .store_raw(source_type, &content_id, path, &filename)?;
                Some((filename, ident, size))
            }
            None => None,
        };
        // a re-add under another extension, or without a file, drops the old one
        let stale_raw =
            previous_raw.filter(|old| raw.as_ref().map_or(true, |(_, ident, _)| ident != old));
        if let Some(old) = &stale_raw {
            match self.records.files().delete(old) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(RecordError::from(err).into()),
            }
        }

        let stale_records = self.records.remove_chunks(source_type, &content_id)?;
        let chunk_records = self.records.save_chunks(&chunks)?;
        self.records.upsert_summary(
            source_type,
            SummaryItem {
                content_id: content_id.clone(),
                title: metadata.title.trim().to_string(),
                filename: raw
                    .as_ref()
                    .map(|(filename, _, _)| filename.clone())
                    .or_else(|| metadata.filename.clone()),
                created_at: Utc::now(),
                chunks: chunks.len(),
                file_size: raw.as_ref().map(|(_, _, size)| *size).unwrap_or(0),
                tags: metadata.tags.clone(),
            },
        )?;

        let mut index = publisher.working_copy();
        let replaced = index.remove_content(&content_id);
        let count = chunks.len();
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            index.insert(chunk, embedding)?;
        }

        let token = self.next_token(&publisher);
        let replica = publisher.commit(&index, &token)?;
        log::info!(
            "added {count} chunks for {content_id} (replaced {}), local generation {token}",
            replaced.len()
        );

        let mut mirrored = true;
        if let Some(old) = &stale_raw {
            mirrored &= self.mirror_delete(old);
        }
        if let Some((_, ident, _)) = &raw {
            mirrored &= self.mirror_upload(ident);
        }
        for ident in stale_records.iter().filter(|old| !chunk_records.contains(old)) {
            mirrored &= self.mirror_delete(ident);
        }
        for ident in &chunk_records {
            mirrored &= self.mirror_upload(ident);
        }
        mirrored &= self.mirror_upload(&RecordStore::summary_path(source_type));

        let published = self.publish(&publisher, &replica, token);

        Ok(MutationStatus {
            status: Status::Success,
            message: status_message(
                format!("Added {count} chunks for {:?}", metadata.title.trim()),
                mirrored,
                published.lagging,
            ),
            content_id: Some(content_id),
            chunks: count,
            token: Some(published.token),
            convergence_lagging: published.lagging || !mirrored,
        })
    }

    /// Remove every chunk, record and raw file of one content id.
    pub fn try_delete(
        &self,
        content_id: &Eid,
        source_type: SourceType,
    ) -> Result<MutationStatus, MutationError> {
        if source_type == SourceType::Primary {
            return Err(MutationError::Protected);
        }
        let content_id = validate_content_id(content_id)?;

        let publisher = self.sync.begin_publish();
        log_refresh("before delete", &publisher.refresh());

        let mut index = publisher.working_copy();
        let indexed = index.chunk_ids_for(&content_id);
        if let Some(other) = indexed
            .first()
            .and_then(|id| index.get(id))
            .map(|entry| entry.chunk.source_type)
            .filter(|kind| *kind != source_type)
        {
            return Err(MutationError::NotFound(format!(
                "{content_id} is {other}, not {source_type}"
            )));
        }

        let local_records = self.records.chunk_files(source_type, &content_id);
        if indexed.is_empty() && local_records.is_empty() {
            return Err(MutationError::NotFound(content_id.to_string()));
        }

        let (_, item) = self.records.remove_from_summary(source_type, &content_id)?;
        let filename = item.and_then(|item| item.filename);
        if let Some(filename) = &filename {
            self.records.remove_raw(source_type, &content_id, filename)?;
        }
        self.records.remove_chunks(source_type, &content_id)?;

        let removed = index.remove_content(&content_id);
        let token = self.next_token(&publisher);
        let replica = publisher.commit(&index, &token)?;
        log::info!(
            "removed {} chunks of {content_id}, local generation {token}",
            removed.len()
        );

        let mut mirrored = true;
        if let Some(filename) = &filename {
            match RecordStore::raw_path(source_type, &content_id, filename) {
                Ok(ident) => mirrored &= self.mirror_delete(&ident),
                Err(err) => log::warn!("skipping remote raw file removal: {err}"),
            }
        }
        match self
            .sync
            .remote()
            .list(&RecordStore::chunk_prefix(source_type, &content_id))
        {
            Ok(idents) => {
                for ident in idents
                    .iter()
                    .filter(|ident| RecordStore::is_chunk_record(source_type, &content_id, ident))
                {
                    mirrored &= self.mirror_delete(ident);
                }
            }
            Err(err) => {
                log::warn!("failed to list remote chunk records of {content_id}: {err}");
                mirrored = false;
            }
        }
        mirrored &= self.mirror_upload(&RecordStore::summary_path(source_type));

        let published = self.publish(&publisher, &replica, token);

        Ok(MutationStatus {
            status: Status::Success,
            message: status_message(
                format!("Deleted {} chunks of {content_id}", removed.len()),
                mirrored,
                published.lagging,
            ),
            content_id: Some(content_id),
            chunks: removed.len(),
            token: Some(published.token),
            convergence_lagging: published.lagging || !mirrored,
        })
    }

    /// A token newer than both the remote marker and the local generation.
    fn next_token(&self, publisher: &Publisher<'_>) -> VersionToken {
        let marker = self.sync.remote().read_marker().unwrap_or_else(|err| {
            log::warn!("version marker unreadable, issuing token from local state: {err}");
            None
        });
        let local = publisher.current().map(|replica| replica.token().clone());

        let newest = [marker, local]
            .into_iter()
            .flatten()
            .max_by_key(VersionToken::sequence);
        VersionToken::next_after(newest.as_ref())
    }

    /// Upload the snapshot, bump the marker and refresh.
    fn publish(
        &self,
        publisher: &Publisher<'_>,
        replica: &LocalIndexReplica,
        token: VersionToken,
    ) -> Published {
        let mut lagging = !self.upload_snapshot(replica);

        if let Err(err) = self.sync.remote().write_marker(&token) {
            log::warn!("failed to bump version marker to {token}: {err}");
            return Published {
                token,
                lagging: true,
            };
        }

        match publisher.refresh() {
            SyncOutcome::UpToDate { .. } => {}
            outcome => {
                log::warn!("refresh after publishing {token} returned {outcome:?}");
                lagging = true;
            }
        }

        let token = publisher
            .current()
            .map(|replica| replica.token().clone())
            .unwrap_or(token);
        Published { token, lagging }
    }

    /// Upload on a worker thread and wait at most the upload timeout. A slow
    /// upload keeps running after the wait gives up; later uploads queue
    /// behind it and skip themselves once something newer has landed.
    fn upload_snapshot(&self, replica: &LocalIndexReplica) -> bool {
        let archive = match self.sync.handle().store().pack(replica) {
            Ok(archive) => archive,
            Err(err) => {
                log::warn!("failed to pack snapshot {}: {err}", replica.token());
                return false;
            }
        };

        let remote = self.sync.remote().clone();
        let uploaded = self.uploaded.clone();
        let token = replica.token().clone();
        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut newest = uploaded.lock().unwrap_or_else(|e| e.into_inner());
            let _ = done_tx.send(upload_unless_superseded(
                remote.as_ref(),
                archive.path(),
                &token,
                &mut newest,
            ));
        });

        match done_rx.recv_timeout(self.upload_timeout) {
            Ok(uploaded) => uploaded,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "snapshot upload still running after {:?}, other replicas may lag",
                    self.upload_timeout
                );
                false
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("snapshot upload worker exited without a result");
                false
            }
        }
    }

    fn mirror_upload(&self, ident: &str) -> bool {
        let uploaded = self
            .records
            .files()
            .path(ident)
            .map_err(RemoteError::from)
            .and_then(|local| self.sync.remote().upload(&local, ident));
        match uploaded {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to mirror {ident}: {err}");
                false
            }
        }
    }

    fn mirror_delete(&self, ident: &str) -> bool {
        match self.sync.remote().delete(ident) {
            Ok(()) | Err(RemoteError::NotFound(_)) => true,
            Err(err) => {
                log::warn!("failed to delete remote {ident}: {err}");
                false
            }
        }
    }
}

/// Upload the snapshot of `token` unless a newer one already landed or the
/// remote marker has moved past it. Returns false only when the upload failed.
fn upload_unless_superseded(
    remote: &dyn RemoteStore,
    archive: &Path,
    token: &VersionToken,
    newest: &mut Option<VersionToken>,
) -> bool {
    let marker = remote.read_marker().ok().flatten();
    if let Some(newer) = [newest.as_ref(), marker.as_ref()]
        .into_iter()
        .flatten()
        .find(|newer| newer.is_newer_than(token))
    {
        log::info!("snapshot {token} superseded by {newer}, skipping upload");
        return true;
    }

    match remote.upload(archive, SNAPSHOT_PATH) {
        Ok(()) => {
            log::debug!("snapshot {token} uploaded");
            *newest = Some(token.clone());
            true
        }
        Err(err) => {
            log::warn!("snapshot {token} upload failed: {err}");
            false
        }
    }
}

fn validate_content_id(content_id: &Eid) -> Result<Eid, MutationError> {
    if CONTENT_ID.is_match(content_id) {
        Ok(content_id.clone())
    } else {
        Err(MutationError::InvalidContent(format!(
            "invalid content id {:?}: use letters, digits, '.', '_' or '-'",
            content_id.as_str()
        )))
    }
}

fn build_chunks(
    content_id: &Eid,
    source_type: SourceType,
    drafts: Vec<ChunkDraft>,
    metadata: &ContentMetadata,
) -> Result<Vec<Chunk>, MutationError> {
    let title = metadata.title.trim();
    if title.is_empty() {
        return Err(MutationError::InvalidContent("title must not be empty".to_string()));
    }

    let chunks: Vec<Chunk> = drafts
        .into_iter()
        .filter(|draft| !draft.text.trim().is_empty())
        .enumerate()
        .map(|(idx, draft)| {
            let mut chunk_metadata = draft.metadata;
            if chunk_metadata.title.trim().is_empty() {
                chunk_metadata.title = title.to_string();
            }
            if chunk_metadata.filename.is_none() {
                chunk_metadata.filename = metadata.filename.clone();
            }
            Chunk {
                id: content_id.chunk_id(idx + 1),
                content_id: content_id.clone(),
                source_type,
                text: draft.text,
                metadata: chunk_metadata,
            }
        })
        .collect();

    if chunks.is_empty() {
        return Err(MutationError::InvalidContent("no chunk has any text".to_string()));
    }
    Ok(chunks)
}

fn raw_filename(metadata: &ContentMetadata, path: &Path) -> Result<String, MutationError> {
    metadata
        .filename
        .clone()
        .or_else(|| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.to_string())
        })
        .ok_or_else(|| {
            MutationError::InvalidContent(format!("no filename for {}", path.display()))
        })
}

fn status_message(summary: String, mirrored: bool, lagging: bool) -> String {
    match (mirrored, lagging) {
        (true, false) => summary,
        (false, _) => format!("{summary}; some records were not mirrored, other replicas may lag"),
        (true, true) => format!("{summary}; index upload incomplete, other replicas may lag"),
    }
}

fn log_refresh(stage: &str, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Failed { reason } => log::warn!("refresh {stage} failed: {reason}"),
        outcome => log::debug!("refresh {stage}: {outcome:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ChunkMetadata;

    fn draft(text: &str) -> ChunkDraft {
        ChunkDraft {
            text: text.to_string(),
            metadata: ChunkMetadata::default(),
        }
    }

    #[test]
    fn test_content_id_pattern() {
        assert!(validate_content_id(&Eid::from("user_note_01hx.v2-a")).is_ok());
        assert!(validate_content_id(&Eid::from("../etc")).is_err());
        assert!(validate_content_id(&Eid::from("a/b")).is_err());
        assert!(validate_content_id(&Eid::from("")).is_err());
    }

    #[test]
    fn test_build_chunks_numbers_and_inherits_title() {
        let metadata = ContentMetadata {
            title: " Ward round ".to_string(),
            filename: Some("round.txt".to_string()),
            ..Default::default()
        };
        let mut titled = draft("second");
        titled.metadata.title = "Own title".to_string();

        let chunks = build_chunks(
            &Eid::from("n1"),
            SourceType::UserNote,
            vec![draft("first"), draft("   "), titled],
            &metadata,
        )
        .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "n1_chunk1");
        assert_eq!(chunks[1].id, "n1_chunk2");
        assert_eq!(chunks[0].metadata.title, "Ward round");
        assert_eq!(chunks[1].metadata.title, "Own title");
        assert_eq!(chunks[0].metadata.filename.as_deref(), Some("round.txt"));
    }

    #[test]
    fn test_build_chunks_rejects_empty_input() {
        let metadata = ContentMetadata {
            title: "t".to_string(),
            ..Default::default()
        };
        assert!(build_chunks(&Eid::from("n"), SourceType::UserNote, vec![draft(" ")], &metadata).is_err());

        let untitled = ContentMetadata::default();
        assert!(build_chunks(&Eid::from("n"), SourceType::UserNote, vec![draft("x")], &untitled).is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_value(MutationStatus::error("boom")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "boom");
        assert!(json.get("token").is_none());
    }
}
