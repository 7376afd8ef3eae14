//! Chunk records, raw files and per-type summaries on local disk.
//!
//! The layout matches the remote one, so every ident returned here can be
//! mirrored to the remote store as is.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{Chunk, SourceType};
use crate::eid::Eid;
use crate::storage::LocalFiles;

const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub content_id: Eid,
    pub title: String,
    #[serde(default)]
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub chunks: usize,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Aggregate of everything stored for one source type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub content_type: SourceType,
    pub total_items: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub items: Vec<SummaryItem>,
}

impl Summary {
    pub fn empty(content_type: SourceType) -> Self {
        Self {
            content_type,
            total_items: 0,
            total_chunks: 0,
            items: vec![],
        }
    }

    pub fn find(&self, content_id: &str) -> Option<&SummaryItem> {
        self.items
            .iter()
            .find(|item| item.content_id.as_str() == content_id)
    }

    fn recount(&mut self) {
        self.total_items = self.items.len();
        self.total_chunks = self.items.iter().map(|item| item.chunks).sum();
    }
}

#[derive(Clone, Debug)]
pub struct RecordStore {
    files: LocalFiles,
}

impl RecordStore {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        Ok(Self {
            files: LocalFiles::new(base_dir)?,
        })
    }

    pub fn files(&self) -> &LocalFiles {
        &self.files
    }

    pub fn chunk_path(chunk: &Chunk) -> String {
        format!("{}/{}.json", chunk.source_type.chunks_dir(), chunk.id)
    }

    pub fn summary_path(kind: SourceType) -> String {
        format!("{}/{SUMMARY_FILE}", kind.chunks_dir())
    }

    /// Raw files are named after their content id and keep the extension
    /// of the uploaded filename.
    pub fn raw_path(kind: SourceType, content_id: &Eid, filename: &str) -> Result<String, RecordError> {
        let filename = clean_filename(filename)?;
        Ok(match Path::new(&filename).extension().and_then(|ext| ext.to_str()) {
            Some(ext) => format!("{}/{content_id}.{ext}", kind.content_dir()),
            None => format!("{}/{content_id}", kind.content_dir()),
        })
    }

    /// Prefix shared by every chunk record of one content id. Listings under
    /// it must still go through [`RecordStore::is_chunk_record`].
    pub fn chunk_prefix(kind: SourceType, content_id: &Eid) -> String {
        format!("{}/{}", kind.chunks_dir(), content_id.chunk_prefix())
    }

    /// Whether `ident` is a chunk record of exactly `content_id`.
    pub fn is_chunk_record(kind: SourceType, content_id: &Eid, ident: &str) -> bool {
        ident
            .strip_prefix(kind.chunks_dir())
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|name| name.strip_suffix(".json"))
            .is_some_and(|chunk_id| content_id.owns_chunk_id(chunk_id))
    }

    /// Write one JSON file per chunk. Returns the idents written.
    pub fn save_chunks(&self, chunks: &[Chunk]) -> Result<Vec<String>, RecordError> {
        let mut written = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let ident = Self::chunk_path(chunk);
            self.files.write(&ident, &serde_json::to_vec_pretty(chunk)?)?;
            written.push(ident);
        }
        Ok(written)
    }

    pub fn chunk_files(&self, kind: SourceType, content_id: &Eid) -> Vec<String> {
        self.files
            .list(&Self::chunk_prefix(kind, content_id))
            .into_iter()
            .filter(|ident| Self::is_chunk_record(kind, content_id, ident))
            .collect()
    }

    pub fn load_chunks(&self, kind: SourceType, content_id: &Eid) -> Result<Vec<Chunk>, RecordError> {
        let mut chunks = vec![];
        for ident in self.chunk_files(kind, content_id) {
            chunks.push(serde_json::from_slice::<Chunk>(&self.files.read(&ident)?)?);
        }
        chunks.sort_by_key(|chunk| chunk.ordinal());
        Ok(chunks)
    }

    /// Delete the chunk records of one content id. Returns the idents removed.
    pub fn remove_chunks(&self, kind: SourceType, content_id: &Eid) -> Result<Vec<String>, RecordError> {
        let idents = self.chunk_files(kind, content_id);
        for ident in &idents {
            self.files.delete(ident)?;
        }
        Ok(idents)
    }

    /// The summary for `kind`, empty when none was written yet.
    pub fn load_summary(&self, kind: SourceType) -> Result<Summary, RecordError> {
        let ident = Self::summary_path(kind);
        if !self.files.exists(&ident) {
            return Ok(Summary::empty(kind));
        }
        Ok(serde_json::from_slice(&self.files.read(&ident)?)?)
    }

    /// Insert or replace the entry for `item.content_id`.
    pub fn upsert_summary(&self, kind: SourceType, item: SummaryItem) -> Result<Summary, RecordError> {
        let mut summary = self.load_summary(kind)?;
        summary.items.retain(|existing| existing.content_id != item.content_id);
        summary.items.push(item);
        self.save_summary(&mut summary)?;
        Ok(summary)
    }

    /// Drop the entry for `content_id`, returning the updated summary and the removed entry.
    pub fn remove_from_summary(
        &self,
        kind: SourceType,
        content_id: &Eid,
    ) -> Result<(Summary, Option<SummaryItem>), RecordError> {
        let mut summary = self.load_summary(kind)?;
        let position = summary
            .items
            .iter()
            .position(|item| &item.content_id == content_id);
        let removed = position.map(|idx| summary.items.remove(idx));
        self.save_summary(&mut summary)?;
        Ok((summary, removed))
    }

    /// Copy a raw content file into the tree. Returns its ident and size.
    pub fn store_raw(
        &self,
        kind: SourceType,
        content_id: &Eid,
        source: &Path,
        filename: &str,
    ) -> Result<(String, u64), RecordError> {
        let ident = Self::raw_path(kind, content_id, filename)?;
        let size = self.files.copy_in(source, &ident)?;
        Ok((ident, size))
    }

    /// Remove a raw file if present. Returns the ident when something was deleted.
    pub fn remove_raw(
        &self,
        kind: SourceType,
        content_id: &Eid,
        filename: &str,
    ) -> Result<Option<String>, RecordError> {
        let ident = Self::raw_path(kind, content_id, filename)?;
        match self.files.delete(&ident) {
            Ok(()) => Ok(Some(ident)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save_summary(&self, summary: &mut Summary) -> Result<(), RecordError> {
        summary.recount();
        let ident = Self::summary_path(summary.content_type);
        self.files.write(&ident, &serde_json::to_vec_pretty(summary)?)?;
        Ok(())
    }
}

/// Last path component of a user supplied filename.
fn clean_filename(filename: &str) -> Result<String, RecordError> {
    Path::new(filename.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.starts_with('.'))
        .map(|name| name.to_string())
        .ok_or_else(|| RecordError::InvalidFilename(filename.to_string()))
}
