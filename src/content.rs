//! Chunks, content sources and the per-type storage layout.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::eid::Eid;

/// Characters of chunk text used for a preview when none is supplied.
const PREVIEW_CHARS: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Primary,
    IndependentDocument,
    UserNote,
    UserImage,
    UserDrawing,
    UserAudio,
}

impl SourceType {
    pub const ALL: [SourceType; 6] = [
        SourceType::Primary,
        SourceType::IndependentDocument,
        SourceType::UserNote,
        SourceType::UserImage,
        SourceType::UserDrawing,
        SourceType::UserAudio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Primary => "primary",
            SourceType::IndependentDocument => "independent_document",
            SourceType::UserNote => "user_note",
            SourceType::UserImage => "user_image",
            SourceType::UserDrawing => "user_drawing",
            SourceType::UserAudio => "user_audio",
        }
    }

    /// Directory holding raw content files, relative to the store root.
    pub fn content_dir(&self) -> &'static str {
        match self {
            SourceType::Primary => "processed/primary",
            SourceType::IndependentDocument => "independent_pdfs",
            SourceType::UserNote => "processed/user_notes",
            SourceType::UserImage => "processed/user_images",
            SourceType::UserDrawing => "processed/user_drawings",
            SourceType::UserAudio => "processed/user_audio",
        }
    }

    /// Directory holding chunk records and the summary file.
    pub fn chunks_dir(&self) -> &'static str {
        match self {
            SourceType::Primary => "processed/chunks",
            SourceType::IndependentDocument => "processed/independent_chunks",
            SourceType::UserNote => "processed/user_notes_chunks",
            SourceType::UserImage => "processed/user_images_chunks",
            SourceType::UserDrawing => "processed/user_drawings_chunks",
            SourceType::UserAudio => "processed/user_audio_chunks",
        }
    }

    pub fn is_user_content(&self) -> bool {
        matches!(
            self,
            SourceType::UserNote
                | SourceType::UserImage
                | SourceType::UserDrawing
                | SourceType::UserAudio
        )
    }

    /// Display group for user content labels.
    pub fn collection_label(&self) -> &'static str {
        match self {
            SourceType::Primary => "Reference",
            SourceType::IndependentDocument => "Documents",
            SourceType::UserNote => "My Notes",
            SourceType::UserImage => "My Images",
            SourceType::UserDrawing => "My Drawings",
            SourceType::UserAudio => "My Audio",
        }
    }
}

impl Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        SourceType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .or(match normalized.as_str() {
                "note" => Some(SourceType::UserNote),
                "image" => Some(SourceType::UserImage),
                "drawing" => Some(SourceType::UserDrawing),
                "audio" => Some(SourceType::UserAudio),
                "document" | "independent" => Some(SourceType::IndependentDocument),
                _ => None,
            })
            .ok_or_else(|| format!("unknown source type: {s}"))
    }
}

/// Metadata attached to every chunk. Page fields are only present for
/// page-backed sources.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_page: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_page: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,

    /// Structural id in the primary corpus, e.g. `part4_ch81_cancer_of_the_skin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,

    /// Comma separated table references.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub has_tables: String,

    /// Comma separated figure references.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub has_figures: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    pub fn table_refs(&self) -> Vec<String> {
        split_refs(&self.has_tables)
    }

    pub fn figure_refs(&self) -> Vec<String> {
        split_refs(&self.has_figures)
    }

    pub fn page_range(&self) -> Option<String> {
        match (self.start_page, self.end_page) {
            (Some(start), Some(end)) if start != end => Some(format!("{start}-{end}")),
            (Some(start), _) => Some(start.to_string()),
            (None, Some(end)) => Some(end.to_string()),
            (None, None) => None,
        }
    }
}

fn split_refs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Smallest indexed unit. The embedding lives next to it in the index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content_id: Eid,
    pub source_type: SourceType,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn title(&self) -> &str {
        if self.metadata.title.is_empty() {
            self.metadata.topic_name.as_deref().unwrap_or("Untitled")
        } else {
            &self.metadata.title
        }
    }

    pub fn preview(&self) -> String {
        match &self.metadata.preview {
            Some(preview) if !preview.trim().is_empty() => preview.clone(),
            _ => {
                let text = self.text.trim();
                if text.chars().count() <= PREVIEW_CHARS {
                    text.to_string()
                } else {
                    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
                    format!("{}...", cut.trim_end())
                }
            }
        }
    }

    /// 1-based position parsed from the `_chunk{n}` suffix.
    pub fn ordinal(&self) -> usize {
        self.id
            .rsplit_once("_chunk")
            .and_then(|(_, n)| n.parse().ok())
            .unwrap_or(0)
    }
}

/// A chunk as produced by the external chunker, before ids are assigned.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub text: String,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

/// Content-level metadata supplied with an add.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContentMetadata {
    /// Reuse an id to regenerate the chunks of existing content.
    #[serde(default)]
    pub content_id: Option<Eid>,

    pub title: String,

    #[serde(default)]
    pub filename: Option<String>,

    /// Local path of the raw file to mirror alongside the chunks.
    #[serde(default, skip_serializing)]
    pub raw_file: Option<PathBuf>,

    #[serde(default)]
    pub tags: Vec<String>,
}
