//! Read-only views over the active replica: sources, topics and stats.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::content::{Chunk, SourceType};
use crate::hierarchy::HierarchyTree;
use crate::records::{RecordStore, SummaryItem};
use crate::replica::LocalIndexReplica;
use crate::sync::ReplicaSynchronizer;
use crate::token::VersionToken;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceEntry {
    pub content_id: String,
    pub source_type: SourceType,
    pub title: String,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TopicDetails {
    pub id: String,
    pub content_id: String,
    pub source_type: SourceType,
    pub title: String,
    pub hierarchy_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_range: Option<String>,
    pub text_content: String,
    pub word_count: usize,
    pub table_refs: Vec<String>,
    pub figure_refs: Vec<String>,
    pub chunk_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LibraryStats {
    pub total_chunks: usize,
    pub total_sources: usize,
    pub chunks_by_type: BTreeMap<SourceType, usize>,
    pub sources_by_type: BTreeMap<SourceType, usize>,
    pub token: Option<VersionToken>,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
}

pub struct Library {
    sync: Arc<ReplicaSynchronizer>,
    hierarchy: Arc<HierarchyTree>,
    records: RecordStore,
}

impl Library {
    pub fn new(sync: Arc<ReplicaSynchronizer>, hierarchy: Arc<HierarchyTree>, records: RecordStore) -> Self {
        Self {
            sync,
            hierarchy,
            records,
        }
    }

    /// Every content source in the index, optionally of one type, sorted by
    /// type then title.
    pub fn list_sources(&self, filter: Option<SourceType>) -> Vec<SourceEntry> {
        let Some(replica) = self.replica() else {
            return vec![];
        };

        let mut grouped: HashMap<&str, Vec<&Chunk>> = HashMap::new();
        for chunk in replica.index().chunks() {
            if filter.is_some_and(|kind| kind != chunk.source_type) {
                continue;
            }
            grouped.entry(chunk.content_id.as_str()).or_default().push(chunk);
        }

        let summaries = self.summaries(filter);
        let mut sources: Vec<SourceEntry> = grouped
            .into_values()
            .map(|chunks| source_entry(&chunks, &summaries))
            .collect();

        sources.sort_by(|a, b| {
            a.source_type
                .cmp(&b.source_type)
                .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        sources
    }

    pub fn source(&self, content_id: &str) -> Option<SourceEntry> {
        let replica = self.replica()?;
        let chunks = content_chunks(&replica, content_id);
        let first = chunks.first()?;
        let summaries = self.summaries(Some(first.source_type));
        Some(source_entry(&chunks, &summaries))
    }

    /// Case-insensitive title match over [`Self::list_sources`].
    pub fn find(&self, query: &str, filter: Option<SourceType>) -> Vec<SourceEntry> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return vec![];
        }
        self.list_sources(filter)
            .into_iter()
            .filter(|source| source.title.to_lowercase().contains(&needle))
            .collect()
    }

    /// Resolve a chunk id, a content id or a primary corpus topic id.
    ///
    /// A chunk id yields that chunk alone; the other two yield every chunk
    /// they cover, in chunk order.
    pub fn topic(&self, id: &str) -> Option<TopicDetails> {
        let replica = self.replica()?;
        let index = replica.index();

        let chunks: Vec<&Chunk> = match index.get(id) {
            Some(entry) => vec![&entry.chunk],
            None => {
                let by_content = content_chunks(&replica, id);
                if by_content.is_empty() {
                    let mut by_topic: Vec<&Chunk> = index
                        .chunks()
                        .filter(|chunk| chunk.metadata.topic_id.as_deref() == Some(id))
                        .collect();
                    by_topic.sort_by(|a, b| a.id.cmp(&b.id));
                    by_topic
                } else {
                    by_content
                }
            }
        };

        let first = *chunks.first()?;
        let text_content = chunks
            .iter()
            .map(|chunk| chunk.text.trim())
            .collect::<Vec<_>>()
            .join("\n\n");

        Some(TopicDetails {
            id: id.to_string(),
            content_id: first.content_id.to_string(),
            source_type: first.source_type,
            title: first.title().to_string(),
            hierarchy_path: self.hierarchy.label(first),
            page_range: page_span(&chunks),
            word_count: text_content.split_whitespace().count(),
            text_content,
            table_refs: merged_refs(&chunks, |chunk| chunk.metadata.table_refs()),
            figure_refs: merged_refs(&chunks, |chunk| chunk.metadata.figure_refs()),
            chunk_ids: chunks.iter().map(|chunk| chunk.id.clone()).collect(),
        })
    }

    pub fn stats(&self) -> LibraryStats {
        let Some(replica) = self.replica() else {
            return LibraryStats::default();
        };

        let mut stats = LibraryStats {
            total_chunks: replica.chunk_count(),
            token: Some(replica.token().clone()),
            model: Some(replica.manifest().model.clone()),
            dimensions: Some(replica.manifest().dimensions),
            ..Default::default()
        };

        let mut seen = HashMap::new();
        for chunk in replica.index().chunks() {
            *stats.chunks_by_type.entry(chunk.source_type).or_default() += 1;
            seen.insert(chunk.content_id.as_str(), chunk.source_type);
        }
        for kind in seen.into_values() {
            *stats.sources_by_type.entry(kind).or_default() += 1;
        }
        stats.total_sources = stats.sources_by_type.values().sum();
        stats
    }

    fn replica(&self) -> Option<Arc<LocalIndexReplica>> {
        self.sync.check_if_due();
        self.sync.handle().current()
    }

    /// Summary entries keyed by content id. Unreadable summaries are skipped.
    fn summaries(&self, filter: Option<SourceType>) -> HashMap<String, SummaryItem> {
        SourceType::ALL
            .into_iter()
            .filter(|kind| filter.map_or(true, |wanted| wanted == *kind))
            .filter_map(|kind| match self.records.load_summary(kind) {
                Ok(summary) => Some(summary.items),
                Err(err) => {
                    log::warn!("ignoring unreadable {kind} summary: {err}");
                    None
                }
            })
            .flatten()
            .map(|item| (item.content_id.to_string(), item))
            .collect()
    }
}

fn content_chunks<'a>(replica: &'a LocalIndexReplica, content_id: &str) -> Vec<&'a Chunk> {
    let index = replica.index();
    index
        .chunk_ids_for(content_id)
        .iter()
        .filter_map(|id| index.get(id))
        .map(|entry| &entry.chunk)
        .collect()
}

fn source_entry(chunks: &[&Chunk], summaries: &HashMap<String, SummaryItem>) -> SourceEntry {
    let mut ordered = chunks.to_vec();
    ordered.sort_by_key(|chunk| chunk.ordinal());
    let first = ordered[0];
    let summary = summaries.get(first.content_id.as_str());

    SourceEntry {
        content_id: first.content_id.to_string(),
        source_type: first.source_type,
        title: summary
            .map(|item| item.title.clone())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| first.title().to_string()),
        chunks: ordered.len(),
        page_range: page_span(&ordered),
        filename: summary
            .and_then(|item| item.filename.clone())
            .or_else(|| first.metadata.filename.clone()),
        created_at: summary.map(|item| item.created_at),
        tags: summary.map(|item| item.tags.clone()).unwrap_or_default(),
    }
}

/// Lowest start page to highest end page over `chunks`.
fn page_span(chunks: &[&Chunk]) -> Option<String> {
    let start = chunks.iter().filter_map(|c| c.metadata.start_page).min();
    let end = chunks
        .iter()
        .filter_map(|c| c.metadata.end_page.or(c.metadata.start_page))
        .max();

    match (start, end) {
        (Some(start), Some(end)) if start < end => Some(format!("{start}-{end}")),
        (Some(start), _) => Some(start.to_string()),
        (None, Some(end)) => Some(end.to_string()),
        (None, None) => None,
    }
}

fn merged_refs(chunks: &[&Chunk], refs: impl Fn(&Chunk) -> Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = vec![];
    for chunk in chunks {
        for reference in refs(chunk) {
            if !merged.contains(&reference) {
                merged.push(reference);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ChunkMetadata;
    use crate::eid::Eid;

    fn chunk(id: &str, start: Option<u32>, end: Option<u32>, tables: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            content_id: Eid::from("doc"),
            source_type: SourceType::Primary,
            text: String::new(),
            metadata: ChunkMetadata {
                start_page: start,
                end_page: end,
                has_tables: tables.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_page_span_covers_all_chunks() {
        let a = chunk("doc_chunk1", Some(543), Some(545), "");
        let b = chunk("doc_chunk2", Some(545), Some(547), "");
        let c = chunk("doc_chunk3", None, None, "");
        assert_eq!(page_span(&[&a, &b, &c]).as_deref(), Some("543-547"));
        assert_eq!(page_span(&[&c]), None);

        let single = chunk("doc_chunk4", Some(12), None, "");
        assert_eq!(page_span(&[&single]).as_deref(), Some("12"));
    }

    #[test]
    fn test_refs_are_merged_in_order_without_duplicates() {
        let a = chunk("doc_chunk1", None, None, "Table 1, Table 2");
        let b = chunk("doc_chunk2", None, None, "Table 2, Table 3");
        assert_eq!(
            merged_refs(&[&a, &b], |c| c.metadata.table_refs()),
            vec!["Table 1", "Table 2", "Table 3"]
        );
    }
}
