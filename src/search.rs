//! Query path: staleness check, embedding, nearest neighbors, ranking.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::content::SourceType;
use crate::hierarchy::HierarchyTree;
use crate::semantic::{EmbeddingClient, EmbeddingError, IndexError, Neighbor};
use crate::sync::ReplicaSynchronizer;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("embedding service failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index lookup failed: {0}")]
    Index(#[from] IndexError),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub hierarchy_path: String,
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_range: Option<String>,
    pub relevance: f32,
    pub table_refs: Vec<String>,
    pub figure_refs: Vec<String>,
    pub source_tag: SourceType,
    #[serde(skip)]
    content_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub total_results: usize,
    pub elapsed_ms: u64,
}

/// Maps a squared L2 distance onto `[0, 1]`. For unit vectors this is the
/// cosine similarity, clamped.
pub fn relevance(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Relevance descending, then content id, then chunk id.
fn rank(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.relevance
        .total_cmp(&a.relevance)
        .then_with(|| a.content_id.cmp(&b.content_id))
        .then_with(|| a.id.cmp(&b.id))
}

pub struct SearchEngine {
    sync: Arc<ReplicaSynchronizer>,
    embedder: Arc<dyn EmbeddingClient>,
    hierarchy: Arc<HierarchyTree>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(
        sync: Arc<ReplicaSynchronizer>,
        embedder: Arc<dyn EmbeddingClient>,
        hierarchy: Arc<HierarchyTree>,
        config: SearchConfig,
    ) -> Self {
        Self {
            sync,
            embedder,
            hierarchy,
            config,
        }
    }

    /// Validate a request, run it and wrap the hits.
    pub fn handle(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let max_results = self.validate(request)?;
        let query = request.query.trim();
        let (results, elapsed_ms) = self.search(query, max_results)?;

        Ok(SearchResponse {
            query: query.to_string(),
            total_results: results.len(),
            results,
            elapsed_ms,
        })
    }

    pub fn validate(&self, request: &SearchRequest) -> Result<usize, SearchError> {
        let query_chars = request.query.trim().chars().count();
        if query_chars == 0 {
            return Err(SearchError::InvalidRequest("query must not be empty".to_string()));
        }
        if query_chars > self.config.max_query_chars {
            return Err(SearchError::InvalidRequest(format!(
                "query must be at most {} characters",
                self.config.max_query_chars
            )));
        }

        let max_results = request.max_results.unwrap_or(self.config.default_max_results);
        if !(1..=self.config.max_results_limit).contains(&max_results) {
            return Err(SearchError::InvalidRequest(format!(
                "max_results must be between 1 and {}",
                self.config.max_results_limit
            )));
        }

        Ok(max_results)
    }

    /// Ranked hits for `query` and the elapsed wall-clock milliseconds.
    pub fn search(&self, query: &str, max_results: usize) -> Result<(Vec<SearchHit>, u64), SearchError> {
        let started = Instant::now();

        self.sync.check_if_due();

        let Some(replica) = self.sync.handle().current() else {
            log::debug!("no local replica yet, returning no results");
            return Ok((vec![], elapsed_ms(started)));
        };
        if replica.index().is_empty() {
            return Ok((vec![], elapsed_ms(started)));
        }

        let query_vector = self.embedder.embed(query)?;

        let fetch = max_results.saturating_mul(self.config.over_fetch_factor);
        let mut hits: Vec<SearchHit> = replica
            .index()
            .nearest(&query_vector, fetch)?
            .into_iter()
            .map(|neighbor| self.to_hit(neighbor))
            .collect();

        hits.sort_by(rank);
        hits.truncate(max_results);

        let elapsed = elapsed_ms(started);
        log::debug!("query {query:?} returned {} hits in {elapsed}ms", hits.len());
        Ok((hits, elapsed))
    }

    fn to_hit(&self, neighbor: Neighbor<'_>) -> SearchHit {
        let chunk = neighbor.chunk;
        SearchHit {
            id: chunk.id.clone(),
            title: chunk.title().to_string(),
            hierarchy_path: self.hierarchy.label(chunk),
            preview: chunk.preview(),
            page_range: chunk.metadata.page_range(),
            relevance: relevance(neighbor.distance),
            table_refs: chunk.metadata.table_refs(),
            figure_refs: chunk.metadata.figure_refs(),
            source_tag: chunk.source_type,
            content_id: chunk.content_id.to_string(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
