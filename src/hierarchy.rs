//! Part/chapter names of the primary corpus, used to label results.
//!
//! Loaded once from `complete_hierarchy.json`. A missing file only costs
//! nicer labels, so it loads as an empty tree.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::content::{Chunk, SourceType};

/// Part names longer than this are shown as `Part <n>`.
const MAX_PART_NAME_CHARS: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct HierarchyTree {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    part_number: serde_json::Value,
    #[serde(default)]
    part_name: Option<String>,
}

impl Part {
    fn number(&self) -> Option<String> {
        match &self.part_number {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            _ => None,
        }
    }
}

impl HierarchyTree {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::warn!(
                "hierarchy file {} not found, continuing without part names",
                path.display()
            );
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let tree: Self = serde_json::from_str(&raw)
            .with_context(|| format!("malformed hierarchy file {}", path.display()))?;

        log::info!("loaded {} parts from {}", tree.parts.len(), path.display());
        Ok(tree)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Display label for a result.
    pub fn label(&self, chunk: &Chunk) -> String {
        match chunk.source_type {
            SourceType::IndependentDocument => chunk.title().to_string(),
            SourceType::Primary => {
                let topic_name = chunk
                    .metadata
                    .topic_name
                    .as_deref()
                    .unwrap_or_else(|| chunk.title());
                let topic_id = chunk
                    .metadata
                    .topic_id
                    .as_deref()
                    .unwrap_or(chunk.content_id.as_str());
                self.primary_label(topic_id, topic_name)
            }
            kind => format!("{} > {}", kind.collection_label(), chunk.title()),
        }
    }

    /// `"<Part name> > <topic>"` for ids shaped like `part4_ch81_cancer_of_the_skin`.
    pub fn primary_label(&self, topic_id: &str, topic_name: &str) -> String {
        let segments: Vec<&str> = topic_id.split('_').collect();
        if segments.len() < 2 {
            return topic_name.to_string();
        }

        let part_number = segments[0].replace("part", "");

        let part = self
            .parts
            .iter()
            .find(|part| part.number().as_deref() == Some(part_number.as_str()));

        match part {
            Some(part) => {
                let part_name = match part.part_name.as_deref() {
                    Some(name) if name.chars().count() <= MAX_PART_NAME_CHARS => name.to_string(),
                    _ => format!("Part {part_number}"),
                };
                format!("{part_name} > {topic_name}")
            }
            None => format!("Part {part_number} > {topic_name}"),
        }
    }
}
