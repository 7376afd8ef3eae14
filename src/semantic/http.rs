//! OpenAI-compatible embeddings endpoint.
//!
//! Failures are returned as-is; callers decide whether to retry.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use crate::semantic::embeddings::{EmbeddingClient, EmbeddingError};

pub struct HttpEmbeddingClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        model: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            model: model.to_string(),
            dimensions,
        })
    }
}

impl EmbeddingClient for HttpEmbeddingClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut request = self.client.post(&self.endpoint).json(&json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EmbeddingError::ServiceStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response.json()?;
        parse_embeddings(parsed, texts.len(), self.dimensions)
    }
}

fn parse_embeddings(
    mut parsed: EmbeddingResponse,
    expected: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if parsed.data.len() != expected {
        return Err(EmbeddingError::CountMismatch {
            expected,
            got: parsed.data.len(),
        });
    }

    parsed.data.sort_by_key(|datum| datum.index);

    parsed
        .data
        .into_iter()
        .map(|datum| {
            if datum.embedding.len() == dimensions {
                Ok(datum.embedding)
            } else {
                Err(EmbeddingError::EmbeddingFailed(format!(
                    "expected {dimensions} dimensions, got {}",
                    datum.embedding.len()
                )))
            }
        })
        .collect()
}
