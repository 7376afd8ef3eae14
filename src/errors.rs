use crate::mutation::MutationError;
use crate::search::SearchError;
use crate::semantic::EmbeddingError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("embedding service error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::InvalidRequest(message) => AppError::InvalidRequest(message),
            SearchError::Embedding(err) => AppError::Embedding(err),
            err @ SearchError::Index(_) => AppError::Other(err.into()),
        }
    }
}

impl From<MutationError> for AppError {
    fn from(err: MutationError) -> Self {
        match err {
            MutationError::InvalidContent(message) => AppError::InvalidRequest(message),
            err @ MutationError::Protected => AppError::InvalidRequest(err.to_string()),
            err @ MutationError::NotFound(_) => AppError::NotFound(err.to_string()),
            MutationError::Embedding(err) => AppError::Embedding(err),
            err => AppError::Other(err.into()),
        }
    }
}
