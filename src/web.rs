use crate::{
    app::{App, AppStatus, ReloadReport},
    content::{ChunkDraft, ContentMetadata, SourceType},
    eid::Eid,
    errors::AppError,
    library::{LibraryStats, SourceEntry, TopicDetails},
    mutation::MutationStatus,
    search::{SearchRequest, SearchResponse},
};
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
}

pub fn router(app: Arc<App>) -> Router {
    let body_limit = app.config().server.body_limit_bytes;
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/health", get(health))
        .route("/api/search", post(search))
        .route("/api/content", post(add_content))
        .route("/api/content/delete", post(delete_content))
        .route("/api/topic/:id", get(topic))
        .route("/api/library", get(library))
        .route("/api/library/:id", get(library_source))
        .route("/api/stats", get(stats))
        .route("/api/status", get(status))
        .route("/api/reload", post(reload))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(app: App) -> anyhow::Result<()> {
    let listen = app.config().server.listen.clone();
    let app = router(Arc::new(app));

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => log::warn!("received Ctrl+C, shutting down"),
        _ = terminate => log::warn!("received SIGTERM, shutting down"),
    }
}

pub fn start_daemon(app: App) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(app))
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::InvalidRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => axum::http::StatusCode::NOT_FOUND,
            AppError::Embedding(_) => {
                log::error!("{self:?}");
                axum::http::StatusCode::BAD_GATEWAY
            }
            AppError::IO(_) | AppError::Other(_) => {
                log::error!("{self:?}");
                axum::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

// lets handlers use `?` on anything that converts into `AppError`
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn parse_source_type(raw: &str) -> Result<SourceType, AppError> {
    raw.parse().map_err(AppError::InvalidRequest)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    indexed_chunks: usize,
    version: Option<String>,
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        Json(HealthResponse {
            status: "healthy",
            indexed_chunks: app.indexed_chunks(),
            version: app.sync().handle().token().map(|token| token.to_string()),
        })
    })
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    let app = state.app.clone();

    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || Ok(Json(app.search().handle(&payload)?)))
}

#[derive(Debug, Deserialize)]
pub struct AddContentRequest {
    pub source_type: String,
    pub title: String,
    #[serde(default)]
    pub content_id: Option<Eid>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub chunks: Vec<ChunkDraft>,
}

async fn add_content(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<AddContentRequest>,
) -> Result<Json<MutationStatus>, HttpError> {
    let app = state.app.clone();

    log::debug!(
        "add {} {:?} with {} chunks",
        payload.source_type,
        payload.title,
        payload.chunks.len()
    );

    let source_type = parse_source_type(&payload.source_type)?;
    let metadata = ContentMetadata {
        content_id: payload.content_id,
        title: payload.title,
        filename: payload.filename,
        raw_file: None,
        tags: payload.tags,
    };

    tokio::task::block_in_place(move || {
        Ok(Json(
            app.mutations()
                .try_add(source_type, payload.chunks, metadata)?,
        ))
    })
}

#[derive(Debug, Deserialize)]
pub struct DeleteContentRequest {
    pub content_id: Eid,
    pub source_type: String,
}

async fn delete_content(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<DeleteContentRequest>,
) -> Result<Json<MutationStatus>, HttpError> {
    let app = state.app.clone();

    log::debug!("payload: {payload:?}");

    let source_type = parse_source_type(&payload.source_type)?;

    tokio::task::block_in_place(move || {
        Ok(Json(
            app.mutations()
                .try_delete(&payload.content_id, source_type)?,
        ))
    })
}

async fn topic(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<TopicDetails>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        app.library()
            .topic(&id)
            .map(Json)
            .ok_or_else(|| AppError::NotFound(format!("topic not found: {id}")).into())
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct LibraryQuery {
    pub source_type: Option<String>,
    /// Title filter
    pub query: Option<String>,
}

#[derive(Serialize)]
pub struct LibraryResponse {
    pub sources: Vec<SourceEntry>,
    pub total: usize,
}

async fn library(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<LibraryQuery>,
) -> Result<Json<LibraryResponse>, HttpError> {
    let app = state.app.clone();

    let filter = params
        .source_type
        .as_deref()
        .map(parse_source_type)
        .transpose()?;

    tokio::task::block_in_place(move || {
        let sources = match params.query.as_deref() {
            Some(query) => app.library().find(query, filter),
            None => app.library().list_sources(filter),
        };

        Ok(Json(LibraryResponse {
            total: sources.len(),
            sources,
        }))
    })
}

async fn library_source(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<SourceEntry>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        app.library()
            .source(&id)
            .map(Json)
            .ok_or_else(|| AppError::NotFound(format!("source not found: {id}")).into())
    })
}

async fn stats(State(state): State<Arc<SharedState>>) -> Json<LibraryStats> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || Json(app.library().stats()))
}

async fn status(State(state): State<Arc<SharedState>>) -> Json<AppStatus> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || Json(app.status()))
}

async fn reload(State(state): State<Arc<SharedState>>) -> Json<ReloadReport> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let report = app.reload(true);
        log::info!("manual reload: {:?}", report.outcome);
        Json(report)
    })
}
