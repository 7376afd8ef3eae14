//! Composition root. Owns the replica handle and wires every component to it.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::config::Config;
use crate::hierarchy::HierarchyTree;
use crate::library::Library;
use crate::mutation::MutationCoordinator;
use crate::records::RecordStore;
use crate::remote::{create_store, RemoteStore};
use crate::replica::{ReplicaHandle, ReplicaStore};
use crate::search::SearchEngine;
use crate::semantic::{self, EmbeddingClient};
use crate::sync::{ReplicaSynchronizer, SyncOutcome};
use crate::token::VersionToken;

const REPLICAS_DIR: &str = "replicas";

#[derive(Debug, Serialize)]
pub struct AppStatus {
    pub local_token: Option<VersionToken>,
    pub remote_token: Option<VersionToken>,
    pub remote_reachable: bool,
    pub indexed_chunks: usize,
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Serialize)]
pub struct ReloadReport {
    pub before: Option<VersionToken>,
    pub after: Option<VersionToken>,
    pub outcome: SyncOutcome,
    pub indexed_chunks: usize,
}

pub struct App {
    config: Config,
    embedder: Arc<dyn EmbeddingClient>,
    sync: Arc<ReplicaSynchronizer>,
    search: SearchEngine,
    mutations: MutationCoordinator,
    library: Library,
}

impl App {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let remote = create_store(
            &config.remote,
            config.base_path(),
            config.sync.marker_timeout(),
        )?;
        let embedder = semantic::create_client(&config.embedding, config.base_path())
            .context("failed to initialize embedding client")?;

        Self::with_components(config, remote, embedder)
    }

    pub fn with_components(
        config: Config,
        remote: Arc<dyn RemoteStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> anyhow::Result<Self> {
        let base_path = config.base_path().to_path_buf();

        let hierarchy = Arc::new(HierarchyTree::load(&config.hierarchy_path())?);
        let replicas = ReplicaStore::new(
            base_path.join(REPLICAS_DIR),
            embedder.model_name(),
            embedder.dimensions(),
        )
        .context("failed to prepare replica directory")?;
        let handle = Arc::new(ReplicaHandle::new(Arc::new(replicas)));
        match handle.reload() {
            Some(replica) => log::info!(
                "opened local replica {} ({} chunks)",
                replica.token(),
                replica.chunk_count()
            ),
            None => log::info!("no local replica yet, first check will download one"),
        }
        let sync = Arc::new(ReplicaSynchronizer::new(
            remote,
            handle,
            config.sync.check_interval(),
        ));
        let records = RecordStore::new(&base_path)?;

        let search = SearchEngine::new(
            sync.clone(),
            embedder.clone(),
            hierarchy.clone(),
            config.search.clone(),
        );
        let mutations = MutationCoordinator::new(
            sync.clone(),
            embedder.clone(),
            records.clone(),
            config.sync.upload_timeout(),
            config.embedding.batch_size,
            config.embedding.max_input_chars,
        );
        let library = Library::new(sync.clone(), hierarchy, records);

        Ok(Self {
            config,
            embedder,
            sync,
            search,
            mutations,
            library,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sync(&self) -> &Arc<ReplicaSynchronizer> {
        &self.sync
    }

    pub fn search(&self) -> &SearchEngine {
        &self.search
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn indexed_chunks(&self) -> usize {
        self.sync
            .handle()
            .current()
            .map(|replica| replica.chunk_count())
            .unwrap_or(0)
    }

    pub fn status(&self) -> AppStatus {
        let (remote_token, remote_reachable) = match self.sync.remote().read_marker() {
            Ok(token) => (token, true),
            Err(err) => {
                log::warn!("version marker unreachable: {err}");
                (None, false)
            }
        };

        AppStatus {
            local_token: self.sync.handle().token(),
            remote_token,
            remote_reachable,
            indexed_chunks: self.indexed_chunks(),
            model: self.embedder.model_name().to_string(),
            dimensions: self.embedder.dimensions(),
        }
    }

    /// Refresh now (`force`) or only when the check interval has elapsed.
    pub fn reload(&self, force: bool) -> ReloadReport {
        let before = self.sync.handle().token();
        let outcome = self.sync.check_and_refresh(force);

        ReloadReport {
            before,
            after: self.sync.handle().token(),
            outcome,
            indexed_chunks: self.indexed_chunks(),
        }
    }
}
