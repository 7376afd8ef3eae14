use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::{DEFAULT_MAX_INPUT_CHARS, DEFAULT_MODEL};
use crate::storage::LocalFiles;

const CONFIG_FILE: &str = "config.yaml";
const BASE_PATH_ENV: &str = "MEDSEARCH_BASE_PATH";
const DEFAULT_BASE_PATH: &str = "./data";

const DEFAULT_CHECK_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MARKER_TIMEOUT_MS: u64 = 2_000;
/// Hard limit on the full index upload after a mutation
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 90;

const DEFAULT_MAX_RESULTS: usize = 10;
const MAX_RESULTS_LIMIT: usize = 50;
const MAX_QUERY_CHARS: usize = 500;
const OVER_FETCH_FACTOR: usize = 2;

const DEFAULT_EMBEDDING_BATCH: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minimum time between passive staleness checks
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Bound on reading the remote version marker
    #[serde(default = "default_marker_timeout_ms")]
    pub marker_timeout_ms: u64,

    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

impl SyncConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            marker_timeout_ms: DEFAULT_MARKER_TIMEOUT_MS,
            upload_timeout_secs: DEFAULT_UPLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_check_interval_ms() -> u64 {
    DEFAULT_CHECK_INTERVAL_MS
}

fn default_marker_timeout_ms() -> u64 {
    DEFAULT_MARKER_TIMEOUT_MS
}

fn default_upload_timeout_secs() -> u64 {
    DEFAULT_UPLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,

    #[serde(default = "max_results_limit")]
    pub max_results_limit: usize,

    #[serde(default = "max_query_chars")]
    pub max_query_chars: usize,

    /// Neighbors fetched per requested result
    #[serde(default = "over_fetch_factor")]
    pub over_fetch_factor: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_max_results: DEFAULT_MAX_RESULTS,
            max_results_limit: MAX_RESULTS_LIMIT,
            max_query_chars: MAX_QUERY_CHARS,
            over_fetch_factor: OVER_FETCH_FACTOR,
        }
    }
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

fn max_results_limit() -> usize {
    MAX_RESULTS_LIMIT
}

fn max_query_chars() -> usize {
    MAX_QUERY_CHARS
}

fn over_fetch_factor() -> usize {
    OVER_FETCH_FACTOR
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Fastembed,
    Openai,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProvider,

    /// Model name (e.g. "bge-base-en-v1.5" or "text-embedding-3-large")
    #[serde(default = "default_model")]
    pub model: String,

    /// Required for http providers, probed for fastembed
    #[serde(default)]
    pub dimensions: Option<usize>,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dimensions: None,
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_embedding_timeout_secs(),
            batch_size: DEFAULT_EMBEDDING_BATCH,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

fn default_provider() -> EmbeddingProvider {
    EmbeddingProvider::Fastembed
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    DEFAULT_EMBEDDING_BATCH
}

fn default_max_input_chars() -> usize {
    DEFAULT_MAX_INPUT_CHARS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Directory,
    Gcs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_kind")]
    pub kind: RemoteKind,

    /// Root of a directory remote. Defaults to `<base>/remote`.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default = "default_gcs_endpoint")]
    pub endpoint: String,

    /// Environment variable holding a bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: default_remote_kind(),
            path: None,
            bucket: None,
            endpoint: default_gcs_endpoint(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_remote_kind() -> RemoteKind {
    RemoteKind::Directory
}

fn default_gcs_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_token_env() -> String {
    "GCS_ACCESS_TOKEN".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_body_limit() -> usize {
    20 * 1024 * 1024
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub server: ServerConfig,

    /// Primary corpus part/chapter names, relative to the base path
    #[serde(default = "default_hierarchy_file")]
    pub hierarchy_file: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            remote: RemoteConfig::default(),
            server: ServerConfig::default(),
            hierarchy_file: default_hierarchy_file(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_hierarchy_file() -> String {
    "complete_hierarchy.json".to_string()
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync.marker_timeout_ms == 0 {
            bail!("sync.marker_timeout_ms must be greater than 0");
        }
        if self.sync.upload_timeout_secs == 0 {
            bail!("sync.upload_timeout_secs must be greater than 0");
        }

        let search = &self.search;
        if search.max_results_limit == 0 {
            bail!("search.max_results_limit must be greater than 0");
        }
        if !(1..=search.max_results_limit).contains(&search.default_max_results) {
            bail!(
                "search.default_max_results must be between 1 and {}, got {}",
                search.max_results_limit,
                search.default_max_results
            );
        }
        if search.max_query_chars == 0 {
            bail!("search.max_query_chars must be greater than 0");
        }
        if search.over_fetch_factor == 0 {
            bail!("search.over_fetch_factor must be greater than 0");
        }

        let embedding = &self.embedding;
        if embedding.batch_size == 0 {
            bail!("embedding.batch_size must be greater than 0");
        }
        if embedding.max_input_chars == 0 {
            bail!("embedding.max_input_chars must be greater than 0");
        }
        if embedding.provider == EmbeddingProvider::Openai && embedding.dimensions.is_none() {
            bail!("embedding.dimensions is required when embedding.provider is openai");
        }

        if self.remote.kind == RemoteKind::Gcs && self.remote.bucket.is_none() {
            bail!("remote.bucket is required when remote.kind is gcs");
        }

        Ok(())
    }

    /// Load from `$MEDSEARCH_BASE_PATH`, or `./data` when unset.
    pub fn load() -> anyhow::Result<Self> {
        let base_path = std::env::var(BASE_PATH_ENV).unwrap_or_else(|_| DEFAULT_BASE_PATH.into());
        Self::load_with(Path::new(&base_path))
    }

    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = LocalFiles::new(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case new fields were added
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = LocalFiles::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn hierarchy_path(&self) -> PathBuf {
        self.base_path.join(&self.hierarchy_file)
    }
}
