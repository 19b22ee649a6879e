//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` has defaults, so a minimal config file only
//! needs a database path:
//!
//! ```toml
//! [db]
//! path = "./data/subidx.sqlite"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotConfig {
    /// Parent directory for per-run session directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Byte ceiling for a downloaded archive and for any single entry.
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Environment variable holding an optional bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            max_archive_bytes: default_max_archive_bytes(),
            api_base: default_api_base(),
            token_env: default_token_env(),
            timeout_secs: default_download_timeout_secs(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("subidx")
}
fn default_max_archive_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_download_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// Trailing lines carried into the next piece when an oversized window
    /// is re-split.
    #[serde(default = "default_split_seed_lines")]
    pub split_seed_lines: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_lines: default_window_lines(),
            overlap_lines: default_overlap_lines(),
            max_chunk_chars: default_max_chunk_chars(),
            split_seed_lines: default_split_seed_lines(),
            max_file_bytes: default_max_file_bytes(),
            extensions: default_extensions(),
            ignored_dirs: default_ignored_dirs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_window_lines() -> usize {
    200
}
fn default_overlap_lines() -> usize {
    40
}
fn default_max_chunk_chars() -> usize {
    6000
}
fn default_split_seed_lines() -> usize {
    3
}
fn default_max_file_bytes() -> u64 {
    512 * 1024
}
fn default_extensions() -> Vec<String> {
    [
        "rs", "py", "js", "jsx", "ts", "tsx", "mjs", "cjs", "go", "java", "kt", "kts", "scala",
        "rb", "php", "cs", "c", "h", "cc", "cpp", "cxx", "hpp", "swift", "m", "mm", "sh", "bash",
        "sql", "html", "css", "scss", "vue", "svelte", "json", "yaml", "yml", "toml", "md",
        "graphql", "proto", "ex", "exs", "erl", "hs", "lua", "dart", "r", "tf", "gradle",
        "dockerfile",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_ignored_dirs() -> Vec<String> {
    [
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        "out",
        "vendor",
        "coverage",
        "__pycache__",
        ".venv",
        "venv",
        ".next",
        ".idea",
        ".vscode",
        ".gradle",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `sqlite`, `memory`, or `pinecone`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    /// Metadata has its own size limit, stricter than the embedding input.
    #[serde(default = "default_metadata_content_chars")]
    pub metadata_content_chars: usize,
    /// Index host URL for the `pinecone` backend.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            upsert_batch_size: default_upsert_batch_size(),
            metadata_content_chars: default_metadata_content_chars(),
            host: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_upsert_batch_size() -> usize {
    100
}
fn default_metadata_content_chars() -> usize {
    4000
}
fn default_api_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Server-side ceiling; caller-supplied `top_k` is clamped to this.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_max_total_chars")]
    pub max_total_chars: usize,
    #[serde(default = "default_retrieval_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_dedup_overlap_threshold")]
    pub dedup_overlap_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            max_chunks: default_max_chunks(),
            max_total_chars: default_max_total_chars(),
            max_chunk_chars: default_retrieval_chunk_chars(),
            dedup_overlap_threshold: default_dedup_overlap_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_max_top_k() -> usize {
    50
}
fn default_max_chunks() -> usize {
    12
}
fn default_max_total_chars() -> usize {
    24_000
}
fn default_retrieval_chunk_chars() -> usize {
    3000
}
fn default_dedup_overlap_threshold() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifyConfig {
    /// When set, a JSON completion event is POSTed here after each
    /// successful indexing run.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Config {
    /// Config with defaults everywhere, rooted at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            snapshot: SnapshotConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            server: ServerConfig::default(),
            notify: NotifyConfig::default(),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.window_lines == 0 {
            anyhow::bail!("chunking.window_lines must be > 0");
        }
        if c.overlap_lines >= c.window_lines {
            anyhow::bail!("chunking.overlap_lines must be < chunking.window_lines");
        }
        if c.max_chunk_chars == 0 {
            anyhow::bail!("chunking.max_chunk_chars must be > 0");
        }

        if self.snapshot.max_archive_bytes == 0 {
            anyhow::bail!("snapshot.max_archive_bytes must be > 0");
        }

        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        if self.index.upsert_batch_size == 0 {
            anyhow::bail!("index.upsert_batch_size must be > 0");
        }

        let r = &self.retrieval;
        if r.max_top_k == 0 || r.default_top_k == 0 {
            anyhow::bail!("retrieval.default_top_k and retrieval.max_top_k must be >= 1");
        }
        if r.max_chunks == 0 {
            anyhow::bail!("retrieval.max_chunks must be >= 1");
        }
        if !(0.0..=1.0).contains(&r.dedup_overlap_threshold) {
            anyhow::bail!("retrieval.dedup_overlap_threshold must be in [0.0, 1.0]");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "hashing" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hashing, or local.",
                other
            ),
        }
        if matches!(self.embedding.provider.as_str(), "openai" | "ollama") {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.index.backend.as_str() {
            "sqlite" | "memory" => {}
            "pinecone" => {
                if self.index.host.is_none() {
                    anyhow::bail!("index.host must be set when backend is 'pinecone'");
                }
            }
            other => anyhow::bail!(
                "Unknown index backend: '{}'. Must be sqlite, memory, or pinecone.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
