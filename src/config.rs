use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// The metadata JSON document.
    pub metadata_path: PathBuf,
    /// Flat directory of image files; image paths in the document are relative to it.
    pub images_dir: PathBuf,
    /// Directory owned by the vector store.
    pub vector_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub text_model: Option<String>,
    #[serde(default)]
    pub image_model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Prepended to text queries before embedding (some models expect a task prefix).
    #[serde(default)]
    pub query_prefix: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            text_model: None,
            image_model: None,
            dims: None,
            batch_size: 16,
            query_prefix: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    16
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long the consumer waits for a job before re-checking for shutdown.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
        }
    }
}

fn default_limit() -> usize {
    20
}

impl Config {
    /// A config with every path under `root` and embeddings disabled.
    pub fn minimal(root: &Path) -> Self {
        Self {
            storage: StorageConfig {
                metadata_path: root.join("metadata.json"),
                images_dir: root.join("images"),
                vector_dir: root.join("vectors"),
            },
            embedding: EmbeddingConfig::default(),
            indexer: IndexerConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.indexer.queue_capacity == 0 {
        anyhow::bail!("indexer.queue_capacity must be >= 1");
    }
    if config.indexer.poll_interval_ms == 0 {
        anyhow::bail!("indexer.poll_interval_ms must be >= 1");
    }
    if config.search.default_limit == 0 {
        anyhow::bail!("search.default_limit must be >= 1");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "local" => {
            crate::embedding::resolve_local_models(&config.embedding)?;
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or local.",
            other
        ),
    }

    Ok(())
}
