//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`LocalProvider`]**: runs a paired image/text model locally via fastembed;
//!   no network calls after the first model download.
//!
//! Image and text vectors live in one shared space, so the distance between
//! an image vector and a text vector is meaningful. Every vector returned by
//! a provider is L2-normalized.
//!
//! Also provides vector utilities for the SQLite-backed vector store:
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//! - [`normalize_l2`], [`l2_distance`], [`distance_to_score`]
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the appropriate provider based
//! on the configuration:
//!
//! ```rust,no_run
//! # use gallery_harness::config::EmbeddingConfig;
//! # use gallery_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Model Loading
//!
//! The local models are loaded at most once per provider, on first use or on
//! an explicit [`EmbeddingProvider::warm_up`]. Concurrent first callers wait
//! on the same initialization. A failed load is not cached, so the next call
//! retries.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EmbeddingConfig;

/// Trait for embedding providers.
///
/// Implementations must be safe to share across tasks. Blocking inference
/// belongs on the blocking pool, never on the calling task.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-vision-v1.5"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;

    /// Embed a text query into the shared space.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of image files, one vector per path, in order.
    async fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single image file.
    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        let vectors = self.embed_images(&[path.to_path_buf()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    /// Load models ahead of the first request.
    async fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }
    async fn embed_images(&self, _paths: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Local Provider (fastembed) ============

/// Resolved local model pair.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalModels {
    pub text_model: String,
    pub image_model: String,
    pub dims: usize,
    pub query_prefix: String,
}

/// Pick the text/image model pair and dimensionality from config.
///
/// The two models must share an embedding space, so only known pairs are
/// accepted.
pub fn resolve_local_models(config: &EmbeddingConfig) -> Result<LocalModels> {
    let image_model = config
        .image_model
        .clone()
        .unwrap_or_else(|| "nomic-embed-vision-v1.5".to_string());

    let (default_text, native_dims, default_prefix) = match image_model.as_str() {
        "nomic-embed-vision-v1.5" => ("nomic-embed-text-v1.5", 768, "search_query: "),
        "clip-vit-b-32" => ("clip-vit-b-32", 512, ""),
        other => bail!(
            "Unknown local image model: '{}'. Supported models: \
             nomic-embed-vision-v1.5, clip-vit-b-32",
            other
        ),
    };

    let text_model = config
        .text_model
        .clone()
        .unwrap_or_else(|| default_text.to_string());
    if text_model != default_text {
        bail!(
            "Text model '{}' does not share an embedding space with image model '{}' (expected '{}')",
            text_model,
            image_model,
            default_text
        );
    }

    if let Some(dims) = config.dims {
        if dims != native_dims {
            bail!(
                "embedding.dims = {} but '{}' produces {}-dimensional vectors",
                dims,
                image_model,
                native_dims
            );
        }
    }

    Ok(LocalModels {
        text_model,
        image_model,
        dims: native_dims,
        query_prefix: config
            .query_prefix
            .clone()
            .unwrap_or_else(|| default_prefix.to_string()),
    })
}

/// Embedding provider for local inference with fastembed.
///
/// Models are downloaded on first use from Hugging Face and cached.
/// Inference runs on the blocking pool; each model sits behind its own
/// mutex because a fastembed session is run through `&mut`.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    models: LocalModels,
    batch_size: usize,
    text: tokio::sync::OnceCell<Arc<std::sync::Mutex<fastembed::TextEmbedding>>>,
    image: tokio::sync::OnceCell<Arc<std::sync::Mutex<fastembed::ImageEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            models: resolve_local_models(config)?,
            batch_size: config.batch_size,
            text: tokio::sync::OnceCell::new(),
            image: tokio::sync::OnceCell::new(),
        })
    }

    async fn text_model(&self) -> Result<Arc<std::sync::Mutex<fastembed::TextEmbedding>>> {
        let model = self
            .text
            .get_or_try_init(|| async {
                let kind = fastembed_text_model(&self.models.text_model)?;
                tracing::info!(model = %self.models.text_model, "loading text embedding model");
                let model = tokio::task::spawn_blocking(move || {
                    fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(kind).with_show_download_progress(false),
                    )
                    .map_err(|e| anyhow::anyhow!("Failed to initialize text embedding model: {}", e))
                })
                .await??;
                Ok::<_, anyhow::Error>(Arc::new(std::sync::Mutex::new(model)))
            })
            .await?;
        Ok(Arc::clone(model))
    }

    async fn image_model(&self) -> Result<Arc<std::sync::Mutex<fastembed::ImageEmbedding>>> {
        let model = self
            .image
            .get_or_try_init(|| async {
                let kind = fastembed_image_model(&self.models.image_model)?;
                tracing::info!(model = %self.models.image_model, "loading image embedding model");
                let model = tokio::task::spawn_blocking(move || {
                    fastembed::ImageEmbedding::try_new(
                        fastembed::ImageInitOptions::new(kind).with_show_download_progress(false),
                    )
                    .map_err(|e| anyhow::anyhow!("Failed to initialize image embedding model: {}", e))
                })
                .await??;
                Ok::<_, anyhow::Error>(Arc::new(std::sync::Mutex::new(model)))
            })
            .await?;
        Ok(Arc::clone(model))
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.models.image_model
    }
    fn dims(&self) -> usize {
        self.models.dims
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.text_model().await?;
        let input = vec![format!("{}{}", self.models.query_prefix, text)];
        let mut vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow::anyhow!("Text embedding model lock poisoned"))?;
            model
                .embed(input, None)
                .map_err(|e| anyhow::anyhow!("Local text embedding failed: {}", e))
        })
        .await??;
        let vector = vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
        Ok(normalize_l2(vector))
    }

    async fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.image_model().await?;
        let paths = paths.to_vec();
        let batch_size = self.batch_size;
        let expected = paths.len();
        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow::anyhow!("Image embedding model lock poisoned"))?;
            model
                .embed(paths, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local image embedding failed: {}", e))
        })
        .await??;
        if vectors.len() != expected {
            bail!(
                "Image embedding returned {} vectors for {} images",
                vectors.len(),
                expected
            );
        }
        Ok(vectors.into_iter().map(normalize_l2).collect())
    }

    async fn warm_up(&self) -> Result<()> {
        self.text_model().await?;
        self.image_model().await?;
        Ok(())
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_text_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "clip-vit-b-32" => Ok(fastembed::EmbeddingModel::ClipVitB32),
        other => bail!("Unknown local text model: '{}'", other),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_image_model(name: &str) -> Result<fastembed::ImageEmbeddingModel> {
    match name {
        "nomic-embed-vision-v1.5" => Ok(fastembed::ImageEmbeddingModel::NomicEmbedVisionV15),
        "clip-vit-b-32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
        other => bail!("Unknown local image model: '{}'", other),
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// # Supported Providers
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"local"` | `LocalProvider` (requires the `local-embeddings-fastembed` feature) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use gallery_harness::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Euclidean distance between two vectors, or `None` if their lengths differ.
pub fn l2_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let sum: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

/// Map the Euclidean distance between two unit vectors to a `[0, 1]` score.
///
/// Unit vectors are at most `2.0` apart, so `1 - d/2` is `1.0` for identical
/// vectors and `0.0` for opposite ones. The result is clamped so a vector
/// that is not quite normalized cannot leave the range.
pub fn distance_to_score(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_normalize_l2() {
        let v = normalize_l2(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize_l2(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_distance_and_score() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let c = vec![-1.0, 0.0];
        assert_eq!(l2_distance(&a, &a), Some(0.0));
        assert!((l2_distance(&a, &b).unwrap() - 2f32.sqrt()).abs() < 1e-6);
        assert!((l2_distance(&a, &c).unwrap() - 2.0).abs() < 1e-6);
        assert_eq!(l2_distance(&a, &[1.0]), None);

        assert_eq!(distance_to_score(0.0), 1.0);
        assert_eq!(distance_to_score(2.0), 0.0);
        assert_eq!(distance_to_score(3.5), 0.0);
        assert_eq!(distance_to_score(-0.1), 1.0);
    }

    #[test]
    fn test_resolve_default_pair() {
        let mut config = EmbeddingConfig::default();
        config.provider = "local".into();
        let models = resolve_local_models(&config).unwrap();
        assert_eq!(models.text_model, "nomic-embed-text-v1.5");
        assert_eq!(models.image_model, "nomic-embed-vision-v1.5");
        assert_eq!(models.dims, 768);
        assert_eq!(models.query_prefix, "search_query: ");
    }

    #[test]
    fn test_resolve_rejects_mismatched_pair() {
        let mut config = EmbeddingConfig::default();
        config.image_model = Some("clip-vit-b-32".into());
        config.text_model = Some("nomic-embed-text-v1.5".into());
        assert!(resolve_local_models(&config).is_err());

        config.text_model = None;
        config.dims = Some(768);
        let err = resolve_local_models(&config).unwrap_err();
        assert!(err.to_string().contains("512"));
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        assert!(provider.embed_text("cat").await.is_err());
        assert!(provider.embed_image(Path::new("a.png")).await.is_err());
    }
}
