//! Text-to-image and image-to-image search, plus the indexing entry points
//! that feed the vector store.
//!
//! Indexing never fails loudly: a missing file, a provider error or a store
//! error is logged and reported as `false`, so callers in a request path can
//! ignore the outcome. Searching does propagate errors.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::assets;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::metadata::MetadataStore;
use crate::models::{IndexJob, SearchHit};
use crate::vector_store::VectorStore;

pub struct SearchService {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<VectorStore>,
    images_dir: PathBuf,
    batch_size: usize,
}

impl SearchService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<VectorStore>,
        images_dir: impl Into<PathBuf>,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            store,
            images_dir: images_dir.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)?;
        let store = Arc::new(VectorStore::new(&config.storage.vector_dir));
        Ok(Self::new(
            provider,
            store,
            &config.storage.images_dir,
            config.embedding.batch_size,
        ))
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Images whose vectors are closest to the embedding of `query`.
    ///
    /// A blank query returns no hits without touching the provider.
    pub async fn search_by_text(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.provider.embed_text(query).await?;
        self.store.search_by_vector(&vector, limit, &[]).await
    }

    /// "More like this": images closest to the image at `image_path`,
    /// never including `image_id` itself.
    pub async fn search_by_image(
        &self,
        image_id: &str,
        image_path: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let path = assets::resolve_image_path(&self.images_dir, image_path)?;
        if !path.exists() {
            bail!("Image file not found: {}", path.display());
        }
        let vector = self.provider.embed_image(&path).await?;
        self.store
            .search_by_vector(&vector, limit, &[image_id])
            .await
    }

    /// Embed and store one image. Already-indexed images count as success.
    pub async fn index_image(
        &self,
        image_id: &str,
        image_path: &str,
        prompt_id: Option<&str>,
        prompt_text: Option<&str>,
    ) -> bool {
        match self
            .try_index_image(image_id, image_path, prompt_id, prompt_text)
            .await
        {
            Ok(indexed) => indexed,
            Err(e) => {
                warn!(image_id, error = %e, "failed to index image");
                false
            }
        }
    }

    pub async fn index_job(&self, job: &IndexJob) -> bool {
        self.index_image(
            &job.image_id,
            &job.image_path,
            job.prompt_id.as_deref(),
            job.prompt_text.as_deref(),
        )
        .await
    }

    async fn try_index_image(
        &self,
        image_id: &str,
        image_path: &str,
        prompt_id: Option<&str>,
        prompt_text: Option<&str>,
    ) -> Result<bool> {
        if self.store.is_indexed(image_id).await? {
            debug!(image_id, "already indexed");
            return Ok(true);
        }
        let path = assets::resolve_image_path(&self.images_dir, image_path)?;
        if !path.exists() {
            warn!(image_id, path = %path.display(), "image file missing, not indexing");
            return Ok(false);
        }

        let vector = self.provider.embed_image(&path).await?;
        let inserted = self
            .store
            .add_image(image_id, image_path, &vector, prompt_id, prompt_text)
            .await?;
        if inserted {
            debug!(image_id, dims = vector.len(), "indexed image");
        }
        Ok(true)
    }

    /// Index many images, embedding them `batch_size` at a time.
    ///
    /// Returns `(indexed, failed)`. A batch whose embedding call fails falls
    /// back to indexing its images one by one.
    pub async fn index_images_batch(&self, jobs: &[IndexJob]) -> (usize, usize) {
        let mut indexed = 0;
        let mut failed = 0;

        for batch in jobs.chunks(self.batch_size) {
            let mut ready: Vec<(&IndexJob, PathBuf)> = Vec::new();
            for job in batch {
                match self.prepare(job).await {
                    Ok(Some(path)) => ready.push((job, path)),
                    Ok(None) => indexed += 1,
                    Err(e) => {
                        warn!(image_id = %job.image_id, error = %e, "skipping image");
                        failed += 1;
                    }
                }
            }
            if ready.is_empty() {
                continue;
            }

            let paths: Vec<PathBuf> = ready.iter().map(|(_, p)| p.clone()).collect();
            match self.provider.embed_images(&paths).await {
                Ok(vectors) => {
                    for ((job, _), vector) in ready.iter().zip(vectors) {
                        match self
                            .store
                            .add_image(
                                &job.image_id,
                                &job.image_path,
                                &vector,
                                job.prompt_id.as_deref(),
                                job.prompt_text.as_deref(),
                            )
                            .await
                        {
                            Ok(_) => indexed += 1,
                            Err(e) => {
                                warn!(image_id = %job.image_id, error = %e, "failed to store vector");
                                failed += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = ready.len(), error = %e, "batch embedding failed, retrying one by one");
                    for (job, _) in &ready {
                        if self.index_job(job).await {
                            indexed += 1;
                        } else {
                            failed += 1;
                        }
                    }
                }
            }
        }

        info!(indexed, failed, "batch indexing finished");
        (indexed, failed)
    }

    /// `Ok(None)` if already indexed, `Ok(Some(path))` if it needs embedding.
    async fn prepare(&self, job: &IndexJob) -> Result<Option<PathBuf>> {
        if self.store.is_indexed(&job.image_id).await? {
            return Ok(None);
        }
        let path = assets::resolve_image_path(&self.images_dir, &job.image_path)?;
        if !path.exists() {
            bail!("Image file not found: {}", path.display());
        }
        Ok(Some(path))
    }
}

// ============ CLI ============

pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let service = SearchService::from_config(config)?;
    let limit = limit.unwrap_or(config.search.default_limit);
    let hits = service.search_by_text(query, limit).await?;
    print_hits(&hits, &config.storage.images_dir);
    service.store().close().await;
    Ok(())
}

pub async fn run_similar(config: &Config, image_id: &str, limit: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Similarity search requires embeddings. Set [embedding] provider in config.");
    }

    let doc = MetadataStore::from_config(&config.storage).read().await?;
    let Some((image, _)) = doc.find_image_by_id(image_id) else {
        bail!("Image not found: {}", image_id);
    };

    let service = SearchService::from_config(config)?;
    let limit = limit.unwrap_or(config.search.default_limit);
    let hits = service
        .search_by_image(image_id, &image.image_path, limit)
        .await?;
    print_hits(&hits, &config.storage.images_dir);
    service.store().close().await;
    Ok(())
}

fn print_hits(hits: &[SearchHit], images_dir: &Path) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(hit.indexed_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!("{}. [{:.2}] {}", i + 1, hit.score, hit.id);
        println!("    file: {}", images_dir.join(&hit.image_path).display());
        if let Some(ref text) = hit.prompt_text {
            println!("    prompt: \"{}\"", text.replace('\n', " ").trim());
        }
        println!("    indexed: {}", date);
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Embeds an image file whose content is a single axis number as the
    /// matching basis vector. Text queries are parsed the same way.
    struct AxisProvider {
        text_calls: AtomicUsize,
    }

    fn axis_vector(s: &str) -> Result<Vec<f32>> {
        let axis: usize = s.trim().parse()?;
        let mut v = vec![0.0; 4];
        v[axis] = 1.0;
        Ok(v)
    }

    #[async_trait]
    impl EmbeddingProvider for AxisProvider {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            axis_vector(text)
        }
        async fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
            paths
                .iter()
                .map(|p| axis_vector(&std::fs::read_to_string(p)?))
                .collect()
        }
    }

    fn service(tmp: &TempDir) -> (SearchService, Arc<AxisProvider>) {
        let images = tmp.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        for axis in 0..4 {
            std::fs::write(images.join(format!("{}.png", axis)), axis.to_string()).unwrap();
        }
        let provider = Arc::new(AxisProvider {
            text_calls: AtomicUsize::new(0),
        });
        let store = Arc::new(VectorStore::new(&tmp.path().join("vectors")));
        let svc = SearchService::new(provider.clone(), store, images, 2);
        (svc, provider)
    }

    fn job(axis: usize) -> IndexJob {
        IndexJob {
            image_id: format!("img-{}", axis),
            image_path: format!("{}.png", axis),
            prompt_id: Some("prompt-1".into()),
            prompt_text: Some("axes".into()),
        }
    }

    #[tokio::test]
    async fn test_blank_query_skips_provider() {
        let tmp = TempDir::new().unwrap();
        let (svc, provider) = service(&tmp);
        assert!(svc.search_by_text("   ", 5).await.unwrap().is_empty());
        assert_eq!(provider.text_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_index_twice_one_record() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        assert!(svc.index_image("img-0", "0.png", None, None).await);
        assert!(svc.index_image("img-0", "0.png", None, None).await);
        assert_eq!(svc.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_reports_false() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        assert!(!svc.index_image("img-9", "9.png", None, None).await);
        assert!(!svc.index_image("img-x", "../escape.png", None, None).await);
        assert_eq!(svc.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_search_by_image_excludes_source() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let jobs: Vec<IndexJob> = (0..4).map(job).collect();
        assert_eq!(svc.index_images_batch(&jobs).await, (4, 0));

        let hits = svc.search_by_image("img-1", "1.png", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.id != "img-1"));
    }

    #[tokio::test]
    async fn test_search_by_text_ranks_match_first() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let jobs: Vec<IndexJob> = (0..4).map(job).collect();
        svc.index_images_batch(&jobs).await;

        let hits = svc.search_by_text("2", 2).await.unwrap();
        assert_eq!(hits[0].id, "img-2");
        assert!(hits[0].score > 0.9);
        assert_eq!(hits[0].prompt_text.as_deref(), Some("axes"));
    }

    #[tokio::test]
    async fn test_batch_counts_failures() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let mut jobs: Vec<IndexJob> = (0..3).map(job).collect();
        jobs.push(IndexJob {
            image_id: "img-gone".into(),
            image_path: "gone.png".into(),
            prompt_id: None,
            prompt_text: None,
        });
        assert_eq!(svc.index_images_batch(&jobs).await, (3, 1));
        // Re-running counts already-indexed images as indexed.
        assert_eq!(svc.index_images_batch(&jobs[..3]).await, (3, 0));
    }
}
