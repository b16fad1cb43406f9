//! The gallery service: owns the metadata store, the search service and the
//! background indexer, and exposes the operations request handlers call.
//!
//! Every document mutation goes through [`MetadataStore::update`], so
//! concurrent handlers never lose each other's writes. New images are queued
//! for indexing after their record is saved; indexing failures never reach
//! the caller.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::assets;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::indexer::BackgroundIndexer;
use crate::metadata::MetadataStore;
use crate::models::{Image, IndexJob, Prompt, SearchHit};
use crate::search::SearchService;
use crate::vector_store::VectorStore;

pub struct Gallery {
    config: Config,
    metadata: MetadataStore,
    search: Arc<SearchService>,
    indexer: BackgroundIndexer,
}

impl Gallery {
    /// Build a gallery with the provider named in `config.embedding`.
    pub fn open(config: Config) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)?;
        Ok(Self::with_provider(config, provider))
    }

    pub fn with_provider(config: Config, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let metadata = MetadataStore::from_config(&config.storage);
        let store = Arc::new(VectorStore::new(&config.storage.vector_dir));
        let search = Arc::new(SearchService::new(
            provider,
            store,
            &config.storage.images_dir,
            config.embedding.batch_size,
        ));
        let indexer = BackgroundIndexer::from_config(Arc::clone(&search), &config.indexer);
        Self {
            config,
            metadata,
            search,
            indexer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn search(&self) -> &Arc<SearchService> {
        &self.search
    }

    pub fn indexer(&self) -> &BackgroundIndexer {
        &self.indexer
    }

    /// Warm the models, open the vector store and start the indexer.
    ///
    /// A model that fails to load is logged; it is retried on first use.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.search.provider().warm_up().await {
            warn!(error = %e, "embedding model warm-up failed");
        }
        self.search.store().init().await?;
        self.indexer.start();
        info!(
            model = self.search.provider().model_name(),
            "gallery started"
        );
        Ok(())
    }

    /// Drain the indexing queue and close the vector store.
    pub async fn shutdown(&self) {
        self.indexer.stop().await;
        self.search.store().close().await;
        info!("gallery stopped");
    }

    pub async fn create_prompt(&self, text: &str, title: &str, category: &str) -> Result<Prompt> {
        if text.trim().is_empty() {
            bail!("Prompt text must not be empty");
        }
        let prompt = Prompt::new(text, title, category);
        let saved = prompt.clone();
        self.metadata
            .update(move |doc| {
                doc.prompts.push(saved);
                Ok(())
            })
            .await?;
        Ok(prompt)
    }

    /// Store a generated image under `prompt_id` and queue it for indexing.
    ///
    /// `payload` is base64 or a base64 data URL. The MIME type comes from the
    /// data URL, then `mime_type`, then defaults to PNG.
    pub async fn add_generated_image(
        &self,
        prompt_id: &str,
        payload: &str,
        mime_type: Option<&str>,
    ) -> Result<Image> {
        let (url_mime, bytes) = assets::decode_base64_image(payload)?;
        let mime = url_mime
            .or_else(|| mime_type.map(str::to_string))
            .unwrap_or_else(|| "image/png".to_string());
        self.add_image_bytes(prompt_id, bytes, &mime).await
    }

    /// Store raw image bytes under `prompt_id` and queue them for indexing.
    pub async fn add_image_bytes(
        &self,
        prompt_id: &str,
        bytes: Vec<u8>,
        mime: &str,
    ) -> Result<Image> {
        if bytes.is_empty() {
            bail!("Image payload is empty");
        }
        let mut image = Image::new("", mime);
        let images_dir = self.config.storage.images_dir.clone();
        let (id, mime_for_write) = (image.id.clone(), mime.to_string());
        image.image_path = tokio::task::spawn_blocking(move || {
            assets::write_image_bytes(&images_dir, &id, &mime_for_write, &bytes)
        })
        .await??;

        let record = image.clone();
        let outcome = self
            .metadata
            .update(|doc| {
                let Some(prompt) = doc.find_prompt_by_id_mut(prompt_id) else {
                    bail!("Prompt not found: {}", prompt_id);
                };
                let job = IndexJob::for_image(&record, prompt);
                prompt.images.push(record);
                Ok(job)
            })
            .await;

        let job = match outcome {
            Ok(job) => job,
            Err(e) => {
                if let Err(cleanup) =
                    assets::remove_image_file(&self.config.storage.images_dir, &image.image_path)
                {
                    warn!(image_id = %image.id, error = %cleanup, "could not remove orphaned image file");
                }
                return Err(e);
            }
        };

        self.indexer.queue_for_indexing(job);
        Ok(image)
    }

    pub async fn search_by_text(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchHit>> {
        let limit = limit.unwrap_or(self.config.search.default_limit);
        self.search.search_by_text(query, limit).await
    }

    /// Images similar to `image_id`, which is never among the results.
    pub async fn search_similar(
        &self,
        image_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let doc = self.metadata.read().await?;
        let (image, _) = doc
            .find_image_by_id(image_id)
            .with_context(|| format!("Image not found: {}", image_id))?;
        let limit = limit.unwrap_or(self.config.search.default_limit);
        self.search
            .search_by_image(image_id, &image.image_path, limit)
            .await
    }

    /// Remove an image's record, file, favorite entry and vector record.
    ///
    /// The file is deleted after the document is saved. Returns `false` if no
    /// such image exists.
    pub async fn delete_image(&self, image_id: &str) -> Result<bool> {
        let removed = self
            .metadata
            .update(|doc| {
                let Some((image, _)) = doc.remove_image(image_id) else {
                    return Ok(None);
                };
                doc.remove_favorite(&image.id);
                Ok(Some(image))
            })
            .await?;

        let Some(image) = removed else {
            return Ok(false);
        };
        self.metadata
            .delete_image_files(vec![(image.id, image.image_path)])
            .await;
        self.search.store().delete_image(image_id).await?;
        info!(image_id, "deleted image");
        Ok(true)
    }

    /// Remove a prompt along with every image it owns.
    pub async fn delete_prompt(&self, prompt_id: &str) -> Result<bool> {
        let removed = self
            .metadata
            .update(|doc| {
                let Some(prompt) = doc.remove_prompt(prompt_id) else {
                    return Ok(None);
                };
                for image in &prompt.images {
                    doc.remove_favorite(&image.id);
                }
                Ok(Some(prompt))
            })
            .await?;

        let Some(prompt) = removed else {
            return Ok(false);
        };
        let files = prompt
            .images
            .iter()
            .map(|image| (image.id.clone(), image.image_path.clone()))
            .collect();
        self.metadata.delete_image_files(files).await;
        for image in &prompt.images {
            self.search.store().delete_image(&image.id).await?;
        }
        info!(prompt_id, images = prompt.images.len(), "deleted prompt");
        Ok(true)
    }
}
