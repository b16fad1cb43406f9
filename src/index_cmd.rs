use anyhow::{bail, Result};
use std::collections::HashSet;

use crate::config::Config;
use crate::metadata::MetadataStore;
use crate::models::{Document, IndexJob};
use crate::search::SearchService;

/// Images in `doc` with no vector record, in document order.
pub fn find_pending(doc: &Document, indexed: &HashSet<String>, limit: Option<usize>) -> Vec<IndexJob> {
    doc.all_images()
        .filter(|(image, _)| !indexed.contains(&image.id))
        .map(|(image, prompt)| IndexJob::for_image(image, prompt))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Vector record ids whose image no longer exists in `doc`.
pub fn find_orphans(doc: &Document, indexed: &HashSet<String>) -> Vec<String> {
    let live: HashSet<&str> = doc.all_images().map(|(image, _)| image.id.as_str()).collect();
    let mut orphans: Vec<String> = indexed
        .iter()
        .filter(|id| !live.contains(id.as_str()))
        .cloned()
        .collect();
    orphans.sort();
    orphans
}

/// Embed images that have no vector record yet.
pub async fn run_index_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let mut config = config.clone();
    if let Some(batch_size) = batch_size_override {
        if batch_size == 0 {
            bail!("--batch-size must be >= 1");
        }
        config.embedding.batch_size = batch_size;
    }

    let doc = MetadataStore::from_config(&config.storage).read().await?;
    let service = SearchService::from_config(&config)?;
    let indexed = service.store().get_indexed_ids().await?;
    let pending = find_pending(&doc, &indexed, limit);

    if dry_run {
        println!("index pending (dry-run)");
        println!("  images needing vectors: {}", pending.len());
        service.store().close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("index pending");
        println!("  all images indexed");
        service.store().close().await;
        return Ok(());
    }

    let (indexed_count, failed) = service.index_images_batch(&pending).await;

    println!("index pending");
    println!("  total pending: {}", pending.len());
    println!("  indexed: {}", indexed_count);
    println!("  failed: {}", failed);

    service.store().close().await;
    Ok(())
}

/// Delete vector records for images that are no longer in the document.
pub async fn run_index_prune(config: &Config) -> Result<()> {
    let doc = MetadataStore::from_config(&config.storage).read().await?;
    let service = SearchService::from_config(config)?;
    let indexed = service.store().get_indexed_ids().await?;
    let orphans = find_orphans(&doc, &indexed);

    let mut removed = 0;
    for id in &orphans {
        if service.store().delete_image(id).await? {
            removed += 1;
        }
    }

    println!("index prune");
    println!("  vector records: {}", indexed.len());
    println!("  removed: {}", removed);

    service.store().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Image, Prompt};

    fn doc() -> Document {
        let mut doc = Document::new();
        let mut prompt = Prompt::new("A cat", "", "");
        for id in ["img-a", "img-b", "img-c"] {
            let mut image = Image::new(&format!("{}.png", id), "image/png");
            image.id = id.into();
            prompt.images.push(image);
        }
        doc.prompts.push(prompt);
        doc
    }

    #[test]
    fn test_find_pending_skips_indexed() {
        let indexed: HashSet<String> = ["img-b".to_string()].into_iter().collect();
        let pending = find_pending(&doc(), &indexed, None);
        let ids: Vec<&str> = pending.iter().map(|j| j.image_id.as_str()).collect();
        assert_eq!(ids, vec!["img-a", "img-c"]);
        assert_eq!(pending[0].prompt_text.as_deref(), Some("A cat"));

        assert_eq!(find_pending(&doc(), &indexed, Some(1)).len(), 1);
    }

    #[test]
    fn test_find_orphans() {
        let indexed: HashSet<String> = ["img-a", "img-gone", "img-old"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(find_orphans(&doc(), &indexed), vec!["img-gone", "img-old"]);
    }
}
