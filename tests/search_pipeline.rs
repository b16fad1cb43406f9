use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use gallery_harness::config::Config;
use gallery_harness::embedding::EmbeddingProvider;
use gallery_harness::gallery::Gallery;
use gallery_harness::indexer::BackgroundIndexer;
use gallery_harness::models::IndexJob;
use gallery_harness::search::SearchService;
use gallery_harness::vector_store::VectorStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DIMS: usize = 5;

/// Maps `"axis:N"` (as text, or as the content of an image file) to the
/// N-th basis vector.
struct AxisProvider {
    delay: Duration,
}

fn axis_vector(s: &str) -> Result<Vec<f32>> {
    let n: usize = s
        .trim()
        .strip_prefix("axis:")
        .ok_or_else(|| anyhow::anyhow!("not an axis: {}", s))?
        .parse()?;
    let mut v = vec![0.0; DIMS];
    v[n] = 1.0;
    Ok(v)
}

#[async_trait]
impl EmbeddingProvider for AxisProvider {
    fn model_name(&self) -> &str {
        "axis-test"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        axis_vector(text)
    }
    async fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        paths
            .iter()
            .map(|p| axis_vector(&std::fs::read_to_string(p)?))
            .collect()
    }
}

fn payload(axis: usize) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("axis:{}", axis))
}

fn gallery(tmp: &TempDir, delay: Duration) -> Gallery {
    let mut config = Config::minimal(tmp.path());
    config.indexer.poll_interval_ms = 20;
    Gallery::with_provider(config, Arc::new(AxisProvider { delay }))
}

#[tokio::test]
async fn test_generate_index_search_delete() {
    let tmp = TempDir::new().unwrap();
    let g = gallery(&tmp, Duration::ZERO);
    g.start().await.unwrap();

    let prompt = g.create_prompt("A cat", "Cat", "animals").await.unwrap();
    let mut images = Vec::new();
    for axis in 0..4 {
        let image = g
            .add_generated_image(&prompt.id, &payload(axis), Some("image/png"))
            .await
            .unwrap();
        assert!(image.image_path.ends_with(".png"));
        images.push(image);
    }

    g.indexer().stop().await;
    assert_eq!(g.search().store().count().await.unwrap(), 4);

    let record = g
        .search()
        .store()
        .get_record(&images[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.prompt_id.as_deref(), Some(prompt.id.as_str()));
    assert_eq!(record.prompt_text.as_deref(), Some("A cat"));

    let hits = g.search_by_text("axis:2", Some(3)).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].id, images[2].id);
    assert!(hits[0].score > 0.9);

    let similar = g.search_similar(&images[1].id, Some(10)).await.unwrap();
    assert_eq!(similar.len(), 3);
    assert!(similar.iter().all(|h| h.id != images[1].id));

    let favorites = [images[0].id.clone(), images[2].id.clone()];
    g.metadata()
        .update(|doc| {
            for id in &favorites {
                doc.add_favorite(id);
            }
            Ok(())
        })
        .await
        .unwrap();

    assert!(g.delete_image(&images[2].id).await.unwrap());
    assert!(!g.delete_image(&images[2].id).await.unwrap());
    assert_eq!(g.metadata().load().unwrap().favorites, vec![images[0].id.clone()]);
    assert!(!g.search().store().is_indexed(&images[2].id).await.unwrap());
    assert!(!tmp.path().join("images").join(&images[2].image_path).exists());
    let doc = g.metadata().load().unwrap();
    assert!(doc.find_image_by_id(&images[2].id).is_none());
    assert_eq!(doc.image_count(), 3);

    assert!(g.delete_prompt(&prompt.id).await.unwrap());
    assert_eq!(g.search().store().count().await.unwrap(), 0);
    let doc = g.metadata().load().unwrap();
    assert!(doc.prompts.is_empty());
    assert!(doc.favorites.is_empty());
    assert!(!tmp.path().join("images").join(&images[0].image_path).exists());

    g.shutdown().await;
}

#[tokio::test]
async fn test_unknown_prompt_leaves_no_file() {
    let tmp = TempDir::new().unwrap();
    let g = gallery(&tmp, Duration::ZERO);

    let err = g
        .add_generated_image("prompt-missing", &payload(0), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Prompt not found"));

    let leftover = std::fs::read_dir(tmp.path().join("images"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
    assert_eq!(g.indexer().pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_generation_keeps_every_image() {
    let tmp = TempDir::new().unwrap();
    let g = Arc::new(gallery(&tmp, Duration::ZERO));
    let prompt = g.create_prompt("A dog", "", "").await.unwrap();

    let mut handles = Vec::new();
    for axis in 0..20 {
        let g = Arc::clone(&g);
        let prompt_id = prompt.id.clone();
        handles.push(tokio::spawn(async move {
            g.add_generated_image(&prompt_id, &payload(axis % DIMS), None)
                .await
                .unwrap()
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let doc = g.metadata().load().unwrap();
    assert_eq!(doc.image_count(), 20);
    assert_eq!(g.indexer().pending_count(), 20);
}

#[tokio::test]
async fn test_stop_drains_queue() {
    let tmp = TempDir::new().unwrap();
    let images = tmp.path().join("images");
    std::fs::create_dir_all(&images).unwrap();
    for axis in 0..DIMS {
        std::fs::write(images.join(format!("{}.png", axis)), format!("axis:{}", axis)).unwrap();
    }

    let store = Arc::new(VectorStore::new(&tmp.path().join("vectors")));
    let provider = Arc::new(AxisProvider {
        delay: Duration::from_millis(30),
    });
    let search = Arc::new(SearchService::new(provider, Arc::clone(&store), &images, 4));
    let indexer = BackgroundIndexer::new(search, 8, Duration::from_millis(20));

    for axis in 0..DIMS {
        assert!(indexer.queue_for_indexing(IndexJob {
            image_id: format!("img-{}", axis),
            image_path: format!("{}.png", axis),
            prompt_id: None,
            prompt_text: None,
        }));
    }
    indexer.start();
    indexer.stop().await;

    assert!(!indexer.is_running());
    assert_eq!(indexer.pending_count(), 0);
    assert_eq!(store.count().await.unwrap(), DIMS);
}

#[tokio::test]
async fn test_backpressure_drops_beyond_capacity() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path());
    config.indexer.queue_capacity = 2;
    let g = Gallery::with_provider(
        config,
        Arc::new(AxisProvider {
            delay: Duration::ZERO,
        }),
    );
    let prompt = g.create_prompt("A bird", "", "").await.unwrap();

    for axis in 0..3 {
        g.add_generated_image(&prompt.id, &payload(axis), None)
            .await
            .unwrap();
        assert!(g.indexer().pending_count() <= 2);
    }
    assert_eq!(g.indexer().pending_count(), 2);
    // The image whose job was dropped is still saved.
    assert_eq!(g.metadata().load().unwrap().image_count(), 3);
}
