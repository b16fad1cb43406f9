//! Gallery statistics and health overview.
//!
//! Summarizes what the metadata document holds and how much of it the
//! vector store covers. Used by `gallery stats` to confirm that migrations
//! and indexing are doing what they should.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::metadata::MetadataStore;
use crate::models::Document;
use crate::vector_store::VectorStore;

/// Per-category breakdown of prompt and image counts.
#[derive(Debug, Default, PartialEq)]
struct CategoryStats {
    prompts: usize,
    images: usize,
    indexed: usize,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = MetadataStore::from_config(&config.storage);
    let doc = store.read().await?;

    let vectors = VectorStore::new(&config.storage.vector_dir);
    let indexed_ids = vectors.get_indexed_ids().await?;

    let total_images = doc.image_count();
    let indexed_live = doc
        .all_images()
        .filter(|(image, _)| indexed_ids.contains(&image.id))
        .count();

    let (doc_size, modified) = file_info(store.path());

    println!("Gallery Stats");
    println!("=============");
    println!();
    println!("  Document:    {}", store.path().display());
    println!("  Size:        {}", format_bytes(doc_size));
    if let Some(ts) = modified {
        println!("  Saved:       {}", format_ts_relative(ts));
    }
    println!("  Version:     {}", doc.version);
    println!();
    println!("  Prompts:     {}", doc.prompts.len());
    println!("  Images:      {}", total_images);
    println!("  Favorites:   {}", doc.favorites.len());
    println!(
        "  Indexed:     {} / {} ({}%)",
        indexed_live,
        total_images,
        if total_images > 0 {
            (indexed_live * 100) / total_images
        } else {
            0
        }
    );
    let orphaned = indexed_ids.len().saturating_sub(indexed_live);
    if orphaned > 0 {
        println!("  Orphaned:    {} (run `gallery index prune`)", orphaned);
    }
    println!();
    println!(
        "  Templates: {}  Stories: {}  Collections: {}  Sessions: {}  Tokens: {}",
        doc.templates.len(),
        doc.stories.len(),
        doc.collections.len(),
        doc.sessions.len(),
        doc.tokens.len()
    );

    let by_category = category_stats(&doc, |id| indexed_ids.contains(id));
    if !by_category.is_empty() {
        println!();
        println!("  By category:");
        println!(
            "  {:<24} {:>8} {:>8} {:>8}",
            "CATEGORY", "PROMPTS", "IMAGES", "INDEXED"
        );
        println!("  {}", "-".repeat(52));
        for (category, s) in &by_category {
            println!(
                "  {:<24} {:>8} {:>8} {:>8}",
                category, s.prompts, s.images, s.indexed
            );
        }
    }

    println!();
    vectors.close().await;
    Ok(())
}

fn category_stats(
    doc: &Document,
    is_indexed: impl Fn(&str) -> bool,
) -> BTreeMap<String, CategoryStats> {
    let mut out: BTreeMap<String, CategoryStats> = BTreeMap::new();
    for prompt in &doc.prompts {
        let key = if prompt.category.is_empty() {
            "(uncategorized)".to_string()
        } else {
            prompt.category.clone()
        };
        let entry = out.entry(key).or_default();
        entry.prompts += 1;
        entry.images += prompt.images.len();
        entry.indexed += prompt.images.iter().filter(|i| is_indexed(&i.id)).count();
    }
    out
}

fn file_info(path: &Path) -> (u64, Option<i64>) {
    let Ok(meta) = std::fs::metadata(path) else {
        return (0, None);
    };
    let modified = meta
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp());
    (meta.len(), modified)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Image, Prompt};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_category_stats() {
        let mut doc = Document::new();
        let mut p = Prompt::new("A cat", "", "animals");
        let mut img = Image::new("a.png", "image/png");
        img.id = "img-a".into();
        p.images.push(img);
        let mut img = Image::new("b.png", "image/png");
        img.id = "img-b".into();
        p.images.push(img);
        doc.prompts.push(p);
        doc.prompts.push(Prompt::new("Untitled", "", ""));

        let stats = category_stats(&doc, |id| id == "img-a");
        assert_eq!(
            stats["animals"],
            CategoryStats {
                prompts: 1,
                images: 2,
                indexed: 1
            }
        );
        assert_eq!(stats["(uncategorized)"].images, 0);
    }
}
