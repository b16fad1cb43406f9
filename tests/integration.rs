use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn gallery_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("gallery");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[storage]
metadata_path = "{root}/data/metadata.json"
images_dir = "{root}/data/images"
vector_dir = "{root}/data/vectors"

[embedding]
provider = "disabled"

[indexer]
queue_capacity = 16
"#,
        root = root.display()
    );

    let config_path = config_dir.join("gallery.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_gallery(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = gallery_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run gallery binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn write_legacy_document(tmp: &TempDir) {
    let data = tmp.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(
        data.join("metadata.json"),
        r#"{
  "images": [
    {"id": "img-1", "prompt": "A cat", "title": "Cat", "category": "animals",
     "image_path": "img-1.png", "created_at": "2024-01-01T00:00:00Z"},
    {"id": "img-2", "prompt": "A dog", "image_path": "img-2.png"},
    {"id": "img-3", "prompt": "A cat", "image_path": "img-3.png"}
  ],
  "favorites": ["img-3"]
}"#,
    )
    .unwrap();
}

#[test]
fn test_init_creates_layout() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_gallery(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let data = tmp.path().join("data");
    assert!(data.join("metadata.json").exists());
    assert!(data.join("images").is_dir());
    assert!(data.join("vectors/vectors.sqlite").exists());
}

#[test]
fn test_init_idempotent_keeps_document() {
    let (tmp, config_path) = setup_test_env();
    write_legacy_document(&tmp);
    let before = fs::read_to_string(tmp.path().join("data/metadata.json")).unwrap();

    let (_, _, success1) = run_gallery(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_gallery(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");

    let after = fs::read_to_string(tmp.path().join("data/metadata.json")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_migrate_legacy_document() {
    let (tmp, config_path) = setup_test_env();
    write_legacy_document(&tmp);

    let (stdout, stderr, success) = run_gallery(&config_path, &["migrate"]);
    assert!(success, "migrate failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("v0 -> v1"), "got: {}", stdout);
    assert!(stdout.contains("prompts: 2"));
    assert!(stdout.contains("images: 3"));

    let raw = fs::read_to_string(tmp.path().join("data/metadata.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(doc.get("images").is_none());
    assert_eq!(doc["prompts"][0]["prompt"], "A cat");
    assert_eq!(doc["prompts"][0]["images"].as_array().unwrap().len(), 2);
    assert_eq!(doc["favorites"][0], "img-3");

    // A second run is a no-op on content.
    let (stdout, _, success) = run_gallery(&config_path, &["migrate"]);
    assert!(success);
    assert!(stdout.contains("v1 -> v1"));
}

#[test]
fn test_migrate_requires_document() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_gallery(&config_path, &["migrate"]);
    assert!(!success);
    assert!(stderr.contains("gallery init"));
}

#[test]
fn test_corrupt_document_is_not_replaced() {
    let (tmp, config_path) = setup_test_env();
    let data = tmp.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("metadata.json"), "{ broken").unwrap();

    let (_, stderr, success) = run_gallery(&config_path, &["migrate"]);
    assert!(!success);
    assert!(stderr.contains("not valid JSON"), "stderr: {}", stderr);
    assert_eq!(
        fs::read_to_string(data.join("metadata.json")).unwrap(),
        "{ broken"
    );
}

#[test]
fn test_stats_reports_counts() {
    let (tmp, config_path) = setup_test_env();
    write_legacy_document(&tmp);
    run_gallery(&config_path, &["init"]);

    let (stdout, stderr, success) = run_gallery(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Prompts:     2"));
    assert!(stdout.contains("Images:      3"));
    assert!(stdout.contains("Indexed:     0 / 3"));
    assert!(stdout.contains("animals"));
}

#[test]
fn test_search_requires_embeddings() {
    let (_tmp, config_path) = setup_test_env();
    run_gallery(&config_path, &["init"]);

    let (_, stderr, success) = run_gallery(&config_path, &["search", "a cat"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_search_blank_query() {
    let (_tmp, config_path) = setup_test_env();
    run_gallery(&config_path, &["init"]);

    let (stdout, _, success) = run_gallery(&config_path, &["search", "   "]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_delete_image() {
    let (tmp, config_path) = setup_test_env();
    write_legacy_document(&tmp);
    run_gallery(&config_path, &["init"]);
    let images = tmp.path().join("data/images");
    fs::write(images.join("img-3.png"), b"png").unwrap();

    let (stdout, stderr, success) = run_gallery(&config_path, &["delete", "img-3"]);
    assert!(success, "delete failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Deleted img-3"));
    assert!(!images.join("img-3.png").exists());

    let raw = fs::read_to_string(tmp.path().join("data/metadata.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(doc["favorites"].as_array().unwrap().is_empty());

    let (stdout, _, success) = run_gallery(&config_path, &["delete", "img-3"]);
    assert!(success);
    assert!(stdout.contains("No image with id img-3"));
}

#[test]
fn test_index_pending_dry_run_requires_embeddings() {
    let (_tmp, config_path) = setup_test_env();
    run_gallery(&config_path, &["init"]);
    let (_, stderr, success) = run_gallery(&config_path, &["index", "pending", "--dry-run"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_index_prune_empty() {
    let (tmp, config_path) = setup_test_env();
    write_legacy_document(&tmp);
    run_gallery(&config_path, &["init"]);

    let (stdout, stderr, success) = run_gallery(&config_path, &["index", "prune"]);
    assert!(success, "prune failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("removed: 0"));
}
