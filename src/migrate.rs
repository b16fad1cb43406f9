//! Metadata document schema migrations.
//!
//! Migrations run on the raw JSON tree before it is deserialized into a
//! [`Document`], once per load. Each step is idempotent: running the full
//! chain on an already-current document changes nothing.
//!
//! # Versions
//!
//! | Version | Shape |
//! |---------|-------|
//! | 0 | Flat `images` list; each image carries its own `prompt` text, `title`, `category` |
//! | 1 | `prompts` list owning `images`, plus auxiliary collections |

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::metadata::MetadataStore;
use crate::models::{new_id, Document, Image, Prompt, SCHEMA_VERSION};
use crate::vector_store::VectorStore;

/// Top-level collections every current document carries.
const COLLECTIONS: &[&str] = &[
    "prompts",
    "templates",
    "stories",
    "collections",
    "sessions",
    "tokens",
    "favorites",
];

/// Migrate a raw JSON document to the current schema and deserialize it.
pub fn upgrade(mut raw: Value) -> Result<Document> {
    let Some(root) = raw.as_object_mut() else {
        bail!("Metadata document must be a JSON object");
    };

    let version = match root.get("version") {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .with_context(|| format!("Metadata document has an invalid schema version: {}", v))?,
    };
    if version > SCHEMA_VERSION {
        bail!(
            "Metadata document has schema version {} but this build supports up to {}",
            version,
            SCHEMA_VERSION
        );
    }

    migrate_legacy_images(root)?;
    ensure_collections(root)?;
    root.insert("version".to_string(), Value::from(SCHEMA_VERSION));

    Ok(serde_json::from_value(raw)?)
}

/// Fold a legacy flat `images` list into synthesized prompts.
///
/// Images are grouped by their `prompt` text in first-seen order. Each new
/// prompt inherits the first image's title, category and timestamp. The
/// legacy list is removed, so a second run is a no-op. Returns the number of
/// prompts created.
pub fn migrate_legacy_images(root: &mut Map<String, Value>) -> Result<usize> {
    let legacy = match root.remove("images") {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Array(items)) => items,
        Some(other) => bail!(
            "Legacy 'images' field must be a list, found {}",
            json_kind(&other)
        ),
    };

    let mut groups: Vec<Prompt> = Vec::new();

    for item in legacy {
        let Value::Object(mut fields) = item else {
            bail!("Legacy image entries must be JSON objects");
        };

        let prompt_text = take_string(&mut fields, "prompt").unwrap_or_default();
        let title = take_string(&mut fields, "title").unwrap_or_default();
        let category = take_string(&mut fields, "category").unwrap_or_default();
        let created_at = take_string(&mut fields, "created_at");

        let mut image: Image = serde_json::from_value(Value::Object(fields))?;
        if image.generated_at.is_empty() {
            if let Some(ts) = &created_at {
                image.generated_at = ts.clone();
            }
        }

        match groups.iter_mut().find(|p| p.prompt_text == prompt_text) {
            Some(prompt) => prompt.images.push(image),
            None => {
                let created_at = created_at.unwrap_or_else(|| image.generated_at.clone());
                groups.push(Prompt {
                    id: new_id("prompt"),
                    prompt_text,
                    title,
                    category,
                    created_at,
                    images: vec![image],
                    ..Default::default()
                });
            }
        }
    }

    let created = groups.len();
    let prompts = root
        .entry("prompts")
        .or_insert_with(|| Value::Array(Vec::new()));
    if prompts.is_null() {
        *prompts = Value::Array(Vec::new());
    }
    let Some(list) = prompts.as_array_mut() else {
        bail!("'prompts' field must be a list");
    };
    for prompt in groups {
        list.push(serde_json::to_value(prompt)?);
    }

    Ok(created)
}

/// Insert any absent or `null` top-level collection as an empty list.
///
/// A collection holding anything other than a list is an error; it is
/// never replaced.
fn ensure_collections(root: &mut Map<String, Value>) -> Result<()> {
    for key in COLLECTIONS {
        match root.get(*key) {
            Some(Value::Array(_)) => {}
            None | Some(Value::Null) => {
                root.insert((*key).to_string(), Value::Array(Vec::new()));
            }
            Some(other) => bail!(
                "'{}' field must be a list, found {}",
                key,
                json_kind(other)
            ),
        }
    }
    Ok(())
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Create the data directories, an empty document and the vector table.
///
/// Idempotent: an existing document is left untouched.
pub async fn run_init(config: &Config) -> Result<()> {
    let storage = &config.storage;
    for dir in [&storage.images_dir, &storage.vector_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let store = MetadataStore::from_config(storage);
    let created = !store.path().exists();
    if created {
        store.save(&Document::new())?;
    }

    let vectors = VectorStore::new(&storage.vector_dir);
    vectors.init().await?;
    vectors.close().await;

    println!("Gallery initialized.");
    println!(
        "  metadata: {}{}",
        store.path().display(),
        if created { " (created)" } else { "" }
    );
    println!("  images:   {}", storage.images_dir.display());
    println!("  vectors:  {}", vectors.db_path().display());
    Ok(())
}

/// Rewrite the document in the current schema.
pub async fn run_migrate(config: &Config) -> Result<()> {
    let store = MetadataStore::from_config(&config.storage);
    if !store.path().exists() {
        bail!(
            "No metadata document at {}. Run `gallery init` first.",
            store.path().display()
        );
    }

    let raw = std::fs::read(store.path())?;
    let from_version = serde_json::from_slice::<Value>(&raw)
        .ok()
        .and_then(|v| v.get("version").and_then(Value::as_u64))
        .unwrap_or(0);

    let doc = store.update(|doc| Ok(doc.clone())).await?;

    println!("migrate");
    println!("  schema: v{} -> v{}", from_version, SCHEMA_VERSION);
    println!("  prompts: {}", doc.prompts.len());
    println!("  images: {}", doc.image_count());
    Ok(())
}
