//! Core data models used throughout Gallery Harness.
//!
//! These types describe the metadata document (prompts, images and the
//! auxiliary collections), the unit of deferred indexing work, and the rows
//! held by the vector store.
//!
//! Every record keeps keys it does not recognise in a flattened `extra` map,
//! so loading and re-saving a document never drops data written by a newer
//! or older version of the application.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current on-disk schema version of the metadata document.
pub const SCHEMA_VERSION: u32 = 1;

/// Generate a fresh record id such as `img-3f9c0e...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// Current time as an RFC 3339 string, the timestamp format used in the document.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// The whole metadata document, persisted as a single JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub stories: Vec<Story>,
    #[serde(default)]
    pub collections: Vec<Collection>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub tokens: Vec<Token>,
    /// Everything else, including the `model` and `variation_prompt`
    /// settings. An explicit `null` here survives a save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A generation request plus every image it produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    #[serde(rename = "prompt", default)]
    pub prompt_text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_concept: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept_axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_image_ids: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Prompt {
    pub fn new(prompt_text: &str, title: &str, category: &str) -> Self {
        Self {
            id: new_id("prompt"),
            prompt_text: prompt_text.to_string(),
            title: title.to_string(),
            category: category.to_string(),
            created_at: now_timestamp(),
            ..Default::default()
        }
    }
}

/// One generated or imported picture plus its annotations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    /// Path relative to the images directory.
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub varied_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Tags the user liked, grouped by design axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liked_axes: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_dimensions: Option<BTreeMap<String, Dimension>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Image {
    pub fn new(image_path: &str, mime_type: &str) -> Self {
        Self {
            id: new_id("img"),
            image_path: image_path.to_string(),
            mime_type: mime_type.to_string(),
            generated_at: now_timestamp(),
            ..Default::default()
        }
    }

    /// Record a liked tag on an axis. Returns `false` if it was already liked.
    pub fn like_tag(&mut self, axis: &str, tag: &str) -> bool {
        let tags = self
            .liked_axes
            .get_or_insert_with(BTreeMap::new)
            .entry(axis.to_string())
            .or_default();
        if tags.iter().any(|t| t == tag) {
            return false;
        }
        tags.push(tag.to_string());
        true
    }
}

/// A named visual-style dimension attached to an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "prompt", default)]
    pub prompt_text: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub prompt_ids: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A reusable style token extracted from liked images.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "prompt", default, skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    /// An empty document at the current schema version.
    pub fn new() -> Self {
        Self {
            version: SCHEMA_VERSION,
            ..Default::default()
        }
    }

    /// The generation model setting, if set to a string.
    pub fn model(&self) -> Option<&str> {
        self.extra.get("model").and_then(Value::as_str)
    }

    pub fn variation_prompt(&self) -> Option<&str> {
        self.extra.get("variation_prompt").and_then(Value::as_str)
    }

    /// Find an image and its owning prompt by image id.
    pub fn find_image_by_id(&self, image_id: &str) -> Option<(&Image, &Prompt)> {
        self.prompts.iter().find_map(|prompt| {
            prompt
                .images
                .iter()
                .find(|img| img.id == image_id)
                .map(|img| (img, prompt))
        })
    }

    pub fn find_image_by_id_mut(&mut self, image_id: &str) -> Option<&mut Image> {
        self.prompts
            .iter_mut()
            .flat_map(|p| p.images.iter_mut())
            .find(|img| img.id == image_id)
    }

    pub fn find_prompt_by_id(&self, prompt_id: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.id == prompt_id)
    }

    pub fn find_prompt_by_id_mut(&mut self, prompt_id: &str) -> Option<&mut Prompt> {
        self.prompts.iter_mut().find(|p| p.id == prompt_id)
    }

    pub fn find_template_by_id(&self, id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn find_story_by_id(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn find_collection_by_id(&self, id: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.id == id)
    }

    pub fn find_session_by_id(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn find_token_by_id(&self, id: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.id == id)
    }

    /// Remove an image record from its prompt, returning it with the owning prompt id.
    ///
    /// The backing file and the favorites entry are left alone; see
    /// [`MetadataStore::delete_image_file`](crate::metadata::MetadataStore::delete_image_file).
    pub fn remove_image(&mut self, image_id: &str) -> Option<(Image, String)> {
        for prompt in &mut self.prompts {
            if let Some(pos) = prompt.images.iter().position(|img| img.id == image_id) {
                let image = prompt.images.remove(pos);
                return Some((image, prompt.id.clone()));
            }
        }
        None
    }

    /// Remove a prompt (and with it, all of its images).
    pub fn remove_prompt(&mut self, prompt_id: &str) -> Option<Prompt> {
        let pos = self.prompts.iter().position(|p| p.id == prompt_id)?;
        Some(self.prompts.remove(pos))
    }

    /// Iterate over every image paired with its owning prompt, in document order.
    pub fn all_images(&self) -> impl Iterator<Item = (&Image, &Prompt)> {
        self.prompts
            .iter()
            .flat_map(|p| p.images.iter().map(move |img| (img, p)))
    }

    pub fn image_count(&self) -> usize {
        self.prompts.iter().map(|p| p.images.len()).sum()
    }

    /// Mark an image as a favorite. Returns `false` if it already was one.
    pub fn add_favorite(&mut self, image_id: &str) -> bool {
        if self.favorites.iter().any(|f| f == image_id) {
            return false;
        }
        self.favorites.push(image_id.to_string());
        true
    }

    pub fn remove_favorite(&mut self, image_id: &str) -> bool {
        let before = self.favorites.len();
        self.favorites.retain(|f| f != image_id);
        self.favorites.len() != before
    }

    pub fn is_favorite(&self, image_id: &str) -> bool {
        self.favorites.iter().any(|f| f == image_id)
    }
}

/// A unit of deferred indexing work: "embed and store this image".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexJob {
    pub image_id: String,
    pub image_path: String,
    pub prompt_id: Option<String>,
    pub prompt_text: Option<String>,
}

impl IndexJob {
    pub fn for_image(image: &Image, prompt: &Prompt) -> Self {
        Self {
            image_id: image.id.clone(),
            image_path: image.image_path.clone(),
            prompt_id: Some(prompt.id.clone()),
            prompt_text: Some(prompt.prompt_text.clone()),
        }
    }
}

/// A stored embedding row, one per indexed image.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub image_path: String,
    pub vector: Vec<f32>,
    pub prompt_id: Option<String>,
    pub prompt_text: Option<String>,
    /// Unix timestamp (seconds).
    pub indexed_at: i64,
}

/// A nearest-neighbor result returned by the vector store.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub image_path: String,
    pub prompt_id: Option<String>,
    pub prompt_text: Option<String>,
    pub indexed_at: i64,
    /// Euclidean distance between the query and the stored vector.
    pub distance: f32,
    /// Similarity in `[0, 1]`, higher is closer.
    pub score: f32,
}
