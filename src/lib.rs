//! # Gallery Harness
//!
//! The storage and search core of an image-generation gallery.
//!
//! All prompts, images, stories, tokens and other curation records live in
//! one JSON document, guarded by a metadata store that serializes concurrent
//! read-modify-write cycles and replaces the file atomically. Images are
//! embedded into a shared image/text vector space and indexed in SQLite, so
//! the gallery can answer "find images matching this text" and "find images
//! like this one". Indexing runs in the background off a bounded queue.
//!
//! ## Architecture
//!
//! ```text
//!  add_generated_image                 search_by_text / search_similar
//!         │                                         │
//!         ▼                                         ▼
//! ┌───────────────┐  IndexJob  ┌────────────┐  ┌───────────────┐
//! │ MetadataStore │──────────▶│  Indexer   │─▶│ SearchService │
//! │  (JSON file)  │   queue    │ (consumer) │  │  embed + kNN  │
//! └───────────────┘            └────────────┘  └──────┬────────┘
//!                                                     │
//!                                  ┌──────────────────┤
//!                                  ▼                  ▼
//!                          ┌──────────────┐   ┌──────────────┐
//!                          │  Embedding   │   │ VectorStore  │
//!                          │  (fastembed) │   │  (SQLite)    │
//!                          └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gallery init                       # create data dirs and empty document
//! gallery migrate                    # upgrade a legacy document in place
//! gallery index pending              # embed images that have no vector yet
//! gallery search "a cat on a sofa"
//! gallery similar img-1a2b3c
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Document, prompt, image and index types |
//! | [`migrate`] | Document schema migrations |
//! | [`metadata`] | Atomic JSON metadata store |
//! | [`assets`] | Image file storage |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`db`] | SQLite connection |
//! | [`vector_store`] | Durable nearest-neighbor index |
//! | [`search`] | Text and image search, indexing |
//! | [`indexer`] | Background indexing queue |
//! | [`gallery`] | Service composition root |
//! | [`index_cmd`] | `index pending` / `index prune` commands |
//! | [`stats`] | Gallery statistics |

pub mod assets;
pub mod config;
pub mod db;
pub mod embedding;
pub mod gallery;
pub mod index_cmd;
pub mod indexer;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod search;
pub mod stats;
pub mod vector_store;
