//! The metadata store: sole reader and writer of the gallery's JSON document.
//!
//! Two mutation paths are offered:
//!
//! - **Scoped** ([`MetadataStore::write`]): a synchronous guard that loads the
//!   document, hands out `&mut Document`, and saves when the guard ends. Meant
//!   for single-threaded callers; it takes no lock.
//! - **Atomic** ([`MetadataStore::atomic`]): the same guard shape, but async and
//!   serialized. The guard holds a FIFO-fair async mutex from before the load
//!   until after the save, so concurrent mutations never interleave their
//!   read-modify-write cycles. Load and save run on the blocking pool; waiting
//!   for the lock never stalls the runtime.
//!
//! Both guards save when dropped without [`commit`](DocumentGuard::commit)
//! (early `?` return, panic), so progress made before a failure is still
//! written. Only `commit` can report a save error; a failed save on drop is
//! logged.
//!
//! Every save goes to a temp file in the same directory, is fsynced, then
//! renamed over the document. Readers see the old file or the new one, never
//! a partial write.

use anyhow::{Context, Result};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::assets;
use crate::config::StorageConfig;
use crate::migrate;
use crate::models::Document;

/// Handle to the on-disk metadata document. Cheap to clone; clones share the
/// same write lock.
#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    images_dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>, images_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                images_dir: images_dir.into(),
                lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(&storage.metadata_path, &storage.images_dir)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn images_dir(&self) -> &Path {
        &self.inner.images_dir
    }

    /// Read the document from disk, migrating legacy shapes.
    ///
    /// A missing file yields a fresh, empty document. A file that is not
    /// valid JSON is an error; it is never silently replaced.
    pub fn load(&self) -> Result<Document> {
        read_document(&self.inner.path)
    }

    /// Atomically replace the document on disk.
    pub fn save(&self, doc: &Document) -> Result<()> {
        write_document(&self.inner.path, doc)
    }

    /// [`load`](Self::load) on the blocking pool.
    pub async fn read(&self) -> Result<Document> {
        let path = self.inner.path.clone();
        tokio::task::spawn_blocking(move || read_document(&path)).await?
    }

    /// Begin a scoped, unserialized mutation.
    pub fn write(&self) -> Result<DocumentGuard<'_>> {
        let doc = self.load()?;
        Ok(DocumentGuard {
            store: self,
            doc,
            saved: false,
        })
    }

    /// Begin a serialized mutation.
    ///
    /// Waits (asynchronously, in FIFO order) for every earlier atomic
    /// mutation to finish saving, then loads the current on-disk state.
    pub async fn atomic(&self) -> Result<AtomicWrite> {
        let guard = Arc::clone(&self.inner.lock).lock_owned().await;
        let path = self.inner.path.clone();
        let doc = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || read_document(&path)).await??
        };
        Ok(AtomicWrite {
            path,
            doc,
            guard: Some(guard),
        })
    }

    /// Run `f` inside an atomic mutation and commit.
    ///
    /// The document is saved even if `f` returns an error; `f`'s error wins
    /// over a save error only when the save succeeded.
    pub async fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Document) -> Result<T>,
    {
        let mut write = self.atomic().await?;
        let out = f(&mut *write);
        write.commit().await?;
        out
    }

    /// Delete an image's backing file and drop it from favorites.
    ///
    /// Best effort: a missing file is fine, and a path outside the images
    /// directory or an I/O failure is logged rather than returned. The image
    /// record itself stays in its prompt; removing it is the caller's job
    /// within the same mutation.
    pub fn delete_image_file(&self, doc: &mut Document, image_id: &str, image_path: &str) {
        remove_file_logged(&self.inner.images_dir, image_id, image_path);
        doc.remove_favorite(image_id);
    }

    /// Delete backing files for `(image_id, image_path)` pairs on the
    /// blocking pool. Same best-effort rules as [`Self::delete_image_file`].
    ///
    /// For async callers: clear favorites inside the mutation, then call this
    /// once the document is saved, so no file I/O happens under the lock.
    pub async fn delete_image_files(&self, files: Vec<(String, String)>) {
        if files.is_empty() {
            return;
        }
        let images_dir = self.inner.images_dir.clone();
        let removal = tokio::task::spawn_blocking(move || {
            for (image_id, image_path) in &files {
                remove_file_logged(&images_dir, image_id, image_path);
            }
        });
        if let Err(e) = removal.await {
            error!(error = %e, "image file removal task failed");
        }
    }
}

fn remove_file_logged(images_dir: &Path, image_id: &str, image_path: &str) {
    match assets::remove_image_file(images_dir, image_path) {
        Ok(true) => debug!(image_id, image_path, "deleted image file"),
        Ok(false) => debug!(image_id, image_path, "image file already absent"),
        Err(e) => warn!(image_id, image_path, error = %e, "could not delete image file"),
    }
}

/// Guard returned by [`MetadataStore::write`].
pub struct DocumentGuard<'a> {
    store: &'a MetadataStore,
    doc: Document,
    saved: bool,
}

impl DocumentGuard<'_> {
    /// Save now and report any write error.
    pub fn commit(mut self) -> Result<()> {
        self.saved = true;
        self.store.save(&self.doc)
    }
}

impl Deref for DocumentGuard<'_> {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.doc
    }
}

impl DerefMut for DocumentGuard<'_> {
    fn deref_mut(&mut self) -> &mut Document {
        &mut self.doc
    }
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        if self.saved {
            return;
        }
        if let Err(e) = self.store.save(&self.doc) {
            error!(path = %self.store.path().display(), error = %e, "failed to save metadata document");
        }
    }
}

/// Guard returned by [`MetadataStore::atomic`]. Holds the write lock.
pub struct AtomicWrite {
    path: PathBuf,
    doc: Document,
    guard: Option<OwnedMutexGuard<()>>,
}

impl AtomicWrite {
    /// Save on the blocking pool, then release the lock.
    pub async fn commit(mut self) -> Result<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let doc = std::mem::take(&mut self.doc);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let result = write_document(&path, &doc);
            drop(guard);
            result
        })
        .await?
    }
}

impl Deref for AtomicWrite {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.doc
    }
}

impl DerefMut for AtomicWrite {
    fn deref_mut(&mut self) -> &mut Document {
        &mut self.doc
    }
}

impl Drop for AtomicWrite {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let doc = std::mem::take(&mut self.doc);
        let path = std::mem::take(&mut self.path);
        let save = move || {
            if let Err(e) = write_document(&path, &doc) {
                error!(path = %path.display(), error = %e, "failed to save metadata document");
            }
            // The lock is released only once the document is on disk.
            drop(guard);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(save);
            }
            Err(_) => save(),
        }
    }
}

fn read_document(path: &Path) -> Result<Document> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read metadata: {}", path.display()))
        }
    };
    let raw: serde_json::Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Metadata document is not valid JSON: {}", path.display()))?;
    migrate::upgrade(raw).with_context(|| format!("Failed to load metadata: {}", path.display()))
}

fn write_document(path: &Path, doc: &Document) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(doc)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&json)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace metadata: {}", path.display()))?;
    Ok(())
}
