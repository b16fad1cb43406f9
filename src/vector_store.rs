//! Durable nearest-neighbor index over image embeddings.
//!
//! One SQLite table, `image_vectors`, keyed by image id. Vectors are stored as
//! little-endian `f32` BLOBs (see [`vec_to_blob`]) and searched brute-force by
//! Euclidean distance, which is exact and fast enough for a personal gallery.
//!
//! Image ids come from clients, so every id is checked against a strict
//! allow-list (`[A-Za-z0-9._-]+`) before it reaches a query. Inserting a
//! malformed id is an error; looking one up or deleting it returns `false`.
//!
//! The table is created once per store, on first access, behind a one-time
//! initialization cell. A concurrent creator winning the race ("already
//! exists") counts as success.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::db;
use crate::embedding::{blob_to_vec, distance_to_score, l2_distance, vec_to_blob};
use crate::models::{SearchHit, VectorRecord};

/// File name of the SQLite database inside the vector directory.
pub const DB_FILE: &str = "vectors.sqlite";

/// Whether `id` is safe to use as a vector-store key.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub struct VectorStore {
    db_path: PathBuf,
    pool: OnceCell<SqlitePool>,
}

impl VectorStore {
    pub fn new(vector_dir: &Path) -> Self {
        Self {
            db_path: vector_dir.join(DB_FILE),
            pool: OnceCell::new(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .get_or_try_init(|| async {
                let pool = db::connect(&self.db_path).await?;
                create_table(&pool).await?;
                debug!(path = %self.db_path.display(), "vector store opened");
                Ok::<_, anyhow::Error>(pool)
            })
            .await
    }

    /// Open the database and create the table if needed.
    pub async fn init(&self) -> Result<()> {
        self.pool().await.map(|_| ())
    }

    /// Insert a vector record unless `id` is already indexed.
    ///
    /// Returns `true` if a row was inserted, `false` if one already existed.
    pub async fn add_image(
        &self,
        id: &str,
        image_path: &str,
        vector: &[f32],
        prompt_id: Option<&str>,
        prompt_text: Option<&str>,
    ) -> Result<bool> {
        if !is_valid_id(id) {
            bail!("Invalid image id for vector store: {:?}", id);
        }
        if vector.is_empty() {
            bail!("Refusing to index an empty vector for {}", id);
        }

        let pool = self.pool().await?;
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO image_vectors (id, image_path, vector, dims, prompt_id, prompt_text, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(image_path)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(prompt_id)
        .bind(prompt_text)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Up to `limit` nearest records to `query`, closest first, skipping
    /// `exclude_ids`.
    pub async fn search_by_vector(
        &self,
        query: &[f32],
        limit: usize,
        exclude_ids: &[&str],
    ) -> Result<Vec<SearchHit>> {
        if query.is_empty() {
            bail!("Query vector is empty");
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT id, image_path, vector, prompt_id, prompt_text, indexed_at FROM image_vectors",
        )
        .fetch_all(pool)
        .await?;

        let mut skipped = 0usize;
        let mut hits: Vec<SearchHit> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let Some(distance) = l2_distance(query, &blob_to_vec(&blob)) else {
                    skipped += 1;
                    return None;
                };
                Some(SearchHit {
                    id: row.get("id"),
                    image_path: row.get("image_path"),
                    prompt_id: row.get("prompt_id"),
                    prompt_text: row.get("prompt_text"),
                    indexed_at: row.get("indexed_at"),
                    distance,
                    score: distance_to_score(distance),
                })
            })
            .collect();

        if skipped > 0 {
            warn!(
                skipped,
                dims = query.len(),
                "vector search skipped records with a different dimensionality"
            );
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        // Exclusion happens after ranking, so fetch enough to still fill `limit`.
        hits.truncate(limit.saturating_add(exclude_ids.len()));
        hits.retain(|hit| !exclude_ids.contains(&hit.id.as_str()));
        hits.truncate(limit);

        Ok(hits)
    }

    /// Remove the record for `id`. Returns `false` if `id` is malformed or not indexed.
    pub async fn delete_image(&self, id: &str) -> Result<bool> {
        if !is_valid_id(id) {
            warn!(id, "rejected malformed image id");
            return Ok(false);
        }
        let pool = self.pool().await?;
        let result = sqlx::query("DELETE FROM image_vectors WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_indexed(&self, id: &str) -> Result<bool> {
        if !is_valid_id(id) {
            return Ok(false);
        }
        let pool = self.pool().await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image_vectors WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await?;
        Ok(n > 0)
    }

    pub async fn get_indexed_ids(&self) -> Result<HashSet<String>> {
        let pool = self.pool().await?;
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM image_vectors")
            .fetch_all(pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn count(&self) -> Result<usize> {
        let pool = self.pool().await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image_vectors")
            .fetch_one(pool)
            .await?;
        Ok(n as usize)
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<VectorRecord>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        let pool = self.pool().await?;
        let row = sqlx::query(
            "SELECT id, image_path, vector, prompt_id, prompt_text, indexed_at FROM image_vectors WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("vector");
            VectorRecord {
                id: r.get("id"),
                image_path: r.get("image_path"),
                vector: blob_to_vec(&blob),
                prompt_id: r.get("prompt_id"),
                prompt_text: r.get("prompt_text"),
                indexed_at: r.get("indexed_at"),
            }
        }))
    }

    /// Close the connection pool, if it was ever opened.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}

async fn create_table(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS image_vectors (
            id TEXT PRIMARY KEY,
            image_path TEXT NOT NULL,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            prompt_id TEXT,
            prompt_text TEXT,
            indexed_at INTEGER NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_image_vectors_prompt_id ON image_vectors(prompt_id)",
    ];

    for sql in statements {
        match sqlx::query(sql).execute(pool).await {
            Ok(_) => {}
            Err(e) if e.to_string().contains("already exists") => {
                debug!("vector table created concurrently");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
