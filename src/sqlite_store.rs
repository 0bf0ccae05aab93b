//! On-disk [`VectorStore`] backed by the `collections` and `vectors`
//! tables.
//!
//! Similarity search is brute force: every vector of the collection is
//! loaded and scored with cosine similarity. This keeps the store
//! dependency-free and is fast enough for per-project collections of a
//! few hundred thousand units.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use stratus_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use stratus_core::models::{RetrievedNode, VectorRecord};
use stratus_core::reconcile::Fingerprint;
use stratus_core::store::{rank_candidates, VectorStore};

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn get_or_create(&self, collection: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(collection)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fingerprints(&self, collection: &str) -> Result<HashMap<String, Fingerprint>> {
        let rows = sqlx::query(
            r#"
            SELECT identity, content_hash, source_path, document_hash, fragment_count
            FROM vectors WHERE collection = ?
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let identity: String = row.get("identity");
                (
                    identity,
                    Fingerprint {
                        content_hash: row.get("content_hash"),
                        source_path: row.get("source_path"),
                        document_hash: row.get("document_hash"),
                        fragment_count: row.get::<i64, _>("fragment_count") as usize,
                    },
                )
            })
            .collect())
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<()> {
        if record.embedding.is_empty() {
            bail!("refusing to store an empty vector for {}", record.identity);
        }
        let metadata_json = serde_json::to_string(&record.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO vectors (collection, identity, source_path, content_hash, document_hash,
                                 fragment_count, payload, metadata_json, embedding, dims, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, identity) DO UPDATE SET
                source_path = excluded.source_path,
                content_hash = excluded.content_hash,
                document_hash = excluded.document_hash,
                fragment_count = excluded.fragment_count,
                payload = excluded.payload,
                metadata_json = excluded.metadata_json,
                embedding = excluded.embedding,
                dims = excluded.dims,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(&record.identity)
        .bind(&record.source_path)
        .bind(&record.content_hash)
        .bind(&record.document_hash)
        .bind(record.fragment_count as i64)
        .bind(&record.payload)
        .bind(&metadata_json)
        .bind(vec_to_blob(&record.embedding))
        .bind(record.embedding.len() as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting {} into collection `{collection}`", record.identity))?;
        Ok(())
    }

    async fn delete(&self, collection: &str, identity: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE collection = ? AND identity = ?")
            .bind(collection)
            .bind(identity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedNode>> {
        let rows = sqlx::query(
            "SELECT identity, payload, metadata_json, embedding FROM vectors WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let scored = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let metadata_json: String = row.get("metadata_json");
                RetrievedNode {
                    identity: row.get("identity"),
                    payload: row.get("payload"),
                    metadata: serde_json::from_str(&metadata_json)
                        .unwrap_or(serde_json::json!({})),
                    score: f64::from(cosine_similarity(vector, &blob_to_vec(&blob))),
                    retrieval_rank: 0,
                }
            })
            .collect();

        Ok(rank_candidates(scored, top_k))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
