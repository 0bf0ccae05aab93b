//! In-memory [`VectorStore`] for tests and embedding-free tooling.
//!
//! Collections are `HashMap`s behind a `std::sync::RwLock`. Queries are
//! brute-force cosine similarity over every record in the collection.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{RetrievedNode, VectorRecord};
use crate::reconcile::Fingerprint;

use super::{rank_candidates, VectorStore};

type Collections = HashMap<String, HashMap<String, VectorRecord>>;

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<Collections>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.collections
            .read()
            .map_err(|_| anyhow!("vector store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.collections
            .write()
            .map_err(|_| anyhow!("vector store lock poisoned"))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn get_or_create(&self, collection: &str) -> Result<()> {
        self.write()?.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn fingerprints(&self, collection: &str) -> Result<HashMap<String, Fingerprint>> {
        let guard = self.read()?;
        let Some(records) = guard.get(collection) else {
            return Ok(HashMap::new());
        };
        Ok(records
            .values()
            .map(|r| {
                (
                    r.identity.clone(),
                    Fingerprint {
                        content_hash: r.content_hash.clone(),
                        source_path: r.source_path.clone(),
                        document_hash: r.document_hash.clone(),
                        fragment_count: r.fragment_count,
                    },
                )
            })
            .collect())
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<()> {
        let mut guard = self.write()?;
        let records = guard
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection `{collection}` does not exist"))?;
        records.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, collection: &str, identity: &str) -> Result<()> {
        if let Some(records) = self.write()?.get_mut(collection) {
            records.remove(identity);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedNode>> {
        let guard = self.read()?;
        let Some(records) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        let scored = records
            .values()
            .map(|r| RetrievedNode {
                identity: r.identity.clone(),
                payload: r.payload.clone(),
                metadata: r.metadata.clone(),
                score: f64::from(cosine_similarity(vector, &r.embedding)),
                retrieval_rank: 0,
            })
            .collect();
        Ok(rank_candidates(scored, top_k))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.write()?.remove(collection);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.read()?.get(collection).map_or(0, HashMap::len))
    }
}
