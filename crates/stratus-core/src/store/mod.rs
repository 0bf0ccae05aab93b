//! Vector store abstraction.
//!
//! The [`VectorStore`] trait covers everything ingestion and retrieval
//! need from a store: named collections, per-identity fingerprints for
//! reconciliation, upsert/delete of single records, and similarity
//! queries. Implementations must be `Send + Sync` to be shared across
//! tasks.

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{RetrievedNode, VectorRecord};
use crate::reconcile::Fingerprint;

/// Abstract vector store keyed by `(collection, identity)`.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_or_create`](VectorStore::get_or_create) | Ensure a collection exists |
/// | [`fingerprints`](VectorStore::fingerprints) | Stored hashes per identity |
/// | [`upsert`](VectorStore::upsert) | Insert or replace one record |
/// | [`delete`](VectorStore::delete) | Remove one record |
/// | [`query`](VectorStore::query) | Top-k cosine similarity search |
/// | [`drop_collection`](VectorStore::drop_collection) | Remove a collection and its records |
/// | [`count`](VectorStore::count) | Number of records in a collection |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn get_or_create(&self, collection: &str) -> Result<()>;

    /// Fingerprints of every record in the collection, keyed by identity.
    /// Empty for an unknown collection.
    async fn fingerprints(&self, collection: &str) -> Result<HashMap<String, Fingerprint>>;

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<()>;

    /// Delete one record. Deleting an absent identity is not an error.
    async fn delete(&self, collection: &str, identity: &str) -> Result<()>;

    /// The `top_k` records most similar to `vector`, by descending score,
    /// with `retrieval_rank` set to the position in that order. An unknown
    /// or empty collection yields no nodes.
    async fn query(&self, collection: &str, vector: &[f32], top_k: usize)
        -> Result<Vec<RetrievedNode>>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Order scored candidates and assign retrieval ranks.
///
/// Shared by store implementations so that ranking ties resolve the same
/// way everywhere: by identity.
pub fn rank_candidates(mut scored: Vec<RetrievedNode>, top_k: usize) -> Vec<RetrievedNode> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.identity.cmp(&b.identity))
    });
    scored.truncate(top_k);
    for (rank, node) in scored.iter_mut().enumerate() {
        node.retrieval_rank = rank;
    }
    scored
}
