//! Reranking: re-score retrieved nodes against the query and keep the
//! best `top_n`.
//!
//! A [`Reranker`] only produces scores. [`rerank_nodes`] applies them,
//! sorts (ties keep retrieval order), and truncates. The cross-encoder
//! backend lives in the app crate; [`LexicalReranker`] is a dependency-free
//! term-overlap scorer used when no model is configured.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::RetrievedNode;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// One relevance score per passage, in passage order. Higher is better.
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>>;
}

/// Apply `scores` to `nodes`, order by descending score, keep `top_n`.
pub fn rerank_nodes(
    mut nodes: Vec<RetrievedNode>,
    scores: &[f32],
    top_n: usize,
) -> Result<Vec<RetrievedNode>> {
    if nodes.len() != scores.len() {
        bail!(
            "reranker returned {} scores for {} nodes",
            scores.len(),
            nodes.len()
        );
    }
    for (node, score) in nodes.iter_mut().zip(scores) {
        node.score = f64::from(*score);
    }
    nodes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.retrieval_rank.cmp(&b.retrieval_rank))
    });
    nodes.truncate(top_n);
    Ok(nodes)
}

/// Scores passages by how many distinct query terms they contain,
/// with a damped bonus for repeated occurrences.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalReranker;

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
}

impl LexicalReranker {
    pub fn score_one(query_terms: &HashSet<String>, passage: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let mut tf: HashMap<String, usize> = HashMap::new();
        for t in terms(passage) {
            if query_terms.contains(&t) {
                *tf.entry(t).or_insert(0) += 1;
            }
        }
        let total: f32 = tf.values().map(|&n| 1.0 + (n as f32).ln()).sum();
        total / query_terms.len() as f32
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        let query_terms: HashSet<String> = terms(query).collect();
        Ok(passages
            .iter()
            .map(|p| Self::score_one(&query_terms, p))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, payload: &str, rank: usize) -> RetrievedNode {
        RetrievedNode {
            identity: id.to_string(),
            payload: payload.to_string(),
            metadata: serde_json::json!({}),
            score: 1.0 - rank as f64 * 0.1,
            retrieval_rank: rank,
        }
    }

    #[test]
    fn test_rerank_orders_and_truncates() {
        let nodes = vec![node("a", "", 0), node("b", "", 1), node("c", "", 2)];
        let out = rerank_nodes(nodes, &[0.1, 0.9, 0.5], 2).unwrap();
        let ids: Vec<_> = out.iter().map(|n| n.identity.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!((out[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_rerank_ties_keep_retrieval_order() {
        let nodes = vec![node("a", "", 0), node("b", "", 1), node("c", "", 2)];
        let out = rerank_nodes(nodes, &[0.5, 0.5, 0.5], 3).unwrap();
        let ids: Vec<_> = out.iter().map(|n| n.identity.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rerank_rejects_length_mismatch() {
        assert!(rerank_nodes(vec![node("a", "", 0)], &[], 1).is_err());
    }

    #[tokio::test]
    async fn test_lexical_prefers_matching_passage() {
        let scores = LexicalReranker
            .score(
                "how is the database migrated",
                &["fn render() { draw(); }", "run the database migration before start"],
            )
            .await
            .unwrap();
        assert!(scores[1] > scores[0]);
        assert_eq!(scores[0], 0.0);
    }
}
