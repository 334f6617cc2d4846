//! Hybrid relevance search over the vector collections: dense cosine scoring
//! fused with BM25 keyword scores from the FTS5 mirrors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::FusionWeights;
use crate::db_call;
use crate::error::StrataError;
use crate::store::{Collection, Correlation, TierStore};
use crate::EmbedCache;

/// Embedding f32 values serialized little-endian for BLOB storage.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity accumulated in f64 for stability on long vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut na = 0.0_f64;
    let mut nb = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StrataError>;
}

/// Deterministic bag-of-tokens hash embedder. No network, stable across
/// processes; the fallback when no embedding backend is configured, and the
/// embedder the tests run against.
pub struct LocalHashEmbedder {
    dims: usize,
}

impl LocalHashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for LocalHashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for LocalHashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StrataError> {
        let mut v = vec![0.0_f32; self.dims];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            v[(h as usize) % self.dims] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

// CJK characters count as single-character tokens, everything else splits on
// non-alphanumerics and lowercases.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in text.chars() {
        if crate::store::is_cjk(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(c.to_string());
        } else if c.is_alphanumeric() {
            word.extend(c.to_lowercase());
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325_u64;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub ref_id: i64,
    pub content: String,
    pub score: f64,
}

/// Dense + sparse search over one collection, with embed caching.
pub struct RelevanceIndex {
    store: Arc<TierStore>,
    embedder: Arc<dyn Embedder>,
    cache: EmbedCache,
}

impl RelevanceIndex {
    pub fn new(store: Arc<TierStore>, embedder: Arc<dyn Embedder>, cache_capacity: usize) -> Self {
        Self { store, embedder, cache: EmbedCache::new(cache_capacity) }
    }

    async fn embed_cached(&self, text: &str) -> Result<Vec<f32>, StrataError> {
        if let Some(v) = self.cache.get(text) {
            return Ok(v);
        }
        let v = self.embedder.embed(text).await?;
        self.cache.put(text.to_string(), v.clone());
        Ok(v)
    }

    /// Fused ranking: `w.dense·cosine + w.sparse·(bm25 / max_bm25)`, candidates
    /// optionally restricted to one user and/or an explicit id set.
    pub async fn search(
        &self,
        coll: Collection,
        query: &str,
        top_k: usize,
        user_id: Option<i64>,
        within: Option<Vec<i64>>,
        weights: FusionWeights,
    ) -> Result<Vec<SearchHit>, StrataError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embed_cached(query).await?;

        let rows = {
            let store = self.store.clone();
            let within = within.clone();
            db_call(move || store.vector_rows(coll, user_id, within.as_deref())).await?
        };
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let sparse = {
            let store = self.store.clone();
            let query = query.to_string();
            let limit = rows.len();
            db_call(move || {
                store.fts_search(coll, &query, user_id, within.as_deref(), limit)
            })
            .await?
        };
        let max_bm25 = sparse.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
        let sparse_by_id: HashMap<i64, f64> = sparse
            .into_iter()
            .map(|(id, s)| (id, if max_bm25 > 0.0 { s / max_bm25 } else { 0.0 }))
            .collect();

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|row| {
                let dense = cosine_similarity(&query_vec, &row.embedding).max(0.0);
                let bm25 = sparse_by_id.get(&row.ref_id).copied().unwrap_or(0.0);
                SearchHit {
                    ref_id: row.ref_id,
                    content: row.content,
                    score: weights.dense * dense + weights.sparse * bm25,
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        debug!(?coll, top = hits.len(), "relevance search");
        Ok(hits)
    }

    /// Best-matching segment for a piece of text, if the user has any.
    pub async fn most_relevant_segment(
        &self,
        user_id: i64,
        text: &str,
        weights: FusionWeights,
    ) -> Result<Option<Correlation>, StrataError> {
        let hits = self
            .search(Collection::Segments, text, 1, Some(user_id), None, weights)
            .await?;
        Ok(hits
            .first()
            .map(|h| Correlation { segment_id: h.ref_id, score: h.score }))
    }

    /// Rank a fixed set of pages against a query; returns page ids, best first.
    pub async fn top_k_pages(
        &self,
        page_ids: Vec<i64>,
        query: &str,
        top_k: usize,
        weights: FusionWeights,
    ) -> Result<Vec<i64>, StrataError> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self
            .search(Collection::Pages, query, top_k, None, Some(page_ids), weights)
            .await?;
        Ok(hits.into_iter().map(|h| h.ref_id).collect())
    }

    /// Highest fused similarity between `text` and the user's stored knowledge.
    /// `None` when the user has no knowledge yet.
    pub async fn best_knowledge_score(
        &self,
        user_id: i64,
        text: &str,
        weights: FusionWeights,
    ) -> Result<Option<f64>, StrataError> {
        let hits = self
            .search(Collection::Knowledge, text, 1, Some(user_id), None, weights)
            .await?;
        Ok(hits.first().map(|h| h.score))
    }

    pub async fn index_text(
        &self,
        coll: Collection,
        ref_id: i64,
        user_id: i64,
        content: &str,
    ) -> Result<(), StrataError> {
        let embedding = self.embed_cached(content).await?;
        let store = self.store.clone();
        let content = content.to_string();
        db_call(move || store.vector_insert(coll, ref_id, user_id, &content, &embedding)).await
    }

    pub async fn remove(&self, coll: Collection, ref_ids: Vec<i64>) -> Result<(), StrataError> {
        let store = self.store.clone();
        db_call(move || store.vector_delete(coll, &ref_ids)).await
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache.hits(), self.cache.misses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> FusionWeights {
        FusionWeights { dense: 0.7, sparse: 0.3 }
    }

    async fn seeded_index() -> (Arc<TierStore>, RelevanceIndex) {
        let store = Arc::new(TierStore::open(":memory:").expect("store"));
        let index =
            RelevanceIndex::new(store.clone(), Arc::new(LocalHashEmbedder::default()), 64);
        (store, index)
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let e = LocalHashEmbedder::default();
        let a = e.embed("likes pour-over coffee").await.unwrap();
        let b = e.embed("likes pour-over coffee").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let v = vec![0.25_f32, -1.5, 3.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }

    #[tokio::test]
    async fn search_ranks_topical_match_first() {
        let (_store, index) = seeded_index().await;
        index
            .index_text(Collection::Segments, 1, 7, "coffee brewing and espresso machines")
            .await
            .unwrap();
        index
            .index_text(Collection::Segments, 2, 7, "weekend hiking trails and weather")
            .await
            .unwrap();

        let hits = index
            .search(Collection::Segments, "how to brew coffee", 2, Some(7), None, weights())
            .await
            .unwrap();
        assert_eq!(hits[0].ref_id, 1);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn search_respects_id_subset() {
        let (_store, index) = seeded_index().await;
        for (id, text) in [(1, "coffee notes"), (2, "coffee beans"), (3, "tea ceremony")] {
            index.index_text(Collection::Pages, id, 7, text).await.unwrap();
        }
        let ranked = index
            .top_k_pages(vec![2, 3], "coffee", 5, weights())
            .await
            .unwrap();
        assert_eq!(ranked.first().copied(), Some(2));
        assert!(!ranked.contains(&1));
    }

    #[tokio::test]
    async fn knowledge_score_none_when_empty() {
        let (_store, index) = seeded_index().await;
        let score = index.best_knowledge_score(9, "anything", weights()).await.unwrap();
        assert!(score.is_none());
    }

    #[tokio::test]
    async fn identical_knowledge_scores_high() {
        let (_store, index) = seeded_index().await;
        index
            .index_text(Collection::Knowledge, 1, 9, "user prefers black coffee")
            .await
            .unwrap();
        let score = index
            .best_knowledge_score(9, "user prefers black coffee", weights())
            .await
            .unwrap()
            .unwrap();
        assert!(score > 0.9, "got {score}");
    }
}
