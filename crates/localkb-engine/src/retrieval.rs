//! Similarity and Maximal Marginal Relevance queries.
//!
//! Parameters are validated before anything is read or embedded. Queries only
//! ever hold the collection's read lock, and only after the query text has
//! been embedded.

use localkb_core::error::{QueryError, Result};
use localkb_core::types::{Chunk, ScoredChunk};
use localkb_vector::{cosine_similarity, CollectionState};

use crate::KnowledgeBase;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmrParams {
    pub k: usize,
    pub fetch_k: usize,
    /// 1.0 ranks purely by relevance, 0.0 purely by diversity.
    pub lambda_mult: f32,
}

impl MmrParams {
    pub fn validate(&self) -> std::result::Result<(), QueryError> {
        validate_k(self.k)?;
        if self.fetch_k < self.k {
            return Err(QueryError::InvalidParameters(format!(
                "fetch_k ({}) must be at least k ({})",
                self.fetch_k, self.k
            )));
        }
        if !(0.0..=1.0).contains(&self.lambda_mult) {
            return Err(QueryError::InvalidParameters(format!(
                "lambda_mult ({}) must be within [0, 1]",
                self.lambda_mult
            )));
        }
        Ok(())
    }
}

/// Everything a caller can tune on a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryOptions {
    pub k: usize,
    pub use_mmr: bool,
    pub fetch_k: usize,
    pub lambda_mult: f32,
}

impl QueryOptions {
    pub fn mmr(&self) -> MmrParams {
        MmrParams { k: self.k, fetch_k: self.fetch_k, lambda_mult: self.lambda_mult }
    }
}

fn validate_k(k: usize) -> std::result::Result<(), QueryError> {
    if k == 0 {
        return Err(QueryError::InvalidParameters("k must be at least 1".to_string()));
    }
    Ok(())
}

fn validate_text(query: &str) -> std::result::Result<(), QueryError> {
    if query.trim().is_empty() {
        return Err(QueryError::InvalidParameters("query text must not be empty".to_string()));
    }
    Ok(())
}

fn validate_vector(state: &CollectionState, query: &[f32]) -> std::result::Result<(), QueryError> {
    if query.iter().any(|x| !x.is_finite()) {
        return Err(QueryError::InvalidParameters("query embedding has non-finite components".to_string()));
    }
    match state.dimension() {
        Some(expected) if expected != query.len() => {
            Err(QueryError::DimensionMismatch { expected, actual: query.len() })
        }
        _ => Ok(()),
    }
}

/// Top `k` chunks by cosine similarity, highest first. The sort is stable, so
/// equal scores keep insertion order.
fn ranked<'a>(state: &'a CollectionState, query: &[f32], k: usize) -> Vec<(&'a Chunk, &'a [f32], f32)> {
    let mut scored: Vec<(&Chunk, &[f32], f32)> =
        state.scan().map(|(chunk, vector)| (chunk, vector, cosine_similarity(query, vector))).collect();
    scored.sort_by(|a, b| b.2.total_cmp(&a.2));
    scored.truncate(k);
    scored
}

/// Greedy MMR selection over a candidate pool given in relevance order.
///
/// Each step picks the candidate maximising
/// `lambda * relevance - (1 - lambda) * max_similarity_to_selected`, where the
/// second term is 0 while nothing is selected. Ties go to the earlier
/// candidate. Returns indices into the pool, in selection order.
pub fn select_mmr(relevance: &[f32], vectors: &[&[f32]], k: usize, lambda_mult: f32) -> Vec<usize> {
    let n = relevance.len().min(vectors.len());
    let lambda = f64::from(lambda_mult);
    let mut pool: Vec<usize> = (0..n).collect();
    let mut redundancy = vec![0f64; n];
    let mut selected = Vec::with_capacity(k.min(n));

    while selected.len() < k && !pool.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (pos, &i) in pool.iter().enumerate() {
            let score = lambda * f64::from(relevance[i]) - (1.0 - lambda) * redundancy[i];
            if pos == 0 || score > best_score {
                best_pos = pos;
                best_score = score;
            }
        }
        let chosen = pool.remove(best_pos);
        for &i in &pool {
            let sim = f64::from(cosine_similarity(vectors[i], vectors[chosen]));
            redundancy[i] = if selected.is_empty() { sim } else { redundancy[i].max(sim) };
        }
        selected.push(chosen);
    }
    selected
}

impl KnowledgeBase {
    /// Defaults from the `retrieval` settings.
    pub fn query_options(&self) -> QueryOptions {
        let r = &self.settings().retrieval;
        QueryOptions { k: r.k, use_mmr: r.use_mmr, fetch_k: r.fetch_k, lambda_mult: r.lambda_mult }
    }

    /// True when the collection exists and holds at least one chunk.
    async fn has_chunks(&self, collection: &str) -> Result<bool> {
        Ok(self.store().read(collection).await?.is_some_and(|state| !state.is_empty()))
    }

    /// The `k` chunks most similar to `query`, by descending cosine score. An
    /// empty or missing collection yields no results.
    pub async fn similarity_search(&self, collection: &str, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        validate_text(query)?;
        validate_k(k)?;
        if !self.has_chunks(collection).await? {
            return Ok(Vec::new());
        }
        let vector = self.batcher().embed_one(query).await?;
        self.similarity_search_by_vector(collection, &vector, k).await
    }

    pub async fn similarity_search_by_vector(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        validate_k(k)?;
        let Some(state) = self.store().read(collection).await? else {
            return Ok(Vec::new());
        };
        validate_vector(&state, query)?;
        Ok(ranked(&state, query, k)
            .into_iter()
            .map(|(chunk, _, score)| ScoredChunk { chunk: chunk.clone(), score })
            .collect())
    }

    /// MMR over the `fetch_k` most similar chunks. Scores in the result are
    /// each chunk's relevance to the query, not its MMR score.
    pub async fn mmr_search(&self, collection: &str, query: &str, params: MmrParams) -> Result<Vec<ScoredChunk>> {
        validate_text(query)?;
        params.validate()?;
        if !self.has_chunks(collection).await? {
            return Ok(Vec::new());
        }
        let vector = self.batcher().embed_one(query).await?;
        self.mmr_search_by_vector(collection, &vector, params).await
    }

    pub async fn mmr_search_by_vector(
        &self,
        collection: &str,
        query: &[f32],
        params: MmrParams,
    ) -> Result<Vec<ScoredChunk>> {
        params.validate()?;
        let Some(state) = self.store().read(collection).await? else {
            return Ok(Vec::new());
        };
        validate_vector(&state, query)?;
        let candidates = ranked(&state, query, params.fetch_k);
        let relevance: Vec<f32> = candidates.iter().map(|c| c.2).collect();
        let vectors: Vec<&[f32]> = candidates.iter().map(|c| c.1).collect();
        Ok(select_mmr(&relevance, &vectors, params.k, params.lambda_mult)
            .into_iter()
            .map(|i| ScoredChunk { chunk: candidates[i].0.clone(), score: candidates[i].2 })
            .collect())
    }

    /// Similarity or MMR search depending on `opts.use_mmr`.
    pub async fn query(&self, collection: &str, query: &str, opts: &QueryOptions) -> Result<Vec<ScoredChunk>> {
        if opts.use_mmr {
            self.mmr_search(collection, query, opts.mmr()).await
        } else {
            self.similarity_search(collection, query, opts.k).await
        }
    }
}
