//! Vector similarity search over documents and Q&A pairs.
//!
//! Every query runs the same steps for each table it touches:
//!
//! 1. Embed the query through the [`EmbeddingGate`]. A failure here fails
//!    the whole search.
//! 2. Ask the store's vector index for the top `limit` neighbours that
//!    pass the filters.
//! 3. If the index errors, answers with zero rows, or answers a filtered
//!    query short without filtering exhaustively, run the full scan with
//!    the same filters and limit.
//! 4. Convert cosine distance to similarity (`1 - distance`, `-1` when
//!    the distance is missing or NaN).
//! 5. Drop results below the threshold, sort by similarity descending with
//!    id as tiebreak, truncate to `limit`.
//!
//! Steps 2–4 live in [`nearest_neighbors`], shared by both tables.
//! An empty store or an empty filtered set is a successful empty search;
//! only a failing full scan is a [`CoreError::Search`].

use std::cmp::Ordering;
use std::sync::Arc;

use crate::embed_gate::EmbeddingGate;
use crate::embedding::similarity_from_distance;
use crate::error::{CoreError, CoreResult};
use crate::models::{RecordKind, SearchFilters, SearchResult};
use crate::store::{KnowledgeStore, OpenStore};

pub struct VectorSearchEngine {
    gate: Arc<EmbeddingGate>,
    store: Arc<KnowledgeStore>,
}

impl VectorSearchEngine {
    pub fn new(gate: Arc<EmbeddingGate>, store: Arc<KnowledgeStore>) -> Self {
        Self { gate, store }
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    /// Search documents and Q&A pairs together.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.search_kinds(&[RecordKind::Document, RecordKind::Qa], query, limit, threshold, filters)
            .await
    }

    pub async fn search_documents(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.search_kinds(&[RecordKind::Document], query, limit, threshold, filters)
            .await
    }

    pub async fn search_qa(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.search_kinds(&[RecordKind::Qa], query, limit, threshold, filters)
            .await
    }

    /// Search with an already computed query vector.
    pub async fn search_vector(
        &self,
        kinds: &[RecordKind],
        query: &[f32],
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let reader = self.store.reader().await?;

        let mut results = Vec::new();
        for &kind in kinds {
            results.extend(nearest_neighbors(&reader, kind, filters, query, limit).await?);
        }
        Ok(select_results(results, limit, threshold))
    }

    async fn search_kinds(
        &self,
        kinds: &[RecordKind],
        query: &str,
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        // Fail fast before spending an inference on a closed store.
        if !self.store.is_open().await {
            return Err(CoreError::NotReady("no knowledge store is open".to_string()));
        }
        let vector = self.gate.embed(query).await?;
        let results = self
            .search_vector(kinds, &vector, limit, threshold, filters)
            .await?;
        tracing::debug!(query, results = results.len(), threshold, "search finished");
        Ok(results)
    }
}

/// Top `limit` records of one table, index first, full scan as fallback.
///
/// Results carry similarities but are not yet threshold-filtered.
pub async fn nearest_neighbors(
    store: &OpenStore,
    kind: RecordKind,
    filters: &SearchFilters,
    query: &[f32],
    limit: usize,
) -> CoreResult<Vec<SearchResult>> {
    let neighbors = match store.index_top_k(kind, filters, query, limit).await {
        Ok(rows) if !rows.is_empty() && !filtered_short(store, filters, rows.len(), limit) => rows,
        Ok(rows) => {
            tracing::debug!(
                table = kind.table(),
                index = store.index_name(),
                rows = rows.len(),
                "index answer incomplete, scanning"
            );
            store
                .scan_top_k(kind, filters, query, limit)
                .await
                .map_err(CoreError::search)?
        }
        Err(e) => {
            tracing::warn!(table = kind.table(), index = store.index_name(), error = %e, "vector index failed, scanning");
            store
                .scan_top_k(kind, filters, query, limit)
                .await
                .map_err(CoreError::search)?
        }
    };

    let ids: Vec<String> = neighbors.iter().map(|n| n.id.clone()).collect();
    let mut records = store
        .fetch_records(kind, &ids)
        .await
        .map_err(CoreError::search)?;

    Ok(neighbors
        .into_iter()
        .filter_map(|n| {
            records.remove(&n.id).map(|record| SearchResult {
                record,
                similarity: similarity_from_distance(n.distance),
            })
        })
        .collect())
}

/// A filtered answer shorter than `limit` from an index that may have
/// filtered after its own cut can hide matching rows.
fn filtered_short(store: &OpenStore, filters: &SearchFilters, rows: usize, limit: usize) -> bool {
    rows < limit && !filters.is_empty() && !store.index_filters_exhaustively()
}

/// Threshold, order, and truncate a candidate set.
pub fn select_results(
    mut results: Vec<SearchResult>,
    limit: usize,
    threshold: f32,
) -> Vec<SearchResult> {
    results.retain(|r| r.similarity >= threshold);
    results.sort_by(compare_results);
    results.truncate(limit);
    results
}

fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.record.id().cmp(b.record.id()))
        .then_with(|| kind_rank(a.record.kind()).cmp(&kind_rank(b.record.kind())))
}

fn kind_rank(kind: RecordKind) -> u8 {
    match kind {
        RecordKind::Document => 0,
        RecordKind::Qa => 1,
    }
}
