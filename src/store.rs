//! Shared handle to the open knowledge store.
//!
//! The process holds at most one open artifact, behind a single
//! reader/writer lock: searches hold the read side for their whole
//! duration, while [`KnowledgeStore::swap_in`] takes the write side to
//! close the old connection, move a freshly validated file into place,
//! and reopen. A download in progress therefore never disturbs reads of
//! the previous artifact.
//!
//! Nearest-neighbour queries go through the [`VectorIndex`] trait:
//!
//! | Mode | Index |
//! |------|-------|
//! | `libsql` | [`LibsqlIndex`], the artifact's native `vector_top_k` index |
//! | `flat` | [`FlatIndex`], exact in-memory index built when the artifact opens |
//! | `none` | [`NoIndex`], always unavailable |
//!
//! [`OpenStore::scan_top_k`] is the full linear scan every index falls
//! back to.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::db;
use crate::embedding::{blob_to_vec, cosine_distance};
use crate::error::{CoreError, CoreResult};
use crate::models::{Document, QaPair, RecordKind, SearchFilters, VectorRecord};

/// SQLite caps bound parameters per statement; stay well below it.
const LOOKUP_BATCH: usize = 500;

/// Filtered libSQL queries start by fetching this many times `k`.
const LIBSQL_OVERFETCH: usize = 4;
/// Growth stops once the fetch reaches this many times `k`.
const LIBSQL_MAX_FETCH_FACTOR: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Libsql,
    Flat,
    None,
}

impl FromStr for IndexMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "libsql" => Ok(IndexMode::Libsql),
            "flat" => Ok(IndexMode::Flat),
            "none" => Ok(IndexMode::None),
            other => Err(CoreError::Search(format!("unknown index mode: {}", other))),
        }
    }
}

/// One nearest-neighbour candidate. `distance` is cosine distance in
/// `[0, 2]`, `None` when it could not be computed.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: Option<f32>,
}

#[derive(Debug, Error)]
pub enum IndexError {
    /// The index does not exist or the engine lacks vector support.
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    #[error("vector index query failed: {0}")]
    Query(sqlx::Error),
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        let missing = ["no such function", "no such module", "no such table", "vector"]
            .iter()
            .any(|needle| message.contains(needle));
        if missing {
            IndexError::Unavailable(message)
        } else {
            IndexError::Query(err)
        }
    }
}

/// Accelerated top-K lookup over one table.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a short filtered answer means fewer than `k` rows match.
    /// Indexes that filter after their own top-K cut cannot promise that.
    fn filters_exhaustively(&self) -> bool {
        false
    }

    /// Up to `k` neighbours of `query` that satisfy `filters`, nearest first.
    async fn top_k(
        &self,
        pool: &SqlitePool,
        kind: RecordKind,
        filters: &SearchFilters,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, IndexError>;
}

/// Sort nearest first; uncomputable distances last; ties by id.
pub fn rank_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        let da = a.distance.filter(|d| d.is_finite());
        let db = b.distance.filter(|d| d.is_finite());
        match (da, db) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| a.id.cmp(&b.id))
    });
}

// ============ libSQL native index ============

/// Queries the `<table>_embedding_idx` index shipped inside the artifact.
pub struct LibsqlIndex;

#[async_trait]
impl VectorIndex for LibsqlIndex {
    fn name(&self) -> &'static str {
        "libsql"
    }

    async fn top_k(
        &self,
        pool: &SqlitePool,
        kind: RecordKind,
        filters: &SearchFilters,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, IndexError> {
        let query_json = serde_json::to_string(query)
            .map_err(|e| IndexError::Unavailable(format!("cannot encode query: {}", e)))?;

        let sql = match kind {
            RecordKind::Document => {
                r#"
                SELECT d.id AS id,
                       vector_distance_cos(d.embedding, vector32(?)) AS distance,
                       d.specialty AS specialty,
                       d.year AS year
                FROM vector_top_k('documents_embedding_idx', vector32(?), ?) AS v
                JOIN documents d ON d.rowid = v.id
                "#
            }
            RecordKind::Qa => {
                r#"
                SELECT q.id AS id,
                       vector_distance_cos(q.embedding, vector32(?)) AS distance,
                       d.specialty AS specialty,
                       d.year AS year
                FROM vector_top_k('medical_qa_embedding_idx', vector32(?), ?) AS v
                JOIN medical_qa q ON q.rowid = v.id
                LEFT JOIN documents d ON d.id = q.document_id
                "#
            }
        };

        // `vector_top_k` cuts before any WHERE clause applies, so filtered
        // queries over-fetch and grow the fetch until `k` rows match or the
        // index runs dry.
        let max_fetch = k.saturating_mul(LIBSQL_MAX_FETCH_FACTOR);
        let mut fetch = if filters.is_empty() {
            k
        } else {
            k.saturating_mul(LIBSQL_OVERFETCH)
        };

        loop {
            let rows = sqlx::query(sql)
                .bind(&query_json)
                .bind(&query_json)
                .bind(fetch as i64)
                .fetch_all(pool)
                .await?;
            let fetched = rows.len();

            let mut neighbors = Vec::with_capacity(fetched);
            for row in &rows {
                let specialty: Option<String> = row.try_get("specialty")?;
                let year: Option<i64> = row.try_get("year")?;
                if !filters.matches(specialty.as_deref(), year) {
                    continue;
                }
                let distance: Option<f64> = row.try_get("distance").unwrap_or(None);
                neighbors.push(Neighbor {
                    id: row.try_get("id")?,
                    distance: distance.map(|d| d as f32),
                });
            }

            if neighbors.len() >= k || fetched < fetch || fetch >= max_fetch {
                rank_neighbors(&mut neighbors);
                neighbors.truncate(k);
                return Ok(neighbors);
            }
            tracing::debug!(table = kind.table(), fetch, matched = neighbors.len(), "growing filtered index fetch");
            fetch = fetch.saturating_mul(LIBSQL_OVERFETCH).min(max_fetch);
        }
    }
}

// ============ In-memory flat index ============

struct FlatEntry {
    id: String,
    specialty: Option<String>,
    year: Option<i64>,
    vector: Vec<f32>,
}

/// Exact index holding every stored vector in memory.
pub struct FlatIndex {
    documents: Vec<FlatEntry>,
    qa: Vec<FlatEntry>,
}

impl FlatIndex {
    /// Load every embedded row of both tables.
    pub async fn build(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        Ok(Self {
            documents: load_entries(pool, RecordKind::Document).await?,
            qa: load_entries(pool, RecordKind::Qa).await?,
        })
    }

    pub fn len(&self) -> usize {
        self.documents.len() + self.qa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn load_entries(pool: &SqlitePool, kind: RecordKind) -> Result<Vec<FlatEntry>, sqlx::Error> {
    let sql = match kind {
        RecordKind::Document => {
            "SELECT id, specialty, year, embedding FROM documents WHERE embedding IS NOT NULL"
        }
        RecordKind::Qa => {
            r#"
            SELECT q.id AS id, d.specialty AS specialty, d.year AS year, q.embedding AS embedding
            FROM medical_qa q
            LEFT JOIN documents d ON d.id = q.document_id
            WHERE q.embedding IS NOT NULL
            "#
        }
    };

    let mut entries = Vec::new();
    let mut rows = sqlx::query(sql).fetch(pool);
    while let Some(row) = rows.try_next().await? {
        let blob: Vec<u8> = row.try_get("embedding")?;
        entries.push(FlatEntry {
            id: row.try_get("id")?,
            specialty: row.try_get("specialty")?,
            year: row.try_get("year")?,
            vector: blob_to_vec(&blob),
        });
    }
    Ok(entries)
}

#[async_trait]
impl VectorIndex for FlatIndex {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn filters_exhaustively(&self) -> bool {
        true
    }

    async fn top_k(
        &self,
        _pool: &SqlitePool,
        kind: RecordKind,
        filters: &SearchFilters,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, IndexError> {
        let entries = match kind {
            RecordKind::Document => &self.documents,
            RecordKind::Qa => &self.qa,
        };

        let mut neighbors: Vec<Neighbor> = entries
            .iter()
            .filter(|e| filters.matches(e.specialty.as_deref(), e.year))
            .map(|e| Neighbor {
                id: e.id.clone(),
                distance: cosine_distance(query, &e.vector),
            })
            .collect();

        rank_neighbors(&mut neighbors);
        neighbors.truncate(k);
        Ok(neighbors)
    }
}

/// Index mode `none`: every query goes straight to the full scan.
pub struct NoIndex;

#[async_trait]
impl VectorIndex for NoIndex {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn top_k(
        &self,
        _pool: &SqlitePool,
        _kind: RecordKind,
        _filters: &SearchFilters,
        _query: &[f32],
        _k: usize,
    ) -> Result<Vec<Neighbor>, IndexError> {
        Err(IndexError::Unavailable("index disabled".to_string()))
    }
}

// ============ Open artifact ============

/// A validated artifact with its connection and index.
pub struct OpenStore {
    pool: SqlitePool,
    index: Arc<dyn VectorIndex>,
    path: PathBuf,
}

impl OpenStore {
    async fn open(path: &Path, mode: IndexMode, custom: Option<&Arc<dyn VectorIndex>>) -> CoreResult<Self> {
        let pool = db::open_artifact(path)
            .await
            .map_err(|e| CoreError::Validation(format!("cannot open artifact: {}", e)))?;

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('documents', 'medical_qa')",
        )
        .fetch_one(&pool)
        .await
        .map_err(|e| CoreError::Validation(format!("cannot read artifact schema: {}", e)))?;
        if tables != 2 {
            pool.close().await;
            return Err(CoreError::Validation(
                "artifact is missing the documents or medical_qa table".to_string(),
            ));
        }

        let index: Arc<dyn VectorIndex> = match (custom, mode) {
            (Some(index), _) => Arc::clone(index),
            (None, IndexMode::Libsql) => Arc::new(LibsqlIndex),
            (None, IndexMode::None) => Arc::new(NoIndex),
            (None, IndexMode::Flat) => {
                let flat = FlatIndex::build(&pool)
                    .await
                    .map_err(|e| CoreError::Validation(format!("cannot load vectors: {}", e)))?;
                tracing::info!(vectors = flat.len(), "flat vector index loaded");
                Arc::new(flat)
            }
        };

        tracing::info!(path = %path.display(), index = index.name(), "knowledge store opened");
        Ok(Self {
            pool,
            index,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index_name(&self) -> &'static str {
        self.index.name()
    }

    pub fn index_filters_exhaustively(&self) -> bool {
        self.index.filters_exhaustively()
    }

    pub async fn index_top_k(
        &self,
        kind: RecordKind,
        filters: &SearchFilters,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, IndexError> {
        self.index.top_k(&self.pool, kind, filters, query, k).await
    }

    /// Full linear scan: cosine distance against every embedded row that
    /// passes `filters`, nearest `k` returned.
    pub async fn scan_top_k(
        &self,
        kind: RecordKind,
        filters: &SearchFilters,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, sqlx::Error> {
        let sql = match kind {
            RecordKind::Document => {
                r#"
                SELECT id, embedding FROM documents
                WHERE embedding IS NOT NULL
                  AND (? IS NULL OR specialty = ?)
                  AND (? IS NULL OR year = ?)
                "#
            }
            RecordKind::Qa => {
                r#"
                SELECT q.id AS id, q.embedding AS embedding
                FROM medical_qa q
                LEFT JOIN documents d ON d.id = q.document_id
                WHERE q.embedding IS NOT NULL
                  AND (? IS NULL OR d.specialty = ?)
                  AND (? IS NULL OR d.year = ?)
                "#
            }
        };

        let mut neighbors = Vec::new();
        let mut rows = sqlx::query(sql)
            .bind(&filters.specialty)
            .bind(&filters.specialty)
            .bind(filters.year)
            .bind(filters.year)
            .fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let blob: Vec<u8> = row.try_get("embedding")?;
            neighbors.push(Neighbor {
                id: row.try_get("id")?,
                distance: cosine_distance(query, &blob_to_vec(&blob)),
            });
        }

        rank_neighbors(&mut neighbors);
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Batch-load records of one kind by id.
    pub async fn fetch_records(
        &self,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<HashMap<String, VectorRecord>, sqlx::Error> {
        match kind {
            RecordKind::Document => Ok(self
                .get_documents(ids)
                .await?
                .into_iter()
                .map(|(id, d)| (id, VectorRecord::Document(d)))
                .collect()),
            RecordKind::Qa => Ok(self
                .get_qa(ids)
                .await?
                .into_iter()
                .map(|(id, q)| (id, VectorRecord::Qa(q)))
                .collect()),
        }
    }

    pub async fn get_documents(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Document>, sqlx::Error> {
        let mut found = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(LOOKUP_BATCH) {
            let sql = format!(
                "SELECT id, title, content, url, year, specialty FROM documents WHERE id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let doc = Document {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    content: row.try_get("content")?,
                    url: row.try_get("url")?,
                    year: row.try_get("year")?,
                    specialty: row.try_get("specialty")?,
                };
                found.insert(doc.id.clone(), doc);
            }
        }
        Ok(found)
    }

    async fn get_qa(&self, ids: &[String]) -> Result<HashMap<String, QaPair>, sqlx::Error> {
        let mut found = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(LOOKUP_BATCH) {
            let sql = format!(
                "SELECT id, question, answer, document_id FROM medical_qa WHERE id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let qa = QaPair {
                    id: row.try_get("id")?,
                    question: row.try_get("question")?,
                    answer: row.try_get("answer")?,
                    document_id: row.try_get("document_id")?,
                };
                found.insert(qa.id.clone(), qa);
            }
        }
        Ok(found)
    }

    /// Row counts of `(documents, medical_qa)`.
    pub async fn counts(&self) -> Result<(i64, i64), sqlx::Error> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let qa: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM medical_qa")
            .fetch_one(&self.pool)
            .await?;
        Ok((documents, qa))
    }

    async fn close(self) {
        self.pool.close().await;
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ============ Shared handle ============

/// Batch document metadata lookup used to build citations.
#[async_trait]
pub trait DocumentLookup: Send + Sync {
    async fn get_documents(&self, ids: &[String]) -> CoreResult<HashMap<String, Document>>;
}

/// Process-wide handle to the (at most one) open artifact.
pub struct KnowledgeStore {
    state: RwLock<Option<OpenStore>>,
    mode: IndexMode,
    custom_index: Option<Arc<dyn VectorIndex>>,
}

impl KnowledgeStore {
    pub fn new(mode: IndexMode) -> Self {
        Self {
            state: RwLock::new(None),
            mode,
            custom_index: None,
        }
    }

    /// A store that queries `index` instead of one of the built-in modes.
    pub fn with_index(index: Arc<dyn VectorIndex>) -> Self {
        Self {
            state: RwLock::new(None),
            mode: IndexMode::None,
            custom_index: Some(index),
        }
    }

    pub fn index_mode(&self) -> IndexMode {
        self.mode
    }

    /// Open the artifact at `path`, replacing any open one.
    pub async fn open(&self, path: &Path) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(old) = state.take() {
            old.close().await;
        }
        *state = Some(OpenStore::open(path, self.mode, self.custom_index.as_ref()).await?);
        Ok(())
    }

    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if let Some(old) = state.take() {
            old.close().await;
            tracing::info!("knowledge store closed");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Replace the live artifact at `dest` with the validated file at
    /// `staged` and reopen. Waits for in-flight searches to finish.
    pub async fn swap_in(&self, staged: &Path, dest: &Path) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(old) = state.take() {
            old.close().await;
        }

        if let Err(e) = tokio::fs::rename(staged, dest).await {
            // Keep serving the previous artifact if it is still there.
            if let Ok(previous) = OpenStore::open(dest, self.mode, self.custom_index.as_ref()).await {
                *state = Some(previous);
            }
            return Err(CoreError::Io(e));
        }

        *state = Some(OpenStore::open(dest, self.mode, self.custom_index.as_ref()).await?);
        tracing::info!(path = %dest.display(), "new artifact swapped in");
        Ok(())
    }

    /// Read access for the duration of one query.
    pub async fn reader(&self) -> CoreResult<RwLockReadGuard<'_, OpenStore>> {
        RwLockReadGuard::try_map(self.state.read().await, |state| state.as_ref())
            .map_err(|_| CoreError::NotReady("no knowledge store is open".to_string()))
    }
}

#[async_trait]
impl DocumentLookup for KnowledgeStore {
    async fn get_documents(&self, ids: &[String]) -> CoreResult<HashMap<String, Document>> {
        let reader = self.reader().await?;
        reader.get_documents(ids).await.map_err(CoreError::search)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use tempfile::TempDir;

    fn neighbor(id: &str, distance: Option<f32>) -> Neighbor {
        Neighbor {
            id: id.to_string(),
            distance,
        }
    }

    #[test]
    fn rank_orders_by_distance_then_id() {
        let mut list = vec![
            neighbor("c", Some(0.2)),
            neighbor("b", None),
            neighbor("a", Some(0.2)),
            neighbor("d", Some(0.1)),
            neighbor("e", Some(f32::NAN)),
        ];
        rank_neighbors(&mut list);
        let ids: Vec<&str> = list.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a", "c", "b", "e"]);
    }

    #[test]
    fn missing_vector_support_is_unavailable() {
        let err = IndexError::from(sqlx::Error::Protocol("no such function: vector32".into()));
        assert!(matches!(err, IndexError::Unavailable(_)));
        let err = IndexError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, IndexError::Query(_)));
    }

    #[test]
    fn index_mode_parsing() {
        assert_eq!("flat".parse::<IndexMode>().unwrap(), IndexMode::Flat);
        assert!("hnsw".parse::<IndexMode>().is_err());
    }

    #[tokio::test]
    async fn only_flat_index_filters_exhaustively() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("medical.db");
        migrate::run_migrations(&path).await.unwrap();

        for (mode, exhaustive) in [
            (IndexMode::Flat, true),
            (IndexMode::Libsql, false),
            (IndexMode::None, false),
        ] {
            let store = KnowledgeStore::new(mode);
            store.open(&path).await.unwrap();
            assert_eq!(store.reader().await.unwrap().index_filters_exhaustively(), exhaustive);
        }

        let custom = KnowledgeStore::with_index(Arc::new(LibsqlIndex));
        custom.open(&path).await.unwrap();
        assert_eq!(custom.reader().await.unwrap().index_name(), "libsql");
    }

    #[tokio::test]
    async fn reader_before_open_is_not_ready() {
        let store = KnowledgeStore::new(IndexMode::None);
        assert!(matches!(store.reader().await, Err(CoreError::NotReady(_))));
    }

    #[tokio::test]
    async fn open_rejects_foreign_sqlite_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.db");
        let pool = db::open_writable(&path).await.unwrap();
        sqlx::query("CREATE TABLE notes (id TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let store = KnowledgeStore::new(IndexMode::None);
        assert!(matches!(
            store.open(&path).await,
            Err(CoreError::Validation(_))
        ));
        assert!(!store.is_open().await);
    }

    #[tokio::test]
    async fn libsql_index_is_unavailable_on_plain_sqlite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("medical.db");
        migrate::run_migrations(&path).await.unwrap();

        let store = KnowledgeStore::new(IndexMode::Libsql);
        store.open(&path).await.unwrap();
        let reader = store.reader().await.unwrap();
        let result = reader
            .index_top_k(RecordKind::Document, &SearchFilters::default(), &[1.0, 0.0], 5)
            .await;
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }

    #[tokio::test]
    async fn lookup_batches_large_id_lists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("medical.db");
        migrate::run_migrations(&path).await.unwrap();
        let pool = db::open_writable(&path).await.unwrap();
        for i in 0..(LOOKUP_BATCH + 20) {
            let doc = Document {
                id: format!("doc{}", i),
                title: format!("Title {}", i),
                content: "content".to_string(),
                url: None,
                year: Some(2020),
                specialty: None,
            };
            migrate::insert_document(&pool, &doc, None).await.unwrap();
        }
        pool.close().await;

        let store = KnowledgeStore::new(IndexMode::None);
        store.open(&path).await.unwrap();
        let ids: Vec<String> = (0..(LOOKUP_BATCH + 20)).map(|i| format!("doc{}", i)).collect();
        let docs = store.get_documents(&ids).await.unwrap();
        assert_eq!(docs.len(), LOOKUP_BATCH + 20);
    }
}
