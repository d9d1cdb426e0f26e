//! Shared fixtures for the integration tests: a local artifact server that
//! honours `Range`, fixture stores, and a deterministic embedding backend.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use medcontext::db;
use medcontext::download::DownloadObserver;
use medcontext::embed_gate::EmbeddingGate;
use medcontext::embedding::EmbeddingBackend;
use medcontext::error::{CoreError, EmbeddingError};
use medcontext::migrate;
use medcontext::models::{Document, DownloadProgress, QaPair};
use medcontext::search::VectorSearchEngine;
use medcontext::store::{IndexMode, KnowledgeStore};
use medcontext::validate::SQLITE_MAGIC;

pub const DIMS: usize = 4;

// ============ Artifact server ============

#[derive(Clone)]
pub struct ServeOptions {
    /// Abort the first response once this absolute offset has been sent.
    pub fail_first_at: Option<u64>,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// Answer every request with this status and no body.
    pub status: Option<StatusCode>,
    /// Reply `200` with the full body even to range requests.
    pub ignore_range: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            fail_first_at: None,
            chunk_size: 16 * 1024,
            chunk_delay: Duration::ZERO,
            status: None,
            ignore_range: false,
        }
    }
}

struct ServerState {
    data: Vec<u8>,
    options: ServeOptions,
    cut_done: AtomicBool,
    ranges: Mutex<Vec<Option<String>>>,
}

pub struct ArtifactServer {
    pub url: String,
    state: Arc<ServerState>,
    task: tokio::task::JoinHandle<()>,
}

impl ArtifactServer {
    /// `Range` header of every request received so far, in order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.state.ranges.lock().unwrap().clone()
    }
}

impl Drop for ArtifactServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_artifact_server(data: Vec<u8>, options: ServeOptions) -> ArtifactServer {
    let state = Arc::new(ServerState {
        data,
        options,
        cut_done: AtomicBool::new(false),
        ranges: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/medical.db", get(serve_artifact))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ArtifactServer {
        url: format!("http://{}/medical.db", addr),
        state,
        task,
    }
}

fn parse_range_start(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

async fn serve_artifact(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().unwrap().push(range.clone());

    if let Some(status) = state.options.status {
        return (status, "unavailable").into_response();
    }

    let total = state.data.len() as u64;
    let start = if state.options.ignore_range {
        0
    } else {
        range.as_deref().and_then(parse_range_start).unwrap_or(0)
    };
    if start > 0 && start >= total {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", total))
            .body(Body::empty())
            .unwrap();
    }

    let cut = state
        .options
        .fail_first_at
        .filter(|_| !state.cut_done.swap(true, Ordering::SeqCst))
        .map(|at| at.clamp(start, total));
    let end = cut.unwrap_or(total);

    let mut chunks: Vec<Result<Vec<u8>, std::io::Error>> = state.data
        [start as usize..end as usize]
        .chunks(state.options.chunk_size)
        .map(|c| Ok(c.to_vec()))
        .collect();
    if cut.is_some() {
        chunks.push(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "simulated network drop",
        )));
    }

    let delay = state.options.chunk_delay;
    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        chunk
    });

    let mut builder = Response::builder().header(header::CONTENT_LENGTH, total - start);
    builder = if start > 0 {
        builder.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, total - 1, total),
        )
    } else {
        builder.status(StatusCode::OK)
    };
    builder.body(Body::from_stream(stream)).unwrap()
}

/// `len` bytes that pass header validation but are not a usable database.
pub fn header_only_artifact(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(SQLITE_MAGIC);
    data.extend((0..len - SQLITE_MAGIC.len()).map(|i| (i % 251) as u8));
    data
}

// ============ Download observer ============

#[derive(Default)]
pub struct RecordingObserver {
    pub progress: Mutex<Vec<DownloadProgress>>,
    pub errors: Mutex<Vec<String>>,
    pub completed: Mutex<Option<PathBuf>>,
    done: Notify,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for the terminal callback.
    pub async fn wait(&self) {
        tokio::time::timeout(Duration::from_secs(20), self.done.notified())
            .await
            .expect("download did not finish in time");
    }

    pub fn last_written(&self) -> u64 {
        self.progress
            .lock()
            .unwrap()
            .last()
            .map(|p| p.bytes_written)
            .unwrap_or(0)
    }
}

impl DownloadObserver for RecordingObserver {
    fn on_progress(&self, progress: DownloadProgress) {
        self.progress.lock().unwrap().push(progress);
    }

    fn on_error(&self, error: &CoreError) {
        self.errors.lock().unwrap().push(error.to_string());
        self.done.notify_one();
    }

    fn on_complete(&self, staged: &Path) {
        *self.completed.lock().unwrap() = Some(staged.to_path_buf());
        self.done.notify_one();
    }
}

// ============ Fixture stores ============

pub fn document(id: &str, title: &str, specialty: Option<&str>, year: Option<i64>) -> Document {
    Document {
        id: id.to_string(),
        title: title.to_string(),
        content: format!("{}. Full reference text for {}.", title, id),
        url: Some(format!("https://example.org/docs/{}", id)),
        year,
        specialty: specialty.map(str::to_string),
    }
}

pub fn qa(id: &str, document_id: Option<&str>, question: &str, answer: &str) -> QaPair {
    QaPair {
        id: id.to_string(),
        question: question.to_string(),
        answer: answer.to_string(),
        document_id: document_id.map(str::to_string),
    }
}

/// Create a store at `path` holding the given rows.
pub async fn build_store(
    path: &Path,
    documents: &[(Document, Option<Vec<f32>>)],
    qa_pairs: &[(QaPair, Option<Vec<f32>>)],
) {
    migrate::run_migrations(path).await.unwrap();
    let pool = db::open_writable(path).await.unwrap();
    for (doc, embedding) in documents {
        migrate::insert_document(&pool, doc, embedding.as_deref())
            .await
            .unwrap();
    }
    for (pair, embedding) in qa_pairs {
        migrate::insert_qa(&pool, pair, embedding.as_deref())
            .await
            .unwrap();
    }
    pool.close().await;
}

/// A small medical corpus: three embedded documents, one without an
/// embedding, and two Q&A pairs.
pub async fn build_medical_store(path: &Path) {
    build_store(
        path,
        &[
            (
                document("doc1", "Type 2 diabetes management", Some("endocrinology"), Some(2021)),
                Some(vec![1.0, 0.0, 0.0, 0.0]),
            ),
            (
                document("doc2", "Hypertension guidelines", Some("cardiology"), Some(2020)),
                Some(vec![0.0, 1.0, 0.0, 0.0]),
            ),
            (
                document("doc3", "Insulin therapy", Some("endocrinology"), Some(2019)),
                Some(vec![0.9, 0.1, 0.0, 0.0]),
            ),
            (
                document("doc4", "Unembedded appendix", Some("endocrinology"), Some(2021)),
                None,
            ),
        ],
        &[
            (
                qa(
                    "qa1",
                    Some("doc1"),
                    "What is the first-line drug for type 2 diabetes?",
                    "Metformin is the usual first-line therapy.",
                ),
                Some(vec![0.99, 0.01, 0.0, 0.0]),
            ),
            (
                qa(
                    "qa2",
                    Some("doc2"),
                    "What blood pressure counts as hypertension?",
                    "Readings of 130/80 mmHg or higher.",
                ),
                Some(vec![0.0, 1.0, 0.0, 0.0]),
            ),
        ],
    )
    .await;
}

// ============ Embedding backend ============

/// Maps text to a fixed vector by keyword; unknown text embeds to the
/// last axis, orthogonal to every fixture vector.
pub struct KeywordBackend;

impl KeywordBackend {
    pub fn vector_for(text: &str) -> Vec<f32> {
        let text = text.to_lowercase();
        if text.contains("diabetes") {
            vec![1.0, 0.0, 0.0, 0.0]
        } else if text.contains("blood pressure") || text.contains("hypertension") {
            vec![0.0, 1.0, 0.0, 0.0]
        } else if text.contains("insulin") {
            vec![0.7, 0.7, 0.0, 0.0]
        } else if text.contains("fail") {
            vec![]
        } else {
            vec![0.0, 0.0, 0.0, 1.0]
        }
    }
}

impl EmbeddingBackend for KeywordBackend {
    fn model_name(&self) -> &str {
        "keyword-fixture"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vector = Self::vector_for(text);
        if vector.is_empty() {
            return Err(EmbeddingError::Backend("fixture backend refused".to_string()));
        }
        Ok(vector)
    }
}

pub fn gate() -> Arc<EmbeddingGate> {
    let gate = EmbeddingGate::new(DIMS, 16, Duration::from_secs(5));
    gate.register_backend(Arc::new(KeywordBackend)).unwrap();
    Arc::new(gate)
}

/// Open `path` with `mode` and wire it to the fixture backend.
pub async fn engine_for(path: &Path, mode: IndexMode) -> VectorSearchEngine {
    let store = Arc::new(KnowledgeStore::new(mode));
    store.open(path).await.unwrap();
    VectorSearchEngine::new(gate(), store)
}
