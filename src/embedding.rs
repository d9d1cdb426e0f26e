//! Embedding backend abstraction and vector utilities.
//!
//! An [`EmbeddingBackend`] turns one text into one fixed-length vector as a
//! single blocking unit of work. Callers never invoke a backend directly;
//! they go through the [`EmbeddingGate`](crate::embed_gate::EmbeddingGate),
//! which guarantees one inference at a time.
//!
//! Backends:
//! - **[`OllamaBackend`]** calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalBackend`** runs all-MiniLM-L6-v2 in-process via fastembed
//!   (feature `local-embeddings-fastembed`).
//!
//! Vector utilities:
//! - [`vec_to_blob`] / [`blob_to_vec`] convert between `Vec<f32>` and the
//!   little-endian `F32_BLOB` layout stored in the artifact.
//! - [`cosine_similarity`] and [`cosine_distance`].
//!
//! # Retry Strategy
//!
//! The Ollama backend retries transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - connection errors → retry
//! - backoff: 1s, 2s, 4s, ... capped at 32s

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Text-to-vector capability injected into the core.
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier (e.g. `"all-minilm"`).
    fn model_name(&self) -> &str;
    /// Length of every vector this backend returns.
    fn dims(&self) -> usize;
    /// Embed one text. Blocking; may take a long time.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

// ============ Ollama Backend ============

/// Embedding backend backed by a local Ollama server.
pub struct OllamaBackend {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama backend"))?;

        Ok(Self {
            model,
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            timeout: config.timeout(),
        })
    }
}

impl EmbeddingBackend for OllamaBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(EmbeddingError::backend)?;

        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                std::thread::sleep(delay);
            }

            let resp = client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send();

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().map_err(EmbeddingError::backend)?;
                        return parse_ollama_response(&json);
                    }

                    let body_text = response.text().unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EmbeddingError::Backend(format!(
                            "Ollama API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(EmbeddingError::Backend(format!(
                        "Ollama API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(EmbeddingError::Backend(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EmbeddingError::Backend("Ollama embedding failed after retries".to_string())
        }))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let first = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            EmbeddingError::Backend("Invalid Ollama response: missing embeddings array".into())
        })?;

    Ok(first
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Local Backend (fastembed) ============

/// In-process all-MiniLM-L6-v2. The model is fetched once and cached.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalBackend {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalBackend {
    pub fn new() -> Result<Self> {
        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false);
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
        Ok(Self {
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl EmbeddingBackend for LocalBackend {
    fn model_name(&self) -> &str {
        "all-minilm-l6-v2"
    }

    fn dims(&self) -> usize {
        crate::models::EMBEDDING_DIM
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| EmbeddingError::Backend("local model lock poisoned".into()))?;
        let mut vectors = model
            .embed(vec![text.to_string()], None)
            .map_err(EmbeddingError::backend)?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Backend("empty embedding response".into()))
    }
}

/// Build the backend named by `embedding.provider`.
///
/// `"disabled"` yields `None`; the gate then rejects every request until a
/// backend is registered.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingBackend>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "ollama" => Ok(Some(Arc::new(OllamaBackend::new(config)?))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Some(Arc::new(LocalBackend::new()?))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding backend requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Trailing bytes are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`, or `None` when it is undefined
/// (different lengths, empty or zero-norm vectors, non-finite values).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom.is_nan() || denom < f32::EPSILON {
        return None;
    }

    let sim = dot / denom;
    sim.is_finite().then(|| sim.clamp(-1.0, 1.0))
}

/// Cosine distance `1 - cos θ` in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    cosine_similarity(a, b).map(|s| 1.0 - s)
}

/// Map a distance back to a similarity. Missing or NaN distances become
/// `-1`, the worst possible score.
pub fn similarity_from_distance(distance: Option<f32>) -> f32 {
    match distance {
        Some(d) if d.is_finite() => (1.0 - d).clamp(-1.0, 1.0),
        _ => -1.0,
    }
}
