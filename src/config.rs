//! TOML configuration parsing.
//!
//! Every section except `[artifact]` is optional and falls back to the
//! defaults below. [`load_config`] validates the parsed values and fails
//! with a descriptive message on the first problem it finds.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub artifact: ArtifactConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactConfig {
    /// Remote endpoint the knowledge store is fetched from.
    pub url: String,
    /// Local path of the live artifact.
    pub path: PathBuf,
    /// Smallest file size accepted by the validator. `1` means "non-zero".
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,
}

fn default_min_size_bytes() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl DownloadConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_progress_interval_ms() -> u64 {
    250
}
fn default_stall_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound of the embedding queue. `0` leaves it unbounded.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    crate::models::EMBEDDING_DIM
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `maxResults` from the settings collaborator. Read, never validated here.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default = "default_document_floor")]
    pub document_similarity_floor: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            similarity_threshold: default_similarity_threshold(),
            index: default_index(),
            document_similarity_floor: default_document_floor(),
        }
    }
}

fn default_max_results() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_index() -> String {
    "libsql".to_string()
}
fn default_document_floor() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default = "default_max_answers")]
    pub max_answers: usize,
    #[serde(default = "default_excerpt_length")]
    pub excerpt_length: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_length: default_max_context_length(),
            max_answers: default_max_answers(),
            excerpt_length: default_excerpt_length(),
        }
    }
}

fn default_max_context_length() -> usize {
    4000
}
fn default_max_answers() -> usize {
    10
}
fn default_excerpt_length() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Config with every default and the given artifact location.
    ///
    /// Used by tests and by embedders that build the configuration in code.
    pub fn for_artifact(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            artifact: ArtifactConfig {
                url: url.into(),
                path: path.into(),
                min_size_bytes: default_min_size_bytes(),
            },
            download: DownloadConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            context: ContextConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.artifact.url.trim().is_empty() {
        anyhow::bail!("artifact.url must not be empty");
    }
    if config.artifact.path.as_os_str().is_empty() {
        anyhow::bail!("artifact.path must not be empty");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ollama, or local.",
            other
        ),
    }
    if config.embedding.provider == "ollama" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'ollama'");
    }

    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.document_similarity_floor) {
        anyhow::bail!("retrieval.document_similarity_floor must be in [-1.0, 1.0]");
    }
    match config.retrieval.index.as_str() {
        "libsql" | "flat" | "none" => {}
        other => anyhow::bail!(
            "Unknown retrieval.index: '{}'. Must be libsql, flat, or none.",
            other
        ),
    }

    if config.context.max_answers == 0 {
        anyhow::bail!("context.max_answers must be > 0");
    }
    if config.context.excerpt_length == 0 {
        anyhow::bail!("context.excerpt_length must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [artifact]
            url = "https://example.org/medical.db"
            path = "./data/medical.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.artifact.min_size_bytes, 1);
        assert_eq!(config.embedding.dims, 384);
        assert_eq!(config.embedding.queue_capacity, 64);
        assert_eq!(config.retrieval.index, "libsql");
        assert_eq!(config.context.max_answers, 10);
        assert_eq!(config.context.excerpt_length, 200);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = parse(
            r#"
            [artifact]
            url = "https://example.org/medical.db"
            path = "./data/medical.db"

            [embedding]
            provider = "openai"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let err = parse(
            r#"
            [artifact]
            url = "https://example.org/medical.db"
            path = "./data/medical.db"

            [retrieval]
            similarity_threshold = 1.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }

    #[test]
    fn max_results_is_passed_through() {
        let config = parse(
            r#"
            [artifact]
            url = "https://example.org/medical.db"
            path = "./data/medical.db"

            [retrieval]
            max_results = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.max_results, 50);
    }

    #[test]
    fn ollama_requires_model() {
        let err = parse(
            r#"
            [artifact]
            url = "https://example.org/medical.db"
            path = "./data/medical.db"

            [embedding]
            provider = "ollama"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }
}
