//! Artifact validation.
//!
//! A file is a usable knowledge store when it exists, meets the configured
//! size floor, and starts with the 16-byte SQLite magic header. Only the
//! header is read, never the body. Async callers use the `*_async`
//! variants, which run the file I/O on the blocking pool.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::models::ArtifactStatus;

/// `"SQLite format 3\0"`.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone, Copy)]
pub struct ArtifactValidator {
    /// Smallest accepted size in bytes. Anything below `1` behaves as `1`.
    min_size_bytes: u64,
}

impl Default for ArtifactValidator {
    fn default() -> Self {
        Self { min_size_bytes: 1 }
    }
}

impl ArtifactValidator {
    pub fn new(min_size_bytes: u64) -> Self {
        Self {
            min_size_bytes: min_size_bytes.max(1),
        }
    }

    /// Returns `true` only for an existing, large-enough file with the
    /// SQLite header. Any I/O failure counts as invalid.
    pub fn validate(&self, path: &Path) -> bool {
        match self.check(path) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(path = %path.display(), %reason, "artifact rejected");
                false
            }
        }
    }

    /// Like [`validate`](Self::validate), with the reason for rejection.
    pub fn check(&self, path: &Path) -> Result<(), String> {
        let meta = std::fs::metadata(path).map_err(|e| format!("cannot stat file: {}", e))?;
        if !meta.is_file() {
            return Err("not a regular file".to_string());
        }
        if meta.len() < self.min_size_bytes {
            return Err(format!(
                "file is {} bytes, minimum is {}",
                meta.len(),
                self.min_size_bytes
            ));
        }

        let mut header = [0u8; 16];
        let mut file = File::open(path).map_err(|e| format!("cannot open file: {}", e))?;
        file.read_exact(&mut header)
            .map_err(|e| format!("short header read: {}", e))?;

        if &header != SQLITE_MAGIC {
            return Err("missing SQLite header".to_string());
        }
        Ok(())
    }

    /// Inspect the file at `path`. `is_valid` is only computed when the file exists.
    pub fn status(&self, path: &Path) -> ArtifactStatus {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match std::fs::metadata(path) {
            Ok(meta) => ArtifactStatus {
                exists: true,
                size_bytes: Some(meta.len()),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                is_valid: Some(self.validate(path)),
                local_path: path.to_path_buf(),
                file_name,
            },
            Err(_) => ArtifactStatus {
                exists: false,
                size_bytes: None,
                modified_at: None,
                is_valid: None,
                local_path: path.to_path_buf(),
                file_name,
            },
        }
    }

    pub async fn check_async(&self, path: &Path) -> Result<(), String> {
        let validator = *self;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || validator.check(&path))
            .await
            .map_err(|e| format!("validation task failed: {}", e))?
    }

    pub async fn status_async(&self, path: &Path) -> ArtifactStatus {
        let validator = *self;
        let owned: PathBuf = path.to_path_buf();
        match tokio::task::spawn_blocking(move || validator.status(&owned)).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "status task failed, inspecting inline");
                self.status(path)
            }
        }
    }
}
