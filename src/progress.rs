//! Download progress reporting.
//!
//! Reports observable progress during `medctx download` so users see how
//! much has arrived, how fast, and how long is left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::DownloadProgress;

/// A single progress event for a download.
#[derive(Clone, Debug)]
pub enum DownloadEvent {
    /// Bytes are arriving.
    Transferring(DownloadProgress),
    /// The transfer finished and the artifact passed validation.
    Finished { bytes: Option<u64> },
    /// The transfer or the validation failed.
    Failed { error: String },
}

/// Reports download progress. Implementations write to stderr (human or JSON).
pub trait DownloadProgressReporter: Send + Sync {
    fn report(&self, event: DownloadEvent);
}

/// Human-friendly progress on stderr:
/// "download  412,000 / 1,000,000 bytes  41.2%  1.5 MB/s  eta 0:03".
pub struct StderrProgress;

impl DownloadProgressReporter for StderrProgress {
    fn report(&self, event: DownloadEvent) {
        let line = match &event {
            DownloadEvent::Transferring(p) => {
                let mut line = match p.bytes_expected {
                    Some(total) => format!(
                        "download  {} / {} bytes",
                        format_number(p.bytes_written),
                        format_number(total)
                    ),
                    None => format!("download  {} bytes", format_number(p.bytes_written)),
                };
                if let Some(fraction) = p.fraction() {
                    line.push_str(&format!("  {:.1}%", fraction * 100.0));
                }
                if let Some(speed) = p.speed_bytes_per_sec {
                    line.push_str(&format!("  {}", format_rate(speed)));
                }
                if let Some(eta) = p.eta_seconds {
                    line.push_str(&format!("  eta {}", format_eta(eta)));
                }
                line.push('\n');
                line
            }
            DownloadEvent::Finished { bytes } => match bytes {
                Some(b) => format!("download  done  {} bytes\n", format_number(*b)),
                None => "download  done\n".to_string(),
            },
            DownloadEvent::Failed { error } => format!("download  failed  {}\n", error),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl DownloadProgressReporter for JsonProgress {
    fn report(&self, event: DownloadEvent) {
        let obj = match &event {
            DownloadEvent::Transferring(p) => serde_json::json!({
                "event": "progress",
                "bytes_written": p.bytes_written,
                "bytes_expected": p.bytes_expected,
                "speed_bytes_per_sec": p.speed_bytes_per_sec,
                "eta_seconds": p.eta_seconds
            }),
            DownloadEvent::Finished { bytes } => serde_json::json!({
                "event": "finished",
                "bytes": bytes
            }),
            DownloadEvent::Failed { error } => serde_json::json!({
                "event": "failed",
                "error": error
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl DownloadProgressReporter for NoProgress {
    fn report(&self, _event: DownloadEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn format_eta(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn DownloadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
