use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::LogError;
use crate::types::LogEntry;

/// Durable destination for flushed session logs.
pub trait LogSink: Send + Sync {
    /// Persist `entries` (all of one session, in append order) and return a
    /// handle the caller can use to find the artifact again.
    fn write(&self, session_id: &str, entries: &[LogEntry]) -> Result<String, LogError>;
}

/// Writes one pretty-printed JSON array per flush:
/// `{dir}/session_{session_id}_{YYYYmmdd_HHMMSS}.json`.
///
/// Non-ASCII text is written verbatim (serde_json never escapes it).
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Parse a previously written artifact.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<LogEntry>, LogError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The newest artifact written for `session_id`, if any.
    pub fn latest_for(&self, session_id: &str) -> Result<Option<PathBuf>, LogError> {
        let prefix = format!("session_{}_", file_safe(session_id));
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut candidates: Vec<PathBuf> = read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix(&prefix))
                    .is_some_and(is_stamp_suffix)
            })
            .collect();
        // The timestamp suffix sorts lexicographically.
        candidates.sort();
        Ok(candidates.pop())
    }
}

impl LogSink for JsonFileSink {
    fn write(&self, session_id: &str, entries: &[LogEntry]) -> Result<String, LogError> {
        fs::create_dir_all(&self.dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .dir
            .join(format!("session_{}_{}.json", file_safe(session_id), stamp));

        let mut writer = BufWriter::new(fs::File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, entries)?;
        writer.flush()?;
        debug!(path = %path.display(), entries = entries.len(), "session log written");
        Ok(path.display().to_string())
    }
}

/// Keeps flushed batches in memory. Useful for embedding hosts and tests.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<(String, Vec<LogEntry>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches written so far, oldest first.
    pub fn batches(&self) -> Vec<(String, Vec<LogEntry>)> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSink for MemorySink {
    fn write(&self, session_id: &str, entries: &[LogEntry]) -> Result<String, LogError> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.push((session_id.to_string(), entries.to_vec()));
        Ok(format!("memory://{}/{}", session_id, batches.len()))
    }
}

/// Session ids are caller-supplied; keep them from escaping the log dir.
///
/// Alphanumerics and `-` pass through, every other byte becomes `%XX`, so
/// distinct ids never share a file name.
fn file_safe(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for c in session_id.chars() {
        if c.is_alphanumeric() || c == '-' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    out
}

/// `YYYYmmdd_HHMMSS.json`, the part of a file name after the session id.
fn is_stamp_suffix(rest: &str) -> bool {
    let Some(stamp) = rest.strip_suffix(".json") else {
        return false;
    };
    let bytes = stamp.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit())
}
