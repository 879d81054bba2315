use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::LogError;
use crate::sink::LogSink;
use crate::types::{EventType, LogEntry, LogScope};

/// Keys dropped from attachment metadata before it is logged.
const BULKY_KEYS: &[&str] = &["data", "content"];

/// Result of [`EventLog::flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The session has no entries; nothing was written.
    Empty,
    /// Handle of the artifact holding every entry of the session.
    Written(String),
}

impl FlushOutcome {
    /// The artifact handle, or `""` for an empty session.
    pub fn handle(&self) -> &str {
        match self {
            FlushOutcome::Empty => "",
            FlushOutcome::Written(h) => h,
        }
    }
}

#[derive(Default)]
struct SessionLog {
    entries: Vec<LogEntry>,
    /// Number of entries covered by `last_handle`.
    flushed: usize,
    last_handle: Option<String>,
}

/// In-memory, session-partitioned ledger with a pluggable flush target.
///
/// Entries are appended in call order per session. Sessions live in separate
/// `DashMap` shards, so concurrent sessions do not serialize on one lock.
pub struct EventLog {
    sessions: DashMap<String, SessionLog>,
    sink: Box<dyn LogSink>,
}

impl EventLog {
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            sessions: DashMap::new(),
            sink: Box::new(sink),
        }
    }

    /// Append a raw entry and return a copy of it.
    pub fn record(&self, scope: &LogScope, event_type: EventType, content: Value) -> LogEntry {
        let entry = LogEntry::new(scope, event_type, content);
        self.sessions
            .entry(scope.session_id.to_string())
            .or_default()
            .entries
            .push(entry.clone());
        debug!(session_id = %scope.session_id, %event_type, "event recorded");
        entry
    }

    /// Record the user's utterance. Attachment metadata is kept, but any
    /// `data`/`content` payload is stripped first.
    pub fn log_user_input(
        &self,
        scope: &LogScope,
        input: &str,
        file_type: Option<&str>,
        file_info: Option<&Map<String, Value>>,
    ) -> LogEntry {
        let mut content = Map::new();
        content.insert("input".into(), Value::String(input.to_string()));
        if let Some(kind) = file_type {
            content.insert("file_type".into(), Value::String(kind.to_string()));
            if let Some(info) = file_info {
                let safe: Map<String, Value> = info
                    .iter()
                    .filter(|(k, _)| !BULKY_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                content.insert("file_info".into(), Value::Object(safe));
            }
        }
        self.record(scope, EventType::UserInput, Value::Object(content))
    }

    pub fn log_model_call(
        &self,
        scope: &LogScope,
        prompt: Value,
        response: Value,
        call_number: u32,
    ) -> LogEntry {
        self.record(
            scope,
            EventType::ModelCall,
            json!({
                "call_number": call_number,
                "prompt": prompt,
                "response": response,
            }),
        )
    }

    pub fn log_tool_call(
        &self,
        scope: &LogScope,
        tool_name: &str,
        tool_args: Value,
        tool_result: &str,
    ) -> LogEntry {
        self.record(
            scope,
            EventType::ToolCall,
            json!({
                "tool_name": tool_name,
                "tool_args": tool_args,
                "tool_result": tool_result,
            }),
        )
    }

    pub fn log_final_response(
        &self,
        scope: &LogScope,
        response: &str,
        has_tool_calls: bool,
    ) -> LogEntry {
        self.record(
            scope,
            EventType::FinalResponse,
            json!({
                "response": response,
                "has_tool_calls": has_tool_calls,
            }),
        )
    }

    /// Persist every entry of `session_id` as one batch.
    ///
    /// Flushing again without new entries returns the previous handle
    /// instead of writing a duplicate artifact.
    pub fn flush(&self, session_id: &str) -> Result<FlushOutcome, LogError> {
        // Copy out under the shard lock; the sink write happens unlocked.
        let (snapshot, count) = {
            let Some(log) = self.sessions.get(session_id) else {
                return Ok(FlushOutcome::Empty);
            };
            if log.entries.is_empty() {
                return Ok(FlushOutcome::Empty);
            }
            if log.flushed == log.entries.len() {
                if let Some(handle) = &log.last_handle {
                    return Ok(FlushOutcome::Written(handle.clone()));
                }
            }
            (log.entries.clone(), log.entries.len())
        };

        let handle = self.sink.write(session_id, &snapshot).map_err(|e| {
            warn!(session_id, error = %e, "session log flush failed");
            e
        })?;

        if let Some(mut log) = self.sessions.get_mut(session_id) {
            if count >= log.flushed {
                log.flushed = count;
                log.last_handle = Some(handle.clone());
            }
        }
        debug!(session_id, entries = count, handle = %handle, "session log flushed");
        Ok(FlushOutcome::Written(handle))
    }

    /// All entries of one session, in append order.
    pub fn entries_for(&self, session_id: &str) -> Vec<LogEntry> {
        self.sessions
            .get(session_id)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Forget one session's entries. Returns whether anything was removed.
    pub fn clear_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
