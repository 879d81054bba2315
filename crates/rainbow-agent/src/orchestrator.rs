//! One conversation turn, end to end.
//!
//! ```text
//! START → AWAIT_FIRST_RESPONSE ─┬─ no tools ─────────────────────────────────┬→ FINALIZE → DONE
//!                               └─ tools → EXECUTING_TOOLS → AWAIT_SECOND ───┘
//! ```
//!
//! Tool use is single-round: the second model call never advertises tools.
//! Only input validation fails the turn; everything after that degrades to
//! text inside the response.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use rainbow_core::{AiId, SessionId, UserId};
use rainbow_eventlog::{EventLog, LogEntry, LogScope};
use rainbow_store::{KvStore, Record};

use crate::attachment::{
    normalize_upload, Attachment, AttachmentError, AttachmentKind, AttachmentStore,
    MAX_ATTACHMENT_BYTES,
};
use crate::context::{ConversationContext, Turn};
use crate::gateway::ModelGateway;
use crate::tools::ToolRegistry;

/// Key-value table holding one bookkeeping record per session.
const SESSIONS_TABLE: &str = "sessions";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Inbound turn, as a host hands it over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_input: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ai_id: Option<String>,
    /// URL, `data:` URI or raw base64 of an image. Wins over `file_data`.
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub file_data: Option<FileData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    /// Caller-declared kind (`image`, `audio`, `video`, `document`).
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub info: FileInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Tool result as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultView {
    pub tool_name: String,
    pub result: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub response: String,
    pub session_id: String,
    pub has_tool_calls: bool,
    pub tool_results: Vec<ToolResultView>,
    /// Handle of the flushed log; empty when nothing could be written.
    pub log_file: String,
}

/// Everything an [`Orchestrator`] needs, built explicitly by the host.
pub struct AgentContext {
    pub gateway: ModelGateway,
    pub tools: Arc<ToolRegistry>,
    pub events: Arc<EventLog>,
    /// Optional bookkeeping store; failures there never affect a turn.
    pub store: Option<Arc<dyn KvStore>>,
    /// Optional upload store, used to persist attachments.
    pub attachments: Option<Arc<dyn AttachmentStore>>,
    pub system_prompt: String,
}

struct SessionState {
    context: ConversationContext,
    user_id: UserId,
    ai_id: AiId,
    turn_count: u64,
    kv_id: Option<String>,
    created_at: String,
}

pub struct Orchestrator {
    ctx: AgentContext,
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
}

impl Orchestrator {
    pub fn new(ctx: AgentContext) -> Self {
        Self {
            ctx,
            sessions: DashMap::new(),
        }
    }

    /// Normalize raw upload bytes, persisting them when an upload store is
    /// configured. Feed the result to [`Orchestrator::process_turn_with`].
    pub fn upload(&self, bytes: Vec<u8>, filename: &str, media_type: &str) -> Attachment {
        normalize_upload(bytes, filename, media_type, self.ctx.attachments.as_deref())
    }

    /// Run one turn. The attachment is taken from `image_data` or, failing
    /// that, `file_data`.
    pub async fn process_turn(&self, req: TurnRequest) -> Result<TurnResponse> {
        let attachment = request_attachment(&req)?;
        self.process_turn_with(req, attachment).await
    }

    /// Run one turn with an already-normalized attachment. The request's own
    /// `image_data`/`file_data` are ignored.
    #[instrument(skip_all, fields(session_id))]
    pub async fn process_turn_with(
        &self,
        req: TurnRequest,
        attachment: Option<Attachment>,
    ) -> Result<TurnResponse> {
        if req.user_input.trim().is_empty() && attachment.is_none() {
            return Err(AgentError::InvalidInput(
                "user_input is empty and no attachment was given".to_string(),
            ));
        }

        // START
        let session_id = req
            .session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .map(SessionId::from)
            .unwrap_or_default();
        tracing::Span::current().record("session_id", session_id.as_str());

        let state = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionState {
                    context: ConversationContext::with_system_prompt(&self.ctx.system_prompt),
                    user_id: UserId::new(),
                    ai_id: AiId::new(),
                    turn_count: 0,
                    kv_id: None,
                    created_at: chrono::Local::now().to_rfc3339(),
                }))
            })
            .clone();
        let mut state = state.lock().await;

        if let Some(user_id) = req.user_id.filter(|s| !s.is_empty()) {
            state.user_id = UserId::from(user_id);
        }
        if let Some(ai_id) = req.ai_id.filter(|s| !s.is_empty()) {
            state.ai_id = AiId::from(ai_id);
        }
        let scope = LogScope::new(session_id.clone(), state.user_id.clone(), state.ai_id.clone());
        let results_before = state.context.tool_results().len();

        state
            .context
            .append_user_turn(&req.user_input, attachment.as_ref());
        match &attachment {
            Some(a) => {
                let meta = a.metadata();
                self.ctx
                    .events
                    .log_user_input(&scope, &req.user_input, Some(a.kind.as_str()), Some(&meta));
            }
            None => {
                self.ctx
                    .events
                    .log_user_input(&scope, &req.user_input, None, None);
            }
        }

        // AWAIT_FIRST_RESPONSE
        let manifest = self.ctx.tools.manifest();
        let first = self
            .ctx
            .gateway
            .invoke(state.context.snapshot(), Some(&manifest))
            .await;
        self.ctx.events.log_model_call(
            &scope,
            transcript_json(state.context.snapshot()),
            first.to_json(),
            1,
        );

        let has_tool_calls = first.has_tool_calls();
        let response = if has_tool_calls {
            // EXECUTING_TOOLS
            info!(count = first.tool_calls.len(), "model requested tools");
            state
                .context
                .append_tool_calls(Some(first.content.clone()), first.tool_calls.clone());
            for call in &first.tool_calls {
                let result = self.ctx.tools.invoke(&call.name, &call.arguments).await;
                self.ctx
                    .events
                    .log_tool_call(&scope, &call.name, call.arguments.clone(), &result);
                state.context.append_tool_result(
                    &call.name,
                    call.arguments.clone(),
                    &result,
                    Some(&call.id),
                );
            }

            // AWAIT_SECOND_RESPONSE
            let second = self.ctx.gateway.invoke(state.context.snapshot(), None).await;
            self.ctx.events.log_model_call(
                &scope,
                transcript_json(state.context.snapshot()),
                second.to_json(),
                2,
            );
            if second.has_tool_calls() {
                debug!(
                    count = second.tool_calls.len(),
                    "ignoring tool calls in second response"
                );
            }
            second.content
        } else {
            first.content
        };

        // FINALIZE
        state.context.append_assistant_turn(&response);
        self.ctx
            .events
            .log_final_response(&scope, &response, has_tool_calls);
        let log_file = match self.ctx.events.flush(session_id.as_str()) {
            Ok(outcome) => outcome.handle().to_string(),
            Err(e) => {
                warn!(error = %e, "could not persist session log");
                String::new()
            }
        };

        state.turn_count += 1;
        self.record_session(&session_id, &mut state);

        let tool_results = state.context.tool_results()[results_before..]
            .iter()
            .map(|r| ToolResultView {
                tool_name: r.tool_name.clone(),
                result: r.result.clone(),
                timestamp: r.timestamp.clone(),
            })
            .collect();

        info!(has_tool_calls, turns = state.context.len(), "turn complete");
        Ok(TurnResponse {
            response,
            session_id: session_id.to_string(),
            has_tool_calls,
            tool_results,
            log_file,
        })
    }

    /// Transcript of a session, system turn included.
    pub async fn conversation_history(&self, session_id: &str) -> Option<Vec<Turn>> {
        let state = self.sessions.get(session_id).map(|s| Arc::clone(s.value()))?;
        let state = state.lock().await;
        Some(state.context.snapshot().to_vec())
    }

    /// Event-log entries recorded for a session.
    pub fn session_logs(&self, session_id: &str) -> Vec<LogEntry> {
        self.ctx.events.entries_for(session_id)
    }

    /// Drop a session's transcript and log entries. Returns whether the
    /// session was known.
    #[instrument(skip(self))]
    pub fn clear_session(&self, session_id: &str) -> bool {
        let had_context = self.sessions.remove(session_id).is_some();
        let had_log = self.ctx.events.clear_session(session_id);
        debug!(had_context, had_log, "session cleared");
        had_context || had_log
    }

    /// Best-effort upsert of the session's bookkeeping record.
    fn record_session(&self, session_id: &SessionId, state: &mut SessionState) {
        let Some(store) = &self.ctx.store else {
            return;
        };

        let mut record = Record::new();
        record.insert("session_id".into(), json!(session_id.as_str()));
        record.insert("user_id".into(), json!(state.user_id.as_str()));
        record.insert("ai_id".into(), json!(state.ai_id.as_str()));
        record.insert("turn_count".into(), json!(state.turn_count));
        record.insert("updated_at".into(), json!(chrono::Local::now().to_rfc3339()));

        let id = match &state.kv_id {
            Some(id) => Some(id.clone()),
            None => {
                let mut filter = Record::new();
                filter.insert("session_id".into(), json!(session_id.as_str()));
                match store.query(SESSIONS_TABLE, &filter) {
                    Ok(found) => found
                        .first()
                        .and_then(|r| r.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    Err(e) => {
                        warn!(error = %e, "session lookup failed");
                        return;
                    }
                }
            }
        };

        let outcome = match id {
            Some(id) => store.update(SESSIONS_TABLE, &id, record),
            None => {
                record.insert("created_at".into(), json!(state.created_at));
                store.create(SESSIONS_TABLE, record)
            }
        };
        match outcome {
            Ok(saved) => {
                state.kv_id = saved.get("id").and_then(Value::as_str).map(str::to_string);
            }
            Err(e) => warn!(error = %e, "session bookkeeping failed"),
        }
    }
}

/// Build the turn's attachment from the request. `image_data` wins over
/// `file_data`.
pub fn request_attachment(req: &TurnRequest) -> Result<Option<Attachment>> {
    if let Some(image) = req.image_data.as_deref().filter(|s| !s.trim().is_empty()) {
        if req.file_data.is_some() {
            debug!("both image_data and file_data given; using image_data");
        }
        let attachment = Attachment::builder()
            .url(image)
            .kind(AttachmentKind::Image)
            .build()?;
        return Ok(Some(attachment));
    }

    let Some(file) = &req.file_data else {
        return Ok(None);
    };
    let info = &file.info;

    let mut builder = Attachment::builder();
    if let Some(data) = file.data.as_deref().filter(|s| !s.trim().is_empty()) {
        builder = builder.url(data);
    } else if let Some(url) = info.url.as_deref().filter(|s| !s.trim().is_empty()) {
        builder = builder.url(url);
    }
    if let Some(mime) = &info.mime_type {
        builder = builder.media_type(mime.clone());
    }
    if let Some(name) = &info.filename {
        builder = builder.filename(name.clone());
    }
    if let Some(size) = info.size {
        builder = builder.size_bytes(size);
    }
    let mut attachment = builder.build()?;
    if info.url.is_some() && attachment.stored_url.is_none() {
        attachment.stored_url = info.url.clone();
    }

    let oversized = info.size.is_some_and(|s| s > MAX_ATTACHMENT_BYTES as u64);
    if oversized {
        warn!(
            size = info.size,
            limit = MAX_ATTACHMENT_BYTES,
            "attachment exceeds size limit; treating as unknown"
        );
        attachment.kind = AttachmentKind::Unknown;
    } else if attachment.kind == AttachmentKind::Unknown {
        attachment.kind = AttachmentKind::parse(&file.kind);
    }
    Ok(Some(attachment))
}

fn transcript_json(turns: &[Turn]) -> Value {
    serde_json::to_value(turns).unwrap_or_else(|e| {
        warn!(error = %e, "transcript is not serializable");
        Value::Array(Vec::new())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentSource;

    #[test]
    fn image_data_wins_over_file_data() {
        let req = TurnRequest {
            user_input: "看看".into(),
            image_data: Some("https://example.com/cat.png".into()),
            file_data: Some(FileData {
                kind: "document".into(),
                data: Some("aGVsbG8=".into()),
                info: FileInfo::default(),
            }),
            ..TurnRequest::default()
        };
        let a = request_attachment(&req).unwrap().unwrap();
        assert_eq!(a.kind, AttachmentKind::Image);
        assert_eq!(
            a.source,
            AttachmentSource::Url("https://example.com/cat.png".into())
        );
    }

    #[test]
    fn file_data_is_classified_from_metadata() {
        let req = TurnRequest {
            file_data: Some(FileData {
                kind: "image".into(),
                data: None,
                info: FileInfo {
                    filename: Some("report.pdf".into()),
                    mime_type: Some("application/pdf".into()),
                    size: Some(2048),
                    url: Some("/uploads/document/x_report.pdf".into()),
                },
            }),
            ..TurnRequest::default()
        };
        let a = request_attachment(&req).unwrap().unwrap();
        assert_eq!(a.kind, AttachmentKind::Document);
        assert_eq!(a.size_bytes, Some(2048));
        assert_eq!(a.reference_url().as_deref(), Some("/uploads/document/x_report.pdf"));
    }

    #[test]
    fn declared_kind_fills_in_unknown_metadata() {
        let req = TurnRequest {
            file_data: Some(FileData {
                kind: "audio".into(),
                data: Some("https://example.com/clip".into()),
                info: FileInfo::default(),
            }),
            ..TurnRequest::default()
        };
        assert_eq!(
            request_attachment(&req).unwrap().unwrap().kind,
            AttachmentKind::Audio
        );
    }

    #[test]
    fn oversized_file_is_unknown() {
        let req = TurnRequest {
            file_data: Some(FileData {
                kind: "video".into(),
                data: None,
                info: FileInfo {
                    filename: Some("big.mp4".into()),
                    mime_type: Some("video/mp4".into()),
                    size: Some(MAX_ATTACHMENT_BYTES as u64 + 1),
                    url: Some("https://example.com/big.mp4".into()),
                },
            }),
            ..TurnRequest::default()
        };
        assert_eq!(
            request_attachment(&req).unwrap().unwrap().kind,
            AttachmentKind::Unknown
        );
    }

    #[test]
    fn file_data_without_any_source_is_rejected() {
        let req = TurnRequest {
            file_data: Some(FileData {
                kind: "document".into(),
                ..FileData::default()
            }),
            ..TurnRequest::default()
        };
        assert!(matches!(
            request_attachment(&req),
            Err(AgentError::Attachment(AttachmentError::NoSource))
        ));
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: TurnRequest = serde_json::from_value(json!({
            "user_input": "你好",
            "file_data": {"type": "document", "info": {"filename": "a.txt"}}
        }))
        .unwrap();
        assert!(req.session_id.is_none());
        let file = req.file_data.unwrap();
        assert_eq!(file.kind, "document");
        assert_eq!(file.info.filename.as_deref(), Some("a.txt"));
    }
}
