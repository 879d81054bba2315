use rainbow_core::{AiId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened. Serialized in snake_case (`"user_input"`, `"model_call"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserInput,
    ModelCall,
    ToolCall,
    FinalResponse,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserInput => write!(f, "user_input"),
            Self::ModelCall => write!(f, "model_call"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::FinalResponse => write!(f, "final_response"),
        }
    }
}

/// The identifiers every entry of one turn is tagged with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogScope {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub ai_id: AiId,
}

impl LogScope {
    pub fn new(session_id: SessionId, user_id: UserId, ai_id: AiId) -> Self {
        Self {
            session_id,
            user_id,
            ai_id,
        }
    }
}

/// One ledger entry, exactly as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub ai_id: AiId,
    /// RFC 3339 timestamp with microsecond precision.
    pub timestamp: String,
    pub event_type: EventType,
    /// Event-specific payload; always a JSON object.
    pub content: Value,
}

impl LogEntry {
    pub fn new(scope: &LogScope, event_type: EventType, content: Value) -> Self {
        Self {
            session_id: scope.session_id.clone(),
            user_id: scope.user_id.clone(),
            ai_id: scope.ai_id.clone(),
            timestamp: chrono::Local::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
            event_type,
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> LogScope {
        LogScope::new("s1".into(), "user_1".into(), "ai_1".into())
    }

    #[test]
    fn entry_survives_json_round_trip() {
        let entry = LogEntry::new(
            &scope(),
            EventType::ToolCall,
            json!({"tool_name": "get_weather", "tool_args": {"city": "新加坡"}, "tool_result": "晴"}),
        );
        let text = serde_json::to_string_pretty(&entry).unwrap();
        let back: LogEntry = serde_json::from_str(&text).unwrap();

        assert_eq!(back.event_type, entry.event_type);
        assert_eq!(back.timestamp, entry.timestamp);
        assert_eq!(back.content, entry.content);
        assert_eq!(back, entry);
    }

    #[test]
    fn event_type_wire_names() {
        let entry = LogEntry::new(&scope(), EventType::ModelCall, json!({}));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["event_type"], json!("model_call"));
        assert_eq!(value["session_id"], json!("s1"));
        assert_eq!(EventType::FinalResponse.to_string(), "final_response");
    }
}
