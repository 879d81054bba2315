use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque conversation identifier. Generated ids are random UUIDv4 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the human side of a conversation.
///
/// Generated ids look like `user_1a2b3c4d` (first 8 hex chars of a UUIDv4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        Self(format!("user_{}", short_uuid()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies the AI persona answering in a session (`ai_1a2b3c4d` when generated).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AiId(pub String);

impl AiId {
    pub fn new() -> Self {
        Self(format!("ai_{}", short_uuid()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AiId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AiId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AiId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_expected_prefixes() {
        let user = UserId::new();
        let ai = AiId::new();
        assert!(user.as_str().starts_with("user_"));
        assert_eq!(user.as_str().len(), "user_".len() + 8);
        assert!(ai.as_str().starts_with("ai_"));
        assert_eq!(ai.as_str().len(), "ai_".len() + 8);
    }

    #[test]
    fn session_id_serializes_as_plain_string() {
        let id = SessionId::from("session_001");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""session_001""#);
    }
}
