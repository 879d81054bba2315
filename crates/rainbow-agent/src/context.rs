//! Conversation transcript for one session.
//!
//! The transcript is a list of typed [`Turn`]s. Tool turns are only ever
//! appended after an assistant turn announcing the same call id; the context
//! tracks announced-but-unanswered ids so it never has to rescan history.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::attachment::{image_part, Attachment};
use crate::provider::ToolCall;

/// One role-tagged transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Turn {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl Turn {
    pub fn role(&self) -> &'static str {
        match self {
            Turn::System { .. } => "system",
            Turn::User { .. } => "user",
            Turn::Assistant { .. } => "assistant",
            Turn::Tool { .. } => "tool",
        }
    }

    /// Whether this turn carries an image reference.
    pub fn has_image(&self) -> bool {
        match self {
            Turn::User {
                content: UserContent::Parts(parts),
            } => parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })),
            _ => false,
        }
    }
}

/// User content: plain text, or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageRef { url: url.into() },
        }
    }
}

/// An image URL or `data:` URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

/// Record of one executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub arguments: Value,
    pub result: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    system_prompt: Option<String>,
    turns: Vec<Turn>,
    tool_results: Vec<ToolResult>,
    /// Call ids announced by an assistant turn and not yet answered.
    pending: Vec<String>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose transcript always starts with `prompt` as system turn.
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            turns: vec![Turn::System {
                content: prompt.clone(),
            }],
            system_prompt: Some(prompt),
            ..Self::default()
        }
    }

    /// Append the user's turn. The shape depends only on the attachment kind:
    /// none gives plain text, an image gives `[text, image]`, anything else
    /// gives text followed by a description of the file.
    pub fn append_user_turn(&mut self, text: &str, attachment: Option<&Attachment>) {
        let content = match attachment {
            None => UserContent::Text(text.to_string()),
            Some(a) if a.is_image() => {
                UserContent::Parts(vec![ContentPart::text(text), image_part(a)])
            }
            Some(a) => UserContent::Text(describe_file(text, a)),
        };
        self.turns.push(Turn::User { content });
    }

    /// Record the assistant turn that requested `calls`.
    pub fn append_tool_calls(&mut self, content: Option<String>, calls: Vec<ToolCall>) {
        self.pending.extend(calls.iter().map(|c| c.id.clone()));
        self.turns.push(Turn::Assistant {
            content: content.filter(|c| !c.is_empty()),
            tool_calls: calls,
        });
    }

    /// Append a tool result, keeping the call-id pairing valid.
    ///
    /// A pending `tool_call_id` is resolved. An unknown or missing id gets a
    /// synthesized assistant turn announcing the call first.
    pub fn append_tool_result(
        &mut self,
        tool_name: &str,
        arguments: Value,
        result: &str,
        tool_call_id: Option<&str>,
    ) -> &ToolResult {
        let id = match tool_call_id {
            Some(id) if self.resolve_pending(id) => id.to_string(),
            other => {
                let id = other
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                debug!(tool = tool_name, call_id = %id, "synthesizing assistant tool-call turn");
                self.turns.push(Turn::Assistant {
                    content: None,
                    tool_calls: vec![ToolCall {
                        id: id.clone(),
                        name: tool_name.to_string(),
                        arguments: arguments.clone(),
                    }],
                });
                id
            }
        };

        self.turns.push(Turn::Tool {
            tool_call_id: id,
            name: tool_name.to_string(),
            content: result.to_string(),
        });
        self.tool_results.push(ToolResult {
            tool_name: tool_name.to_string(),
            arguments,
            result: result.to_string(),
            timestamp: chrono::Local::now().to_rfc3339(),
        });
        &self.tool_results[self.tool_results.len() - 1]
    }

    /// Append the assistant's final answer for this turn.
    pub fn append_assistant_turn(&mut self, text: &str) {
        self.turns.push(Turn::Assistant {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
        });
    }

    pub fn snapshot(&self) -> &[Turn] {
        &self.turns
    }

    pub fn tool_results(&self) -> &[ToolResult] {
        &self.tool_results
    }

    pub fn pending_calls(&self) -> &[String] {
        &self.pending
    }

    pub fn has_image(&self) -> bool {
        self.turns.iter().any(Turn::has_image)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Start over. The system turn, if configured, is restored.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.tool_results.clear();
        self.pending.clear();
        if let Some(prompt) = &self.system_prompt {
            self.turns.push(Turn::System {
                content: prompt.clone(),
            });
        }
    }

    fn resolve_pending(&mut self, id: &str) -> bool {
        match self.pending.iter().position(|p| p == id) {
            Some(i) => {
                self.pending.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Text rendering of a non-image attachment, appended after the user's words.
fn describe_file(text: &str, a: &Attachment) -> String {
    let mut lines = vec!["[附件信息]".to_string()];
    lines.push(format!(
        "文件名: {}",
        a.original_filename.as_deref().unwrap_or("未知")
    ));
    lines.push(format!("文件类型: {}", a.kind));
    lines.push(format!(
        "媒体类型: {}",
        if a.media_type.is_empty() { "未知" } else { &a.media_type }
    ));
    lines.push(match a.size_bytes {
        Some(size) => format!("文件大小: {size} 字节"),
        None => "文件大小: 未知".to_string(),
    });
    if let Some(url) = a.reference_url() {
        lines.push(format!("文件地址: {url}"));
    }
    lines.push(format!(
        "注意: 这是一个{}文件，不是图片，请不要把它当作图片处理。",
        a.kind
    ));

    let block = lines.join("\n");
    if text.trim().is_empty() {
        block
    } else {
        format!("{text}\n\n{block}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{AttachmentKind, AttachmentSource};
    use serde_json::json;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: json!({}),
        }
    }

    /// Every tool turn must follow an assistant turn announcing its id.
    fn assert_pairing(turns: &[Turn]) {
        for (i, turn) in turns.iter().enumerate() {
            if let Turn::Tool { tool_call_id, .. } = turn {
                let announced = turns[..i].iter().any(|t| match t {
                    Turn::Assistant { tool_calls, .. } => {
                        tool_calls.iter().any(|c| &c.id == tool_call_id)
                    }
                    _ => false,
                });
                assert!(announced, "tool turn {tool_call_id} has no announcing assistant turn");
            }
        }
    }

    #[test]
    fn system_prompt_leads_and_survives_reset() {
        let mut ctx = ConversationContext::with_system_prompt("sys");
        ctx.append_user_turn("hi", None);
        ctx.append_assistant_turn("hello");
        ctx.append_tool_result("t", json!({}), "r", None);
        assert_eq!(ctx.snapshot()[0], Turn::System { content: "sys".into() });

        ctx.reset();
        assert_eq!(ctx.snapshot(), &[Turn::System { content: "sys".into() }]);
        assert!(ctx.tool_results().is_empty());
        assert!(ctx.pending_calls().is_empty());

        let mut bare = ConversationContext::new();
        bare.append_user_turn("x", None);
        bare.reset();
        assert!(bare.is_empty());
    }

    #[test]
    fn image_attachment_yields_two_parts_from_any_channel() {
        let via_url = Attachment::builder()
            .url("https://example.com/cat.png")
            .build()
            .unwrap();
        let via_upload = Attachment::builder()
            .bytes(b"\x89PNG\r\n\x1a\n".to_vec())
            .filename("cat.png")
            .media_type("image/png")
            .kind(AttachmentKind::Image)
            .build()
            .unwrap();

        for a in [via_url, via_upload] {
            let mut ctx = ConversationContext::new();
            ctx.append_user_turn("这是什么？", Some(&a));
            match &ctx.snapshot()[0] {
                Turn::User {
                    content: UserContent::Parts(parts),
                } => {
                    assert_eq!(parts.len(), 2);
                    assert_eq!(parts[0], ContentPart::text("这是什么？"));
                    assert!(matches!(parts[1], ContentPart::ImageUrl { .. }));
                }
                other => panic!("expected parts, got {other:?}"),
            }
            assert!(ctx.has_image());
        }
    }

    #[test]
    fn document_attachment_is_described_in_text() {
        let a = Attachment::builder()
            .bytes(b"%PDF-1.4".to_vec())
            .filename("report.pdf")
            .media_type("application/pdf")
            .build()
            .unwrap();
        assert_eq!(a.kind, AttachmentKind::Document);
        assert!(matches!(a.source, AttachmentSource::Bytes(_)));

        let mut ctx = ConversationContext::new();
        ctx.append_user_turn("", Some(&a));
        assert_eq!(ctx.len(), 1);
        match &ctx.snapshot()[0] {
            Turn::User {
                content: UserContent::Text(text),
            } => {
                assert!(text.contains("report.pdf"));
                assert!(text.contains("application/pdf"));
                assert!(text.contains("文件大小: 8 字节"));
                assert!(text.contains("不是图片"));
                assert!(text.starts_with("[附件信息]"));
            }
            other => panic!("expected text, got {other:?}"),
        }
        assert!(!ctx.has_image());
    }

    #[test]
    fn tool_result_resolves_announced_call() {
        let mut ctx = ConversationContext::new();
        ctx.append_user_turn("weather?", None);
        ctx.append_tool_calls(None, vec![call("call_1", "get_weather"), call("call_2", "generate_ai_id")]);
        assert_eq!(ctx.pending_calls(), ["call_1", "call_2"]);

        ctx.append_tool_result("get_weather", json!({"city": "北京"}), "晴", Some("call_1"));
        ctx.append_tool_result("generate_ai_id", json!({}), "AI-1", Some("call_2"));

        // user, assistant(tool_calls), tool, tool
        assert_eq!(ctx.len(), 4);
        assert!(ctx.pending_calls().is_empty());
        assert_eq!(ctx.tool_results().len(), 2);
        assert_eq!(ctx.tool_results()[0].arguments, json!({"city": "北京"}));
        assert_pairing(ctx.snapshot());
    }

    #[test]
    fn unknown_or_missing_id_synthesizes_assistant_turn() {
        let mut ctx = ConversationContext::new();
        ctx.append_tool_result("get_weather", json!({"city": "上海"}), "多云", Some("call_x"));
        ctx.append_tool_result("generate_ai_id", json!({}), "AI-2", None);

        let turns = ctx.snapshot();
        assert_eq!(turns.len(), 4);
        match &turns[0] {
            Turn::Assistant { content, tool_calls } => {
                assert!(content.is_none());
                assert_eq!(tool_calls[0].id, "call_x");
                assert_eq!(tool_calls[0].arguments, json!({"city": "上海"}));
            }
            other => panic!("expected assistant, got {other:?}"),
        }
        match &turns[3] {
            Turn::Tool { tool_call_id, .. } => assert!(tool_call_id.starts_with("call_")),
            other => panic!("expected tool, got {other:?}"),
        }
        assert_pairing(turns);
    }

    #[test]
    fn answering_the_same_id_twice_stays_paired() {
        let mut ctx = ConversationContext::new();
        ctx.append_tool_calls(Some("checking".into()), vec![call("c1", "t")]);
        ctx.append_tool_result("t", json!({}), "first", Some("c1"));
        ctx.append_tool_result("t", json!({}), "second", Some("c1"));
        // The second answer gets its own announcing turn.
        assert_eq!(ctx.len(), 4);
        assert_pairing(ctx.snapshot());
    }

    #[test]
    fn turns_serialize_in_chat_shape() {
        let mut ctx = ConversationContext::with_system_prompt("sys");
        ctx.append_tool_calls(None, vec![call("c1", "get_weather")]);
        ctx.append_tool_result("get_weather", json!({}), "晴", Some("c1"));
        let value = serde_json::to_value(ctx.snapshot()).unwrap();

        assert_eq!(value[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(value[1]["role"], json!("assistant"));
        assert_eq!(value[1]["tool_calls"][0]["id"], json!("c1"));
        assert_eq!(
            value[2],
            json!({"role": "tool", "tool_call_id": "c1", "name": "get_weather", "content": "晴"})
        );

        let parts = Turn::User {
            content: UserContent::Parts(vec![ContentPart::text("t"), ContentPart::image("https://x/y.png")]),
        };
        assert_eq!(
            serde_json::to_value(&parts).unwrap(),
            json!({"role": "user", "content": [
                {"type": "text", "text": "t"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]})
        );
    }
}
