use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::{ContentPart, Turn, UserContent};
use crate::provider::{
    retry_after_ms, ChatRequest, ChatResponse, LlmProvider, ProviderError, ToolCall, Usage,
};

const API_VERSION: &str = "2023-06-01";

/// Messages-API backend.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.anthropic.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, tools = req.tools.len(), "sending request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry_after_ms(&resp),
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }
}

/// Image part as an Anthropic image block. `data:` URIs become base64 sources.
fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            });
        }
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}

fn text_block(text: &str) -> Option<Value> {
    (!text.trim().is_empty()).then(|| json!({ "type": "text", "text": text }))
}

/// Role and content blocks for one non-system turn.
///
/// Without a tool manifest the API refuses `tool_use`/`tool_result` blocks,
/// so earlier tool traffic is rendered as plain text instead.
fn turn_blocks(turn: &Turn, with_tools: bool) -> Option<(&'static str, Vec<Value>)> {
    match turn {
        Turn::System { .. } => None,
        Turn::User { content } => {
            let blocks = match content {
                UserContent::Text(text) => text_block(text).into_iter().collect(),
                UserContent::Parts(parts) => parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => text_block(text),
                        ContentPart::ImageUrl { image_url } => Some(image_block(&image_url.url)),
                    })
                    .collect(),
            };
            Some(("user", blocks))
        }
        Turn::Assistant {
            content,
            tool_calls,
        } => {
            let mut blocks: Vec<Value> = content.as_deref().and_then(text_block).into_iter().collect();
            for call in tool_calls {
                if with_tools {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                } else {
                    blocks.push(json!({
                        "type": "text",
                        "text": format!("[调用工具 {}] {}", call.name, call.arguments),
                    }));
                }
            }
            Some(("assistant", blocks))
        }
        Turn::Tool {
            tool_call_id,
            name,
            content,
        } => {
            let block = if with_tools {
                json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                })
            } else {
                json!({ "type": "text", "text": format!("[工具 {name} 返回] {content}") })
            };
            Some(("user", vec![block]))
        }
    }
}

fn build_request_body(req: &ChatRequest) -> Value {
    let system: Vec<&str> = req
        .messages
        .iter()
        .filter_map(|t| match t {
            Turn::System { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();

    // The API wants alternating roles, so adjacent same-role turns are merged
    // (e.g. several tool results after one assistant turn).
    let mut messages: Vec<Value> = Vec::new();
    let with_tools = !req.tools.is_empty();
    for (role, blocks) in req
        .messages
        .iter()
        .filter_map(|t| turn_blocks(t, with_tools))
    {
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["content"].as_array_mut() {
                    existing.extend(blocks);
                }
            }
            _ => messages.push(json!({ "role": role, "content": blocks })),
        }
    }

    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n\n"));
    }

    if with_tools {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = json!({ "type": "auto" });
    }
    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text } => content.push_str(&text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input,
            }),
            ContentBlock::Other => {}
        }
    }

    ChatResponse {
        content,
        model: resp.model,
        stop_reason: resp.stop_reason.unwrap_or_default(),
        tool_calls,
        usage: Some(Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

// Anthropic API response types (private, deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}
