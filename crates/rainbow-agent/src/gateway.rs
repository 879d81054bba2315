//! Model gateway: one call to the reasoning backend with a fixed deadline.
//!
//! The gateway never fails. Provider errors and timeouts come back as a
//! response whose `content` explains the failure and whose `tool_calls` is
//! empty, so the orchestrator can always finish the turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use rainbow_core::config::AgentConfig;

use crate::context::Turn;
use crate::provider::{ChatRequest, LlmProvider, ProviderError, ToolCall, ToolDefinition, Usage};

/// Outcome of one gateway call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GatewayResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl GatewayResponse {
    fn failed(err: impl std::fmt::Display) -> Self {
        Self {
            content: format!("模型调用出错: {err}"),
            tool_calls: Vec::new(),
            usage: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Shape recorded in the event log.
    pub fn to_json(&self) -> Value {
        json!({
            "content": self.content,
            "tool_calls": self.tool_calls,
            "usage": self.usage,
        })
    }
}

pub struct ModelGateway {
    provider: Arc<dyn LlmProvider>,
    model: RwLock<String>,
    vision_model: String,
    vision_models: Vec<String>,
    max_tokens: u32,
    temperature: f64,
    timeout: Duration,
}

impl ModelGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &AgentConfig) -> Self {
        Self {
            provider,
            model: RwLock::new(config.model.clone()),
            vision_model: config.vision_model.clone(),
            vision_models: config.vision_models.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }

    pub async fn current_model(&self) -> String {
        self.model.read().await.clone()
    }

    /// Send `transcript` to the backend, advertising `tools` when given.
    pub async fn invoke(
        &self,
        transcript: &[Turn],
        tools: Option<&[ToolDefinition]>,
    ) -> GatewayResponse {
        if transcript.iter().any(Turn::has_image) {
            self.ensure_vision_model().await;
        }

        let req = ChatRequest {
            model: self.current_model().await,
            messages: transcript.to_vec(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: tools.map(<[_]>::to_vec).unwrap_or_default(),
        };
        info!(
            model = %req.model, provider = %self.provider.name(),
            turns = req.messages.len(), tools = req.tools.len(), "calling model"
        );

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.provider.send(&req)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(resp) => {
                info!(
                    model = %resp.model, latency_ms,
                    tool_calls = resp.tool_calls.len(), stop_reason = %resp.stop_reason,
                    "model responded"
                );
                GatewayResponse {
                    content: resp.content,
                    tool_calls: resp.tool_calls,
                    usage: resp.usage,
                }
            }
            Err(e) => {
                warn!(model = %req.model, latency_ms, error = %e, "model call failed");
                GatewayResponse::failed(e)
            }
        }
    }

    /// Switch to the vision model unless the current one already handles images.
    /// The switch is kept for later calls.
    async fn ensure_vision_model(&self) {
        let mut model = self.model.write().await;
        if self.vision_models.iter().any(|m| *m == *model) || *model == self.vision_model {
            return;
        }
        info!(from = %*model, to = %self.vision_model, "switching to vision-capable model");
        *model = self.vision_model.clone();
    }
}
