//! rainbow-agent: tool-calling conversation core.
//!
//! A turn flows through the [`attachment`] normalizer, the per-session
//! [`context`], the [`gateway`] (first call with the tool manifest), the
//! [`tools`] registry, a second gateway call, and finally the event log.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rainbow_agent::{AgentContext, ModelGateway, OpenAiProvider, Orchestrator, TurnRequest};
//! use rainbow_agent::attachment::DirectoryStore;
//! use rainbow_core::RainbowConfig;
//! use rainbow_eventlog::{EventLog, JsonFileSink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RainbowConfig::default();
//!     let provider = Arc::new(OpenAiProvider::new("sk-...".into(), None));
//!     let uploads = Arc::new(DirectoryStore::new(&config.storage.upload_dir));
//!     let orchestrator = Orchestrator::new(AgentContext {
//!         gateway: ModelGateway::new(provider, &config.agent),
//!         tools: Arc::new(rainbow_agent::tools::build_registry(&config.tools.weather, uploads.clone())),
//!         events: Arc::new(EventLog::new(JsonFileSink::new(&config.storage.log_dir))),
//!         store: None,
//!         attachments: Some(uploads),
//!         system_prompt: config.agent.system_prompt.clone(),
//!     });
//!
//!     let reply = orchestrator
//!         .process_turn(TurnRequest { user_input: "明天北京天气怎么样？".into(), ..Default::default() })
//!         .await
//!         .unwrap();
//!     println!("{}", reply.response);
//! }
//! ```

pub mod anthropic;
pub mod attachment;
pub mod context;
pub mod gateway;
pub mod openai;
pub mod orchestrator;
pub mod provider;
pub mod tools;

pub use anthropic::AnthropicProvider;
pub use attachment::{Attachment, AttachmentError, AttachmentKind, AttachmentStore};
pub use context::{ConversationContext, ToolResult, Turn};
pub use gateway::{GatewayResponse, ModelGateway};
pub use openai::OpenAiProvider;
pub use orchestrator::{
    AgentContext, AgentError, FileData, FileInfo, Orchestrator, TurnRequest, TurnResponse,
};
pub use provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, ToolCall, ToolDefinition};
pub use tools::{Tool, ToolError, ToolRegistry};
