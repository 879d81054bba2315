//! Tool system for model tool calling.
//!
//! Tools implement [`Tool`]; the [`ToolRegistry`] owns them, produces the
//! manifest advertised to the model, and dispatches calls by name. The
//! registry is the error boundary: [`ToolRegistry::invoke`] always returns
//! text, whether the tool succeeded, failed, panicked or does not exist.

pub mod build;
pub mod document;
pub mod identifiers;
pub mod image_analysis;
pub mod weather;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::provider::ToolDefinition;

pub use build::build_registry;

/// Arguments of one call, as the model sent them.
pub type ToolArgs = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("缺少参数 {0}")]
    MissingArgument(String),

    #[error("参数无效: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

/// One parameter of a tool's input.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    /// JSON Schema type, e.g. `"string"`.
    pub kind: String,
    pub description: String,
    pub optional: bool,
}

impl ParamSpec {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "string".to_string(),
            description: description.to_string(),
            optional: false,
        }
    }

    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            optional: true,
            ..Self::required(name, description)
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model calls this tool by.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Vec<ParamSpec>;
    /// Run the tool. Errors are turned into text by the registry.
    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError>;
}

/// Build a JSON Schema object from parameter specs.
///
/// Every non-optional parameter is listed as required; the optional marker
/// itself never appears in the schema.
pub fn input_schema(params: &[ParamSpec]) -> Value {
    let mut properties = Map::new();
    for p in params {
        properties.insert(
            p.name.clone(),
            json!({ "type": p.kind, "description": p.description }),
        );
    }
    let required: Vec<&str> = params
        .iter()
        .filter(|p| !p.optional)
        .map(|p| p.name.as_str())
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

type ToolFn = dyn Fn(ToolArgs) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync;

/// A tool backed by an async closure.
pub struct FnTool {
    name: String,
    description: String,
    params: Vec<ParamSpec>,
    f: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(name: &str, description: &str, params: Vec<ParamSpec>, f: F) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params,
            f: Box::new(move |args| f(args).boxed()),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        self.params.clone()
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        (self.f)(args.clone()).await
    }
}

/// Name-keyed tool table, in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&i) => {
                debug!(tool = %name, "replacing registered tool");
                self.tools[i] = tool;
            }
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    /// Register an async closure as a tool.
    pub fn register_fn<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        params: Vec<ParamSpec>,
        f: F,
    ) where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.register(FnTool::new(name, description, params, f));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions of every tool, in registration order.
    pub fn manifest(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: input_schema(&t.parameters()),
            })
            .collect()
    }

    /// Run the named tool. Always returns text.
    pub async fn invoke(&self, name: &str, args: &Value) -> String {
        let Some(tool) = self.get(name) else {
            warn!(tool = name, "model requested unknown tool");
            return format!("工具 {name} 不存在");
        };

        let args = match args {
            Value::Object(map) => map.clone(),
            Value::Null => ToolArgs::new(),
            other => {
                return format!("工具调用失败: 参数必须是JSON对象，实际为 {other}");
            }
        };

        debug!(tool = name, "executing tool");
        match AssertUnwindSafe(tool.execute(&args)).catch_unwind().await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "tool failed");
                format!("工具调用失败: {e}")
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(tool = name, panic = %message, "tool panicked");
                format!("工具调用失败: {message}")
            }
        }
    }
}

/// A non-empty string argument, if present.
pub(crate) fn str_arg<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo the text back"
        }
        fn parameters(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::required("text", "what to echo"),
                ParamSpec::optional("times", "repeat count").with_kind("integer"),
            ]
        }
        async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
            let text = str_arg(args, "text").ok_or_else(|| ToolError::MissingArgument("text".into()))?;
            let times = args.get("times").and_then(Value::as_u64).unwrap_or(1) as usize;
            Ok(text.repeat(times))
        }
    }

    struct Panicky;

    #[async_trait]
    impl Tool for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn parameters(&self) -> Vec<ParamSpec> {
            Vec::new()
        }
        async fn execute(&self, _args: &ToolArgs) -> Result<String, ToolError> {
            panic!("boom")
        }
    }

    #[test]
    fn schema_lists_only_required_params_and_strips_marker() {
        let schema = input_schema(&Echo.parameters());
        assert_eq!(schema["type"], json!("object"));
        assert_eq!(schema["required"], json!(["text"]));
        assert_eq!(
            schema["properties"]["times"],
            json!({"type": "integer", "description": "repeat count"})
        );
        assert!(schema["properties"]["times"].get("optional").is_none());
    }

    #[test]
    fn reregistering_replaces_in_place() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo);
        reg.register(Panicky);
        reg.register_fn("echo", "second echo", Vec::new(), |_| async { Ok("v2".to_string()) });

        assert_eq!(reg.names(), vec!["echo", "panicky"]);
        let manifest = reg.manifest();
        assert_eq!(manifest[0].description, "second echo");
        assert_eq!(manifest.len(), 2);
    }

    #[tokio::test]
    async fn invoke_runs_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo);
        assert_eq!(reg.invoke("echo", &json!({"text": "ab", "times": 2})).await, "abab");
    }

    #[tokio::test]
    async fn unknown_tool_is_text() {
        let reg = ToolRegistry::new();
        assert_eq!(reg.invoke("nope", &json!({})).await, "工具 nope 不存在");
    }

    #[tokio::test]
    async fn tool_errors_and_panics_become_text() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo);
        reg.register(Panicky);
        reg.register_fn("bad_value", "raises", Vec::new(), |_| async {
            Err(ToolError::InvalidArguments("ValueError: bad value".into()))
        });

        let missing = reg.invoke("echo", &json!({})).await;
        assert_eq!(missing, "工具调用失败: 缺少参数 text");

        let panicked = reg.invoke("panicky", &json!({})).await;
        assert_eq!(panicked, "工具调用失败: boom");

        let raised = reg.invoke("bad_value", &Value::Null).await;
        assert!(raised.contains("失败"));
        assert!(raised.contains("ValueError"));

        let not_object = reg.invoke("echo", &json!("text")).await;
        assert!(not_object.starts_with("工具调用失败"));
    }

    #[tokio::test]
    async fn closures_receive_arguments() {
        let mut reg = ToolRegistry::new();
        reg.register_fn(
            "greet",
            "say hello",
            vec![ParamSpec::required("name", "who")],
            |args| async move {
                let name = str_arg(&args, "name").unwrap_or("world").to_string();
                Ok(format!("hello {name}"))
            },
        );
        assert_eq!(reg.invoke("greet", &json!({"name": "彩虹"})).await, "hello 彩虹");
    }
}
