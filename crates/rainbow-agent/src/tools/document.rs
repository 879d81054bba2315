//! Tool: process_document: inspect an uploaded text document.
//!
//! Documents are looked up through the injected [`AttachmentStore`]; without
//! a reference the most recent document upload is used.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{str_arg, ParamSpec, Tool, ToolArgs, ToolError};
use crate::attachment::{AttachmentError, AttachmentKind, AttachmentStore};

/// Characters of content shown by the `analyze` action.
const PREVIEW_CHARS: usize = 1000;

pub struct ProcessDocumentTool {
    store: Arc<dyn AttachmentStore>,
}

impl ProcessDocumentTool {
    pub fn new(store: Arc<dyn AttachmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ProcessDocumentTool {
    fn name(&self) -> &str {
        "process_document"
    }

    fn description(&self) -> &str {
        "处理文档文件"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::optional(
                "document_url",
                "文档的URL路径，如果不提供，将尝试使用最近上传的文档",
            ),
            ParamSpec::optional(
                "action",
                "要执行的操作，可以是'analyze'(分析内容), 'summarize'(生成摘要), 'extract'(提取信息)",
            ),
        ]
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let reference = match str_arg(args, "document_url") {
            Some(r) => r.to_string(),
            None => match self.store.latest(AttachmentKind::Document) {
                Ok(Some(r)) => {
                    debug!(reference = %r, "using most recent document");
                    r
                }
                Ok(None) => return Ok("未找到最近上传的文档，请提供文档URL".to_string()),
                Err(e) => return Ok(format!("读取文档时出错: {e}")),
            },
        };
        let action = str_arg(args, "action").unwrap_or("analyze");

        let bytes = match self.store.resolve(&reference) {
            Ok(b) => b,
            Err(AttachmentError::NotFound(_)) => return Ok(format!("文档不存在: {reference}")),
            Err(e) => {
                warn!(%reference, error = %e, "document read failed");
                return Ok(format!("读取文档时出错: {e}"));
            }
        };
        let size = bytes.len();
        let Ok(content) = String::from_utf8(bytes) else {
            return Ok(format!("无法解析文档编码: {reference}"));
        };

        Ok(match action {
            "analyze" => {
                let mut preview: String = content.chars().take(PREVIEW_CHARS).collect();
                if content.chars().count() > PREVIEW_CHARS {
                    preview.push_str("...");
                }
                format!(
                    "文档内容分析\n\n文档路径: {reference}\n文档大小: {size} 字节\n内容预览:\n{preview}"
                )
            }
            "summarize" => format!(
                "文档摘要\n\n文档路径: {reference}\n文档大小: {size} 字节\n摘要: 这是一个文本文档，包含约 {} 个字符。接入摘要服务后，这里将返回文档摘要。",
                content.chars().count()
            ),
            "extract" => format!(
                "文档信息提取\n\n文档路径: {reference}\n文档大小: {size} 字节\n提取的信息: 接入信息提取服务后，这里将返回结构化信息。"
            ),
            other => format!("不支持的操作类型: {other}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::DirectoryStore;
    use serde_json::json;

    fn args(v: serde_json::Value) -> ToolArgs {
        v.as_object().cloned().unwrap()
    }

    fn tool(dir: &std::path::Path) -> (ProcessDocumentTool, Arc<DirectoryStore>) {
        let store = Arc::new(DirectoryStore::new(dir));
        (ProcessDocumentTool::new(store.clone()), store)
    }

    #[tokio::test]
    async fn analyze_previews_content() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, store) = tool(dir.path());
        let long = "彩".repeat(PREVIEW_CHARS + 5);
        let reference = store
            .put(AttachmentKind::Document, "long.txt", long.as_bytes())
            .unwrap();

        let out = tool.execute(&args(json!({"document_url": reference}))).await.unwrap();
        assert!(out.starts_with("文档内容分析"));
        assert!(out.contains(&format!("文档大小: {} 字节", long.len())));
        assert!(out.ends_with(&format!("{}...", "彩".repeat(PREVIEW_CHARS))));
    }

    #[tokio::test]
    async fn falls_back_to_latest_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, store) = tool(dir.path());
        assert_eq!(
            tool.execute(&ToolArgs::new()).await.unwrap(),
            "未找到最近上传的文档，请提供文档URL"
        );

        store.put(AttachmentKind::Document, "a.txt", b"hello").unwrap();
        let out = tool
            .execute(&args(json!({"action": "summarize"})))
            .await
            .unwrap();
        assert!(out.starts_with("文档摘要"));
        assert!(out.contains("包含约 5 个字符"));
    }

    #[tokio::test]
    async fn missing_and_undecodable_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, store) = tool(dir.path());

        let out = tool
            .execute(&args(json!({"document_url": "/uploads/document/ghost.txt"})))
            .await
            .unwrap();
        assert_eq!(out, "文档不存在: /uploads/document/ghost.txt");

        let reference = store
            .put(AttachmentKind::Document, "bin.txt", &[0xff, 0xfe, 0x00, 0xc3])
            .unwrap();
        let out = tool.execute(&args(json!({"document_url": reference}))).await.unwrap();
        assert!(out.starts_with("无法解析文档编码"));
    }

    #[tokio::test]
    async fn host_files_are_not_readable_through_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, b"TOP-SECRET").unwrap();
        let (tool, _) = tool(&dir.path().join("uploads"));

        let out = tool
            .execute(&args(json!({"document_url": secret.to_str().unwrap()})))
            .await
            .unwrap();
        assert!(out.starts_with("文档不存在"));
        assert!(!out.contains("TOP-SECRET"));

        let out = tool
            .execute(&args(json!({"document_url": "../../secret.txt"})))
            .await
            .unwrap();
        assert!(out.starts_with("读取文档时出错"));
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, store) = tool(dir.path());
        let reference = store.put(AttachmentKind::Document, "a.txt", b"x").unwrap();
        let out = tool
            .execute(&args(json!({"document_url": reference, "action": "translate"})))
            .await
            .unwrap();
        assert_eq!(out, "不支持的操作类型: translate");
    }
}
