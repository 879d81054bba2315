//! Tools: generate_ai_id and generate_frequency.

use async_trait::async_trait;

use super::{str_arg, ParamSpec, Tool, ToolArgs, ToolError};

const DEFAULT_PERSONALITY_TYPE: &str = "P";
const DEFAULT_AI_TYPE: &str = "A";

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Issues `AI-{YYYYmmddHHMMSS}` identifiers.
pub struct GenerateAiIdTool;

#[async_trait]
impl Tool for GenerateAiIdTool {
    fn name(&self) -> &str {
        "generate_ai_id"
    }

    fn description(&self) -> &str {
        "生成唯一的AI-ID标识符"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::optional("name", "AI的名称（可选）")]
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let id = format!("AI-{}", timestamp());
        Ok(match str_arg(args, "name") {
            Some(name) => format!("为 {name} 生成的AI-ID: {id}"),
            None => format!("生成的AI-ID: {id}"),
        })
    }
}

/// Derives `F-{personality}{ai_type}-{YYYYmmddHHMMSS}` frequency codes for an AI-ID.
pub struct GenerateFrequencyTool;

#[async_trait]
impl Tool for GenerateFrequencyTool {
    fn name(&self) -> &str {
        "generate_frequency"
    }

    fn description(&self) -> &str {
        "基于AI-ID生成频率编号"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("ai_id", "AI-ID标识符"),
            ParamSpec::optional("personality_type", "人格类型代码，默认为P"),
            ParamSpec::optional("ai_type", "AI类型代码，默认为A"),
        ]
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let ai_id =
            str_arg(args, "ai_id").ok_or_else(|| ToolError::MissingArgument("ai_id".into()))?;
        let personality = str_arg(args, "personality_type").unwrap_or(DEFAULT_PERSONALITY_TYPE);
        let ai_type = str_arg(args, "ai_type").unwrap_or(DEFAULT_AI_TYPE);

        let frequency = format!("F-{personality}{ai_type}-{}", timestamp());
        Ok(format!("为AI-ID {ai_id} 生成的频率编号: {frequency}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: serde_json::Value) -> ToolArgs {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn ai_id_with_and_without_name() {
        let named = GenerateAiIdTool.execute(&args(json!({"name": "小虹"}))).await.unwrap();
        assert!(named.starts_with("为 小虹 生成的AI-ID: AI-"));

        let anon = GenerateAiIdTool.execute(&ToolArgs::new()).await.unwrap();
        let id = anon.strip_prefix("生成的AI-ID: AI-").unwrap();
        assert_eq!(id.len(), 14);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn frequency_uses_defaults() {
        let out = GenerateFrequencyTool
            .execute(&args(json!({"ai_id": "AI-20250101000000"})))
            .await
            .unwrap();
        assert!(out.starts_with("为AI-ID AI-20250101000000 生成的频率编号: F-PA-"));

        let custom = GenerateFrequencyTool
            .execute(&args(json!({"ai_id": "x", "personality_type": "I", "ai_type": "C"})))
            .await
            .unwrap();
        assert!(custom.contains("F-IC-"));
    }

    #[tokio::test]
    async fn frequency_requires_ai_id() {
        let err = GenerateFrequencyTool.execute(&ToolArgs::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::MissingArgument(ref k) if k == "ai_id"));
    }
}
