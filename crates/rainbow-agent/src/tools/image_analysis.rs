//! Tool: analyze_image: placeholder analysis until a vision backend is wired in.

use async_trait::async_trait;

use super::{str_arg, ParamSpec, Tool, ToolArgs, ToolError};
use crate::attachment::Attachment;
use crate::context::ContentPart;

pub struct AnalyzeImageTool;

#[async_trait]
impl Tool for AnalyzeImageTool {
    fn name(&self) -> &str {
        "analyze_image"
    }

    fn description(&self) -> &str {
        "分析图片内容"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("image_data", "图片的Base64编码或URL"),
            ParamSpec::optional(
                "analysis_type",
                "分析类型，可以是'general'(一般描述), 'objects'(物体检测), 'text'(文字识别)",
            ),
        ]
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let data = str_arg(args, "image_data")
            .ok_or_else(|| ToolError::MissingArgument("image_data".into()))?;

        // Same decoding rules as user-supplied images.
        let attachment = Attachment::builder()
            .url(data)
            .build()
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        if let ContentPart::Text { text } = crate::attachment::image_part(&attachment) {
            return Ok(format!("无法解析图片数据: {text}"));
        }

        let analysis = str_arg(args, "analysis_type").unwrap_or("general");
        Ok(match analysis {
            "general" => "这是一张图片的一般描述。接入图像分析服务后，这里将返回图片的详细内容描述。".to_string(),
            "objects" => "已检测到图片中的物体。接入物体检测服务后，这里将返回识别出的物体列表。".to_string(),
            "text" => "已提取图片中的文字。接入OCR服务后，这里将返回识别出的文字。".to_string(),
            other => format!("不支持的分析类型: {other}"),
        })
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
    async fn analysis_types() {
        let url = "https://example.com/a.png";
        let general = AnalyzeImageTool.execute(&args(json!({"image_data": url}))).await.unwrap();
        assert!(general.contains("一般描述"));

        let objects = AnalyzeImageTool
            .execute(&args(json!({"image_data": url, "analysis_type": "objects"})))
            .await
            .unwrap();
        assert!(objects.contains("物体"));

        let ocr = AnalyzeImageTool
            .execute(&args(json!({"image_data": "aGVsbG8=", "analysis_type": "text"})))
            .await
            .unwrap();
        assert!(ocr.contains("文字"));

        let other = AnalyzeImageTool
            .execute(&args(json!({"image_data": url, "analysis_type": "faces"})))
            .await
            .unwrap();
        assert_eq!(other, "不支持的分析类型: faces");
    }

    #[tokio::test]
    async fn undecodable_data_is_reported() {
        let out = AnalyzeImageTool
            .execute(&args(json!({"image_data": "%%% not an image %%%"})))
            .await
            .unwrap();
        assert!(out.starts_with("无法解析图片数据"));
    }
}
