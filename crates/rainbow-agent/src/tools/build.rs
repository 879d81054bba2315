//! Builds the canonical tool registry for an orchestrator.

use std::sync::Arc;

use rainbow_core::config::WeatherConfig;

use super::document::ProcessDocumentTool;
use super::identifiers::{GenerateAiIdTool, GenerateFrequencyTool};
use super::image_analysis::AnalyzeImageTool;
use super::weather::WeatherTool;
use super::ToolRegistry;
use crate::attachment::AttachmentStore;

/// The built-in tools, in manifest order:
/// `get_weather`, `generate_ai_id`, `generate_frequency`, `analyze_image`,
/// `process_document`.
pub fn build_registry(weather: &WeatherConfig, store: Arc<dyn AttachmentStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(WeatherTool::new(weather));
    registry.register(GenerateAiIdTool);
    registry.register(GenerateFrequencyTool);
    registry.register(AnalyzeImageTool);
    registry.register(ProcessDocumentTool::new(store));
    registry
}
