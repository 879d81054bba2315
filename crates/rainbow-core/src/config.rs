use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_VISION_MODEL: &str = "gpt-4o";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-6";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WEATHER_TIMEOUT_SECS: u64 = 10;

const DEFAULT_SYSTEM_PROMPT: &str = "你是彩虹城系统的AI助手，专门解答关于彩虹城系统、一体七翼、频率编号和关系管理的问题。如果需要外部数据，请明确说明需要调用什么工具。";

/// Top-level config (rainbow.toml + RAINBOW_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RainbowConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Model substituted when a transcript carries images and `model`
    /// is not listed in `vision_models`.
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_vision_models")]
    pub vision_models: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Hard deadline for a single model call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl AgentConfig {
    /// These settings with `model` as both the chat and the vision model.
    pub fn routed_to(&self, model: &str) -> AgentConfig {
        AgentConfig {
            model: model.to_string(),
            vision_model: model.to_string(),
            vision_models: vec![model.to_string()],
            ..self.clone()
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            model: default_model(),
            vision_model: default_vision_model(),
            vision_models: default_vision_models(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub openai: Option<OpenAiProviderConfig>,
    pub anthropic: Option<AnthropicConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    /// Overrides `agent.model` for requests routed here.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    /// Claude model used for every call, images included.
    #[serde(default = "default_anthropic_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub weather: WeatherConfig,
}

/// Settings for the `get_weather` tool (weatherapi.com).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Missing key is not fatal: the tool answers with an explanation instead.
    pub api_key: Option<String>,
    #[serde(default = "default_weather_base_url")]
    pub base_url: String,
    #[serde(default = "default_weather_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_weather_base_url(),
            timeout_secs: DEFAULT_WEATHER_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for persisted uploads (`{upload_dir}/{kind}/...`).
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    /// Directory receiving flushed session logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Extra base directories probed when resolving document references.
    #[serde(default)]
    pub probe_roots: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            log_dir: default_log_dir(),
            db_path: default_db_path(),
            probe_roots: Vec::new(),
        }
    }
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_vision_model() -> String {
    DEFAULT_VISION_MODEL.to_string()
}
fn default_vision_models() -> Vec<String> {
    vec!["gpt-4o".to_string(), "gpt-4-turbo".to_string()]
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}
fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_anthropic_model() -> String {
    DEFAULT_ANTHROPIC_MODEL.to_string()
}
fn default_weather_base_url() -> String {
    "https://api.weatherapi.com".to_string()
}
fn default_weather_timeout_secs() -> u64 {
    DEFAULT_WEATHER_TIMEOUT_SECS
}
fn default_upload_dir() -> String {
    format!("{}/uploads", rainbow_home())
}
fn default_log_dir() -> String {
    format!("{}/logs", rainbow_home())
}
fn default_db_path() -> String {
    format!("{}/rainbow.db", rainbow_home())
}

fn rainbow_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.rainbow", home)
}

impl RainbowConfig {
    /// Load config from a TOML file with RAINBOW_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `RAINBOW_AGENT__MODEL=gpt-4o-mini`. The conventional
    /// `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` / `WEATHER_API_KEY` variables
    /// fill in keys the file leaves out.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: RainbowConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RAINBOW_").split("__"))
            .extract()
            .map_err(|e| crate::error::RainbowError::Config(e.to_string()))?;

        config.apply_env_fallbacks(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every call fail.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.agent.request_timeout_secs == 0 {
            return Err(crate::error::RainbowError::InvalidValue {
                field: "agent.request_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tools.weather.timeout_secs == 0 {
            return Err(crate::error::RainbowError::InvalidValue {
                field: "tools.weather.timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Fill missing credentials from conventional environment variables.
    ///
    /// `lookup` is injected so tests don't have to mutate process env.
    pub fn apply_env_fallbacks<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.providers.openai.is_none() {
            if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
                self.providers.openai = Some(OpenAiProviderConfig {
                    api_key: key,
                    base_url: default_openai_base_url(),
                    model: None,
                });
            }
        }
        if self.providers.anthropic.is_none() {
            if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
                self.providers.anthropic = Some(AnthropicConfig {
                    api_key: key,
                    base_url: default_anthropic_base_url(),
                    model: default_anthropic_model(),
                });
            }
        }
        if self.tools.weather.api_key.is_none() {
            self.tools.weather.api_key = lookup("WEATHER_API_KEY").filter(|k| !k.is_empty());
        }
    }
}

fn default_config_path() -> String {
    format!("{}/rainbow.toml", rainbow_home())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable_without_a_file() {
        let config = RainbowConfig::default();
        assert_eq!(config.agent.model, "gpt-4o");
        assert!(config.agent.vision_models.contains(&"gpt-4o".to_string()));
        assert_eq!(config.tools.weather.timeout_secs, 10);
        assert!(config.agent.system_prompt.contains("彩虹城"));
    }

    #[test]
    fn load_reads_toml_and_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[agent]
model = "gpt-3.5-turbo"
request_timeout_secs = 5

[providers.openai]
api_key = "sk-test"

[storage]
log_dir = "/tmp/rainbow-logs"
"#
        )
        .unwrap();

        let config = RainbowConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.agent.model, "gpt-3.5-turbo");
        assert_eq!(config.agent.request_timeout_secs, 5);
        assert_eq!(config.agent.max_tokens, DEFAULT_MAX_TOKENS);
        let openai = config.providers.openai.unwrap();
        assert_eq!(openai.api_key, "sk-test");
        assert_eq!(openai.base_url, "https://api.openai.com");
        assert_eq!(config.storage.log_dir, "/tmp/rainbow-logs");
    }

    #[test]
    fn anthropic_section_carries_its_own_model() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[providers.anthropic]
api_key = "sk-ant"
"#
        )
        .unwrap();

        let config = RainbowConfig::load(file.path().to_str()).unwrap();
        let anthropic = config.providers.anthropic.unwrap();
        assert_eq!(anthropic.model, DEFAULT_ANTHROPIC_MODEL);

        let routed = config.agent.routed_to(&anthropic.model);
        assert_eq!(routed.model, DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(routed.vision_model, DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(routed.vision_models, vec![DEFAULT_ANTHROPIC_MODEL.to_string()]);
        assert_eq!(routed.max_tokens, config.agent.max_tokens);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[agent]\nrequest_timeout_secs = 0").unwrap();

        let err = RainbowConfig::load(file.path().to_str()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RainbowError::InvalidValue { field: "agent.request_timeout_secs", .. }
        ));

        let mut config = RainbowConfig::default();
        assert!(config.validate().is_ok());
        config.tools.weather.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_fallbacks_only_fill_missing_values() {
        let mut config = RainbowConfig::default();
        config.tools.weather.api_key = Some("from-file".to_string());

        config.apply_env_fallbacks(|name| match name {
            "OPENAI_API_KEY" => Some("sk-env".to_string()),
            "WEATHER_API_KEY" => Some("from-env".to_string()),
            _ => None,
        });

        let openai = config.providers.openai.unwrap();
        assert_eq!(openai.api_key, "sk-env");
        assert_eq!(openai.model, None);
        assert!(config.providers.anthropic.is_none());
        assert_eq!(config.tools.weather.api_key.as_deref(), Some("from-file"));
    }
}
