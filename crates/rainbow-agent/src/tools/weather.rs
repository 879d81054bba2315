//! Tool: get_weather: current conditions or tomorrow's forecast from weatherapi.com.
//!
//! Every failure mode (missing key, timeout, unreachable host, bad status,
//! unexpected payload) is answered with an explanatory sentence, not an error.

use std::time::Duration;

use async_trait::async_trait;
use rainbow_core::config::WeatherConfig;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{str_arg, ParamSpec, Tool, ToolArgs, ToolError};

/// Chinese place names mapped to the names the weather service understands.
/// Districts map to their parent city.
const CITY_ALIASES: &[(&str, &str)] = &[
    ("北京", "Beijing"),
    ("北京市", "Beijing"),
    ("上海", "Shanghai"),
    ("上海市", "Shanghai"),
    ("天津", "Tianjin"),
    ("天津市", "Tianjin"),
    ("重庆", "Chongqing"),
    ("重庆市", "Chongqing"),
    ("广州", "Guangzhou"),
    ("广州市", "Guangzhou"),
    ("深圳", "Shenzhen"),
    ("深圳市", "Shenzhen"),
    ("成都", "Chengdu"),
    ("成都市", "Chengdu"),
    ("杭州", "Hangzhou"),
    ("杭州市", "Hangzhou"),
    ("南京", "Nanjing"),
    ("南京市", "Nanjing"),
    ("武汉", "Wuhan"),
    ("武汉市", "Wuhan"),
    ("西安", "Xian"),
    ("西安市", "Xian"),
    ("郑州", "Zhengzhou"),
    ("郑州市", "Zhengzhou"),
    ("济南", "Jinan"),
    ("济南市", "Jinan"),
    ("青岛", "Qingdao"),
    ("青岛市", "Qingdao"),
    ("大连", "Dalian"),
    ("大连市", "Dalian"),
    ("沈阳", "Shenyang"),
    ("沈阳市", "Shenyang"),
    ("哈尔滨", "Harbin"),
    ("哈尔滨市", "Harbin"),
    ("章丘", "Jinan"),
    ("历城", "Jinan"),
    ("历下", "Jinan"),
    ("崂山", "Qingdao"),
    ("黄埔", "Wuhan"),
    ("海淀", "Beijing"),
    ("浦东", "Shanghai"),
    ("新加坡", "Singapore"),
];

/// Canonical name for `city`, or `city` unchanged.
pub fn canonical_city(city: &str) -> &str {
    CITY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == city)
        .map(|(_, name)| *name)
        .unwrap_or(city)
}

/// Whether the caller asked about tomorrow rather than now.
fn wants_tomorrow(date: Option<&str>) -> bool {
    date.is_some_and(|d| {
        let d = d.trim().to_lowercase();
        d == "tomorrow" || d == "明天"
    })
}

pub struct WeatherTool {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
}

impl WeatherTool {
    pub fn new(config: &WeatherConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    async fn lookup(&self, api_key: &str, city: &str, tomorrow: bool) -> String {
        let (endpoint, days) = if tomorrow {
            ("forecast.json", Some("2"))
        } else {
            ("current.json", None)
        };
        let url = format!("{}/v1/{}", self.base_url, endpoint);
        let mut query = vec![("key", api_key), ("q", city), ("lang", "zh")];
        if let Some(days) = days {
            query.push(("days", days));
        }

        debug!(city, endpoint, "requesting weather");
        let resp = match self
            .client
            .get(&url)
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(city, "weather request timed out");
                return format!("请求{city}天气信息超时，请稍后再试");
            }
            Err(e) if e.is_connect() => {
                warn!(city, error = %e, "weather service unreachable");
                return "连接天气API服务器失败，请检查网络连接".to_string();
            }
            Err(e) => {
                warn!(city, error = %e, "weather request failed");
                return format!("获取天气信息失败: {e}");
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let mut message = format!("请求失败，状态码: {}", status.as_u16());
            match resp.json::<ApiErrorBody>().await {
                Ok(body) => message.push_str(&format!(", 错误信息: {}", body.error.message)),
                Err(_) => message.push_str(", 无法解析错误响应"),
            }
            warn!(city, status = status.as_u16(), "weather API error");
            return format!("无法获取{city}的天气信息: {message}");
        }

        let body: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) if e.is_timeout() => return format!("请求{city}天气信息超时，请稍后再试"),
            Err(e) => return format!("无法解析天气数据: {e}"),
        };
        if body.get("location").is_none() {
            warn!(city, "weather payload has no location");
            return "获取到的数据格式不正确，缺少必要字段".to_string();
        }

        let rendered = if tomorrow {
            serde_json::from_value::<ForecastResponse>(body)
                .ok()
                .and_then(|r| render_tomorrow(&r))
        } else {
            serde_json::from_value::<CurrentResponse>(body)
                .ok()
                .map(|r| render_current(&r))
        };
        match rendered {
            Some(text) => {
                info!(city, "weather lookup succeeded");
                text
            }
            None => format!("解析{city}的天气数据时出错: 缺少必要字段"),
        }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "获取指定城市和日期的天气信息"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("city", "城市名称，如北京、上海、新加坡等"),
            ParamSpec::optional("date", "日期，如今天、明天、后天等"),
        ]
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok("WeatherAPI密钥未配置，请在.env文件中设置WEATHER_API_KEY".to_string());
        };
        let Some(city) = str_arg(args, "city") else {
            return Ok("请提供城市名称".to_string());
        };

        let canonical = canonical_city(city);
        if canonical != city {
            debug!(from = city, to = canonical, "mapped city alias");
        }
        Ok(self
            .lookup(api_key, canonical, wants_tomorrow(str_arg(args, "date")))
            .await)
    }
}

fn render_current(r: &CurrentResponse) -> String {
    format!(
        "{}当前天气: {}, 气温{}°C, 体感温度{}°C, 湿度{}%",
        r.location.name,
        r.current.condition.text,
        r.current.temp_c,
        r.current.feelslike_c,
        r.current.humidity
    )
}

fn render_tomorrow(r: &ForecastResponse) -> Option<String> {
    let day = &r.forecast.forecastday.get(1)?.day;
    Some(format!(
        "明天{}天气: {}, 气温{}°C至{}°C, 降雨概率{}%",
        r.location.name,
        day.condition.text,
        day.mintemp_c,
        day.maxtemp_c,
        day.daily_chance_of_rain
    ))
}

// weatherapi.com response types (private, deserialization only)

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct Location {
    name: String,
}

#[derive(Deserialize)]
struct Condition {
    text: String,
}

#[derive(Deserialize)]
struct CurrentResponse {
    location: Location,
    current: Current,
}

#[derive(Deserialize)]
struct Current {
    temp_c: f64,
    feelslike_c: f64,
    humidity: serde_json::Number,
    condition: Condition,
}

#[derive(Deserialize)]
struct ForecastResponse {
    location: Location,
    forecast: Forecast,
}

#[derive(Deserialize)]
struct Forecast {
    forecastday: Vec<ForecastDay>,
}

#[derive(Deserialize)]
struct ForecastDay {
    day: Day,
}

#[derive(Deserialize)]
struct Day {
    maxtemp_c: f64,
    mintemp_c: f64,
    daily_chance_of_rain: serde_json::Number,
    condition: Condition,
}
