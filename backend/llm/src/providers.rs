//! Remote model providers and how to talk to them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Endpoint value that selects the on-device model.
pub const LOCAL_ENDPOINT: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Local,
    OpenAi,
    DeepSeek,
    Moonshot,
    Doubao,
    Qianwen,
    Ollama,
}

impl ApiType {
    /// Detect the API flavour from an endpoint URL.
    pub fn detect(endpoint: &str) -> Self {
        if endpoint.eq_ignore_ascii_case(LOCAL_ENDPOINT) {
            ApiType::Local
        } else if endpoint.contains("ollama") || endpoint.contains("localhost") {
            ApiType::Ollama
        } else if endpoint.contains("deepseek") {
            ApiType::DeepSeek
        } else if endpoint.contains("moonshot") {
            ApiType::Moonshot
        } else if endpoint.contains("volces") || endpoint.contains("ark") {
            ApiType::Doubao
        } else if endpoint.contains("dashscope") || endpoint.contains("aliyun") {
            ApiType::Qianwen
        } else {
            ApiType::OpenAi
        }
    }

    /// Path appended to a base URL, `None` for the local model.
    pub fn endpoint_path(&self) -> Option<&'static str> {
        match self {
            ApiType::Local => None,
            ApiType::OpenAi | ApiType::DeepSeek | ApiType::Moonshot => {
                Some("/v1/chat/completions")
            }
            ApiType::Doubao => Some("/api/completion"),
            ApiType::Qianwen => Some("/v1/services/aigc/text-generation/generation"),
            ApiType::Ollama => Some("/api/generate"),
        }
    }

    /// Ollama takes a raw prompt, everything else a chat message list.
    pub fn uses_chat_messages(&self) -> bool {
        !matches!(self, ApiType::Ollama | ApiType::Local)
    }

    /// Complete a base URL with this API's endpoint path.
    pub fn full_api_url(&self, base_url: &str) -> String {
        let Some(path) = self.endpoint_path() else {
            return LOCAL_ENDPOINT.to_string();
        };
        let url = base_url.strip_suffix('/').unwrap_or(base_url);
        if url.contains(path) {
            url.to_string()
        } else {
            format!("{}{}", url, path)
        }
    }

    /// Streaming request body for `prompt`.
    ///
    /// Chat APIs get the prompt split at its first blank line into a system
    /// and a user message.
    pub fn request_body(&self, model: &str, prompt: &str) -> Value {
        let mut body = json!({
            "model": model,
            "stream": true,
        });

        if self.uses_chat_messages() {
            let (system, user) = split_system_prompt(prompt);
            let mut messages = Vec::new();
            if !system.is_empty() {
                messages.push(json!({ "role": "system", "content": system }));
            }
            messages.push(json!({ "role": "user", "content": user }));
            body["messages"] = Value::Array(messages);
        } else {
            body["prompt"] = Value::String(prompt.to_string());
        }

        if matches!(self, ApiType::Doubao | ApiType::Qianwen) {
            body["temperature"] = json!(0.7);
        }

        body
    }
}

/// Split a prompt at its first blank line. Both halves are trimmed; without a
/// blank line the whole prompt is the user part.
pub fn split_system_prompt(prompt: &str) -> (&str, &str) {
    match prompt.split_once("\n\n") {
        Some((system, user)) => (system.trim(), user.trim()),
        None => ("", prompt),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub api_type: ApiType,
    pub display_name: String,
    pub default_base_url: String,
    pub suggested_models: Vec<String>,
}

impl ProviderInfo {
    fn new(api_type: ApiType, display_name: &str, base_url: &str, models: &[&str]) -> Self {
        Self {
            api_type,
            display_name: display_name.to_string(),
            default_base_url: base_url.to_string(),
            suggested_models: models.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Known providers, in display order.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<ProviderInfo>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderInfo::new(ApiType::Local, "Local model", LOCAL_ENDPOINT, &[]),
                ProviderInfo::new(
                    ApiType::DeepSeek,
                    "DeepSeek",
                    "https://api.deepseek.com",
                    &["deepseek-chat", "deepseek-reasoner"],
                ),
                ProviderInfo::new(
                    ApiType::Moonshot,
                    "Moonshot",
                    "https://api.moonshot.cn/v1",
                    &["moonshot-v1-8k", "moonshot-v1-32k"],
                ),
                ProviderInfo::new(
                    ApiType::Qianwen,
                    "Qianwen",
                    "https://dashscope.aliyuncs.com/compatible-mode/v1",
                    &["qwen-turbo", "qwen-plus"],
                ),
                ProviderInfo::new(
                    ApiType::Doubao,
                    "Doubao",
                    "https://ark.cn-beijing.volces.com/api/v3",
                    &["doubao-pro-32k"],
                ),
                ProviderInfo::new(
                    ApiType::Ollama,
                    "Ollama",
                    "http://localhost:11434",
                    &["llama3", "qwen2.5"],
                ),
                ProviderInfo::new(
                    ApiType::OpenAi,
                    "OpenAI",
                    "https://api.openai.com",
                    &["gpt-4o-mini", "gpt-4o"],
                ),
            ],
        }
    }
}

impl ProviderRegistry {
    pub fn providers(&self) -> &[ProviderInfo] {
        &self.providers
    }

    pub fn get(&self, api_type: ApiType) -> Option<&ProviderInfo> {
        self.providers.iter().find(|p| p.api_type == api_type)
    }

    /// Display name of whoever serves `endpoint`.
    pub fn display_name(&self, endpoint: &str) -> String {
        let api_type = ApiType::detect(endpoint);
        self.get(api_type)
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| format!("{:?}", api_type))
    }
}
