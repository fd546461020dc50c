use std::io::{BufRead, BufReader};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use serde_json::{json, Value};
use tracing::{info, warn};
use url::Url;

use super::{ChatMessage, ChatProvider, ChatReply, LlmError, ProviderKind};
use crate::config::LlmSettings;

const PULL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking JSON POST with a fixed number of extra attempts on transport
/// errors. HTTP error statuses are returned to the caller, not retried.
#[derive(Debug, Clone)]
struct JsonPoster {
    client: Client,
    retries: u32,
    retry_delay: Duration,
}

impl JsonPoster {
    fn new(timeout: Duration, retries: u32, retry_delay: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(LlmError::ClientInit)?;
        Ok(Self {
            client,
            retries,
            retry_delay,
        })
    }

    fn post(
        &self,
        url: &str,
        payload: &Value,
        bearer: Option<&str>,
        description: &str,
    ) -> Result<(Response, u64), LlmError> {
        let attempts = self.retries + 1;
        let mut attempt = 1;
        loop {
            let mut request = self.client.post(url).json(payload);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let started = Instant::now();
            match request.send() {
                Ok(resp) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if attempt > 1 {
                        info!(description, attempt, elapsed_ms, "request succeeded after retry");
                    }
                    return Ok((resp, elapsed_ms));
                }
                Err(error) => {
                    warn!(
                        description,
                        attempt,
                        attempts,
                        timed_out = error.is_timeout(),
                        %error,
                        "request attempt failed"
                    );
                    if attempt >= attempts {
                        return Err(LlmError::Http {
                            description: description.to_string(),
                            attempts,
                            source: error,
                        });
                    }
                }
            }
            attempt += 1;
            thread::sleep(self.retry_delay);
        }
    }

    fn get_json(&self, url: &str, bearer: Option<&str>, description: &str) -> Result<Value, LlmError> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let resp = request.send().map_err(|source| LlmError::Http {
            description: description.to_string(),
            attempts: 1,
            source,
        })?;
        read_json_body(resp, description)
    }
}

fn read_json_body(resp: Response, description: &str) -> Result<Value, LlmError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(LlmError::Status {
            description: description.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    resp.json().map_err(|source| LlmError::Decode {
        description: description.to_string(),
        source,
    })
}

fn normalize_base_url(url: &str) -> Result<String, LlmError> {
    let trimmed = url.trim().trim_end_matches('/');
    Url::parse(trimmed).map_err(|source| LlmError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;
    Ok(trimmed.to_string())
}

pub struct OllamaProvider {
    base_url: String,
    model: String,
    poster: JsonPoster,
}

impl OllamaProvider {
    pub fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        Ok(Self {
            base_url: normalize_base_url(settings.url.as_str())?,
            model: settings.model.clone(),
            poster: JsonPoster::new(settings.timeout, settings.retries, settings.retry_delay)?,
        })
    }

    /// Asks the server to download `model` and returns the status lines it
    /// streamed back. Blocks until the server closes the stream.
    pub fn pull_model(&self, model: &str) -> Result<Vec<String>, LlmError> {
        let description = "Ollama pull";
        let client = Client::builder()
            .connect_timeout(PULL_CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .map_err(LlmError::ClientInit)?;
        let resp = client
            .post(format!("{}/api/pull", self.base_url))
            .json(&json!({ "model": model }))
            .send()
            .map_err(|source| LlmError::Http {
                description: description.to_string(),
                attempts: 1,
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                description: description.to_string(),
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }

        let mut statuses = Vec::new();
        for line in BufReader::new(resp).lines() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    warn!(%error, "pull stream interrupted");
                    break;
                }
            };
            if let Some(status) = pull_status_line(line.as_str()) {
                info!(model, status = %status, "pull progress");
                statuses.push(status);
            }
        }
        Ok(statuses)
    }
}

impl ChatProvider for OllamaProvider {
    fn model(&self) -> &str {
        self.model.as_str()
    }

    fn chat(&self, messages: &[ChatMessage]) -> Result<ChatReply, LlmError> {
        let description = "Ollama chat";
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        let (resp, latency_ms) = self.poster.post(
            format!("{}/api/chat", self.base_url).as_str(),
            &payload,
            None,
            description,
        )?;
        let status_code = resp.status().as_u16();
        let data = read_json_body(resp, description)?;
        let content = parse_ollama_reply(&data)?;
        info!(provider = "ollama", status_code, latency_ms, "model replied");

        Ok(ChatReply {
            content,
            meta: json!({
                "provider": ProviderKind::Ollama.as_str(),
                "model": self.model,
                "url": self.base_url,
                "status_code": status_code,
                "latency_ms": latency_ms,
                "eval_count": data.get("eval_count").cloned().unwrap_or(Value::Null),
                "eval_duration": data.get("eval_duration").cloned().unwrap_or(Value::Null),
            }),
        })
    }

    fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let data = self.poster.get_json(
            format!("{}/api/tags", self.base_url).as_str(),
            None,
            "Ollama model list",
        )?;
        Ok(names_from_list(&data, "models", "name"))
    }
}

pub struct OpenAiCompatProvider {
    base_url: String,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    poster: JsonPoster,
}

impl OpenAiCompatProvider {
    pub fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        let base_url = normalize_base_url(settings.url.as_str())?;
        Ok(Self {
            endpoint: chat_completions_endpoint(base_url.as_str()),
            base_url,
            model: settings.model.clone(),
            api_key: settings.api_key.clone().filter(|key| !key.is_empty()),
            poster: JsonPoster::new(settings.timeout, settings.retries, settings.retry_delay)?,
        })
    }
}

impl ChatProvider for OpenAiCompatProvider {
    fn model(&self) -> &str {
        self.model.as_str()
    }

    fn chat(&self, messages: &[ChatMessage]) -> Result<ChatReply, LlmError> {
        let description = "OpenAI-compatible chat";
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        let (resp, latency_ms) = self.poster.post(
            self.endpoint.as_str(),
            &payload,
            self.api_key.as_deref(),
            description,
        )?;
        let status_code = resp.status().as_u16();
        let data = read_json_body(resp, description)?;
        let content = parse_openai_reply(&data)?;
        info!(provider = "openai-compat", status_code, latency_ms, "model replied");

        Ok(ChatReply {
            content,
            meta: json!({
                "provider": ProviderKind::OpenaiCompat.as_str(),
                "model": self.model,
                "url": self.base_url,
                "status_code": status_code,
                "latency_ms": latency_ms,
                "usage": data.get("usage").cloned().unwrap_or(Value::Null),
            }),
        })
    }

    fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let data = self.poster.get_json(
            models_endpoint(self.endpoint.as_str()).as_str(),
            self.api_key.as_deref(),
            "OpenAI-compatible model list",
        )?;
        Ok(names_from_list(&data, "data", "id"))
    }
}

pub fn build_provider(settings: &LlmSettings) -> Result<Box<dyn ChatProvider>, LlmError> {
    Ok(match settings.provider {
        ProviderKind::Ollama => Box::new(OllamaProvider::new(settings)?),
        ProviderKind::OpenaiCompat => Box::new(OpenAiCompatProvider::new(settings)?),
    })
}

pub fn chat_completions_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1/chat/completions")
    }
}

pub fn models_endpoint(chat_endpoint: &str) -> String {
    let root = chat_endpoint
        .strip_suffix("/chat/completions")
        .unwrap_or(chat_endpoint);
    format!("{root}/models")
}

pub fn parse_ollama_reply(data: &Value) -> Result<String, LlmError> {
    data.pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(LlmError::MissingContent { provider: "ollama" })
}

pub fn parse_openai_reply(data: &Value) -> Result<String, LlmError> {
    data.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(LlmError::MissingContent {
            provider: "openai-compat",
        })
}

fn pull_status_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let data: Value = serde_json::from_str(trimmed).ok()?;
    data.get("status")
        .or_else(|| data.get("message"))
        .and_then(Value::as_str)
        .filter(|status| !status.is_empty())
        .map(str::to_string)
}

fn names_from_list(data: &Value, list_key: &str, name_key: &str) -> Vec<String> {
    data.get(list_key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get(name_key).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
