use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::catalog::ClientInfo;
use crate::llm::ProviderKind;

pub const DEFAULT_SETTINGS_REL_PATH: &str = "config/host.settings.toml";
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_COMPAT_URL: &str = "http://localhost:1234";
pub const DEFAULT_MAX_VISION_WORKERS: usize = 4;

pub const ENV_LLM_PROVIDER: &str = "SHUTTER_LLM_PROVIDER";
pub const ENV_LLM_URL: &str = "SHUTTER_LLM_URL";
pub const ENV_LLM_MODEL: &str = "SHUTTER_LLM_MODEL";
pub const ENV_LLM_API_KEY: &str = "SHUTTER_LLM_API_KEY";
pub const ENV_RESPONSE_TIMEOUT: &str = "SHUTTER_RESPONSE_TIMEOUT_SECS";
pub const ENV_APPIMAGE: &str = "SHUTTER_APPIMAGE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read host settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse host settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse host settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("host settings root must be an object")]
    RootMustBeObject,
    #[error("host settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
    #[error("environment variable {key} has invalid value '{value}'")]
    InvalidEnv { key: String, value: String },
    #[error("invalid {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub command: Vec<String>,
    pub appimage_path: Option<PathBuf>,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    pub response_timeout: Duration,
}

impl WorkerSettings {
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub url: String,
    pub model: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionSettings {
    pub max_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSettings {
    pub log_dir: PathBuf,
    pub prompt_dir: PathBuf,
}

/// Built once at startup and passed down; nothing below `main` reads the
/// process environment for these values.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub app_root: PathBuf,
    pub worker: WorkerSettings,
    pub llm: LlmSettings,
    pub vision: VisionSettings,
    pub paths: PathSettings,
}

/// Every field optional; layers are merged field by field, the most
/// specific layer first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostSettingsOverlay {
    pub worker_command: Option<Vec<String>>,
    pub appimage_path: Option<String>,
    pub protocol_version: Option<String>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub response_timeout_secs: Option<f64>,
    pub llm_provider: Option<String>,
    pub llm_url: Option<String>,
    pub llm_model: Option<String>,
    pub llm_timeout_secs: Option<f64>,
    pub llm_retries: Option<u32>,
    pub llm_retry_delay_secs: Option<f64>,
    pub llm_api_key: Option<String>,
    pub vision_max_workers: Option<usize>,
    pub log_dir: Option<String>,
    pub prompt_dir: Option<String>,
}

pub fn default_app_root() -> PathBuf {
    std::env::var_os("SHUTTER_APP_ROOT")
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn process_env() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// defaults → settings file → `.env` → process environment → `cli`.
pub fn load_host_config(
    app_root: &Path,
    explicit_settings: Option<&str>,
    env: &HashMap<String, String>,
    cli: &HostSettingsOverlay,
) -> Result<HostConfig, ConfigError> {
    let file = load_host_settings(app_root, explicit_settings)?;
    let dotenv = load_dotenv(app_root.join(".env").as_path())?;
    let mut merged_env = dotenv;
    merged_env.extend(env.iter().map(|(key, value)| (key.clone(), value.clone())));
    let env_overlay = overlay_from_env(&merged_env)?;

    let merged = merge_host_settings_overlays(&file, &env_overlay, cli);
    HostConfig::from_overlay(app_root, &merged)
}

pub fn load_host_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<HostSettingsOverlay, ConfigError> {
    if let Some(path) = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| resolve_under_root(app_root, p))
    {
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.display().to_string(),
                message: String::from("file does not exist"),
            });
        }
        return load_overlay_by_extension(path.as_path());
    }

    let toml_path = app_root.join(DEFAULT_SETTINGS_REL_PATH);
    if toml_path.exists() {
        return load_overlay_by_extension(toml_path.as_path());
    }
    Ok(HostSettingsOverlay::default())
}

pub fn merge_host_settings_overlays(
    file: &HostSettingsOverlay,
    env: &HostSettingsOverlay,
    cli: &HostSettingsOverlay,
) -> HostSettingsOverlay {
    HostSettingsOverlay {
        worker_command: cli
            .worker_command
            .clone()
            .or_else(|| env.worker_command.clone())
            .or_else(|| file.worker_command.clone()),
        appimage_path: choose_string(
            cli.appimage_path.as_deref(),
            env.appimage_path.as_deref(),
            file.appimage_path.as_deref(),
        ),
        protocol_version: choose_string(
            cli.protocol_version.as_deref(),
            env.protocol_version.as_deref(),
            file.protocol_version.as_deref(),
        ),
        client_name: choose_string(
            cli.client_name.as_deref(),
            env.client_name.as_deref(),
            file.client_name.as_deref(),
        ),
        client_version: choose_string(
            cli.client_version.as_deref(),
            env.client_version.as_deref(),
            file.client_version.as_deref(),
        ),
        response_timeout_secs: cli
            .response_timeout_secs
            .or(env.response_timeout_secs)
            .or(file.response_timeout_secs),
        llm_provider: choose_string(
            cli.llm_provider.as_deref(),
            env.llm_provider.as_deref(),
            file.llm_provider.as_deref(),
        ),
        llm_url: choose_string(
            cli.llm_url.as_deref(),
            env.llm_url.as_deref(),
            file.llm_url.as_deref(),
        ),
        llm_model: choose_string(
            cli.llm_model.as_deref(),
            env.llm_model.as_deref(),
            file.llm_model.as_deref(),
        ),
        llm_timeout_secs: cli
            .llm_timeout_secs
            .or(env.llm_timeout_secs)
            .or(file.llm_timeout_secs),
        llm_retries: cli.llm_retries.or(env.llm_retries).or(file.llm_retries),
        llm_retry_delay_secs: cli
            .llm_retry_delay_secs
            .or(env.llm_retry_delay_secs)
            .or(file.llm_retry_delay_secs),
        llm_api_key: choose_string(
            cli.llm_api_key.as_deref(),
            env.llm_api_key.as_deref(),
            file.llm_api_key.as_deref(),
        ),
        vision_max_workers: cli
            .vision_max_workers
            .or(env.vision_max_workers)
            .or(file.vision_max_workers),
        log_dir: choose_string(
            cli.log_dir.as_deref(),
            env.log_dir.as_deref(),
            file.log_dir.as_deref(),
        ),
        prompt_dir: choose_string(
            cli.prompt_dir.as_deref(),
            env.prompt_dir.as_deref(),
            file.prompt_dir.as_deref(),
        ),
    }
}

impl HostConfig {
    pub fn from_overlay(app_root: &Path, overlay: &HostSettingsOverlay) -> Result<Self, ConfigError> {
        let command = overlay.worker_command.clone().unwrap_or_else(|| {
            vec![
                String::from("lua"),
                app_root
                    .join("server")
                    .join("dt_mcp_server.lua")
                    .display()
                    .to_string(),
            ]
        });
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: String::from("worker.command"),
                message: String::from("must name a program"),
            });
        }

        let provider = match overlay.llm_provider.as_deref() {
            Some(raw) => ProviderKind::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
                field: String::from("llm.provider"),
                message: format!("unknown provider '{raw}' (expected ollama or openai-compat)"),
            })?,
            None => ProviderKind::default(),
        };
        let url = overlay.llm_url.clone().unwrap_or_else(|| {
            match provider {
                ProviderKind::Ollama => DEFAULT_OLLAMA_URL,
                ProviderKind::OpenaiCompat => DEFAULT_OPENAI_COMPAT_URL,
            }
            .to_string()
        });
        Url::parse(url.as_str()).map_err(|error| ConfigError::InvalidValue {
            field: String::from("llm.url"),
            message: error.to_string(),
        })?;

        let max_workers = overlay
            .vision_max_workers
            .unwrap_or(DEFAULT_MAX_VISION_WORKERS);
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("vision.max_workers"),
                message: String::from("must be at least 1"),
            });
        }

        Ok(Self {
            app_root: app_root.to_path_buf(),
            worker: WorkerSettings {
                command,
                appimage_path: overlay
                    .appimage_path
                    .as_deref()
                    .map(|path| resolve_under_root(app_root, PathBuf::from(path))),
                protocol_version: overlay
                    .protocol_version
                    .clone()
                    .unwrap_or_else(|| String::from(DEFAULT_PROTOCOL_VERSION)),
                client_name: overlay
                    .client_name
                    .clone()
                    .unwrap_or_else(|| String::from("shutter-host")),
                client_version: overlay
                    .client_version
                    .clone()
                    .unwrap_or_else(|| String::from(env!("CARGO_PKG_VERSION"))),
                response_timeout: seconds(
                    "worker.response_timeout_secs",
                    overlay.response_timeout_secs,
                    30.0,
                )?,
            },
            llm: LlmSettings {
                provider,
                url,
                model: overlay.llm_model.clone().unwrap_or_default(),
                timeout: seconds("llm.timeout_secs", overlay.llm_timeout_secs, 60.0)?,
                retries: overlay.llm_retries.unwrap_or(2),
                retry_delay: non_negative_seconds(
                    "llm.retry_delay_secs",
                    overlay.llm_retry_delay_secs,
                    2.0,
                )?,
                api_key: overlay.llm_api_key.clone().filter(|key| !key.is_empty()),
            },
            vision: VisionSettings { max_workers },
            paths: PathSettings {
                log_dir: overlay
                    .log_dir
                    .as_deref()
                    .map(|path| resolve_under_root(app_root, PathBuf::from(path)))
                    .unwrap_or_else(|| app_root.join("logs")),
                prompt_dir: overlay
                    .prompt_dir
                    .as_deref()
                    .map(|path| resolve_under_root(app_root, PathBuf::from(path)))
                    .unwrap_or_else(|| app_root.join("config").join("prompts")),
            },
        })
    }
}

pub fn parse_host_settings_overlay_json(value: &Value) -> Result<HostSettingsOverlay, ConfigError> {
    let root = value.as_object().ok_or(ConfigError::RootMustBeObject)?;
    let mut out = HostSettingsOverlay::default();

    if let Some(worker) = section(root, "worker")? {
        if let Some(v) = worker.get("command") {
            out.worker_command = Some(parse_string_array(v, "worker.command")?);
        }
        if let Some(v) = worker.get("appimage_path") {
            out.appimage_path = Some(parse_string(v, "worker.appimage_path")?);
        }
        if let Some(v) = worker.get("protocol_version") {
            out.protocol_version = Some(parse_string(v, "worker.protocol_version")?);
        }
        if let Some(v) = worker.get("client_name") {
            out.client_name = Some(parse_string(v, "worker.client_name")?);
        }
        if let Some(v) = worker.get("client_version") {
            out.client_version = Some(parse_string(v, "worker.client_version")?);
        }
        if let Some(v) = worker.get("response_timeout_secs") {
            out.response_timeout_secs = Some(parse_f64(v, "worker.response_timeout_secs")?);
        }
    }
    if let Some(llm) = section(root, "llm")? {
        if let Some(v) = llm.get("provider") {
            out.llm_provider = Some(parse_string(v, "llm.provider")?);
        }
        if let Some(v) = llm.get("url") {
            out.llm_url = Some(parse_string(v, "llm.url")?);
        }
        if let Some(v) = llm.get("model") {
            out.llm_model = Some(parse_string(v, "llm.model")?);
        }
        if let Some(v) = llm.get("timeout_secs") {
            out.llm_timeout_secs = Some(parse_f64(v, "llm.timeout_secs")?);
        }
        if let Some(v) = llm.get("retries") {
            out.llm_retries = Some(parse_u32(v, "llm.retries")?);
        }
        if let Some(v) = llm.get("retry_delay_secs") {
            out.llm_retry_delay_secs = Some(parse_f64(v, "llm.retry_delay_secs")?);
        }
        if let Some(v) = llm.get("api_key") {
            out.llm_api_key = Some(parse_string(v, "llm.api_key")?);
        }
    }
    if let Some(vision) = section(root, "vision")? {
        if let Some(v) = vision.get("max_workers") {
            out.vision_max_workers = Some(parse_u32(v, "vision.max_workers")? as usize);
        }
    }
    if let Some(paths) = section(root, "paths")? {
        if let Some(v) = paths.get("log_dir") {
            out.log_dir = Some(parse_string(v, "paths.log_dir")?);
        }
        if let Some(v) = paths.get("prompt_dir") {
            out.prompt_dir = Some(parse_string(v, "paths.prompt_dir")?);
        }
    }
    Ok(out)
}

pub fn overlay_from_env(env: &HashMap<String, String>) -> Result<HostSettingsOverlay, ConfigError> {
    let get = |key: &str| {
        env.get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let response_timeout_secs = match get(ENV_RESPONSE_TIMEOUT) {
        Some(raw) => Some(raw.parse::<f64>().map_err(|_| ConfigError::InvalidEnv {
            key: String::from(ENV_RESPONSE_TIMEOUT),
            value: raw.clone(),
        })?),
        None => None,
    };

    Ok(HostSettingsOverlay {
        appimage_path: get(ENV_APPIMAGE),
        response_timeout_secs,
        llm_provider: get(ENV_LLM_PROVIDER),
        llm_url: get(ENV_LLM_URL),
        llm_model: get(ENV_LLM_MODEL),
        llm_api_key: get(ENV_LLM_API_KEY),
        ..HostSettingsOverlay::default()
    })
}

pub fn load_dotenv(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path).map_err(|error| ConfigError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    Ok(parse_dotenv_content(raw.as_str()))
}

pub fn parse_dotenv_content(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in raw.lines() {
        let mut value = line.trim();
        if value.is_empty() || value.starts_with('#') {
            continue;
        }
        if let Some(rest) = value.strip_prefix("export ") {
            value = rest.trim_start();
        }
        let Some((key_raw, value_raw)) = value.split_once('=') else {
            continue;
        };
        let key = key_raw.trim();
        if key.is_empty() {
            continue;
        }
        let mut parsed = value_raw.trim().to_string();
        if parsed.len() >= 2
            && ((parsed.starts_with('"') && parsed.ends_with('"'))
                || (parsed.starts_with('\'') && parsed.ends_with('\'')))
        {
            parsed = parsed[1..parsed.len() - 1].to_string();
        } else if let Some((before_comment, _)) = parsed.split_once(" #") {
            parsed = before_comment.trim_end().to_string();
        }
        out.insert(key.to_string(), parsed);
    }
    out
}

fn load_overlay_by_extension(path: &Path) -> Result<HostSettingsOverlay, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|error| ConfigError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let is_json = path
        .extension()
        .and_then(|v| v.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str::<Value>(raw.as_str()).map_err(|error| ConfigError::ParseJson {
            path: path.display().to_string(),
            message: error.to_string(),
        })?
    } else {
        let value = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
            ConfigError::ParseToml {
                path: path.display().to_string(),
                message: error.to_string(),
            }
        })?;
        serde_json::to_value(value).map_err(|error| ConfigError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?
    };
    parse_host_settings_overlay_json(&parsed)
}

fn resolve_under_root(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn seconds(field: &str, value: Option<f64>, default: f64) -> Result<Duration, ConfigError> {
    let secs = value.unwrap_or(default);
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: String::from("must be a positive number of seconds"),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn non_negative_seconds(
    field: &str,
    value: Option<f64>,
    default: f64,
) -> Result<Duration, ConfigError> {
    let secs = value.unwrap_or(default);
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: String::from("must be a non-negative number of seconds"),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn section<'a>(
    root: &'a serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<&'a serde_json::Map<String, Value>>, ConfigError> {
    match root.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_object()
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidFieldType {
                field: name.to_string(),
            }),
    }
}

fn choose_string(a: Option<&str>, b: Option<&str>, c: Option<&str>) -> Option<String> {
    a.or(b).or(c).map(str::to_string)
}

fn parse_string(value: &Value, field: &str) -> Result<String, ConfigError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| ConfigError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(ConfigError::InvalidFieldType {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}

fn parse_string_array(value: &Value, field: &str) -> Result<Vec<String>, ConfigError> {
    let arr = value
        .as_array()
        .ok_or_else(|| ConfigError::InvalidFieldType {
            field: field.to_string(),
        })?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(parse_string(item, field)?);
    }
    Ok(out)
}

fn parse_f64(value: &Value, field: &str) -> Result<f64, ConfigError> {
    value.as_f64().ok_or_else(|| ConfigError::InvalidFieldType {
        field: field.to_string(),
    })
}

fn parse_u32(value: &Value, field: &str) -> Result<u32, ConfigError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ConfigError::InvalidFieldType {
            field: field.to_string(),
        })
}
