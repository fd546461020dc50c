pub mod http;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    #[default]
    Ollama,
    OpenaiCompat,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenaiCompat => "openai-compat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openai-compat" | "openai_compat" | "openai" | "lmstudio" => Some(Self::OpenaiCompat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A chat message in the shape both provider families accept: Ollama reads
/// plain `content` plus a side `images` list, OpenAI-style servers read a
/// list of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: MessageContent::Text(text.into()),
            images: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Text(text.into()),
            images: Vec::new(),
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            images,
            ..Self::user(text)
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Blocks(blocks),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub content: String,
    pub meta: Value,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http client init failed: {0}")]
    ClientInit(#[source] reqwest::Error),
    #[error("invalid endpoint url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{description} failed after {attempts} attempt(s): {source}")]
    Http {
        description: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("{description} returned HTTP {status}: {body}")]
    Status {
        description: String,
        status: u16,
        body: String,
    },
    #[error("{description} returned a body that is not valid JSON: {source}")]
    Decode {
        description: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} reply has no message content")]
    MissingContent { provider: &'static str },
}

pub trait ChatProvider: Send + Sync {
    fn model(&self) -> &str;

    fn chat(&self, messages: &[ChatMessage]) -> Result<ChatReply, LlmError>;

    fn list_models(&self) -> Result<Vec<String>, LlmError>;
}
