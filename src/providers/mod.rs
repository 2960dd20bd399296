//! 生成 Provider 抽象与注册表
//!
//! 每个外部生成服务（图片、视频、音乐、语音、翻译、搜索……）实现 `Provider`；
//! `FallbackCoordinator` 按链路顺序调用它们并在失败时自动切换。

pub mod classifier;
pub mod fallback;
pub mod http;
pub mod scripted;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::MediaKind;

pub use classifier::{DefaultClassifier, FailureClass, FailureClassifier};
pub use fallback::{
    invoke_with_fallback, Attempt, AttemptOutcome, FallbackCoordinator, FallbackError,
    FallbackOutcome,
};
pub use http::HttpProvider;
pub use scripted::ScriptedProvider;

/// 生成能力类型（即 Provider 链路的 key）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationKind {
    TextToImage,
    ImageEdit,
    TextToVideo,
    ImageToVideo,
    VideoEdit,
    TextToMusic,
    TextToSpeech,
    Transcription,
    SpeechToSong,
    Translation,
    Search,
    Location,
}

/// 超时等级：交互类几十秒，媒体类数分钟
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationClass {
    Interactive,
    Media,
}

impl GenerationKind {
    pub const ALL: [GenerationKind; 12] = [
        GenerationKind::TextToImage,
        GenerationKind::ImageEdit,
        GenerationKind::TextToVideo,
        GenerationKind::ImageToVideo,
        GenerationKind::VideoEdit,
        GenerationKind::TextToMusic,
        GenerationKind::TextToSpeech,
        GenerationKind::Transcription,
        GenerationKind::SpeechToSong,
        GenerationKind::Translation,
        GenerationKind::Search,
        GenerationKind::Location,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::TextToImage => "text-to-image",
            GenerationKind::ImageEdit => "image-edit",
            GenerationKind::TextToVideo => "text-to-video",
            GenerationKind::ImageToVideo => "image-to-video",
            GenerationKind::VideoEdit => "video-edit",
            GenerationKind::TextToMusic => "text-to-music",
            GenerationKind::TextToSpeech => "text-to-speech",
            GenerationKind::Transcription => "transcription",
            GenerationKind::SpeechToSong => "speech-to-song",
            GenerationKind::Translation => "translation",
            GenerationKind::Search => "search",
            GenerationKind::Location => "location",
        }
    }

    /// 解析 kebab-case 名称，兼容 HTTP 接口里的简写（translate / music / image）
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "translate" => return Some(GenerationKind::Translation),
            "music" => return Some(GenerationKind::TextToMusic),
            "image" => return Some(GenerationKind::TextToImage),
            "video" => return Some(GenerationKind::TextToVideo),
            "speech" | "tts" => return Some(GenerationKind::TextToSpeech),
            _ => {}
        }
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn class(&self) -> GenerationClass {
        match self {
            GenerationKind::TextToSpeech
            | GenerationKind::Transcription
            | GenerationKind::Translation
            | GenerationKind::Search
            | GenerationKind::Location => GenerationClass::Interactive,
            _ => GenerationClass::Media,
        }
    }

    /// 该能力产出的媒体类型；纯文本能力返回 None
    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            GenerationKind::TextToImage | GenerationKind::ImageEdit => Some(MediaKind::Image),
            GenerationKind::TextToVideo | GenerationKind::ImageToVideo | GenerationKind::VideoEdit => {
                Some(MediaKind::Video)
            }
            GenerationKind::TextToMusic
            | GenerationKind::TextToSpeech
            | GenerationKind::SpeechToSong => Some(MediaKind::Audio),
            GenerationKind::Transcription
            | GenerationKind::Translation
            | GenerationKind::Search
            | GenerationKind::Location => None,
        }
    }
}

impl std::fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider 单次调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("blocked by content policy: {0}")]
    PolicyBlocked(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// 按 HTTP 状态码归类
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 504 => ProviderError::Timeout { elapsed_ms: 0 },
            429 => ProviderError::RateLimited(message),
            500..=599 => ProviderError::Server { status, message },
            400 | 413 | 415 | 422 => ProviderError::InvalidInput(message),
            451 => ProviderError::PolicyBlocked(message),
            _ => ProviderError::Other(format!("HTTP {status}: {message}")),
        }
    }
}

/// Provider 成功返回的内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutput {
    pub media_url: Option<String>,
    pub text: Option<String>,
    pub cost: Option<f64>,
    /// 结构化附加数据（如位置坐标）
    pub data: Option<Value>,
    /// 原始响应，只用于调试，不会被持久化
    #[serde(skip)]
    pub raw: Option<Value>,
}

impl ProviderOutput {
    pub fn media(url: impl Into<String>) -> Self {
        Self {
            media_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// 外部生成服务
#[async_trait]
pub trait Provider: Send + Sync {
    /// 小写名称，用于链路配置与结果标注
    fn name(&self) -> &str;

    fn supports(&self, kind: GenerationKind) -> bool;

    async fn generate(
        &self,
        kind: GenerationKind,
        params: &Value,
    ) -> Result<ProviderOutput, ProviderError>;
}

/// Provider 注册表：名称（小写）-> 实例
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_lowercase();
        tracing::debug!(provider = %name, "Registered provider");
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(&name.to_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&name.to_lowercase())
    }

    /// 支持某能力的 Provider 名称（按名称排序，作为未配置链路时的默认顺序）
    pub fn supporting(&self, kind: GenerationKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .iter()
            .filter(|(_, p)| p.supports(kind))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
