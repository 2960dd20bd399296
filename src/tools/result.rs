//! 工具结果信封
//!
//! 所有工具（Provider 生成、本地投票、历史查询）的输出统一为 `ToolResult`，
//! 再由结果聚合器汇总为 `AgentResult` 交给渠道适配层。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::{Attempt, FallbackOutcome, GenerationKind, ProviderOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }

    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Image => "png",
            MediaKind::Video => "mp4",
            MediaKind::Audio => "mp3",
        }
    }

    /// 由 MIME 类型推断（image/png -> Image）
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.split('/').next()? {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

/// 待投递的媒体引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
    /// Provider 原始响应；只在进程内流转，不序列化、不持久化
    #[serde(skip)]
    pub raw: Option<Value>,
}

impl ToolResult {
    pub fn text_ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<Attempt>) -> Self {
        self.attempts = attempts;
        self
    }

    /// 由回退链的成功结果构造
    pub fn from_provider(kind: GenerationKind, outcome: FallbackOutcome<ProviderOutput>) -> Self {
        let FallbackOutcome {
            provider,
            output,
            attempts,
        } = outcome;
        let media = match (kind.media_kind(), output.media_url) {
            (Some(media_kind), Some(url)) => vec![MediaRef {
                kind: media_kind,
                url,
            }],
            _ => Vec::new(),
        };
        Self {
            success: true,
            media,
            text: output.text,
            provider: Some(provider),
            cost: output.cost,
            data: output.data,
            error: None,
            attempts,
            raw: output.raw,
        }
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    /// 喂回决策模型的观察文本
    pub fn observation(&self) -> String {
        if !self.success {
            return format!(
                "Tool failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            );
        }
        let mut parts = Vec::new();
        for m in &self.media {
            parts.push(format!("{} delivered: {}", m.kind.as_str(), m.url));
        }
        if let Some(text) = &self.text {
            parts.push(text.clone());
        }
        if let Some(data) = &self.data {
            parts.push(data.to_string());
        }
        if parts.is_empty() {
            "Done.".to_string()
        } else {
            parts.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::AttemptOutcome;

    #[test]
    fn test_from_provider_maps_media_kind() {
        let outcome = FallbackOutcome {
            provider: "veo".to_string(),
            output: ProviderOutput::media("https://x/v.mp4").with_text("a cat video"),
            attempts: vec![Attempt {
                provider: "veo".into(),
                outcome: AttemptOutcome::Success,
                class: None,
                error: None,
                elapsed_ms: 3,
            }],
        };
        let r = ToolResult::from_provider(GenerationKind::TextToVideo, outcome);
        assert!(r.success);
        assert_eq!(r.media, vec![MediaRef { kind: MediaKind::Video, url: "https://x/v.mp4".into() }]);
        assert_eq!(r.provider.as_deref(), Some("veo"));
        assert!(r.observation().contains("video delivered"));
    }

    #[test]
    fn test_failure_observation() {
        let r = ToolResult::failure("boom");
        assert_eq!(r.observation(), "Tool failed: boom");
        assert_eq!(MediaKind::from_mime("audio/ogg"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_mime("text/plain"), None);
    }
}
