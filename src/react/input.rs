//! 渠道适配层交给引擎的规范化输入
//!
//! 附带媒体或引用消息的请求是「自包含」的：工具参数直接取自附件 / 引用，不再读取会话历史。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::LastCommand;
use crate::tools::{MediaKind, ToolKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMedia {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// 用户回复（引用）的那条消息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotedMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<InboundMedia>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedInput {
    pub text: String,
    #[serde(default)]
    pub media: Vec<InboundMedia>,
    #[serde(default)]
    pub quoted: Option<QuotedMessage>,
}

impl NormalizedInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_media(mut self, kind: MediaKind, url: impl Into<String>) -> Self {
        self.media.push(InboundMedia {
            kind,
            url: url.into(),
            mime: None,
        });
        self
    }

    pub fn with_quoted(mut self, quoted: QuotedMessage) -> Self {
        self.quoted = Some(quoted);
        self
    }

    pub fn is_self_contained(&self) -> bool {
        !self.media.is_empty() || self.quoted.is_some()
    }

    /// 指定类型的输入媒体：先取附件，再取引用消息里的媒体
    pub fn media_of(&self, kind: MediaKind) -> Option<&InboundMedia> {
        self.media
            .iter()
            .find(|m| m.kind == kind)
            .or_else(|| {
                self.quoted
                    .as_ref()
                    .and_then(|q| q.media.as_ref())
                    .filter(|m| m.kind == kind)
            })
    }

    /// 工具需要输入媒体且参数里没有时，用附件 / 引用媒体填充 input_url
    pub fn fill_media_args(&self, kind: ToolKind, args: &mut Value) {
        let Some(expected) = kind.input_media() else {
            return;
        };
        let present = args
            .get("input_url")
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if present {
            return;
        }
        if let (Some(media), Some(obj)) = (self.media_of(expected), args.as_object_mut()) {
            obj.insert("input_url".to_string(), Value::String(media.url.clone()));
        }
    }

    /// 发给决策模型的用户消息：原文加上附件与引用说明
    pub fn render_for_model(&self) -> String {
        let mut out = self.text.trim().to_string();
        for m in &self.media {
            out.push_str(&format!("\n[Attached {}]", m.kind.as_str()));
        }
        if let Some(q) = &self.quoted {
            if let Some(t) = q.text.as_deref().filter(|t| !t.trim().is_empty()) {
                out.push_str(&format!("\n[Quoted message]: {}", t.trim()));
            }
            if let Some(m) = &q.media {
                out.push_str(&format!("\n[Quoted {}]", m.kind.as_str()));
            }
        }
        out
    }

    pub fn context_markers(&self, last_command: Option<&LastCommand>) -> ContextMarkers {
        ContextMarkers {
            attached: self.media.iter().map(|m| m.kind).collect(),
            quoted_media: self
                .quoted
                .as_ref()
                .and_then(|q| q.media.as_ref())
                .map(|m| m.kind),
            quoted_text: self
                .quoted
                .as_ref()
                .and_then(|q| q.text.as_ref())
                .map(|t| !t.trim().is_empty())
                .unwrap_or(false),
            last_tool: last_command.map(|c| c.tool),
        }
    }
}

/// 规划与决策提示词中的上下文标记
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextMarkers {
    pub attached: Vec<MediaKind>,
    pub quoted_media: Option<MediaKind>,
    pub quoted_text: bool,
    pub last_tool: Option<ToolKind>,
}

impl ContextMarkers {
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if !self.attached.is_empty() {
            let kinds: Vec<&str> = self.attached.iter().map(|k| k.as_str()).collect();
            lines.push(format!("- attached media: {}", kinds.join(", ")));
        }
        if let Some(k) = self.quoted_media {
            lines.push(format!("- quoted media: {}", k.as_str()));
        }
        if self.quoted_text {
            lines.push("- the user is replying to a quoted message".to_string());
        }
        if let Some(t) = self.last_tool {
            lines.push(format!("- previous command: {}", t.name()));
        }
        if lines.is_empty() {
            "- none".to_string()
        } else {
            lines.join("\n")
        }
    }
}
