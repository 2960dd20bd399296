//! lastCommand：最近一次可持久化的工具调用（供「再试一次」使用）
//!
//! 持久化前必须经过白名单清洗：结果只保留 success / media_urls / text / provider / error，
//! 参数丢弃 history、input_path 以及体积过大的非标量值。Provider 原始响应与调试信息永不落库。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::{ToolKind, ToolResult};

/// 文本字段截断长度（字符）
pub const MAX_TEXT_CHARS: usize = 500;
/// 非标量参数的体积上限（序列化后字节数）
pub const MAX_ARG_BYTES: usize = 2048;

const DROPPED_ARGS: &[&str] = &["history", "input_path"];

/// 清洗后的结果（白名单字段）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SanitizedResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 多步计划中某一步的轨迹（用于按步骤重试）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_number: u32,
    pub tool: ToolKind,
    pub arguments: Value,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastCommand {
    pub tool: ToolKind,
    pub arguments: Value,
    pub result: SanitizedResult,
    /// 触发该命令的用户原文
    pub prompt: String,
    /// 上一轮为多步时的逐步轨迹
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepTrace>,
    pub saved_at: DateTime<Utc>,
}

impl LastCommand {
    /// 由一次工具调用构造；不可持久化的工具返回 None
    pub fn from_result(
        tool: ToolKind,
        arguments: &Value,
        result: &ToolResult,
        prompt: &str,
    ) -> Option<Self> {
        if !tool.is_persistable() {
            return None;
        }
        Some(Self {
            tool,
            arguments: sanitize_args(arguments),
            result: sanitize_result(result),
            prompt: truncate(prompt),
            steps: Vec::new(),
            saved_at: Utc::now(),
        })
    }

    pub fn with_steps(mut self, steps: Vec<StepTrace>) -> Self {
        self.steps = steps
            .into_iter()
            .map(|s| StepTrace {
                arguments: sanitize_args(&s.arguments),
                ..s
            })
            .collect();
        self
    }

    /// 重新套用清洗规则；存储层在落库前调用，手工构造的值也不会绕过白名单
    pub fn sanitized(&self) -> Self {
        Self {
            tool: self.tool,
            arguments: sanitize_args(&self.arguments),
            result: SanitizedResult {
                success: self.result.success,
                media_urls: self.result.media_urls.clone(),
                text: self.result.text.as_deref().map(truncate),
                provider: self.result.provider.clone(),
                error: self.result.error.as_deref().map(truncate),
            },
            prompt: truncate(&self.prompt),
            saved_at: self.saved_at,
            steps: Vec::new(),
        }
        .with_steps(self.steps.clone())
    }
}

pub fn sanitize_result(result: &ToolResult) -> SanitizedResult {
    SanitizedResult {
        success: result.success,
        media_urls: result.media.iter().map(|m| m.url.clone()).collect(),
        text: result.text.as_deref().map(truncate),
        provider: result.provider.clone(),
        error: result.error.as_deref().map(truncate),
    }
}

pub fn sanitize_args(args: &Value) -> Value {
    let Some(obj) = args.as_object() else {
        return Value::Object(Map::new());
    };
    let mut out = Map::new();
    for (k, v) in obj {
        if DROPPED_ARGS.contains(&k.as_str()) {
            continue;
        }
        let cleaned = match v {
            Value::String(s) => Value::String(truncate(s)),
            Value::Array(_) | Value::Object(_) => {
                if v.to_string().len() > MAX_ARG_BYTES {
                    continue;
                }
                v.clone()
            }
            other => other.clone(),
        };
        out.insert(k.clone(), cleaned);
    }
    Value::Object(out)
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_TEXT_CHARS {
        s.chars().take(MAX_TEXT_CHARS).collect()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{MediaKind, MediaRef};
    use serde_json::json;

    #[test]
    fn test_sanitize_result_keeps_only_allow_list() {
        let mut result = ToolResult::text_ok("x".repeat(900));
        result.media.push(MediaRef {
            kind: MediaKind::Image,
            url: "https://cdn/a.png".into(),
        });
        result.provider = Some("gemini".into());
        result.cost = Some(0.04);
        result.data = Some(json!({"debug": "trace"}));
        result.raw = Some(json!({"base64": "AAAA"}));

        let cmd = LastCommand::from_result(ToolKind::CreateImage, &json!({"prompt": "a"}), &result, "draw")
            .unwrap();
        let persisted = serde_json::to_value(&cmd.result).unwrap();
        let keys: Vec<&String> = persisted.as_object().unwrap().keys().collect();
        for k in &keys {
            assert!(["success", "media_urls", "text", "provider", "error"].contains(&k.as_str()));
        }
        assert_eq!(cmd.result.text.as_ref().unwrap().chars().count(), MAX_TEXT_CHARS);
        assert_eq!(cmd.result.media_urls, vec!["https://cdn/a.png"]);
    }

    #[test]
    fn test_sanitize_args_drops_history_and_large_values() {
        let big: Vec<String> = (0..500).map(|i| format!("item-{i}")).collect();
        let args = json!({
            "prompt": "cat",
            "history": [{"role": "user", "content": "x"}],
            "input_path": "/tmp/upload.png",
            "options": big,
            "duration": 5
        });
        let cleaned = sanitize_args(&args);
        assert_eq!(cleaned, json!({"prompt": "cat", "duration": 5}));
    }

    #[test]
    fn test_ephemeral_tools_never_become_last_command() {
        let r = ToolResult::text_ok("history");
        assert!(LastCommand::from_result(ToolKind::GetChatHistory, &json!({}), &r, "what did I say").is_none());
        assert!(LastCommand::from_result(ToolKind::RetryLastCommand, &json!({}), &r, "again").is_none());
    }
}
