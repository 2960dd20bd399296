//! 本地投票工具：不调用任何 Provider，只校验并构造投票内容，由渠道适配层发送

use serde::Serialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::ToolResult;

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Poll {
    pub question: String,
    pub options: Vec<String>,
    pub allow_multiple: bool,
}

impl Poll {
    /// 解析并校验：问题非空；选项去空白后非空、去重（忽略大小写）、数量 2..=12
    pub fn from_args(args: &Value) -> Result<Self, AgentError> {
        let question = args
            .get("question")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| AgentError::Validation("poll question is empty".to_string()))?
            .to_string();

        let raw_options = args
            .get("options")
            .and_then(Value::as_array)
            .ok_or_else(|| AgentError::Validation("poll options must be a list".to_string()))?;

        let mut options: Vec<String> = Vec::with_capacity(raw_options.len());
        for opt in raw_options {
            let text = match opt {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if text.is_empty() {
                continue;
            }
            if options.iter().any(|o| o.eq_ignore_ascii_case(&text)) {
                return Err(AgentError::Validation(format!("duplicate poll option '{text}'")));
            }
            options.push(text);
        }

        if options.len() < MIN_OPTIONS || options.len() > MAX_OPTIONS {
            return Err(AgentError::Validation(format!(
                "a poll needs between {MIN_OPTIONS} and {MAX_OPTIONS} options, got {}",
                options.len()
            )));
        }

        Ok(Self {
            question,
            options,
            allow_multiple: args
                .get("allow_multiple")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn into_result(self) -> ToolResult {
        let text = format!("Poll: {} ({})", self.question, self.options.join(" / "));
        let mut result = ToolResult::text_ok(text);
        result.data = serde_json::to_value(&self).ok().map(|poll| serde_json::json!({ "poll": poll }));
        result
    }
}
