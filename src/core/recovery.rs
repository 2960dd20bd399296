//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供决策循环决定是重新提示、收尾还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// tool_names 用于在模型调用不存在的工具时提示可用工具列表
    pub fn handle(&self, err: &AgentError, tool_names: &[&str]) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output was not valid JSON: {raw}. \
                To call a tool, output exactly one JSON object and nothing else, \
                in the form {{\"tool\": \"tool_name\", \"args\": {{...}}}}. \
                To answer the user directly, reply with plain text and no JSON."
            )),
            AgentError::UnknownTool(name) => RecoveryAction::RetryWithPrompt(format!(
                "The tool '{name}' does not exist. Available tools: {}. \
                Pick one of them or answer in plain text.",
                tool_names.join(", ")
            )),
            AgentError::Cancelled => RecoveryAction::Abort,
            other => RecoveryAction::Finalize(other.user_message()),
        }
    }
}
