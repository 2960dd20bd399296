//! 决策函数：给定工具目录与当前上下文，模型要么调用一个工具，要么直接给出最终文本
//!
//! 输出约定：工具调用为 `{"tool": "...", "args": {...}}`（可包在 ```json 代码块里），其余一律视为最终回答。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::ContextMarkers;
use crate::tools::{tool_call_schema_json, ToolRegistry};

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// 直接回复用户
    Final(String),
    Call(ToolCall),
}

/// 从模型输出中截取 JSON 片段：```json 代码块优先，其次是第一个 `{` 到最后一个 `}`
pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析决策输出
///
/// 没有 JSON 或 JSON 里不含 `"tool"` 字段时是最终文本；含 `"tool"` 却无法解析时返回 JsonParseError，
/// 交给恢复引擎重新提示。
pub fn parse_decision(output: &str) -> Result<Decision, AgentError> {
    let trimmed = output.trim();
    let Some(json_str) = extract_json_block(trimmed) else {
        return Ok(Decision::Final(trimmed.to_string()));
    };
    if !json_str.contains("\"tool\"") {
        return Ok(Decision::Final(trimmed.to_string()));
    }

    let mut call: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    if call.tool.trim().is_empty() {
        return Ok(Decision::Final(trimmed.to_string()));
    }
    call.tool = call.tool.trim().to_string();
    if call.args.is_null() {
        call.args = Value::Object(Default::default());
    }
    Ok(Decision::Call(call))
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Genie, a creative assistant inside a chat app. \
You can generate images, videos, music and voice messages, translate, search the web, send locations and create polls. \
Answer in the user's language. Keep replies short: this is a chat, not an essay.";

/// 决策器：持有 LLM、工具目录与基础 system prompt
pub struct DecisionMaker {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    system_prompt: String,
}

impl DecisionMaker {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            registry,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 本轮的 system：基础提示词 + 工具目录 + 输出格式 + 长期记忆 + 上下文标记
    pub fn build_system(&self, long_term: Option<&str>, markers: &ContextMarkers) -> String {
        let mut system = format!(
            "{}\n\n## Tools\n{}\n\n## Output format\n\
            To call a tool, reply with exactly one JSON object matching this schema and nothing else:\n{}\n\
            Call at most one tool per reply. Only set \"provider\" when the user named one.\n\
            When you are done, reply with plain text (no JSON).",
            self.system_prompt,
            self.registry.to_schema_json(),
            tool_call_schema_json(),
        );
        if let Some(block) = long_term {
            system.push_str("\n\n## Memory\n");
            system.push_str(block);
        }
        system.push_str("\n\n## Context\n");
        system.push_str(&markers.render());
        system
    }

    pub async fn decide(&self, system: &str, messages: &[Message]) -> Result<Decision, AgentError> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(Message::system(system.to_string()));
        full.extend_from_slice(messages);
        let output = self.llm.complete(&full).await?;
        tracing::debug!(output_len = output.len(), "Decision model replied");
        parse_decision(&output)
    }
}
