//! 引擎错误类型与恢复动作
//!
//! AgentError 覆盖一轮执行中可能出现的全部错误类别；与 RecoveryEngine 配合：
//! 决策循环根据 AgentError 决定 RetryWithPrompt / Finalize / Abort。

use thiserror::Error;

use crate::db::StoreError;
use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 输入缺失或格式错误，直接返回给用户，不重试
    #[error("Invalid input: {0}")]
    Validation(String),

    /// 超时 / 限流 / 5xx：在 Provider 链路耗尽后才会出现
    #[error("Temporary provider failure: {0}")]
    ProviderTransient(String),

    /// 策略拦截 / 内容非法：最后一个 Provider 仍失败时原样返回
    #[error("{0}")]
    ProviderTerminal(String),

    /// 规划输出无法解析；由 Planner 就地降级为单步，不向外暴露
    #[error("Planner output could not be parsed: {0}")]
    PlanningParse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 决策输出疑似 JSON 但解析失败
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Turn timed out after {0}s")]
    TurnTimeout(u64),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 渲染给聊天用户的简短文本（渠道是对话式的，不暴露内部结构）
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Validation(msg) => format!("I couldn't do that: {msg}"),
            AgentError::ProviderTransient(_) => {
                "The generation service is busy right now. Please try again in a moment.".to_string()
            }
            AgentError::ProviderTerminal(msg) => {
                format!("The request was rejected: {msg}. Try a different prompt.")
            }
            AgentError::TurnTimeout(_) => {
                "That took too long, here is what I have so far.".to_string()
            }
            AgentError::Cancelled => "The request was cancelled.".to_string(),
            _ => "Something went wrong while handling your request.".to_string(),
        }
    }
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        AgentError::Persistence(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让决策模型重试（如 JSON 格式错误、不存在的工具）
    RetryWithPrompt(String),
    /// 以已有结果收尾，附带一条给用户的说明
    Finalize(String),
    /// 终止当前轮
    Abort,
}
