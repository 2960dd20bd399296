//! 执行过程事件：供渠道适配层展示进度（如「正在生成图片…」）

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 规划完成
    PlanReady {
        multi_step: bool,
        steps: usize,
        reasoning: String,
    },
    /// 迭代计数更新
    StepUpdate { iteration: usize, max_iterations: usize },
    /// 正在调用决策模型
    Thinking,
    ToolCall {
        tool: String,
        step_number: Option<u32>,
        args: serde_json::Value,
    },
    /// 工具返回（预览）
    Observation { tool: String, preview: String },
    ToolFailure { tool: String, reason: String },
    /// 恢复动作（RetryWithPrompt / Finalize / Abort）
    Recovery { action: String, detail: String },
    Finalized { success: bool, preview: String },
}

/// 通道关闭或未提供时静默丢弃
pub fn send_event(tx: Option<&UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
