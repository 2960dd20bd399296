//! retry_last_command：把「再试一次」解析为具体的重执行目标
//!
//! 读取会话的 lastCommand（上一轮为多步时读取逐步轨迹），可选地换 Provider 或只重做部分步骤。

use serde_json::Value;

use crate::memory::LastCommand;
use crate::tools::ToolKind;

pub const NOTHING_TO_RETRY: &str =
    "There's nothing to retry yet. Tell me what you'd like me to make and I'll get started!";
pub const NO_MATCHING_STEP: &str =
    "I couldn't find that step in your last request. Which part should I redo?";

/// retry_last_command 的参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryRequest {
    pub provider: Option<String>,
    pub step_numbers: Vec<u32>,
    pub tools: Vec<String>,
}

impl RetryRequest {
    pub fn from_args(args: &Value) -> Self {
        let provider = args
            .get("provider")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let step_numbers = args
            .get("step_numbers")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| {
                        v.as_u64()
                            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                            .map(|n| n as u32)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let tools = args
            .get("tools")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            provider,
            step_numbers,
            tools,
        }
    }

    fn has_filter(&self) -> bool {
        !self.step_numbers.is_empty() || !self.tools.is_empty()
    }

    fn matches(&self, step_number: Option<u32>, kind: ToolKind) -> bool {
        step_number
            .map(|n| self.step_numbers.contains(&n))
            .unwrap_or(false)
            || self.tools.iter().any(|t| t == kind.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryTarget {
    /// 来自多步轨迹时的原步骤编号
    pub step_number: Option<u32>,
    pub kind: ToolKind,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryPlan {
    /// 无可重试内容，附带给用户的说明
    Nothing(String),
    Targets(Vec<RetryTarget>),
}

pub fn plan_retry(last: Option<&LastCommand>, req: &RetryRequest) -> RetryPlan {
    let Some(last) = last else {
        return RetryPlan::Nothing(NOTHING_TO_RETRY.to_string());
    };

    let mut targets: Vec<RetryTarget> = if last.steps.is_empty() {
        let single = RetryTarget {
            step_number: None,
            kind: last.tool,
            args: last.arguments.clone(),
        };
        if req.has_filter() && !req.matches(Some(1), last.tool) {
            return RetryPlan::Nothing(NO_MATCHING_STEP.to_string());
        }
        vec![single]
    } else {
        let steps = last.steps.iter();
        let selected: Vec<_> = if req.has_filter() {
            steps.filter(|s| req.matches(Some(s.step_number), s.tool)).collect()
        } else if last.steps.iter().any(|s| !s.success) {
            steps.filter(|s| !s.success).collect()
        } else {
            steps.collect()
        };
        if selected.is_empty() {
            return RetryPlan::Nothing(NO_MATCHING_STEP.to_string());
        }
        let mut selected: Vec<RetryTarget> = selected
            .into_iter()
            .map(|s| RetryTarget {
                step_number: Some(s.step_number),
                kind: s.tool,
                args: s.arguments.clone(),
            })
            .collect();
        selected.sort_by_key(|t| t.step_number);
        selected
    };

    if let Some(provider) = &req.provider {
        for t in targets.iter_mut().filter(|t| t.kind.generation().is_some()) {
            if let Some(obj) = t.args.as_object_mut() {
                obj.insert("provider".to_string(), Value::String(provider.clone()));
            }
        }
    }
    RetryPlan::Targets(targets)
}
