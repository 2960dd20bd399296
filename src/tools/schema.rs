//! 模型输出格式的 JSON Schema（schemars 生成）
//!
//! 拼入 system prompt，约束决策模型的工具调用格式与规划器的计划格式，减少格式错误。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用格式：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须来自工具目录
    pub tool: String,
    /// 工具参数，依工具不同而不同
    pub args: HashMap<String, Value>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
#[serde(rename_all = "camelCase")]
struct PlanFormat {
    pub is_multi_step: bool,
    pub steps: Vec<PlanStepFormat>,
    pub reasoning: String,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
#[serde(rename_all = "camelCase")]
struct PlanStepFormat {
    /// 从 1 开始，按执行顺序递增
    pub step_number: u32,
    pub tool: String,
    /// 一句话说明该步做什么
    pub action: String,
    pub parameters: HashMap<String, Value>,
}

pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
