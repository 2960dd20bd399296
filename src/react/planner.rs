//! 意图规划：判断本轮是单步还是多步，多步时给出有序步骤
//!
//! 规划失败（模型报错、输出无法解析）一律降级为单步，绝不向用户暴露。
//! 不含顺序连接词的请求在调用模型之前就被判为单步。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{HistoryMessage, Message};
use crate::react::decision::extract_json_block;
use crate::react::ContextMarkers;
use crate::tools::{plan_schema_json, ToolKind, ToolRegistry};

const SEQUENCING_WORDS: &[&str] = &["then", "afterwards", "next", "and", "also", "plus"];
const SEQUENCING_PHRASES: &[&str] = &["after that", "followed by"];

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub step_number: u32,
    /// 模型给出的工具名（可能不在目录内）
    pub tool: String,
    /// 目录内的工具；None 表示未知工具，执行时降级为文本说明
    pub kind: Option<ToolKind>,
    pub action: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub is_multi_step: bool,
    pub steps: Vec<PlanStep>,
    pub reasoning: String,
}

impl Plan {
    pub fn single(reasoning: impl Into<String>) -> Self {
        Self {
            is_multi_step: false,
            steps: Vec::new(),
            reasoning: reasoning.into(),
        }
    }
}

/// 请求中是否出现顺序连接词（按词匹配，大小写不敏感）
pub fn has_sequencing_language(text: &str) -> bool {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.iter().any(|w| SEQUENCING_WORDS.contains(w)) {
        return true;
    }
    let padded = format!(" {} ", words.join(" "));
    SEQUENCING_PHRASES
        .iter()
        .any(|p| padded.contains(&format!(" {p} ")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    #[serde(default, alias = "is_multi_step", alias = "multiStep")]
    is_multi_step: bool,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(default, alias = "step_number", alias = "step")]
    step_number: u32,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    action: String,
    #[serde(default, alias = "args", alias = "params")]
    parameters: Value,
}

/// 解析规划输出并做后校验；无法解析返回 PlanningParse
pub fn parse_plan(output: &str) -> Result<Plan, AgentError> {
    let json_str = extract_json_block(output)
        .ok_or_else(|| AgentError::PlanningParse("no JSON object in planner output".to_string()))?;
    let raw: RawPlan = serde_json::from_str(json_str)
        .map_err(|e| AgentError::PlanningParse(format!("{}: {}", e, json_str)))?;

    if !raw.is_multi_step {
        return Ok(Plan::single(raw.reasoning));
    }

    let mut steps: Vec<PlanStep> = raw
        .steps
        .into_iter()
        .map(|s| {
            let tool = s.tool.trim().to_string();
            PlanStep {
                step_number: s.step_number,
                kind: ToolKind::from_name(&tool),
                tool,
                action: s.action,
                parameters: if s.parameters.is_object() {
                    s.parameters
                } else {
                    Value::Object(Default::default())
                },
            }
        })
        .collect();

    steps.sort_by_key(|s| s.step_number);
    let has_duplicates = steps.windows(2).any(|w| w[0].step_number == w[1].step_number);
    if has_duplicates || steps.first().map(|s| s.step_number == 0).unwrap_or(false) {
        for (i, s) in steps.iter_mut().enumerate() {
            s.step_number = i as u32 + 1;
        }
    }

    let executable = steps
        .iter()
        .filter(|s| matches!(s.kind, Some(k) if k != ToolKind::RetryLastCommand))
        .count();
    if executable < 2 {
        return Ok(Plan::single(format!(
            "downgraded: only {executable} executable step(s). {}",
            raw.reasoning
        )));
    }

    Ok(Plan {
        is_multi_step: true,
        steps,
        reasoning: raw.reasoning,
    })
}

pub struct IntentPlanner {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
}

impl IntentPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self { llm, registry }
    }

    /// 共享 LLM 客户端的累计 token 用量
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn system_prompt(&self, markers: &ContextMarkers) -> String {
        format!(
            "You classify chat requests for a creative assistant.\n\
            Decide whether the request needs several tools run in order (multi-step) or is a single request.\n\
            Multi-step only when the user asks for two or more different things, usually joined by words like \
            \"then\" or \"and then\". A single media request is single-step, even when it names a provider.\n\n\
            ## Tools\n{}\n\n## Context\n{}\n\n\
            Reply with one JSON object matching this schema:\n{}\n\
            For single-step requests use {{\"isMultiStep\": false, \"steps\": [], \"reasoning\": \"...\"}}.",
            self.registry.compact_catalog(),
            markers.render(),
            plan_schema_json(),
        )
    }

    pub async fn plan(&self, text: &str, markers: &ContextMarkers) -> Plan {
        if !has_sequencing_language(text) {
            tracing::debug!("No sequencing language, single-step");
            return Plan::single("no sequencing language");
        }

        let messages = [
            Message::system(self.system_prompt(markers)),
            Message::user(text.to_string()),
        ];
        let output = match self.llm.complete(&messages).await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "Planner call failed, falling back to single-step");
                return Plan::single("planner unavailable");
            }
        };

        match parse_plan(&output) {
            Ok(plan) => {
                tracing::info!(
                    multi_step = plan.is_multi_step,
                    steps = plan.steps.len(),
                    "Plan ready"
                );
                plan
            }
            Err(e) => {
                tracing::warn!(error = %e, "Planner output unparseable, falling back to single-step");
                Plan::single("planner output unparseable")
            }
        }
    }

    /// 把一段对话压缩为简短摘要（历史压缩用）
    pub async fn summarize(&self, history: &[HistoryMessage]) -> Result<String, AgentError> {
        let transcript = history
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = [
            Message::system(
                "Summarize this chat in at most five short sentences. Keep names, preferences, \
                and what was generated. Reply with the summary only."
                    .to_string(),
            ),
            Message::user(transcript),
        ];
        let summary = self.llm.complete(&messages).await?;
        Ok(summary.trim().to_string())
    }
}
