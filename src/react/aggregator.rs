//! 结果聚合：把一轮中的工具调用记录汇总为交给渠道适配层的 AgentResult
//!
//! 有工具调用时，至少一次成功即视为整体成功；多步模式下失败步骤只出现在部分成功摘要里。

use serde::Serialize;
use serde_json::Value;

use crate::providers::Attempt;
use crate::tools::{MediaRef, ToolKind, ToolResult};

/// 一次工具调用的记录
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    #[serde(skip)]
    pub kind: Option<ToolKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    pub arguments: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
}

impl ToolCallRecord {
    pub fn succeeded(kind: ToolKind, step_number: Option<u32>, arguments: Value, result: ToolResult) -> Self {
        Self {
            tool: kind.name().to_string(),
            kind: Some(kind),
            step_number,
            arguments,
            success: true,
            attempts: result.attempts.clone(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(
        tool: impl Into<String>,
        kind: Option<ToolKind>,
        step_number: Option<u32>,
        arguments: Value,
        error: impl Into<String>,
        attempts: Vec<Attempt>,
    ) -> Self {
        Self {
            tool: tool.into(),
            kind,
            step_number,
            arguments,
            success: false,
            result: None,
            error: Some(error.into()),
            attempts,
        }
    }

    /// 持久化 lastCommand 用的结果：失败时构造一个只含错误的结果
    pub fn result_or_failure(&self) -> ToolResult {
        match &self.result {
            Some(r) => r.clone(),
            None => ToolResult::failure(self.error.clone().unwrap_or_default())
                .with_attempts(self.attempts.clone()),
        }
    }

    fn text(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.text.as_deref())
            .filter(|t| !t.trim().is_empty())
    }
}

/// 一轮执行的最终结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentResult {
    pub success: bool,
    pub tool_calls: Vec<ToolCallRecord>,
    pub final_text: String,
    pub media: Vec<MediaRef>,
    pub multi_step: bool,
    pub iterations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timed_out: bool,
    pub cancelled: bool,
    /// 本轮在任务台账中的记录
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// 本轮是重试时，被重试命令的原始提示词
    #[serde(skip)]
    pub retried_prompt: Option<String>,
}

#[derive(Debug, Default)]
pub struct ResultAggregator {
    pub(crate) multi_step: bool,
    records: Vec<ToolCallRecord>,
    notes: Vec<String>,
    final_text: Option<String>,
    error: Option<String>,
    pub(crate) iterations: usize,
    pub(crate) timed_out: bool,
    pub(crate) cancelled: bool,
    pub(crate) retried_prompt: Option<String>,
}

impl ResultAggregator {
    pub fn new(multi_step: bool) -> Self {
        Self {
            multi_step,
            ..Default::default()
        }
    }

    pub fn push_record(&mut self, record: ToolCallRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ToolCallRecord] {
        &self.records
    }

    /// 附加说明（迭代上限、超时、跳过的步骤等），拼在最终文本之后
    pub fn push_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn set_final_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.final_text = Some(text.trim().to_string());
        }
    }

    pub fn has_final_text(&self) -> bool {
        self.final_text.is_some()
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn finish(self) -> AgentResult {
        let any_success = self.records.iter().any(|r| r.success);
        let success = if self.records.is_empty() {
            self.final_text.is_some() && self.error.is_none()
        } else {
            any_success
        };

        let media: Vec<MediaRef> = self
            .records
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.result.as_ref())
            .flat_map(|r| r.media.iter().cloned())
            .collect();

        let final_text = if self.multi_step {
            self.multi_step_text()
        } else {
            self.single_step_text()
        };

        // 整体成功时不向用户暴露内部错误
        let error = if success { None } else { self.error };

        AgentResult {
            success,
            tool_calls: self.records,
            final_text,
            media,
            multi_step: self.multi_step,
            iterations: self.iterations,
            error,
            timed_out: self.timed_out,
            cancelled: self.cancelled,
            task_id: None,
            retried_prompt: self.retried_prompt,
        }
    }

    fn single_step_text(&self) -> String {
        let base = self
            .final_text
            .clone()
            .or_else(|| {
                self.records
                    .iter()
                    .rev()
                    .filter(|r| r.success)
                    .find_map(|r| r.text().map(str::to_string))
            })
            .or_else(|| self.error.clone())
            .unwrap_or_default();
        join_nonempty(std::iter::once(base).chain(self.notes.iter().cloned()))
    }

    fn multi_step_text(&self) -> String {
        let mut parts: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.text().map(str::to_string))
            .collect();
        if let Some(t) = &self.final_text {
            parts.push(t.clone());
        }

        let failed: Vec<&ToolCallRecord> = self.records.iter().filter(|r| !r.success).collect();
        if !failed.is_empty() || !self.notes.is_empty() {
            let done = self.records.iter().filter(|r| r.success).count();
            let total = self.records.len();
            let mut summary = format!("Completed {done} of {total} steps.");
            for r in failed {
                let label = r
                    .step_number
                    .map(|n| format!("Step {n} ({})", r.tool))
                    .unwrap_or_else(|| r.tool.clone());
                summary.push_str(&format!(
                    "\n{label} failed: {}",
                    r.error.as_deref().unwrap_or("unknown error")
                ));
            }
            parts.push(summary);
        }
        parts.extend(self.notes.iter().cloned());
        join_nonempty(parts)
    }
}

fn join_nonempty(parts: impl IntoIterator<Item = String>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::MediaKind;
    use serde_json::json;

    fn image_ok(url: &str) -> ToolResult {
        let mut r = ToolResult::text_ok("here is your image");
        r.media.push(MediaRef {
            kind: MediaKind::Image,
            url: url.into(),
        });
        r.provider = Some("gemini".into());
        r
    }

    #[test]
    fn test_partial_success_summary() {
        let mut agg = ResultAggregator::new(true);
        agg.push_record(ToolCallRecord::succeeded(
            ToolKind::CreateImage,
            Some(1),
            json!({}),
            image_ok("https://cdn/1.png"),
        ));
        agg.push_record(ToolCallRecord::failed(
            "create_video",
            Some(ToolKind::CreateVideo),
            Some(2),
            json!({}),
            "blocked by policy",
            vec![],
        ));
        agg.push_record(ToolCallRecord::succeeded(
            ToolKind::SearchWeb,
            Some(3),
            json!({}),
            ToolResult::text_ok("Rust 1.80 was released"),
        ));
        agg.set_error("step 2 failed");
        let result = agg.finish();

        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.media.len(), 1);
        assert!(result.final_text.contains("Rust 1.80 was released"));
        assert!(result.final_text.contains("Completed 2 of 3 steps."));
        assert!(result.final_text.contains("Step 2 (create_video) failed: blocked by policy"));
    }

    #[test]
    fn test_single_step_text_fallbacks() {
        let mut agg = ResultAggregator::new(false);
        agg.push_record(ToolCallRecord::succeeded(
            ToolKind::SearchWeb,
            None,
            json!({}),
            ToolResult::text_ok("42"),
        ));
        agg.push_note("I stopped after 8 steps.");
        let result = agg.finish();
        assert_eq!(result.final_text, "42\n\nI stopped after 8 steps.");

        let mut failed = ResultAggregator::new(false);
        failed.push_record(ToolCallRecord::failed(
            "create_image",
            Some(ToolKind::CreateImage),
            None,
            json!({}),
            "busy",
            vec![],
        ));
        failed.set_error("The generation service is busy right now.");
        let result = failed.finish();
        assert!(!result.success);
        assert_eq!(result.final_text, "The generation service is busy right now.");
        assert!(result.error.is_some());
    }

    #[test]
    fn test_text_only_turn() {
        let mut agg = ResultAggregator::new(false);
        agg.set_final_text("Hello!");
        let result = agg.finish();
        assert!(result.success);
        assert!(result.tool_calls.is_empty());

        assert!(!ResultAggregator::new(false).finish().success);
    }
}
