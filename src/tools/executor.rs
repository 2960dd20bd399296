//! 工具执行器
//!
//! 校验参数后按工具类型分派：生成类工具走 Provider 回退链，投票与历史查询在本地完成。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::core::AgentError;
use crate::memory::HistoryMessage;
use crate::providers::{Attempt, FallbackCoordinator};
use crate::tools::{Poll, ToolKind, ToolRegistry, ToolResult};

/// 单次调用的上下文（只读）
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// 最近的会话历史，供 get_chat_history 使用
    pub history: Vec<HistoryMessage>,
}

/// 工具失败：错误分类与（若调用过 Provider）回退轨迹
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub error: AgentError,
    pub attempts: Vec<Attempt>,
}

impl From<AgentError> for ToolFailure {
    fn from(error: AgentError) -> Self {
        Self {
            error,
            attempts: Vec::new(),
        }
    }
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    coordinator: Arc<FallbackCoordinator>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, coordinator: Arc<FallbackCoordinator>) -> Self {
        Self {
            registry,
            coordinator,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &FallbackCoordinator {
        &self.coordinator
    }

    pub async fn execute(
        &self,
        kind: ToolKind,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolFailure> {
        let start = Instant::now();
        let result = self.dispatch(kind, args, ctx).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(f) => match f.error {
                AgentError::Validation(_) => (false, "invalid"),
                AgentError::ProviderTransient(_) => (false, "exhausted"),
                _ => (false, "error"),
            },
        };
        let provider = match &result {
            Ok(r) => r.provider.clone(),
            Err(_) => None,
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": kind.name(),
            "ok": ok,
            "outcome": outcome,
            "provider": provider,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    async fn dispatch(
        &self,
        kind: ToolKind,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolFailure> {
        self.registry.validate(kind, args)?;

        match kind {
            ToolKind::CreatePoll => Ok(Poll::from_args(args)?.into_result()),
            ToolKind::GetChatHistory => {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|l| l as usize)
                    .unwrap_or(ctx.history.len());
                Ok(chat_history_result(&ctx.history, limit))
            }
            ToolKind::RetryLastCommand => Err(AgentError::Validation(
                "retry_last_command is resolved by the agent loop".to_string(),
            )
            .into()),
            _ => {
                let Some(generation) = kind.generation() else {
                    return Err(AgentError::UnknownTool(kind.name().to_string()).into());
                };
                let requested = args.get("provider").and_then(Value::as_str);
                let mut params = args.clone();
                if let Some(obj) = params.as_object_mut() {
                    obj.remove("provider");
                }
                match self.coordinator.invoke(generation, &params, requested).await {
                    Ok(outcome) => Ok(ToolResult::from_provider(generation, outcome)),
                    Err(e) => {
                        let attempts = e.attempts.clone();
                        Err(ToolFailure {
                            error: e.into_agent_error(),
                            attempts,
                        })
                    }
                }
            }
        }
    }
}

fn chat_history_result(history: &[HistoryMessage], limit: usize) -> ToolResult {
    if history.is_empty() {
        return ToolResult::text_ok("No earlier messages in this conversation.");
    }
    let start = history.len().saturating_sub(limit);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect();
    ToolResult::text_ok(lines.join("\n"))
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use crate::providers::{GenerationKind, ProviderError, ProviderRegistry, ScriptedProvider};
    use serde_json::json;

    fn executor(reg: ProviderRegistry, chain: &[&str]) -> ToolExecutor {
        let coordinator =
            FallbackCoordinator::new(Arc::new(reg)).with_chain(GenerationKind::TextToImage, chain);
        ToolExecutor::new(Arc::new(ToolRegistry::new()), Arc::new(coordinator))
    }

    #[tokio::test]
    async fn test_generation_strips_provider_and_reports_label() {
        let provider = Arc::new(ScriptedProvider::new("gemini"));
        let mut reg = ProviderRegistry::new();
        reg.register(provider.clone());
        let exec = executor(reg, &["gemini"]);

        let result = exec
            .execute(
                ToolKind::CreateImage,
                &json!({"prompt": "sunset", "provider": "gemini"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.provider.as_deref(), Some("gemini"));
        assert!(result.has_media());
        let (_, params) = &provider.calls()[0];
        assert!(params.get("provider").is_none());
        assert_eq!(params["prompt"], "sunset");
    }

    #[tokio::test]
    async fn test_validation_failure_skips_providers() {
        let provider = Arc::new(ScriptedProvider::new("gemini"));
        let mut reg = ProviderRegistry::new();
        reg.register(provider.clone());
        let exec = executor(reg, &["gemini"]);

        let err = exec
            .execute(ToolKind::CreateImage, &json!({}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err.error, AgentError::Validation(_)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_chain_keeps_attempts() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(
            ScriptedProvider::new("a").failing_with(ProviderError::RateLimited("busy".into())),
        ));
        reg.register(Arc::new(
            ScriptedProvider::new("b").failing_with(ProviderError::Timeout { elapsed_ms: 1 }),
        ));
        let exec = executor(reg, &["a", "b"]);
        let err = exec
            .execute(ToolKind::CreateImage, &json!({"prompt": "x"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err.error, AgentError::ProviderTransient(_)));
        assert_eq!(err.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_local_tools() {
        let exec = executor(ProviderRegistry::new(), &[]);
        let ctx = ToolContext {
            history: vec![
                HistoryMessage::new(Role::User, "hi"),
                HistoryMessage::new(Role::Assistant, "hello"),
                HistoryMessage::new(Role::User, "draw a cat"),
            ],
        };
        let history = exec
            .execute(ToolKind::GetChatHistory, &json!({"limit": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(history.text.as_deref(), Some("assistant: hello\nuser: draw a cat"));

        let poll = exec
            .execute(
                ToolKind::CreatePoll,
                &json!({"question": "Pizza?", "options": ["yes", "no"]}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(poll.data.is_some());
    }
}
