//! 执行循环
//!
//! Planning -> 单步（决策函数反复选择工具或给出最终文本）/ 多步（按 stepNumber 升序逐步执行）-> Finalizing。
//! 迭代次数有上限，超过上限、整轮超时或被取消时都以已有的部分结果收尾，而不是报错。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSection;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::{ConversationStore, HistoryMessage, LastCommand, LongTermMemory, Message};
use crate::react::events::preview;
use crate::react::{
    history_limit_for, inject_history, plan_retry, send_event, AgentEvent, AgentResult,
    ContextMarkers, Decision, DecisionMaker, IntentPlanner, NormalizedInput, ResultAggregator,
    RetryPlan, RetryRequest, ToolCallRecord,
};
use crate::tools::{ToolContext, ToolExecutor, ToolKind, ToolRegistry, ToolResult};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_iterations: usize,
    pub multi_step_max_iterations: usize,
    pub turn_timeout: Duration,
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&AgentSection::default())
    }
}

impl From<&AgentSection> for EngineSettings {
    fn from(section: &AgentSection) -> Self {
        Self {
            max_iterations: section.max_iterations,
            multi_step_max_iterations: section.multi_step_max_iterations,
            turn_timeout: Duration::from_secs(section.turn_timeout_secs),
            history_limit: section.history_limit,
        }
    }
}

/// 单轮执行选项
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// 覆盖默认迭代上限（单步 8 / 多步 10）
    pub max_iterations: Option<usize>,
    pub last_command: Option<LastCommand>,
    pub long_term: Option<LongTermMemory>,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<UnboundedSender<AgentEvent>>,
}

/// 一轮执行中的可变状态；超时后仍可从中取出部分结果
pub(super) struct Turn<'a> {
    pub(super) input: &'a NormalizedInput,
    pub(super) conversation_id: &'a str,
    pub(super) opts: &'a ExecuteOptions,
    pub(super) agg: ResultAggregator,
    history: Option<Vec<HistoryMessage>>,
}

impl Turn<'_> {
    pub(super) fn events(&self) -> Option<&UnboundedSender<AgentEvent>> {
        self.opts.event_tx.as_ref()
    }
}

/// 单步模式下一次工具调用之后的走向
enum Next {
    /// 媒体已产出，本轮结束
    Delivered,
    /// 观察结果喂回决策函数
    Observe(String),
    /// 以已有结果收尾
    Finish,
}

enum Ending {
    Completed,
    TimedOut,
    Cancelled,
}

pub struct AgentEngine {
    pub(super) planner: IntentPlanner,
    pub(super) decider: DecisionMaker,
    pub(super) executor: Arc<ToolExecutor>,
    pub(super) store: Arc<dyn ConversationStore>,
    pub(super) recovery: RecoveryEngine,
    pub(super) settings: EngineSettings,
}

impl AgentEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        store: Arc<dyn ConversationStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            planner: IntentPlanner::new(Arc::clone(&llm), Arc::clone(&registry)),
            decider: DecisionMaker::new(llm, registry),
            executor,
            store,
            recovery: RecoveryEngine::new(),
            settings,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.decider = self.decider.with_system_prompt(prompt);
        self
    }

    pub fn planner(&self) -> &IntentPlanner {
        &self.planner
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(super) fn registry(&self) -> &ToolRegistry {
        self.decider.registry()
    }

    /// 执行一轮请求；从不返回错误，失败体现在 AgentResult.success / error 中
    pub async fn execute(
        &self,
        input: &NormalizedInput,
        conversation_id: &str,
        opts: ExecuteOptions,
    ) -> AgentResult {
        let (init_prompt, init_completion, _) = self.planner.token_usage();
        let mut turn = Turn {
            input,
            conversation_id,
            opts: &opts,
            agg: ResultAggregator::new(false),
            history: None,
        };

        let ending = tokio::select! {
            r = tokio::time::timeout(self.settings.turn_timeout, self.run(&mut turn)) => {
                if r.is_ok() { Ending::Completed } else { Ending::TimedOut }
            }
            _ = opts.cancel_token.cancelled() => Ending::Cancelled,
        };

        let mut agg = turn.agg;
        match ending {
            Ending::Completed => {}
            Ending::TimedOut => {
                let err = AgentError::TurnTimeout(self.settings.turn_timeout.as_secs());
                tracing::warn!(conversation_id = %conversation_id, error = %err, "Turn timed out, finalizing with partial results");
                agg.timed_out = true;
                if agg.records().is_empty() && !agg.has_final_text() {
                    agg.set_error(err.user_message());
                } else {
                    agg.push_note(err.user_message());
                }
            }
            Ending::Cancelled => agg.cancelled = true,
        }
        if agg.cancelled {
            tracing::info!(conversation_id = %conversation_id, "Turn cancelled");
            if agg.records().is_empty() && !agg.has_final_text() {
                agg.set_error(AgentError::Cancelled.user_message());
            }
        }

        let result = agg.finish();
        let (cur_prompt, cur_completion, _) = self.planner.token_usage();
        tracing::info!(
            conversation_id = %conversation_id,
            success = result.success,
            multi_step = result.multi_step,
            tool_calls = result.tool_calls.len(),
            iterations = result.iterations,
            prompt_tokens = cur_prompt.saturating_sub(init_prompt),
            completion_tokens = cur_completion.saturating_sub(init_completion),
            "Turn finalized"
        );
        send_event(
            opts.event_tx.as_ref(),
            AgentEvent::Finalized {
                success: result.success,
                preview: preview(&result.final_text, OBSERVATION_PREVIEW_CHARS),
            },
        );
        result
    }

    async fn run(&self, turn: &mut Turn<'_>) {
        let markers = turn.input.context_markers(turn.opts.last_command.as_ref());
        let plan = self.planner.plan(&turn.input.text, &markers).await;
        send_event(
            turn.events(),
            AgentEvent::PlanReady {
                multi_step: plan.is_multi_step,
                steps: plan.steps.len(),
                reasoning: plan.reasoning.clone(),
            },
        );

        let max_iterations = turn.opts.max_iterations.unwrap_or(if plan.is_multi_step {
            self.settings.multi_step_max_iterations
        } else {
            self.settings.max_iterations
        });

        if plan.is_multi_step {
            turn.agg.multi_step = true;
            self.run_multi_step(turn, &plan, max_iterations).await;
        } else {
            self.run_single_step(turn, &markers, max_iterations).await;
        }
    }

    async fn run_single_step(&self, turn: &mut Turn<'_>, markers: &ContextMarkers, max_iterations: usize) {
        let long_term = turn.opts.long_term.as_ref().and_then(|m| m.prompt_block());
        let system = self.decider.build_system(long_term.as_deref(), markers);
        let tool_names = self.registry().tool_names();
        let mut messages = vec![Message::user(turn.input.render_for_model())];

        loop {
            if turn.opts.cancel_token.is_cancelled() {
                turn.agg.cancelled = true;
                return;
            }
            if turn.agg.iterations >= max_iterations {
                tracing::warn!(max_iterations, "Iteration limit reached, finalizing with partial output");
                turn.agg
                    .push_note(format!("I stopped after {max_iterations} steps; here is what I have so far."));
                return;
            }
            turn.agg.iterations += 1;
            send_event(
                turn.events(),
                AgentEvent::StepUpdate {
                    iteration: turn.agg.iterations,
                    max_iterations,
                },
            );
            send_event(turn.events(), AgentEvent::Thinking);

            let decision = match self.decider.decide(&system, &messages).await {
                Ok(d) => d,
                Err(e) => match self.recovery.handle(&e, &tool_names) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        send_event(
                            turn.events(),
                            AgentEvent::Recovery {
                                action: "RetryWithPrompt".to_string(),
                                detail: preview(&prompt, OBSERVATION_PREVIEW_CHARS),
                            },
                        );
                        messages.push(Message::user(prompt));
                        continue;
                    }
                    RecoveryAction::Finalize(msg) => {
                        tracing::warn!(error = %e, "Decision failed, finalizing");
                        send_event(
                            turn.events(),
                            AgentEvent::Recovery {
                                action: "Finalize".to_string(),
                                detail: e.to_string(),
                            },
                        );
                        turn.agg.set_error(msg);
                        return;
                    }
                    RecoveryAction::Abort => {
                        turn.agg.cancelled = true;
                        return;
                    }
                },
            };

            let call = match decision {
                Decision::Final(text) => {
                    turn.agg.set_final_text(text);
                    return;
                }
                Decision::Call(call) => call,
            };

            let call_json = serde_json::to_string(&call).unwrap_or_else(|_| call.tool.clone());
            messages.push(Message::assistant(call_json));

            let kind = ToolKind::from_name(&call.tool).filter(|k| self.registry().contains(*k));
            let Some(kind) = kind else {
                tracing::warn!(tool = %call.tool, "Model requested unknown tool");
                let err = AgentError::UnknownTool(call.tool.clone());
                send_event(
                    turn.events(),
                    AgentEvent::ToolFailure {
                        tool: call.tool.clone(),
                        reason: err.to_string(),
                    },
                );
                if let RecoveryAction::RetryWithPrompt(prompt) = self.recovery.handle(&err, &tool_names) {
                    messages.push(Message::user(prompt));
                }
                continue;
            };

            match self.dispatch(turn, kind, call.args).await {
                Next::Delivered | Next::Finish => return,
                Next::Observe(observation) => {
                    messages.push(Message::user(format!(
                        "Observation from {}: {}",
                        kind.name(),
                        observation
                    )));
                }
            }
        }
    }

    /// 单步模式的工具分派；retry_last_command 在这里展开为对原命令的重执行
    async fn dispatch(&self, turn: &mut Turn<'_>, kind: ToolKind, args: Value) -> Next {
        if kind == ToolKind::RetryLastCommand {
            return self.retry_last_command(turn, &args).await;
        }

        match self.invoke_tool(turn, kind, args, None, false).await {
            Ok(result) if result.has_media() => Next::Delivered,
            Ok(result) => Next::Observe(result.observation()),
            Err(AgentError::Validation(msg)) => Next::Observe(format!("Tool failed: {msg}")),
            Err(e) => {
                turn.agg.set_error(e.user_message());
                Next::Finish
            }
        }
    }

    async fn retry_last_command(&self, turn: &mut Turn<'_>, args: &Value) -> Next {
        let req = RetryRequest::from_args(args);
        let last = turn.opts.last_command.as_ref();
        match plan_retry(last, &req) {
            RetryPlan::Nothing(text) => {
                tracing::info!("Nothing to retry");
                turn.agg.set_final_text(text);
            }
            RetryPlan::Targets(targets) => {
                tracing::info!(targets = targets.len(), provider = ?req.provider, "Retrying last command");
                turn.agg.retried_prompt = last.map(|c| c.prompt.clone());
                if targets.len() > 1 || targets.iter().any(|t| t.step_number.is_some()) {
                    turn.agg.multi_step = true;
                }
                let mut last_error = None;
                for t in targets {
                    if turn.opts.cancel_token.is_cancelled() {
                        turn.agg.cancelled = true;
                        break;
                    }
                    if let Err(e) = self.invoke_tool(turn, t.kind, t.args, t.step_number, true).await {
                        last_error = Some(e);
                    }
                }
                if let Some(e) = last_error {
                    turn.agg.set_error(e.user_message());
                }
            }
        }
        Next::Finish
    }

    /// 调用一个工具并记录结果：填充附件媒体、按需注入历史、执行、写入聚合器
    pub(super) async fn invoke_tool(
        &self,
        turn: &mut Turn<'_>,
        kind: ToolKind,
        mut args: Value,
        step_number: Option<u32>,
        multi_step: bool,
    ) -> Result<ToolResult, AgentError> {
        turn.input.fill_media_args(kind, &mut args);
        send_event(
            turn.events(),
            AgentEvent::ToolCall {
                tool: kind.name().to_string(),
                step_number,
                args: args.clone(),
            },
        );

        let mut ctx = ToolContext::default();
        let mut call_args = args.clone();
        if let Some(limit) = history_limit_for(kind, turn.input, multi_step, self.settings.history_limit) {
            let history = self.load_history(turn, limit).await;
            if kind == ToolKind::GetChatHistory {
                ctx.history = history;
            } else {
                inject_history(&mut call_args, &history);
            }
        }

        match self.executor.execute(kind, &call_args, &ctx).await {
            Ok(result) => {
                send_event(
                    turn.events(),
                    AgentEvent::Observation {
                        tool: kind.name().to_string(),
                        preview: preview(&result.observation(), OBSERVATION_PREVIEW_CHARS),
                    },
                );
                turn.agg
                    .push_record(ToolCallRecord::succeeded(kind, step_number, args, result.clone()));
                Ok(result)
            }
            Err(failure) => {
                tracing::warn!(tool = %kind, step = ?step_number, error = %failure, "Tool call failed");
                send_event(
                    turn.events(),
                    AgentEvent::ToolFailure {
                        tool: kind.name().to_string(),
                        reason: failure.to_string(),
                    },
                );
                turn.agg.push_record(ToolCallRecord::failed(
                    kind.name(),
                    Some(kind),
                    step_number,
                    args,
                    failure.error.to_string(),
                    failure.attempts,
                ));
                Err(failure.error)
            }
        }
    }

    /// 按需读取最近历史，本轮内缓存；读取失败按空历史处理
    async fn load_history(&self, turn: &mut Turn<'_>, limit: usize) -> Vec<HistoryMessage> {
        if turn.history.is_none() {
            let loaded = match self
                .store
                .get_recent_history(turn.conversation_id, self.settings.history_limit.max(limit))
                .await
            {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(conversation_id = %turn.conversation_id, error = %e, "Failed to load history, continuing without it");
                    Vec::new()
                }
            };
            turn.history = Some(loaded);
        }
        let history = turn.history.as_deref().unwrap_or_default();
        history[history.len().saturating_sub(limit)..].to_vec()
    }
}
