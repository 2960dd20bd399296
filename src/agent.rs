//! Headless Agent 运行时
//!
//! 供渠道适配层（HTTP /agent/route 等）调用：AgentComponents 组装引擎、存储、台账与 Provider 链路，
//! route_to_agent 对一条规范化输入跑完整一轮并负责轮后的持久化（历史、lastCommand、台账、压缩）。
//! 持久化失败只记录告警，从不阻塞结果投递。

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentSection, AppConfig};
use crate::core::AgentError;
use crate::db::connect_pool;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{
    ConversationStore, HistoryMessage, LastCommand, Role, SqliteConversationStore, StepTrace,
};
use crate::providers::{FallbackCoordinator, HttpProvider, ProviderRegistry};
use crate::react::{
    AgentEngine, AgentEvent, AgentResult, EngineSettings, ExecuteOptions, NormalizedInput,
    ToolCallRecord,
};
use crate::tasks::{SqliteTaskLedger, TaskLedger, TaskRunner};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 偏好 key 的最大长度（字符）
const PREFERENCE_KEY_CHARS: usize = 40;
const REMEMBER_ACK: &str = "Got it, I'll remember that.";

/// 预构建的 Agent 组件，可多会话共享
pub struct AgentComponents {
    pub engine: Arc<AgentEngine>,
    pub store: Arc<dyn ConversationStore>,
    pub ledger: Arc<dyn TaskLedger>,
    pub coordinator: Arc<FallbackCoordinator>,
    /// 后台生成任务（HTTP 接口使用）
    pub runner: Arc<TaskRunner>,
    pub settings: AgentSection,
    /// 进程级关闭信号；每轮使用其子令牌
    pub shutdown: CancellationToken,
}

impl AgentComponents {
    /// 用给定的 LLM / Provider / 存储组装（测试与 main 共用）
    pub fn assemble(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        providers: Arc<ProviderRegistry>,
        store: Arc<dyn ConversationStore>,
        ledger: Arc<dyn TaskLedger>,
        shutdown: CancellationToken,
    ) -> Self {
        let tools = Arc::new(ToolRegistry::new());
        let coordinator = Arc::new(FallbackCoordinator::from_config(providers, cfg));
        let executor = Arc::new(ToolExecutor::new(Arc::clone(&tools), Arc::clone(&coordinator)));

        let mut engine = AgentEngine::new(
            llm,
            tools,
            executor,
            Arc::clone(&store),
            EngineSettings::from(&cfg.agent),
        );
        if let Some(path) = &cfg.app.system_prompt_path {
            match std::fs::read_to_string(path) {
                Ok(prompt) => engine = engine.with_system_prompt(prompt),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read system prompt, using built-in")
                }
            }
        }

        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&ledger),
            Arc::clone(&coordinator),
            cfg.server.max_concurrent_tasks,
            shutdown.clone(),
        ));

        Self {
            engine: Arc::new(engine),
            store,
            ledger,
            coordinator,
            runner,
            settings: cfg.agent.clone(),
            shutdown,
        }
    }

    /// 处理单条输入，不推送事件
    pub async fn route_to_agent(&self, input: &NormalizedInput, conversation_id: &str) -> AgentResult {
        self.route_to_agent_with_events(input, conversation_id, None).await
    }

    pub async fn route_to_agent_with_events(
        &self,
        input: &NormalizedInput,
        conversation_id: &str,
        event_tx: Option<UnboundedSender<AgentEvent>>,
    ) -> AgentResult {
        if let Some((key, value)) = parse_remember(&input.text) {
            return self.remember(input, conversation_id, &key, &value).await;
        }

        let last_command = match self.store.get_last_command(conversation_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to load last command");
                None
            }
        };
        let long_term = match self.store.get_long_term_memory(conversation_id).await {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to load long-term memory");
                None
            }
        };

        let task_id = match self.ledger.create(Some("agent-turn")).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record turn in task ledger");
                None
            }
        };

        let opts = ExecuteOptions {
            max_iterations: None,
            last_command: last_command.clone(),
            long_term,
            cancel_token: self.shutdown.child_token(),
            event_tx,
        };
        let mut result = self.engine.execute(input, conversation_id, opts).await;

        if let Some(id) = &task_id {
            self.record_turn(id, &result).await;
        }
        self.persist_messages(input, conversation_id, &result).await;
        if let Some(cmd) = build_last_command(input, &result, last_command.as_ref()) {
            if let Err(e) = self.store.save_last_command(conversation_id, &cmd).await {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to save last command");
            }
        }
        self.maybe_compact(conversation_id).await;

        result.task_id = task_id;
        result
    }

    async fn remember(
        &self,
        input: &NormalizedInput,
        conversation_id: &str,
        key: &str,
        value: &str,
    ) -> AgentResult {
        tracing::info!(conversation_id = %conversation_id, key = %key, "Storing preference");
        let result = match self.store.set_preference(conversation_id, key, value).await {
            Ok(()) => AgentResult {
                success: true,
                final_text: REMEMBER_ACK.to_string(),
                ..Default::default()
            },
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to store preference");
                let err = AgentError::from(e);
                AgentResult {
                    success: false,
                    final_text: err.user_message(),
                    error: Some(err.to_string()),
                    ..Default::default()
                }
            }
        };
        self.persist_messages(input, conversation_id, &result).await;
        result
    }

    async fn record_turn(&self, task_id: &str, result: &AgentResult) {
        let media: Vec<&str> = result.media.iter().map(|m| m.url.as_str()).collect();
        let write = if result.success {
            self.ledger
                .complete(
                    task_id,
                    json!({
                        "text": result.final_text,
                        "media": media,
                        "toolCalls": result.tool_calls.len(),
                        "multiStep": result.multi_step,
                    }),
                )
                .await
        } else {
            let error = result.error.clone().unwrap_or_else(|| result.final_text.clone());
            self.ledger.fail(task_id, &error).await
        };
        if let Err(e) = write {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to finalize turn in task ledger");
        }
    }

    async fn persist_messages(&self, input: &NormalizedInput, conversation_id: &str, result: &AgentResult) {
        let mut reply = result.final_text.clone();
        for m in &result.media {
            if !reply.is_empty() {
                reply.push('\n');
            }
            reply.push_str(&format!("[{}] {}", m.kind.as_str(), m.url));
        }
        let messages = [
            HistoryMessage::new(Role::User, input.render_for_model()),
            HistoryMessage::new(Role::Assistant, reply),
        ];
        for m in messages {
            if m.content.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.store.append_message(conversation_id, m).await {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to append message");
                return;
            }
        }
    }

    /// 消息数超过阈值时让 LLM 生成摘要，写入长期记忆并只保留最近 history_limit 条
    async fn maybe_compact(&self, conversation_id: &str) {
        let count = match self.store.message_count(conversation_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to count messages");
                return;
            }
        };
        if count <= self.settings.compact_threshold {
            return;
        }
        let keep = self.settings.history_limit;
        let history = match self.store.get_recent_history(conversation_id, count).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to load history for compaction");
                return;
            }
        };
        let older = &history[..history.len().saturating_sub(keep)];
        if older.is_empty() {
            return;
        }
        let summary = match self.engine.planner().summarize(older).await {
            Ok(s) if !s.is_empty() => s,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Compaction failed");
                return;
            }
        };
        match self
            .store
            .replace_history_with_summary(conversation_id, &summary, keep)
            .await
        {
            Ok(()) => tracing::info!(conversation_id = %conversation_id, compacted = older.len(), "History compacted"),
            Err(e) => tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to store compacted history"),
        }
    }
}

/// 按配置创建全部组件：SQLite 连接池、会话存储、任务台账、HTTP Provider、LLM
pub async fn create_agent_components(
    cfg: &AppConfig,
    shutdown: CancellationToken,
) -> Result<AgentComponents, AgentError> {
    let pool = connect_pool(&cfg.storage.database_url).await?;
    let store: Arc<dyn ConversationStore> =
        Arc::new(SqliteConversationStore::new(pool.clone(), cfg.agent.max_stored_messages).await?);
    let ledger: Arc<dyn TaskLedger> = Arc::new(SqliteTaskLedger::new(pool).await?);

    let mut providers = ProviderRegistry::new();
    for endpoint in &cfg.providers.endpoints {
        tracing::info!(provider = %endpoint.name, base_url = %endpoint.base_url, "Registering provider");
        providers.register(Arc::new(HttpProvider::from_endpoint(endpoint)));
    }
    if providers.is_empty() {
        tracing::warn!("No provider endpoints configured; generation tools will fail");
    }

    let llm = create_llm_from_config(&cfg.llm);
    Ok(AgentComponents::assemble(
        cfg,
        llm,
        Arc::new(providers),
        store,
        ledger,
        shutdown,
    ))
}

/// 解析「remember: ...」；含 " is " 时拆成 key / value，否则 key 取文本前 40 个字符
pub fn parse_remember(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    let prefix = "remember:";
    let head = trimmed.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let content = trimmed[prefix.len()..].trim();
    if content.is_empty() {
        return None;
    }
    if let Some((k, v)) = content.split_once(" is ") {
        let (k, v) = (k.trim(), v.trim());
        if !k.is_empty() && !v.is_empty() {
            return Some((k.to_lowercase(), v.to_string()));
        }
    }
    let key: String = content.to_lowercase().chars().take(PREFERENCE_KEY_CHARS).collect();
    Some((key, content.to_string()))
}

/// 本轮最后一次可持久化的工具调用（成功或失败）成为新的 lastCommand
fn build_last_command(
    input: &NormalizedInput,
    result: &AgentResult,
    previous: Option<&LastCommand>,
) -> Option<LastCommand> {
    let record = result
        .tool_calls
        .iter()
        .rev()
        .find(|r| r.kind.map(|k| k.is_persistable()).unwrap_or(false))?;
    let kind = record.kind?;
    let prompt = result.retried_prompt.as_deref().unwrap_or(&input.text);
    let cmd = LastCommand::from_result(kind, &record.arguments, &record.result_or_failure(), prompt)?;

    let traced: Vec<StepTrace> = result.tool_calls.iter().filter_map(step_trace).collect();
    let previous = previous.filter(|p| result.retried_prompt.is_some() && !p.steps.is_empty());
    if traced.is_empty() || (!result.multi_step && previous.is_none()) {
        return Some(cmd);
    }

    // 按步骤重试时合并到原轨迹里，保留未重做的步骤（只重做一步也一样）
    let steps = match previous {
        Some(prev) => {
            let mut merged = prev.steps.clone();
            for t in traced {
                match merged.iter_mut().find(|s| s.step_number == t.step_number) {
                    Some(slot) => *slot = t,
                    None => merged.push(t),
                }
            }
            merged.sort_by_key(|s| s.step_number);
            merged
        }
        None => traced,
    };
    Some(cmd.with_steps(steps))
}

fn step_trace(record: &ToolCallRecord) -> Option<StepTrace> {
    Some(StepTrace {
        step_number: record.step_number?,
        tool: record.kind?,
        arguments: record.arguments.clone(),
        success: record.success,
    })
}
