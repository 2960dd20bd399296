//! 多步执行：严格按 stepNumber 升序，一步一个工具
//!
//! 某一步失败只记录，继续执行后续步骤；步骤不读取会话历史，但会使用本轮的附件 / 引用媒体。

use serde_json::Value;

use crate::react::loop_::{AgentEngine, Turn};
use crate::react::{send_event, AgentEvent, Plan, ToolCallRecord};
use crate::tools::ToolKind;

impl AgentEngine {
    pub(super) async fn run_multi_step(&self, turn: &mut Turn<'_>, plan: &Plan, max_iterations: usize) {
        for (idx, step) in plan.steps.iter().enumerate() {
            if turn.opts.cancel_token.is_cancelled() {
                turn.agg.cancelled = true;
                turn.agg
                    .push_note(format!("Cancelled before step {}.", step.step_number));
                return;
            }
            if turn.agg.iterations >= max_iterations {
                let skipped: Vec<String> = plan.steps[idx..]
                    .iter()
                    .map(|s| s.step_number.to_string())
                    .collect();
                tracing::warn!(max_iterations, skipped = ?skipped, "Iteration limit reached, skipping remaining steps");
                turn.agg.push_note(format!(
                    "I stopped after {max_iterations} steps and skipped step(s) {}.",
                    skipped.join(", ")
                ));
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

            let kind = step.kind.filter(|k| self.registry().contains(*k));
            let kind = match kind {
                Some(ToolKind::RetryLastCommand) => {
                    turn.agg.push_record(ToolCallRecord::failed(
                        step.tool.clone(),
                        Some(ToolKind::RetryLastCommand),
                        Some(step.step_number),
                        step.parameters.clone(),
                        "retrying can't be combined with other requests",
                        Vec::new(),
                    ));
                    continue;
                }
                Some(k) => k,
                None => {
                    tracing::warn!(step = step.step_number, tool = %step.tool, "Plan step names unknown tool");
                    turn.agg.push_record(ToolCallRecord::failed(
                        step.tool.clone(),
                        None,
                        Some(step.step_number),
                        step.parameters.clone(),
                        format!("I don't have a tool called '{}'", step.tool),
                        Vec::new(),
                    ));
                    continue;
                }
            };

            tracing::info!(step = step.step_number, tool = %kind, action = %step.action, "Executing plan step");
            let args = if step.parameters.is_object() {
                step.parameters.clone()
            } else {
                Value::Object(Default::default())
            };
            // 结果已写入聚合器，失败不中断
            let _ = self
                .invoke_tool(turn, kind, args, Some(step.step_number), true)
                .await;
        }

        if !turn.agg.records().iter().any(|r| r.success) {
            turn.agg.set_error("None of the steps could be completed.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryConversationStore;
    use crate::providers::{
        FallbackCoordinator, GenerationKind, ProviderError, ProviderRegistry, ScriptedProvider,
    };
    use crate::react::{AgentEngine, EngineSettings, ExecuteOptions, NormalizedInput};
    use crate::tools::{MediaKind, ToolExecutor, ToolRegistry};

    const THREE_STEPS: &str = r#"{"isMultiStep": true, "reasoning": "three asks", "steps": [
        {"stepNumber": 1, "tool": "create_image", "action": "img", "parameters": {"prompt": "a cat"}},
        {"stepNumber": 2, "tool": "create_video", "action": "vid", "parameters": {"prompt": "a dog"}},
        {"stepNumber": 3, "tool": "create_music", "action": "song", "parameters": {"prompt": "jazz"}}
    ]}"#;

    fn engine(llm: MockLlmClient, providers: Vec<ScriptedProvider>) -> AgentEngine {
        let mut reg = ProviderRegistry::new();
        for p in providers {
            reg.register(Arc::new(p));
        }
        let tools = Arc::new(ToolRegistry::new());
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&tools),
            Arc::new(FallbackCoordinator::new(Arc::new(reg))),
        ));
        AgentEngine::new(
            Arc::new(llm),
            tools,
            executor,
            Arc::new(InMemoryConversationStore::new(50)),
            EngineSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_middle_step_failure_is_partial_success() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let media = ScriptedProvider::new("studio")
            .supporting(&[GenerationKind::TextToImage, GenerationKind::TextToMusic])
            .with_journal(journal.clone());
        let video = ScriptedProvider::new("veo")
            .supporting(&[GenerationKind::TextToVideo])
            .failing_with(ProviderError::PolicyBlocked("no dogs".into()))
            .with_journal(journal.clone());
        let engine = engine(MockLlmClient::with_replies([THREE_STEPS]), vec![media, video]);

        let result = engine
            .execute(
                &NormalizedInput::text("draw a cat then a dog video and then some jazz"),
                "c1",
                ExecuteOptions::default(),
            )
            .await;

        assert!(result.multi_step);
        assert!(result.success);
        assert!(result.error.is_none());
        let outcomes: Vec<_> = result.tool_calls.iter().map(|r| (r.step_number, r.success)).collect();
        assert_eq!(outcomes, vec![(Some(1), true), (Some(2), false), (Some(3), true)]);
        assert_eq!(result.media.len(), 2);
        assert!(result.final_text.contains("Completed 2 of 3 steps."));
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "studio:text-to-image".to_string(),
                "veo:text-to-video".to_string(),
                "studio:text-to-music".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_step_limit_skips_rest() {
        let engine = engine(
            MockLlmClient::with_replies([THREE_STEPS]),
            vec![ScriptedProvider::new("any")],
        );
        let result = engine
            .execute(
                &NormalizedInput::text("cat and dog and jazz"),
                "c1",
                ExecuteOptions {
                    max_iterations: Some(2),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(result.tool_calls.len(), 2);
        assert!(result.final_text.contains("skipped step(s) 3"));
    }

    #[tokio::test]
    async fn test_unknown_step_and_attached_media() {
        let plan = r#"{"isMultiStep": true, "steps": [
            {"stepNumber": 1, "tool": "edit_image", "parameters": {"prompt": "add a hat"}},
            {"stepNumber": 2, "tool": "teleport", "parameters": {}},
            {"stepNumber": 3, "tool": "create_music", "parameters": {"prompt": "polka"}}
        ]}"#;
        let provider = Arc::new(ScriptedProvider::new("any"));
        let mut reg = ProviderRegistry::new();
        reg.register(provider.clone());
        let tools = Arc::new(ToolRegistry::new());
        let engine = AgentEngine::new(
            Arc::new(MockLlmClient::with_replies([plan])),
            Arc::clone(&tools),
            Arc::new(ToolExecutor::new(
                tools,
                Arc::new(FallbackCoordinator::new(Arc::new(reg))),
            )),
            Arc::new(InMemoryConversationStore::new(50)),
            EngineSettings::default(),
        );
        let input = NormalizedInput::text("add a hat then make a polka")
            .with_media(MediaKind::Image, "https://chat/photo.jpg");
        let result = engine.execute(&input, "c1", ExecuteOptions::default()).await;

        assert!(result.success);
        assert!(!result.tool_calls[1].success);
        assert!(result.final_text.contains("teleport"));
        let (_, params) = &provider.calls()[0];
        assert_eq!(params["input_url"], "https://chat/photo.jpg");
        // 多步不注入历史
        assert!(params.get("history").is_none());
    }
}
