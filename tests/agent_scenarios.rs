//! 端到端场景：规划 -> 执行 -> 回退 -> 持久化，全部使用内存存储与脚本化 Provider

use std::sync::{Arc, Mutex};
use std::time::Duration;

use genie::agent::AgentComponents;
use genie::config::AppConfig;
use genie::llm::MockLlmClient;
use genie::memory::{ConversationStore, InMemoryConversationStore};
use genie::providers::{
    AttemptOutcome, GenerationKind, ProviderError, ProviderOutput, ProviderRegistry, ScriptedProvider,
};
use genie::react::NormalizedInput;
use genie::tasks::InMemoryTaskLedger;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn build(
    cfg: AppConfig,
    llm: MockLlmClient,
    providers: Vec<Arc<ScriptedProvider>>,
) -> (AgentComponents, Arc<InMemoryConversationStore>) {
    let mut registry = ProviderRegistry::new();
    for p in providers {
        registry.register(p);
    }
    let store = Arc::new(InMemoryConversationStore::new(200));
    let components = AgentComponents::assemble(
        &cfg,
        Arc::new(llm),
        Arc::new(registry),
        store.clone(),
        Arc::new(InMemoryTaskLedger::new()),
        CancellationToken::new(),
    );
    (components, store)
}

#[tokio::test]
async fn location_then_image_runs_two_steps_in_order() {
    let plan = r#"```json
{"isMultiStep": true, "reasoning": "two separate asks", "steps": [
  {"stepNumber": 2, "tool": "create_image", "action": "draw", "parameters": {"prompt": "a sunset"}},
  {"stepNumber": 1, "tool": "send_location", "action": "share", "parameters": {"place": "Lisbon"}}
]}
```"#;
    let journal = Arc::new(Mutex::new(Vec::new()));
    let provider = Arc::new(ScriptedProvider::new("any").with_journal(journal.clone()));
    let (agent, _) = build(AppConfig::default(), MockLlmClient::with_replies([plan]), vec![provider]);

    let result = agent
        .route_to_agent(
            &NormalizedInput::text("send location and then create an image of a sunset"),
            "chat-b",
        )
        .await;

    assert!(result.success);
    assert!(result.multi_step);
    let tools: Vec<&str> = result.tool_calls.iter().map(|r| r.tool.as_str()).collect();
    assert_eq!(tools, vec!["send_location", "create_image"]);
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["any:location".to_string(), "any:text-to-image".to_string()]
    );
    assert_eq!(result.media.len(), 1);
}

#[tokio::test]
async fn try_again_without_history_is_graceful() {
    let llm = MockLlmClient::with_replies([r#"{"tool": "retry_last_command", "args": {}}"#]);
    let (agent, _) = build(AppConfig::default(), llm, vec![Arc::new(ScriptedProvider::new("any"))]);

    let result = agent.route_to_agent(&NormalizedInput::text("try again"), "chat-c").await;

    assert!(result.success);
    assert!(result.error.is_none());
    assert_eq!(result.final_text, genie::react::retry::NOTHING_TO_RETRY);
}

#[tokio::test]
async fn slow_provider_falls_back_without_user_visible_error() {
    let mut cfg = AppConfig::default();
    cfg.providers.media_timeout_secs = 1;
    cfg.providers
        .chains
        .insert("text-to-image".to_string(), vec!["x".to_string(), "y".to_string()]);
    let slow = Arc::new(ScriptedProvider::new("x").with_delay(Duration::from_secs(5)));
    let fast = Arc::new(ScriptedProvider::new("y"));
    let llm = MockLlmClient::with_replies([r#"{"tool": "create_image", "args": {"prompt": "a lighthouse"}}"#]);
    let (agent, _) = build(cfg, llm, vec![slow, fast.clone()]);

    let result = agent.route_to_agent(&NormalizedInput::text("draw a lighthouse"), "chat-d").await;

    assert!(result.success);
    assert!(result.error.is_none());
    let call = &result.tool_calls[0];
    let output = call.result.as_ref().unwrap();
    assert_eq!(output.provider.as_deref(), Some("y"));
    let outcomes: Vec<AttemptOutcome> = call.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Failed, AttemptOutcome::Success]);
    assert_eq!(fast.call_count(), 1);
}

#[tokio::test]
async fn last_command_is_sanitized_and_retried() {
    let provider = Arc::new(
        ScriptedProvider::new("gemini").then_ok(
            ProviderOutput::media("https://cdn/fox.png")
                .with_data(json!({"raw": "provider internals", "token": "secret"})),
        ),
    );
    let llm = MockLlmClient::with_replies([
        r#"{"tool": "create_image", "args": {"prompt": "a fox", "provider": "gemini"}}"#,
        r#"{"tool": "retry_last_command", "args": {}}"#,
    ]);
    let (agent, store) = build(AppConfig::default(), llm, vec![provider.clone()]);

    let first = agent.route_to_agent(&NormalizedInput::text("draw a fox"), "chat-s").await;
    assert!(first.success);

    let saved = store.get_last_command("chat-s").await.unwrap().unwrap();
    let persisted = serde_json::to_value(&saved).unwrap();
    let result_keys: Vec<&String> = persisted["result"].as_object().unwrap().keys().collect();
    for key in result_keys {
        assert!(
            ["success", "media_urls", "text", "provider", "error"].contains(&key.as_str()),
            "unexpected field {key}"
        );
    }
    assert!(!persisted.to_string().contains("secret"));
    assert!(saved.arguments.get("history").is_none());

    let retry = agent.route_to_agent(&NormalizedInput::text("try again"), "chat-s").await;
    assert!(retry.success);
    assert_eq!(provider.call_count(), 2);
    assert_eq!(provider.calls()[1].1["prompt"], "a fox");
}

fn step_outcomes(cmd: &genie::memory::LastCommand) -> Vec<(u32, bool)> {
    cmd.steps.iter().map(|s| (s.step_number, s.success)).collect()
}

#[tokio::test]
async fn multi_step_retry_redoes_selected_steps_and_keeps_trace() {
    let plan = r#"{"isMultiStep": true, "reasoning": "three asks", "steps": [
        {"stepNumber": 1, "tool": "create_image", "action": "img", "parameters": {"prompt": "a cat"}},
        {"stepNumber": 2, "tool": "create_video", "action": "vid", "parameters": {"prompt": "a dog"}},
        {"stepNumber": 3, "tool": "create_music", "action": "song", "parameters": {"prompt": "jazz"}}
    ]}"#;
    let journal = Arc::new(Mutex::new(Vec::new()));
    let studio = Arc::new(
        ScriptedProvider::new("studio")
            .supporting(&[GenerationKind::TextToImage, GenerationKind::TextToMusic])
            .with_journal(journal.clone()),
    );
    // 第一次视频被拦截，之后成功
    let veo = Arc::new(
        ScriptedProvider::new("veo")
            .supporting(&[GenerationKind::TextToVideo])
            .then_err(ProviderError::PolicyBlocked("no dogs".into()))
            .then_ok(ProviderOutput::media("https://cdn/dog.mp4"))
            .with_journal(journal.clone()),
    );
    let llm = MockLlmClient::with_replies([
        plan,
        r#"{"tool": "retry_last_command", "args": {}}"#,
        r#"{"tool": "retry_last_command", "args": {"step_numbers": [3]}}"#,
        r#"{"tool": "retry_last_command", "args": {"tools": ["create_image"]}}"#,
    ]);
    let (agent, store) = build(AppConfig::default(), llm, vec![studio.clone(), veo.clone()]);
    let original = "draw a cat then a dog video and then some jazz";

    let first = agent.route_to_agent(&NormalizedInput::text(original), "chat-m").await;
    assert!(first.multi_step);
    assert!(first.success);
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["studio:text-to-image", "veo:text-to-video", "studio:text-to-music"]
    );
    let saved = store.get_last_command("chat-m").await.unwrap().unwrap();
    assert_eq!(saved.prompt, original);
    assert_eq!(step_outcomes(&saved), vec![(1, true), (2, false), (3, true)]);

    // 无过滤条件：只重做失败的第 2 步
    let retry = agent.route_to_agent(&NormalizedInput::text("try again"), "chat-m").await;
    assert!(retry.success);
    assert_eq!(retry.tool_calls.len(), 1);
    assert_eq!(retry.tool_calls[0].step_number, Some(2));
    assert_eq!(veo.call_count(), 2);
    assert_eq!(studio.call_count(), 2);
    assert_eq!(journal.lock().unwrap().last().unwrap(), "veo:text-to-video");
    let saved = store.get_last_command("chat-m").await.unwrap().unwrap();
    assert_eq!(saved.prompt, original);
    assert_eq!(step_outcomes(&saved), vec![(1, true), (2, true), (3, true)]);

    // 按步骤编号重做
    let redo = agent.route_to_agent(&NormalizedInput::text("redo step 3"), "chat-m").await;
    assert!(redo.success);
    assert_eq!(journal.lock().unwrap().len(), 5);
    assert_eq!(journal.lock().unwrap().last().unwrap(), "studio:text-to-music");
    assert_eq!(studio.calls().last().unwrap().1["prompt"], "jazz");
    let saved = store.get_last_command("chat-m").await.unwrap().unwrap();
    assert_eq!(step_outcomes(&saved), vec![(1, true), (2, true), (3, true)]);

    // 按工具名重做
    let again = agent.route_to_agent(&NormalizedInput::text("redo the picture"), "chat-m").await;
    assert!(again.success);
    assert_eq!(journal.lock().unwrap().len(), 6);
    assert_eq!(journal.lock().unwrap().last().unwrap(), "studio:text-to-image");
    assert_eq!(veo.call_count(), 2);
    let saved = store.get_last_command("chat-m").await.unwrap().unwrap();
    assert_eq!(saved.prompt, original);
    assert_eq!(saved.steps.len(), 3);
    assert_eq!(saved.steps[0].arguments["prompt"], "a cat");
}
