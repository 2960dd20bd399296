//! Provider 回退链
//!
//! `invoke_with_fallback` 是与具体 Provider 无关的高阶组合子：按顺序调用链路中的每个名称，
//! 成功即返回；失败则记录并推进到下一个。最后一个也失败时，把所有 Provider 的错误拼接后返回。
//! `FallbackCoordinator` 在其之上负责链路解析（默认链 / 用户点名）与按能力等级的超时。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use super::{
    DefaultClassifier, FailureClass, FailureClassifier, GenerationClass, GenerationKind,
    ProviderError, ProviderOutput, ProviderRegistry,
};
use crate::config::AppConfig;
use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failed,
}

/// 单次 Provider 调用的轨迹
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    /// 最终成功的 Provider
    pub provider: String,
    pub output: T,
    pub attempts: Vec<Attempt>,
}

/// 链路耗尽（或为空）
#[derive(Debug, Clone)]
pub struct FallbackError {
    /// 最后一次失败的分类
    pub class: FailureClass,
    /// "a: msg; b: msg"
    pub message: String,
    pub attempts: Vec<Attempt>,
}

impl FallbackError {
    pub fn into_agent_error(self) -> AgentError {
        if self.attempts.is_empty() {
            return AgentError::Validation(self.message);
        }
        match self.class {
            FailureClass::Retryable => AgentError::ProviderTransient(self.message),
            FailureClass::Terminal => AgentError::ProviderTerminal(self.message),
        }
    }
}

/// 按链路顺序调用 `call`，直到某个 Provider 成功
///
/// 可重试失败推进；非最后一个 Provider 的终止失败也推进；最后一个失败则返回拼接后的错误。
pub async fn invoke_with_fallback<T, F, Fut>(
    chain: &[String],
    classifier: &dyn FailureClassifier,
    mut call: F,
) -> Result<FallbackOutcome<T>, FallbackError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    if chain.is_empty() {
        return Err(FallbackError {
            class: FailureClass::Terminal,
            message: "no provider available for this request".to_string(),
            attempts: Vec::new(),
        });
    }

    let mut attempts = Vec::with_capacity(chain.len());
    let mut failures: Vec<String> = Vec::new();
    let mut last_class = FailureClass::Retryable;

    for (idx, name) in chain.iter().enumerate() {
        let started = Instant::now();
        let result = call(name.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                tracing::info!(provider = %name, elapsed_ms, attempt = idx + 1, "Provider succeeded");
                attempts.push(Attempt {
                    provider: name.clone(),
                    outcome: AttemptOutcome::Success,
                    class: None,
                    error: None,
                    elapsed_ms,
                });
                return Ok(FallbackOutcome {
                    provider: name.clone(),
                    output,
                    attempts,
                });
            }
            Err(e) => {
                let class = classifier.classify(&e);
                let is_last = idx + 1 == chain.len();
                if is_last {
                    tracing::error!(provider = %name, error = %e, ?class, elapsed_ms, "Provider failed, chain exhausted");
                } else {
                    tracing::warn!(provider = %name, error = %e, ?class, elapsed_ms, "Provider failed, failing over");
                }
                failures.push(format!("{name}: {e}"));
                attempts.push(Attempt {
                    provider: name.clone(),
                    outcome: AttemptOutcome::Failed,
                    class: Some(class),
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                last_class = class;
            }
        }
    }

    Err(FallbackError {
        class: last_class,
        message: failures.join("; "),
        attempts,
    })
}

/// 回退协调器：解析链路并对每次调用施加能力等级超时
pub struct FallbackCoordinator {
    registry: Arc<ProviderRegistry>,
    classifier: Arc<dyn FailureClassifier>,
    chains: HashMap<GenerationKind, Vec<String>>,
    interactive_timeout: Duration,
    media_timeout: Duration,
    strict: bool,
}

impl FallbackCoordinator {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            classifier: Arc::new(DefaultClassifier),
            chains: HashMap::new(),
            interactive_timeout: Duration::from_secs(45),
            media_timeout: Duration::from_secs(300),
            strict: false,
        }
    }

    pub fn from_config(registry: Arc<ProviderRegistry>, config: &AppConfig) -> Self {
        Self::new(registry)
            .with_chains(config.providers.parsed_chains())
            .with_timeouts(
                config.providers.interactive_timeout(),
                config.providers.media_timeout(),
            )
            .with_strict(config.agent.strict_provider)
    }

    pub fn with_chains(mut self, chains: HashMap<GenerationKind, Vec<String>>) -> Self {
        self.chains = chains;
        self
    }

    pub fn with_chain(mut self, kind: GenerationKind, names: &[&str]) -> Self {
        self.chains
            .insert(kind, names.iter().map(|n| n.to_lowercase()).collect());
        self
    }

    pub fn with_timeouts(mut self, interactive: Duration, media: Duration) -> Self {
        self.interactive_timeout = interactive;
        self.media_timeout = media;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn timeout_for(&self, kind: GenerationKind) -> Duration {
        match kind.class() {
            GenerationClass::Interactive => self.interactive_timeout,
            GenerationClass::Media => self.media_timeout,
        }
    }

    /// 默认链：配置的链路（过滤掉未注册或不支持的），未配置时取所有支持该能力的 Provider
    fn default_chain(&self, kind: GenerationKind) -> Vec<String> {
        match self.chains.get(&kind) {
            Some(names) => names
                .iter()
                .filter(|name| {
                    let usable = self.usable(name, kind);
                    if !usable {
                        tracing::warn!(provider = %name, kind = %kind, "Provider in chain is not registered or does not support kind, skipped");
                    }
                    usable
                })
                .cloned()
                .collect(),
            None => self.registry.supporting(kind),
        }
    }

    fn usable(&self, name: &str, kind: GenerationKind) -> bool {
        self.registry
            .get(name)
            .map(|p| p.supports(kind))
            .unwrap_or(false)
    }

    /// 用户点名的 Provider 排在最前，其后是默认链的其余部分（strict 模式下只用点名的那个）
    pub fn resolve_chain(&self, kind: GenerationKind, requested: Option<&str>) -> Vec<String> {
        let default = self.default_chain(kind);
        let requested = requested
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty());

        let Some(requested) = requested else {
            return default;
        };

        if !self.usable(&requested, kind) {
            tracing::warn!(provider = %requested, kind = %kind, "Requested provider unavailable for kind, using default chain");
            return default;
        }

        if self.strict {
            return vec![requested];
        }

        let mut chain = Vec::with_capacity(default.len() + 1);
        chain.push(requested.clone());
        chain.extend(default.into_iter().filter(|n| *n != requested));
        chain
    }

    /// 以回退链调用某能力
    pub async fn invoke(
        &self,
        kind: GenerationKind,
        params: &Value,
        requested: Option<&str>,
    ) -> Result<FallbackOutcome<ProviderOutput>, FallbackError> {
        let chain = self.resolve_chain(kind, requested);
        let timeout = self.timeout_for(kind);
        tracing::debug!(kind = %kind, chain = ?chain, timeout_ms = timeout.as_millis() as u64, "Invoking provider chain");

        invoke_with_fallback(&chain, self.classifier.as_ref(), |name| {
            let provider = self.registry.get(&name);
            async move {
                let provider = provider
                    .ok_or_else(|| ProviderError::Other(format!("provider {name} not registered")))?;
                match tokio::time::timeout(timeout, provider.generate(kind, params)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        elapsed_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ScriptedProvider;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_retryable_failures_advance_to_success() {
        let chain = names(&["a", "b", "c"]);
        let outcome = invoke_with_fallback(&chain, &DefaultClassifier, |name| async move {
            match name.as_str() {
                "a" => Err(ProviderError::Timeout { elapsed_ms: 5 }),
                "b" => Err(ProviderError::RateLimited("busy".into())),
                _ => Ok(format!("{name}-result")),
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.provider, "c");
        assert_eq!(outcome.output, "c-result");
        let outcomes: Vec<_> = outcome.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Failed, AttemptOutcome::Failed, AttemptOutcome::Success]
        );
        assert_eq!(outcome.attempts[0].class, Some(FailureClass::Retryable));
    }

    #[tokio::test]
    async fn test_terminal_on_non_last_still_advances() {
        let chain = names(&["a", "b"]);
        let outcome = invoke_with_fallback(&chain, &DefaultClassifier, |name| async move {
            if name == "a" {
                Err(ProviderError::PolicyBlocked("nope".into()))
            } else {
                Ok(1)
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome.provider, "b");
        assert_eq!(outcome.attempts[0].class, Some(FailureClass::Terminal));
    }

    #[tokio::test]
    async fn test_exhaustion_concatenates_every_message() {
        let chain = names(&["a", "b"]);
        let err = invoke_with_fallback::<(), _, _>(&chain, &DefaultClassifier, |name| async move {
            if name == "a" {
                Err(ProviderError::Timeout { elapsed_ms: 1 })
            } else {
                Err(ProviderError::InvalidInput("prompt too long".into()))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.class, FailureClass::Terminal);
        assert!(err.message.contains("a: timed out"));
        assert!(err.message.contains("b: invalid input: prompt too long"));
        assert!(matches!(err.into_agent_error(), AgentError::ProviderTerminal(_)));
    }

    #[tokio::test]
    async fn test_empty_chain_is_validation_error() {
        let err = invoke_with_fallback::<(), _, _>(&[], &DefaultClassifier, |_| async {
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.attempts.is_empty());
        assert!(matches!(err.into_agent_error(), AgentError::Validation(_)));
    }

    fn registry() -> Arc<ProviderRegistry> {
        let mut reg = ProviderRegistry::new();
        for name in ["gemini", "openai", "grok"] {
            reg.register(Arc::new(
                ScriptedProvider::new(name).supporting(&[GenerationKind::TextToImage]),
            ));
        }
        reg.register(Arc::new(
            ScriptedProvider::new("suno").supporting(&[GenerationKind::TextToMusic]),
        ));
        Arc::new(reg)
    }

    #[test]
    fn test_resolve_chain_requested_first_then_default() {
        let coord = FallbackCoordinator::new(registry())
            .with_chain(GenerationKind::TextToImage, &["gemini", "openai", "missing", "grok"]);

        assert_eq!(
            coord.resolve_chain(GenerationKind::TextToImage, None),
            names(&["gemini", "openai", "grok"])
        );
        assert_eq!(
            coord.resolve_chain(GenerationKind::TextToImage, Some("Grok")),
            names(&["grok", "gemini", "openai"])
        );
        // 不支持该能力的点名回落到默认链
        assert_eq!(
            coord.resolve_chain(GenerationKind::TextToImage, Some("suno")),
            names(&["gemini", "openai", "grok"])
        );
        // 未配置链路时取所有支持的 Provider
        assert_eq!(coord.resolve_chain(GenerationKind::TextToMusic, None), names(&["suno"]));
    }

    #[test]
    fn test_resolve_chain_strict() {
        let coord = FallbackCoordinator::new(registry())
            .with_chain(GenerationKind::TextToImage, &["gemini", "openai"])
            .with_strict(true);
        assert_eq!(
            coord.resolve_chain(GenerationKind::TextToImage, Some("openai")),
            names(&["openai"])
        );
    }

    #[tokio::test]
    async fn test_invoke_times_out_then_fails_over() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(
            ScriptedProvider::new("x").with_delay(Duration::from_millis(200)),
        ));
        reg.register(Arc::new(ScriptedProvider::new("y")));
        let coord = FallbackCoordinator::new(Arc::new(reg))
            .with_chain(GenerationKind::Translation, &["x", "y"])
            .with_timeouts(Duration::from_millis(20), Duration::from_secs(1));

        let outcome = coord
            .invoke(GenerationKind::Translation, &json!({"text": "hola"}), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "y");
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts[0].error.as_deref().unwrap_or("").contains("timed out"));
    }
}
