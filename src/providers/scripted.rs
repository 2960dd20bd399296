//! 脚本化 Provider：本地联调与测试用
//!
//! 按顺序返回预置结果，队列耗尽后使用默认行为（成功生成一个占位 URL / 文本，
//! 或配置了 `failing_with` 时始终失败）。可选延迟用于模拟超时，可选共享日志用于断言跨 Provider 的调用顺序。

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{GenerationKind, Provider, ProviderError, ProviderOutput};

type Journal = Arc<Mutex<Vec<String>>>;

pub struct ScriptedProvider {
    name: String,
    kinds: HashSet<GenerationKind>,
    script: Mutex<VecDeque<Result<ProviderOutput, ProviderError>>>,
    fallback_error: Option<ProviderError>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(GenerationKind, Value)>>,
    journal: Option<Journal>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            kinds: HashSet::new(),
            script: Mutex::new(VecDeque::new()),
            fallback_error: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    /// 限定支持的能力；不调用则支持全部
    pub fn supporting(mut self, kinds: &[GenerationKind]) -> Self {
        self.kinds.extend(kinds.iter().copied());
        self
    }

    pub fn then_ok(self, output: ProviderOutput) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Ok(output));
        }
        self
    }

    pub fn then_err(self, err: ProviderError) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Err(err));
        }
        self
    }

    /// 脚本耗尽后始终返回该错误
    pub fn failing_with(mut self, err: ProviderError) -> Self {
        self.fallback_error = Some(err);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 每次调用向共享日志追加 `name:kind`
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<(GenerationKind, Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn default_output(&self, kind: GenerationKind, params: &Value, n: usize) -> ProviderOutput {
        let prompt = params
            .get("prompt")
            .or_else(|| params.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("");
        match kind.media_kind() {
            Some(media) => ProviderOutput::media(format!(
                "https://media.genie.local/{}/{}-{}.{}",
                self.name,
                kind.as_str(),
                n,
                media.default_extension()
            ))
            .with_cost(0.01),
            None => ProviderOutput::text(format!("[{}] {}", self.name, prompt)),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: GenerationKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    async fn generate(
        &self,
        kind: GenerationKind,
        params: &Value,
    ) -> Result<ProviderOutput, ProviderError> {
        let n = match self.calls.lock() {
            Ok(mut calls) => {
                calls.push((kind, params.clone()));
                calls.len()
            }
            Err(_) => 0,
        };
        if let Some(journal) = &self.journal {
            if let Ok(mut j) = journal.lock() {
                j.push(format!("{}:{}", self.name, kind.as_str()));
            }
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(result) => result,
            None => match &self.fallback_error {
                Some(err) => Err(err.clone()),
                None => Ok(self.default_output(kind, params, n)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_script_then_default() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let p = ScriptedProvider::new("Demo")
            .then_err(ProviderError::RateLimited("busy".into()))
            .with_journal(journal.clone());

        let first = p.generate(GenerationKind::TextToImage, &json!({"prompt": "cat"})).await;
        assert!(first.is_err());
        let second = p
            .generate(GenerationKind::TextToImage, &json!({"prompt": "cat"}))
            .await
            .unwrap();
        assert!(second.media_url.unwrap().ends_with(".png"));

        let third = p
            .generate(GenerationKind::Translation, &json!({"text": "hola"}))
            .await
            .unwrap();
        assert_eq!(third.text.as_deref(), Some("[demo] hola"));

        assert_eq!(p.call_count(), 3);
        assert_eq!(journal.lock().unwrap()[2], "demo:translation");
    }

    #[tokio::test]
    async fn test_failing_with() {
        let p = ScriptedProvider::new("bad").failing_with(ProviderError::PolicyBlocked("x".into()));
        for _ in 0..2 {
            assert!(matches!(
                p.generate(GenerationKind::TextToVideo, &json!({})).await,
                Err(ProviderError::PolicyBlocked(_))
            ));
        }
    }
}
