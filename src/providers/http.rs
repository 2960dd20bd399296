//! 通用 JSON-over-HTTP Provider
//!
//! POST `{base_url}/generate`，请求体 `{"kind": "...", "parameters": {...}}`；
//! 响应体 `{"success": bool, "media_url"|"url": "...", "text": "...", "cost": 0.01, "data": {...}, "error": "..."}`。
//! 不含任何特定服务商的逻辑，具体协议适配放在服务端。

use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{GenerationKind, Provider, ProviderError, ProviderOutput};
use crate::config::ProviderEndpoint;

pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    /// 为空表示支持全部能力
    kinds: HashSet<GenerationKind>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(alias = "url")]
    media_url: Option<String>,
    text: Option<String>,
    cost: Option<f64>,
    data: Option<Value>,
    error: Option<String>,
}

fn default_success() -> bool {
    true
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            kinds: HashSet::new(),
            client: reqwest::Client::new(),
        }
    }

    /// 由 [[providers.endpoints]] 构造；API Key 从环境变量读取，未知的能力名记录告警后忽略
    pub fn from_endpoint(endpoint: &ProviderEndpoint) -> Self {
        let mut provider = Self::new(&endpoint.name, &endpoint.base_url);
        provider.api_key = endpoint
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        for k in &endpoint.kinds {
            match GenerationKind::parse(k) {
                Some(kind) => {
                    provider.kinds.insert(kind);
                }
                None => tracing::warn!(provider = %endpoint.name, kind = %k, "Unknown generation kind on endpoint, ignored"),
            }
        }
        provider
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn map_reqwest_error(e: reqwest::Error, started: Instant) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                elapsed_ms: elapsed_ms(started),
            }
        } else if e.is_connect() {
            ProviderError::Other(format!("connection failed: {e}"))
        } else if e.is_decode() {
            ProviderError::Other(format!("malformed response: {e}"))
        } else {
            ProviderError::Other(e.to_string())
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[async_trait]
impl Provider for HttpProvider {
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
        let url = format!("{}/generate", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .json(&json!({ "kind": kind.as_str(), "parameters": params }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| Self::map_reqwest_error(e, started))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message: String = body.chars().take(300).collect();
            // 408 / 504 记录实际耗时
            return Err(match ProviderError::from_status(status.as_u16(), message) {
                ProviderError::Timeout { .. } => ProviderError::Timeout {
                    elapsed_ms: elapsed_ms(started),
                },
                other => other,
            });
        }

        let raw: Value = resp
            .json()
            .await
            .map_err(|e| Self::map_reqwest_error(e, started))?;
        let body: GenerateResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Other(format!("malformed response: {e}")))?;

        if !body.success {
            return Err(ProviderError::Other(
                body.error.unwrap_or_else(|| "provider reported failure".to_string()),
            ));
        }
        if body.media_url.is_none() && body.text.is_none() && body.data.is_none() {
            return Err(ProviderError::Other("empty response".to_string()));
        }

        Ok(ProviderOutput {
            media_url: body.media_url,
            text: body.text,
            cost: body.cost,
            data: body.data,
            raw: Some(raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_endpoint_parses_kinds() {
        let endpoint = ProviderEndpoint {
            name: "Gemini".to_string(),
            base_url: "http://127.0.0.1:8701/".to_string(),
            api_key_env: None,
            kinds: vec!["text-to-image".into(), "translation".into(), "teleport".into()],
        };
        let p = HttpProvider::from_endpoint(&endpoint);
        assert_eq!(p.name(), "gemini");
        assert_eq!(p.base_url, "http://127.0.0.1:8701");
        assert!(p.supports(GenerationKind::TextToImage));
        assert!(p.supports(GenerationKind::Translation));
        assert!(!p.supports(GenerationKind::TextToVideo));
    }

    #[test]
    fn test_empty_kinds_supports_everything() {
        let p = HttpProvider::new("any", "http://localhost");
        assert!(GenerationKind::ALL.iter().all(|k| p.supports(*k)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        use crate::providers::{DefaultClassifier, FailureClass, FailureClassifier};

        // 端口 9 (discard) 在测试环境中通常没有监听
        let p = HttpProvider::new("down", "http://127.0.0.1:9");
        let err = p
            .generate(GenerationKind::TextToImage, &json!({"prompt": "x"}))
            .await
            .unwrap_err();
        assert_eq!(DefaultClassifier.classify(&err), FailureClass::Retryable);
    }

    #[tokio::test]
    async fn test_gateway_timeout_reports_elapsed_time() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            // 读完整个请求体（JSON 以 "}}" 结尾）再慢慢回 504
            while !received.ends_with(b"}}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            tokio::time::sleep(std::time::Duration::from_millis(80)).await;
            socket
                .write_all(b"HTTP/1.1 504 Gateway Timeout\r\ncontent-length: 4\r\nconnection: close\r\n\r\nslow")
                .await
                .unwrap();
        });

        let p = HttpProvider::new("slow", format!("http://{addr}"));
        let err = p
            .generate(GenerationKind::TextToImage, &json!({"prompt": "x"}))
            .await
            .unwrap_err();
        match err {
            ProviderError::Timeout { elapsed_ms } => assert!(elapsed_ms >= 80, "elapsed {elapsed_ms}ms"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
