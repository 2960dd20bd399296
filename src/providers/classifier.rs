//! 失败分类：可重试（超时、限流、临时服务端错误）与终止（非法输入、内容策略拦截）
//!
//! 链路推进本身不看分类（非最后一个 Provider 总会推进），分类决定链路耗尽后
//! 向上暴露的是 ProviderTransient 还是 ProviderTerminal。

use serde::Serialize;

use super::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Retryable,
    Terminal,
}

pub trait FailureClassifier: Send + Sync {
    fn classify(&self, err: &ProviderError) -> FailureClass;
}

/// 默认分类器：变体优先；Other 命中终止关键词才算终止，其余（连接失败、未知错误）按可重试处理
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

const TERMINAL_HINTS: &[&str] = &[
    "policy",
    "safety",
    "nsfw",
    "blocked",
    "invalid",
    "not allowed",
    "unsupported",
    "unauthorized",
    "forbidden",
];

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, err: &ProviderError) -> FailureClass {
        match err {
            ProviderError::Timeout { .. } | ProviderError::RateLimited(_) => FailureClass::Retryable,
            ProviderError::Server { status, .. } if *status >= 500 => FailureClass::Retryable,
            ProviderError::Server { .. } => FailureClass::Terminal,
            ProviderError::InvalidInput(_) | ProviderError::PolicyBlocked(_) => FailureClass::Terminal,
            ProviderError::Other(msg) => {
                let lower = msg.to_lowercase();
                if TERMINAL_HINTS.iter().any(|h| lower.contains(h)) {
                    FailureClass::Terminal
                } else {
                    FailureClass::Retryable
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(err: ProviderError) -> FailureClass {
        DefaultClassifier.classify(&err)
    }

    #[test]
    fn test_variants() {
        assert_eq!(classify(ProviderError::Timeout { elapsed_ms: 10 }), FailureClass::Retryable);
        assert_eq!(classify(ProviderError::RateLimited("429".into())), FailureClass::Retryable);
        assert_eq!(
            classify(ProviderError::Server { status: 503, message: "down".into() }),
            FailureClass::Retryable
        );
        assert_eq!(
            classify(ProviderError::Server { status: 404, message: "gone".into() }),
            FailureClass::Terminal
        );
        assert_eq!(classify(ProviderError::InvalidInput("empty prompt".into())), FailureClass::Terminal);
        assert_eq!(classify(ProviderError::PolicyBlocked("nsfw".into())), FailureClass::Terminal);
    }

    #[test]
    fn test_other_message_heuristics() {
        assert_eq!(
            classify(ProviderError::Other("Service temporarily unavailable".into())),
            FailureClass::Retryable
        );
        assert_eq!(
            classify(ProviderError::Other("Prompt violates safety policy".into())),
            FailureClass::Terminal
        );
        assert_eq!(
            classify(ProviderError::Other("HTTP 401: unauthorized".into())),
            FailureClass::Terminal
        );
        assert_eq!(classify(ProviderError::Other("weird".into())), FailureClass::Retryable);
    }
}
