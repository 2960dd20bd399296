//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置的回复；队列耗尽后回显最后一条 User 消息（作为纯文本最终回答）。
//! 每次请求的消息都会被记录，便于断言提示词内容。token 用量按空白分词粗略计数。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, TokenUsage};
use crate::memory::{Message, Role};

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    usage: TokenUsage,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以一组成功回复构造
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for r in replies {
            client.push_reply(r);
        }
        client
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Ok(reply.into()));
        }
    }

    pub fn push_error(&self, err: LlmError) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Err(err));
        }
    }

    /// 已收到的请求数
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 所有请求的消息快照
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(messages.to_vec());
        }
        let prompt_tokens: u64 = messages.iter().map(|m| word_count(&m.content)).sum();

        let scripted = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(reply) = scripted {
            if let Ok(text) = &reply {
                self.usage.add(prompt_tokens, word_count(text));
            }
            return reply;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let reply = format!("Echo from Mock: {}", last_user);
        self.usage.add(prompt_tokens, word_count(&reply));
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_then_echo() {
        let mock = MockLlmClient::with_replies(["first"]);
        mock.push_error(LlmError::Timeout);

        let msgs = vec![Message::system("sys"), Message::user("hello")];
        assert_eq!(mock.complete(&msgs).await.unwrap(), "first");
        assert_eq!(mock.complete(&msgs).await, Err(LlmError::Timeout));
        assert_eq!(mock.complete(&msgs).await.unwrap(), "Echo from Mock: hello");
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.requests()[0][1].content, "hello");
    }

    #[tokio::test]
    async fn test_usage_counts_successful_calls() {
        let mock = MockLlmClient::with_replies(["two words"]);
        mock.push_error(LlmError::EmptyResponse);
        let msgs = vec![Message::system("be brief"), Message::user("hello there")];

        mock.complete(&msgs).await.unwrap();
        assert_eq!(mock.token_usage(), (4, 2, 6));
        assert!(mock.complete(&msgs).await.is_err());
        assert_eq!(mock.token_usage(), (4, 2, 6));
    }
}
