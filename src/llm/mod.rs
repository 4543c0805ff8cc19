//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、宽容 JSON 解析、重试
//!
//! 所有后端实现 LlmClient：generate（文本补全）、embed（向量嵌入）。
//! 引擎侧统一通过 RetryingLlmClient 调用，获得有界重试 + 指数退避。

pub mod mock;
pub mod openai;
pub mod parse;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// LLM 调用错误；is_transient 决定是否值得重试
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM rate limited")]
    RateLimited,

    #[error("LLM returned empty completion")]
    EmptyCompletion,

    #[error("LLM response malformed: {0}")]
    Malformed(String),
}

impl LlmError {
    /// 网络/限流类错误可重试；格式类错误重试无意义
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Request(_) | LlmError::RateLimited)
    }
}

/// LLM 客户端 trait：文本补全与嵌入
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 对单条 prompt 生成补全文本
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// 将文本编码为定长向量（供向量记忆使用）
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

/// 重试策略：尝试次数与退避区间
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// 重试装饰器：包装任意 LlmClient，对瞬态错误做有界指数退避
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        Self {
            inner,
            config: RetryConfig::default(),
        }
    }

    pub fn with_config(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let mut backoff = self.config.initial_backoff;
        let mut last_err = LlmError::EmptyCompletion;

        for attempt in 1..=self.config.max_attempts {
            match self.inner.generate(prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    if !e.is_transient() || attempt == self.config.max_attempts {
                        return Err(e);
                    }
                    tracing::warn!(
                        attempt,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "LLM call failed, retrying"
                    );
                    last_err = e;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
        Err(last_err)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut backoff = self.config.initial_backoff;
        let mut last_err = LlmError::EmptyCompletion;

        for attempt in 1..=self.config.max_attempts {
            match self.inner.embed(text).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !e.is_transient() || attempt == self.config.max_attempts {
                        return Err(e);
                    }
                    last_err = e;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(LlmError::Request("connection reset".into()))
            } else {
                Ok("ok".into())
            }
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(LlmError::RateLimited)
            } else {
                Ok(vec![0.5; 4])
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 2,
        });
        let retrying = RetryingLlmClient::new(client.clone());
        let out = retrying.generate("hello").await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 10,
        });
        let retrying = RetryingLlmClient::new(client.clone());
        assert!(retrying.generate("hello").await.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embed_retries_on_rate_limit() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 1,
        });
        let retrying = RetryingLlmClient::new(client.clone());
        let vector = retrying.embed("hello").await.unwrap();
        assert_eq!(vector.len(), 4);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        struct MalformedClient {
            calls: AtomicU32,
        }

        #[async_trait]
        impl LlmClient for MalformedClient {
            async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Malformed("bad".into()))
            }
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
                Ok(vec![])
            }
        }

        let client = Arc::new(MalformedClient {
            calls: AtomicU32::new(0),
        });
        let retrying = RetryingLlmClient::new(client.clone());
        assert!(retrying.generate("hello").await.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}
