//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按提交顺序弹出预置回复；脚本用尽后回显 prompt 开头，便于本地跑通任务流程。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

/// 脚本化 Mock 客户端：每次 generate 弹出一条预置回复
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    /// 追加一条预置回复到脚本末尾
    pub fn push(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("mock responses poisoned")
            .push_back(response.into());
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let scripted = self
            .responses
            .lock()
            .expect("mock responses poisoned")
            .pop_front();
        match scripted {
            Some(r) => Ok(r),
            None => {
                let head: String = prompt.chars().take(64).collect();
                Ok(format!("Echo from Mock: {}", head))
            }
        }
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(vec![0.0; 8])
    }
}
