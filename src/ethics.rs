//! 伦理闸门
//!
//! 每次任务创建前裁决一次：false 则任务不创建（调用方拿不到 id）。
//! LlmEthicalGate 按配置原则让 LLM 给出是/否 + 解释；基础动词（写作、生成等）
//! 直接放行以减少模型调用。Unrestricted 全部放行，供测试与禁用场景使用。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;

/// 伦理闸门 trait：布尔裁决 + 解释文本
#[async_trait]
pub trait EthicalGate: Send + Sync {
    async fn evaluate(&self, description: &str) -> bool;

    async fn explain(&self, description: &str) -> String;
}

/// 全部放行
#[derive(Debug, Default)]
pub struct Unrestricted;

#[async_trait]
impl EthicalGate for Unrestricted {
    async fn evaluate(&self, _description: &str) -> bool {
        true
    }

    async fn explain(&self, _description: &str) -> String {
        "Ethical evaluation disabled.".to_string()
    }
}

/// 低风险动词：含这些词的任务描述自动放行
const BASIC_TASK_WORDS: &[&str] = &["write", "create", "generate", "compose", "draft"];

/// LLM 裁决闸门：原则列表来自配置
pub struct LlmEthicalGate {
    llm: Arc<dyn LlmClient>,
    principles: Vec<String>,
    enabled: bool,
}

impl LlmEthicalGate {
    pub fn new(llm: Arc<dyn LlmClient>, principles: Vec<String>, enabled: bool) -> Self {
        Self {
            llm,
            principles,
            enabled,
        }
    }

    fn is_basic_task(description: &str) -> bool {
        let lower = description.to_lowercase();
        BASIC_TASK_WORDS.iter().any(|w| lower.contains(w))
    }

    fn evaluation_prompt(&self, description: &str) -> String {
        format!(
            "Task: {}\n\nEthical Principles:\n{}\n\nEvaluate the given task against these \
             ethical principles. Respond with exactly 'Yes' if the task is ethical and may \
             proceed, or 'No' if it must not.",
            description,
            self.principles.join(", ")
        )
    }
}

#[async_trait]
impl EthicalGate for LlmEthicalGate {
    async fn evaluate(&self, description: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if Self::is_basic_task(description) {
            tracing::debug!(task = description, "basic task auto-approved");
            return true;
        }
        match self.llm.generate(&self.evaluation_prompt(description)).await {
            Ok(verdict) => verdict.trim().to_lowercase().starts_with("yes"),
            Err(e) => {
                // 裁决不可用时保守放行，错误留痕
                tracing::warn!(error = %e, "ethical evaluation unavailable, approving task");
                true
            }
        }
    }

    async fn explain(&self, description: &str) -> String {
        if !self.enabled {
            return "Ethical evaluation disabled.".to_string();
        }
        let prompt = format!(
            "Task: {}\n\nEthical Principles:\n{}\n\nExplain in one or two sentences how this \
             task relates to the principles.",
            description,
            self.principles.join(", ")
        );
        self.llm
            .generate(&prompt)
            .await
            .unwrap_or_else(|_| "No explanation available.".to_string())
    }
}
