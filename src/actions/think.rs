//! 控制类动作：think 与 sleep
//!
//! think 调用 LLM 对 prompt（加可选 context）做一轮反思，是任务计划中唯一
//! 必定可用的动作，也是生成解析失败时的兜底动作。sleep 是惰性占位。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::actions::{Action, ActionReturn};
use crate::llm::LlmClient;

/// think：LLM 反思。参数 prompt 为静态文本时效果最好；依赖前置任务结果时
/// 用 {{placeholder}} 注入 prompt 或 context，并在 required_inputs 中声明链接。
pub struct ThinkAction {
    llm: Arc<dyn LlmClient>,
}

impl ThinkAction {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Action for ThinkAction {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Reflect on a prompt with the language model and return the generated text. \
         Use a 'prompt' parameter (and optionally 'context'); infuse results of prior \
         tasks with {{placeholder}} tokens declared in required_inputs."
    }

    async fn execute(&self, parameters: &Map<String, Value>) -> ActionReturn {
        let prompt = match parameters.get("prompt") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return ActionReturn::Text("Error: think requires a 'prompt' parameter".into()),
        };
        let full_prompt = match parameters.get("context") {
            Some(context) if !context.is_null() => {
                format!("Context: {}\n\nPrompt: {}", context, prompt)
            }
            _ => prompt,
        };
        match self.llm.generate(&full_prompt).await {
            Ok(text) => ActionReturn::Text(text),
            Err(e) => ActionReturn::Text(format!("Error: think failed: {}", e)),
        }
    }
}

/// sleep：暂停标记，无任何副作用；计划中用来表达「此处停一拍」
#[derive(Debug, Default)]
pub struct SleepAction;

#[async_trait]
impl Action for SleepAction {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Inert pause marker with no effect; use it to structure a plan around a waiting point."
    }

    async fn execute(&self, _parameters: &Map<String, Value>) -> ActionReturn {
        ActionReturn::Unit
    }
}
