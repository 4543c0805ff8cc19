//! 失败恢复：分析失败任务，产出一个封闭的恢复计划
//!
//! 模型输出在唯一的边界处解码成 RecoveryPlan 标签联合，引擎只消费
//! 类型化计划，不再接触原始 JSON。缺 strategy 字段降级为参数不变的
//! 重试；strategy 存在但不认识则判定恢复失败，交回引擎走永久失败。

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::task::{Task, TaskSpec};
use crate::llm::{parse::parse_lenient, LlmClient, LlmError};

/// 恢复计划：四种策略的封闭集合
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryPlan {
    /// 原动作重跑，参数可被整体替换
    Retry { parameters: Option<Map<String, Value>> },
    /// 换一个动作达成同一目的
    Alternative {
        description: Option<String>,
        action: String,
        parameters: Map<String, Value>,
    },
    /// 拆成更小的子任务
    Decompose { subtasks: Vec<TaskSpec> },
    /// 放弃，任务转永久失败
    Abandon,
}

impl RecoveryPlan {
    pub fn strategy_name(&self) -> &'static str {
        match self {
            RecoveryPlan::Retry { .. } => "RETRY",
            RecoveryPlan::Alternative { .. } => "ALTERNATIVE",
            RecoveryPlan::Decompose { .. } => "DECOMPOSE",
            RecoveryPlan::Abandon => "ABANDON",
        }
    }
}

/// 解码后的完整决定，raw 留作审计
#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    pub plan: RecoveryPlan,
    pub reason: String,
    pub raw: Option<Value>,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("恢复分析调用失败: {0}")]
    Llm(#[from] LlmError),
    #[error("未知恢复策略: {0}")]
    UnknownStrategy(String),
    #[error("恢复计划不完整: {0}")]
    InvalidPlan(String),
}

pub struct RecoveryManager {
    llm: Arc<dyn LlmClient>,
    /// 喂给模型的单条结果截断长度
    result_truncate_chars: usize,
}

impl RecoveryManager {
    pub fn new(llm: Arc<dyn LlmClient>, result_truncate_chars: usize) -> Self {
        Self {
            llm,
            result_truncate_chars,
        }
    }

    /// 分析失败任务，返回类型化的恢复决定
    pub async fn analyze(&self, task: &Task) -> Result<RecoveryDecision, RecoveryError> {
        let prompt = self.build_prompt(task);
        let raw = self.llm.generate(&prompt).await?;
        let decision = decode_recovery(&raw, task)?;
        info!(
            task_id = %task.id,
            strategy = decision.plan.strategy_name(),
            "恢复策略已确定"
        );
        Ok(decision)
    }

    fn build_prompt(&self, task: &Task) -> String {
        let mut history = String::new();
        for attempt in &task.attempts {
            history.push_str(&format!(
                "Attempt {}:\n  parameters: {}\n  success: {}\n",
                attempt.attempt_number,
                Value::Object(attempt.parameters.clone()),
                attempt
                    .success
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".into()),
            ));
            if let Some(error) = &attempt.error {
                history.push_str(&format!("  error: {}\n", truncate(error, self.result_truncate_chars)));
            }
            if let Some(result) = &attempt.result {
                history.push_str(&format!(
                    "  result: {}\n",
                    truncate(&result.to_string(), self.result_truncate_chars)
                ));
            }
        }

        format!(
            "A task has failed repeatedly. Analyze the failure and propose a recovery.\n\n\
             Task: {}\n\
             Action: {}\n\
             Current parameters: {}\n\n\
             Attempt history:\n{}\n\
             Respond with ONLY a JSON object:\n\
             {{\n\
               \"strategy\": \"RETRY\" | \"ALTERNATIVE\" | \"DECOMPOSE\" | \"ABANDON\",\n\
               \"reason\": \"why this strategy\",\n\
               \"parameters\": {{...}},          // RETRY/ALTERNATIVE: new parameters\n\
               \"action\": \"action_name\",      // ALTERNATIVE only\n\
               \"subtasks\": [{{\"description\": ..., \"action\": ..., \"parameters\": {{...}}}}]  // DECOMPOSE only\n\
             }}",
            task.description,
            task.action,
            Value::Object(task.parameters.clone()),
            history
        )
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// 唯一解码边界。缺 strategy 降级重试；strategy 不认识或关键字段缺失报错。
pub fn decode_recovery(raw: &str, task: &Task) -> Result<RecoveryDecision, RecoveryError> {
    let Some(value) = parse_lenient(raw) else {
        warn!(task_id = %task.id, "恢复分析输出不可解析，降级为原参数重试");
        return Ok(degraded_retry(None));
    };
    let Some(obj) = value.as_object().cloned() else {
        warn!(task_id = %task.id, "恢复分析输出不是对象，降级为原参数重试");
        return Ok(degraded_retry(Some(value)));
    };

    let reason = obj
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("no reason given")
        .to_string();

    let Some(strategy) = obj.get("strategy").and_then(Value::as_str) else {
        warn!(task_id = %task.id, "恢复分析缺少 strategy 字段，降级为原参数重试");
        return Ok(degraded_retry(Some(Value::Object(obj))));
    };

    let plan = match strategy.to_ascii_uppercase().as_str() {
        "RETRY" => RecoveryPlan::Retry {
            parameters: obj.get("parameters").and_then(Value::as_object).cloned(),
        },
        "ALTERNATIVE" => {
            let action = obj
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    RecoveryError::InvalidPlan("ALTERNATIVE 缺少 action".into())
                })?
                .to_string();
            let parameters = obj
                .get("parameters")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| {
                    RecoveryError::InvalidPlan("ALTERNATIVE 缺少 parameters 对象".into())
                })?;
            RecoveryPlan::Alternative {
                description: obj
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                action,
                parameters,
            }
        }
        "DECOMPOSE" => {
            let subtasks = decode_subtasks(obj.get("subtasks"));
            if subtasks.is_empty() {
                return Err(RecoveryError::InvalidPlan(
                    "DECOMPOSE 不含任何可用子任务".into(),
                ));
            }
            RecoveryPlan::Decompose { subtasks }
        }
        "ABANDON" => RecoveryPlan::Abandon,
        other => return Err(RecoveryError::UnknownStrategy(other.to_string())),
    };

    Ok(RecoveryDecision {
        plan,
        reason,
        raw: Some(Value::Object(obj)),
    })
}

fn degraded_retry(raw: Option<Value>) -> RecoveryDecision {
    RecoveryDecision {
        plan: RecoveryPlan::Retry { parameters: None },
        reason: "recovery analysis unusable, retrying with unchanged parameters".to_string(),
        raw,
    }
}

/// 子任务需要 description 和 action 才算有效，其余条目静默丢弃；
/// 优先级统一由入库方继承失败任务的优先级
fn decode_subtasks(value: Option<&Value>) -> Vec<TaskSpec> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut specs = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let (Some(description), Some(action)) = (
            obj.get("description").and_then(Value::as_str),
            obj.get("action").and_then(Value::as_str),
        ) else {
            continue;
        };
        let mut spec = TaskSpec::new(description, action);
        if let Some(Value::Object(p)) = obj.get("parameters") {
            spec.parameters = p.clone();
        }
        if let Some(Value::Object(inputs)) = obj.get("required_inputs") {
            spec.required_inputs = inputs
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
        }
        specs.push(spec);
    }
    specs
}
