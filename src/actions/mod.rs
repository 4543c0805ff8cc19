//! 动作抽象：Action trait、注册表、返回值归一化
//!
//! 所有动作实现 Action trait（name / description / execute），由 ActionRegistry
//! 按名注册与查找。动作返回值是闭集 ActionReturn，normalize 对其做穷尽匹配，
//! 归一化为带 success 标志的 Outcome；派发层不做鸭子类型的字段嗅探。

pub mod think;

pub use think::{SleepAction, ThinkAction};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// 控制类动作：无外部副作用，只影响计划本身；动作目录筛选时永远保留
pub const CONTROL_ACTIONS: &[&str] = &["think", "replan_tasks", "rerun_tasks", "sleep"];

/// 元动作（由引擎拦截，不经注册表）的目录描述
pub fn meta_action_description(name: &str) -> Option<&'static str> {
    match name {
        "replan_tasks" => Some(
            "Plan a fresh batch of tasks for the current goal using the full task history so far. \
             Place this after tasks whose outcome should influence the next steps.",
        ),
        "rerun_tasks" => Some(
            "Repeat a previously executed segment of tasks. Takes 'start_task_description' naming \
             the first task of the segment; the decision to repeat considers elapsed time.",
        ),
        _ => None,
    }
}

/// 动作执行的原始返回形态（闭集）
#[derive(Debug, Clone)]
pub enum ActionReturn {
    /// 纯文本；以字面量 "Error" 开头视为失败（大小写敏感）
    Text(String),
    /// 结构化负载；可携带 success / error / code / stdout / result 等键
    Payload(Map<String, Value>),
    /// 无返回值，视为成功
    Unit,
}

/// 归一化后的执行结果：success 标志 + 负载对象
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub payload: Map<String, Value>,
}

impl Outcome {
    pub fn failure(error: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("error".into(), Value::String(error.into()));
        Self {
            success: false,
            payload,
        }
    }

    pub fn error_text(&self) -> String {
        match self.payload.get("error") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }

    /// 含 success 标志的完整 JSON 对象（任务 result 的持久形态）
    pub fn to_value(&self) -> Value {
        let mut obj = self.payload.clone();
        obj.insert("success".into(), Value::Bool(self.success));
        Value::Object(obj)
    }
}

/// 归一化：闭集穷尽匹配
pub fn normalize(ret: ActionReturn) -> Outcome {
    match ret {
        ActionReturn::Text(text) => {
            if text.starts_with("Error") {
                Outcome::failure(text)
            } else {
                let mut payload = Map::new();
                payload.insert("result".into(), Value::String(text));
                Outcome {
                    success: true,
                    payload,
                }
            }
        }
        ActionReturn::Payload(mut payload) => {
            let success = match payload.remove("success") {
                Some(Value::Bool(b)) => b,
                Some(other) => {
                    // 非布尔 success 键按 JSON 真值折算：null/0/"" 记为失败
                    let truthy = match &other {
                        Value::Null => false,
                        Value::String(s) => !s.is_empty(),
                        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
                        _ => true,
                    };
                    payload.insert("success_raw".into(), other);
                    truthy
                }
                None => true,
            };
            Outcome { success, payload }
        }
        ActionReturn::Unit => Outcome {
            success: true,
            payload: Map::new(),
        },
    }
}

/// 动作 trait：名称、描述（进入生成 prompt 的目录）、异步执行
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, parameters: &Map<String, Value>) -> ActionReturn;
}

/// 动作注册表：按名称存储 Arc<dyn Action>
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Action + 'static) {
        let name = action.name().to_string();
        self.actions.insert(name, Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// 执行并归一化；未注册的名称返回失败 Outcome，不走异常路径
    pub async fn execute(&self, name: &str, parameters: &Map<String, Value>) -> Outcome {
        match self.actions.get(name) {
            Some(action) => normalize(action.execute(parameters).await),
            None => Outcome::failure(format!("Error: action '{}' is not registered", name)),
        }
    }

    /// (name, description) 目录，含引擎拦截的元动作；用于生成 prompt 的 Available actions 段落
    pub fn catalog(&self) -> Vec<(String, String)> {
        let mut catalog: Vec<(String, String)> = self
            .actions
            .iter()
            .map(|(name, action)| (name.clone(), action.description().to_string()))
            .collect();
        for name in CONTROL_ACTIONS {
            if !self.actions.contains_key(*name) {
                if let Some(desc) = meta_action_description(name) {
                    catalog.push((name.to_string(), desc.to_string()));
                }
            }
        }
        catalog.sort();
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_error_prefixed_text_is_failure() {
        let out = normalize(ActionReturn::Text("Error: file not found".into()));
        assert!(!out.success);
        assert_eq!(out.error_text(), "Error: file not found");
    }

    #[test]
    fn test_normalize_plain_text_is_success() {
        let out = normalize(ActionReturn::Text("all good".into()));
        assert!(out.success);
        assert_eq!(out.payload["result"], "all good");
    }

    #[test]
    fn test_normalize_error_prefix_is_case_sensitive() {
        let out = normalize(ActionReturn::Text("error in lowercase is fine".into()));
        assert!(out.success);
    }

    #[test]
    fn test_normalize_payload_with_explicit_success() {
        let mut payload = Map::new();
        payload.insert("success".into(), json!(false));
        payload.insert("error".into(), json!("boom"));
        let out = normalize(ActionReturn::Payload(payload));
        assert!(!out.success);
        assert_eq!(out.error_text(), "boom");
    }

    #[test]
    fn test_normalize_payload_with_falsy_success_is_failure() {
        for falsy in [json!(0), json!(null), json!("")] {
            let mut payload = Map::new();
            payload.insert("success".into(), falsy.clone());
            let out = normalize(ActionReturn::Payload(payload));
            assert!(!out.success, "success={} should fail", falsy);
            assert_eq!(out.payload["success_raw"], falsy);
        }

        let mut payload = Map::new();
        payload.insert("success".into(), json!("ok"));
        let out = normalize(ActionReturn::Payload(payload));
        assert!(out.success);
        assert_eq!(out.payload["success_raw"], json!("ok"));
    }

    #[test]
    fn test_normalize_payload_without_success_flag() {
        let mut payload = Map::new();
        payload.insert("stdout".into(), json!("42"));
        let out = normalize(ActionReturn::Payload(payload));
        assert!(out.success);
        assert_eq!(out.payload["stdout"], "42");
    }

    #[test]
    fn test_normalize_unit_is_generic_success() {
        let out = normalize(ActionReturn::Unit);
        assert!(out.success);
        assert!(out.payload.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_is_normalized_failure() {
        let registry = ActionRegistry::new();
        let out = registry.execute("no_such_action", &Map::new()).await;
        assert!(!out.success);
        assert!(out.error_text().contains("no_such_action"));
    }

    #[test]
    fn test_catalog_includes_meta_actions() {
        let registry = ActionRegistry::new();
        let names: Vec<String> = registry.catalog().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"replan_tasks".to_string()));
        assert!(names.contains(&"rerun_tasks".to_string()));
    }
}
