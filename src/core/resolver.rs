//! 依赖解析：把 required_inputs 声明替换成上游任务的真实产出
//!
//! 解析发生在每次尝试开始时，不改写任务模板参数；同一任务重试会用
//! 最新的上游结果重新解析。登记过 input_links 的占位符按 id 直连取值，
//! 没有链接的退回描述匹配。缺口只警告不报错，留给动作自己处理。

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::store::TaskStore;
use crate::core::task::{Task, TaskStatus};

/// 从上游结果对象提取可注入的值；键优先级 code > stdout > result > error
pub fn extract_useful_value(result: &Value) -> String {
    if let Some(obj) = result.as_object() {
        for key in ["code", "stdout", "result", "error"] {
            if let Some(v) = obj.get(key) {
                return value_to_text(v);
            }
        }
    }
    value_to_text(result)
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 计算本次尝试的实际参数。模板参数不被修改。
pub fn resolve_parameters(store: &TaskStore, task: &Task) -> Map<String, Value> {
    let mut resolved = task.parameters.clone();
    if task.required_inputs.is_empty() {
        return resolved;
    }

    for (placeholder, source_desc) in &task.required_inputs {
        let Some(replacement) = lookup_input(store, task, placeholder, source_desc) else {
            warn!(
                task_id = %task.id,
                placeholder = %placeholder,
                source = %source_desc,
                "依赖尚未就绪，占位符保持原样"
            );
            continue;
        };
        let token = format!("{{{{{}}}}}", placeholder);
        for value in resolved.values_mut() {
            substitute(value, &token, &replacement);
        }
    }
    resolved
}

/// id 直连优先；链接的任务未完成或已消失时退回描述匹配
fn lookup_input(
    store: &TaskStore,
    task: &Task,
    placeholder: &str,
    source_desc: &str,
) -> Option<String> {
    if let Some(source_id) = task.input_links.get(placeholder) {
        if let Some(source) = store.get(source_id) {
            if source.status == TaskStatus::Completed {
                let result = source.result.as_ref()?;
                debug!(task_id = %task.id, source_id = %source_id, "按 id 链接取得依赖值");
                return Some(extract_useful_value(result));
            }
        }
    }
    let source = store.find_completed_by_description(source_desc)?;
    let result = source.result.as_ref()?;
    Some(extract_useful_value(result))
}

/// 递归替换：字符串做文本替换，容器逐项下探
fn substitute(value: &mut Value, token: &str, replacement: &str) {
    match value {
        Value::String(s) => {
            if s.contains(token) {
                *s = s.replace(token, replacement);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, token, replacement);
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                substitute(v, token, replacement);
            }
        }
        _ => {}
    }
}
