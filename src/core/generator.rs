//! 任务生成：把自然语言目标翻译成可执行的任务批次
//!
//! 两段式：先让模型从动作目录挑一个相关子集（控制动作恒在），再用
//! 子集目录生成任务数组。模型输出一律走宽容解析，任何垃圾输出最终
//! 退化成一个 think 任务，生成永不返回空批次。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::actions::{ActionRegistry, CONTROL_ACTIONS};
use crate::core::store::TaskStore;
use crate::core::task::{TaskId, TaskSpec};
use crate::llm::{parse::parse_lenient, LlmClient};

pub struct TaskGenerator {
    llm: Arc<dyn LlmClient>,
}

impl TaskGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// 生成一批任务描述；保证非空
    pub async fn generate(
        &self,
        goal: &str,
        context: &str,
        registry: &ActionRegistry,
    ) -> Vec<TaskSpec> {
        let catalog = self.filter_catalog(goal, registry).await;
        let prompt = build_generation_prompt(goal, context, &catalog);

        let raw = match self.llm.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "任务生成调用失败，退化为单个分析任务");
                return vec![fallback_spec(goal)];
            }
        };
        parse_task_specs(&raw, goal)
    }

    /// 按目标筛选动作目录；失败时用完整目录
    async fn filter_catalog(
        &self,
        goal: &str,
        registry: &ActionRegistry,
    ) -> Vec<(String, String)> {
        let full = registry.catalog();
        let names: Vec<&str> = full.iter().map(|(n, _)| n.as_str()).collect();
        let prompt = format!(
            "Given the goal below, select the actions relevant to achieving it.\n\
             Goal: {}\n\
             Available actions: {}\n\
             Respond with ONLY a JSON array of action names.",
            goal,
            names.join(", ")
        );

        let selected: Option<Vec<String>> = match self.llm.generate(&prompt).await {
            Ok(raw) => parse_lenient(&raw).and_then(|v| {
                v.as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_str().map(str::to_string))
                        .collect()
                })
            }),
            Err(e) => {
                warn!(error = %e, "动作目录筛选失败，使用完整目录");
                None
            }
        };

        let Some(mut selected) = selected else {
            return full;
        };
        // 控制动作永远可用
        for name in CONTROL_ACTIONS {
            if !selected.iter().any(|s| s == name) {
                selected.push((*name).to_string());
            }
        }
        let filtered: Vec<(String, String)> = full
            .iter()
            .filter(|(n, _)| selected.iter().any(|s| s == n))
            .cloned()
            .collect();
        if filtered.is_empty() {
            full
        } else {
            filtered
        }
    }
}

fn build_generation_prompt(goal: &str, context: &str, catalog: &[(String, String)]) -> String {
    let mut lines = String::new();
    for (name, desc) in catalog {
        lines.push_str(&format!("- {}: {}\n", name, desc));
    }
    format!(
        "You are the planning module of an autonomous agent.\n\
         Goal: {}\n\
         Context: {}\n\n\
         Available actions:\n{}\n\
         Break the goal into a short sequence of tasks. Respond with ONLY a JSON array.\n\
         Each element must be an object with:\n\
         - \"description\": what the task accomplishes\n\
         - \"action\": one of the action names above\n\
         - \"parameters\": object of arguments for the action\n\
         - \"required_inputs\": object mapping placeholder names to the description of\n\
           the earlier task that produces the value (omit if none); reference a\n\
           placeholder inside parameters as {{{{name}}}}\n\
         - \"priority\": integer, higher runs first",
        goal, context, lines
    )
}

fn fallback_spec(goal: &str) -> TaskSpec {
    let mut spec = TaskSpec::new(format!("Analyze goal: {}", goal), "think");
    spec.parameters.insert(
        "prompt".into(),
        Value::String(format!(
            "Analyze this goal and describe concrete steps to achieve it: {}",
            goal
        )),
    );
    spec
}

/// 把模型原始输出解码成任务批次；永不返回空
pub fn parse_task_specs(raw: &str, goal: &str) -> Vec<TaskSpec> {
    let Some(value) = parse_lenient(raw) else {
        warn!("任务生成输出完全不可解析，退化为单个分析任务");
        return vec![fallback_spec(goal)];
    };

    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("tasks") {
            Some(Value::Array(items)) => items,
            _ => vec![Value::Object(obj)],
        },
        other => vec![other],
    };

    let mut specs = Vec::new();
    for item in items {
        if let Some(spec) = decode_spec(item, goal) {
            specs.push(spec);
        }
    }
    if specs.is_empty() {
        warn!("任务生成输出不含任何可用条目，退化为单个分析任务");
        specs.push(fallback_spec(goal));
    }
    specs
}

fn decode_spec(item: Value, goal: &str) -> Option<TaskSpec> {
    let obj = match item {
        Value::Object(obj) => obj,
        // 裸字符串视为一个思考任务
        Value::String(text) => {
            let mut spec = TaskSpec::new(text.clone(), "think");
            spec.parameters.insert("prompt".into(), Value::String(text));
            return Some(spec);
        }
        other => {
            debug!(value = %other, "忽略非对象任务条目");
            return None;
        }
    };

    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Work toward goal: {}", goal));
    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("think")
        .to_string();

    let parameters: Map<String, Value> = match obj.get("parameters") {
        Some(Value::Object(p)) => p.clone(),
        // 非对象参数包装成 prompt
        Some(other) if !other.is_null() => {
            let mut p = Map::new();
            p.insert("prompt".into(), other.clone());
            p
        }
        _ => Map::new(),
    };

    let required_inputs: BTreeMap<String, String> = obj
        .get("required_inputs")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let priority = obj.get("priority").and_then(Value::as_i64).unwrap_or(1) as i32;

    let mut spec = TaskSpec::new(description, action);
    spec.parameters = parameters;
    spec.required_inputs = required_inputs;
    spec.priority = priority;
    Some(spec)
}

/// 同批任务的依赖登记：required_inputs 指向本批描述时直接记 id 链接。
/// 跨批依赖不在此登记，运行期由描述匹配兜底。
pub fn link_batch(store: &mut TaskStore, batch: &[TaskId]) {
    let descriptions: Vec<(TaskId, String)> = batch
        .iter()
        .filter_map(|id| store.get(id).map(|t| (id.clone(), t.description.clone())))
        .collect();

    for id in batch {
        let Some(task) = store.get(id) else { continue };
        let mut links: Vec<(String, TaskId)> = Vec::new();
        for (placeholder, source_desc) in &task.required_inputs {
            let hit = descriptions
                .iter()
                .filter(|(other_id, _)| other_id != id)
                .find(|(_, d)| d == source_desc)
                .or_else(|| {
                    descriptions.iter().filter(|(other_id, _)| other_id != id).find(
                        |(_, d)| d.contains(source_desc) || source_desc.contains(d.as_str()),
                    )
                });
            if let Some((source_id, _)) = hit {
                links.push((placeholder.clone(), source_id.clone()));
            }
        }
        if links.is_empty() {
            continue;
        }
        if let Some(task) = store.get_mut(id) {
            for (placeholder, source_id) in links {
                task.input_links.insert(placeholder, source_id);
            }
        }
    }
}
